//! Process-local cluster and Helm fakes.
//!
//! Both keep their state behind a mutex and support failure injection per
//! operation, so saga failure paths can be exercised without a cluster.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kubemanager_core::quantity;
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};
use crate::types::{HelmRelease, NamespaceInfo, NamespaceSpec, NamespaceUsage, QuotaSpec};
use crate::{ClusterProvisioner, HelmInstaller};

/// Cluster operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClusterOp {
    CreateNamespace,
    GetNamespace,
    DeleteNamespace,
    ReconcileQuota,
    EnsureSecret,
    DeleteSecret,
    NamespaceUsage,
}

/// Helm operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HelmOp {
    UpgradeInstall,
    Uninstall,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Times(u32),
    Always,
}

/// Injected failures plus a call counter per operation.
#[derive(Debug)]
struct Faults<Op: Ord> {
    planned: BTreeMap<Op, Fault>,
    calls: BTreeMap<Op, u32>,
}

impl<Op: Ord + Copy> Faults<Op> {
    fn new() -> Self {
        Self {
            planned: BTreeMap::new(),
            calls: BTreeMap::new(),
        }
    }

    /// Count a call to `op` and report whether it should fail.
    fn trip(&mut self, op: Op) -> bool {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.planned.get_mut(&op) {
            Some(Fault::Always) => true,
            Some(Fault::Times(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn calls(&self, op: Op) -> u32 {
        self.calls.get(&op).copied().unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Cluster ────────────────────────────────────────────────────────

#[derive(Debug)]
struct ClusterState {
    namespaces: BTreeMap<String, NamespaceSpec>,
    quotas: BTreeMap<String, QuotaSpec>,
    secrets: BTreeMap<(String, String), BTreeMap<String, String>>,
    usage: BTreeMap<String, NamespaceUsage>,
    faults: Faults<ClusterOp>,
}

/// In-memory [`ClusterProvisioner`].
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                namespaces: BTreeMap::new(),
                quotas: BTreeMap::new(),
                secrets: BTreeMap::new(),
                usage: BTreeMap::new(),
                faults: Faults::new(),
            }),
        }
    }

    /// Fail the next `times` calls of `op` with a transient API error.
    pub fn fail_next(&self, op: ClusterOp, times: u32) {
        lock(&self.state).faults.planned.insert(op, Fault::Times(times));
    }

    /// Fail every call of `op` until [`InMemoryCluster::heal`] is called.
    pub fn fail_always(&self, op: ClusterOp) {
        lock(&self.state).faults.planned.insert(op, Fault::Always);
    }

    pub fn heal(&self, op: ClusterOp) {
        lock(&self.state).faults.planned.remove(&op);
    }

    pub fn calls(&self, op: ClusterOp) -> u32 {
        lock(&self.state).faults.calls(op)
    }

    pub fn namespace(&self, name: &str) -> Option<NamespaceSpec> {
        lock(&self.state).namespaces.get(name).cloned()
    }

    pub fn quota(&self, namespace: &str) -> Option<QuotaSpec> {
        lock(&self.state).quotas.get(namespace).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.state)
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Seed a namespace directly, bypassing fault injection.
    pub fn insert_namespace(&self, spec: NamespaceSpec) {
        lock(&self.state).namespaces.insert(spec.name.clone(), spec);
    }

    /// Drop a namespace behind the control plane's back.
    pub fn remove_namespace(&self, name: &str) {
        let mut state = lock(&self.state);
        state.namespaces.remove(name);
        state.quotas.remove(name);
        state.secrets.retain(|(ns, _), _| ns != name);
    }

    /// Set what `namespace_usage` reports for a namespace.
    pub fn set_usage(&self, namespace: &str, usage: NamespaceUsage) {
        lock(&self.state).usage.insert(namespace.to_string(), usage);
    }

    fn check(&self, op: ClusterOp) -> ClusterResult<MutexGuard<'_, ClusterState>> {
        let mut state = lock(&self.state);
        if state.faults.trip(op) {
            debug!(?op, "injected cluster failure");
            return Err(ClusterError::Api(format!("injected failure: {op:?}")));
        }
        Ok(state)
    }
}

#[async_trait]
impl ClusterProvisioner for InMemoryCluster {
    async fn create_namespace(&self, spec: &NamespaceSpec) -> ClusterResult<()> {
        let mut state = self.check(ClusterOp::CreateNamespace)?;
        state
            .namespaces
            .entry(spec.name.clone())
            .or_insert_with(|| spec.clone());
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<NamespaceInfo>> {
        let state = self.check(ClusterOp::GetNamespace)?;
        Ok(state.namespaces.get(name).map(|spec| NamespaceInfo {
            name: spec.name.clone(),
            phase: Some("Active".to_string()),
            labels: spec.labels.clone(),
        }))
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.check(ClusterOp::DeleteNamespace)?;
        state.namespaces.remove(name);
        state.quotas.remove(name);
        state.secrets.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn reconcile_quota(&self, namespace: &str, quota: &QuotaSpec) -> ClusterResult<()> {
        quantity::cpu_millis(&quota.cpu).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        quantity::bytes(&quota.memory).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        let mut state = self.check(ClusterOp::ReconcileQuota)?;
        if !state.namespaces.contains_key(namespace) {
            return Err(ClusterError::NotFound(format!("namespace {namespace}")));
        }
        state.quotas.insert(namespace.to_string(), quota.clone());
        Ok(())
    }

    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let mut state = self.check(ClusterOp::EnsureSecret)?;
        if !state.namespaces.contains_key(namespace) {
            return Err(ClusterError::NotFound(format!("namespace {namespace}")));
        }
        state
            .secrets
            .insert((namespace.to_string(), name.to_string()), data.clone());
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.check(ClusterOp::DeleteSecret)?;
        state
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn namespace_usage(&self, namespace: &str) -> ClusterResult<NamespaceUsage> {
        let state = self.check(ClusterOp::NamespaceUsage)?;
        if !state.namespaces.contains_key(namespace) {
            return Err(ClusterError::NotFound(format!("namespace {namespace}")));
        }
        Ok(state.usage.get(namespace).copied().unwrap_or_default())
    }
}

// ── Helm ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct HelmState {
    releases: BTreeMap<(String, String), HelmRelease>,
    faults: Faults<HelmOp>,
}

/// In-memory [`HelmInstaller`] recording installed releases.
#[derive(Debug)]
pub struct InMemoryHelm {
    state: Mutex<HelmState>,
}

impl Default for InMemoryHelm {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHelm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HelmState {
                releases: BTreeMap::new(),
                faults: Faults::new(),
            }),
        }
    }

    pub fn fail_next(&self, op: HelmOp, times: u32) {
        lock(&self.state).faults.planned.insert(op, Fault::Times(times));
    }

    pub fn fail_always(&self, op: HelmOp) {
        lock(&self.state).faults.planned.insert(op, Fault::Always);
    }

    pub fn heal(&self, op: HelmOp) {
        lock(&self.state).faults.planned.remove(&op);
    }

    pub fn calls(&self, op: HelmOp) -> u32 {
        lock(&self.state).faults.calls(op)
    }

    /// The last installed revision of a release.
    pub fn release(&self, namespace: &str, name: &str) -> Option<HelmRelease> {
        lock(&self.state)
            .releases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn check(&self, op: HelmOp) -> ClusterResult<MutexGuard<'_, HelmState>> {
        let mut state = lock(&self.state);
        if state.faults.trip(op) {
            debug!(?op, "injected helm failure");
            return Err(ClusterError::Helm(format!("injected failure: {op:?}")));
        }
        Ok(state)
    }
}

#[async_trait]
impl HelmInstaller for InMemoryHelm {
    async fn upgrade_install(&self, release: &HelmRelease) -> ClusterResult<()> {
        let mut state = self.check(HelmOp::UpgradeInstall)?;
        state.releases.insert(
            (release.namespace.clone(), release.name.clone()),
            release.clone(),
        );
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> ClusterResult<()> {
        let mut state = self.check(HelmOp::Uninstall)?;
        state
            .releases
            .remove(&(namespace.to_string(), release.to_string()));
        Ok(())
    }
}
