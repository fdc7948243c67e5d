//! kubemanager-cluster — everything that talks to the cluster.
//!
//! Two contracts sit at the seam between the provisioning sagas and the
//! outside world:
//!
//! - [`ClusterProvisioner`] — namespaces, resource quotas, secrets and pod
//!   metrics through the Kubernetes API.
//! - [`HelmInstaller`] — upgrade-or-install and uninstall of Helm releases.
//!
//! Implementations:
//!
//! - [`KubeProvisioner`] — `kube` client against a real API server.
//! - [`HelmCli`] — shells out to the `helm` binary.
//! - [`InMemoryCluster`] / [`InMemoryHelm`] — process-local fakes with
//!   failure injection, used by tests and `mode = "in-memory"`.

pub mod error;
pub mod helm;
pub mod kubernetes;
pub mod memory;
pub mod types;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use error::{ClusterError, ClusterResult};
pub use helm::HelmCli;
pub use kubernetes::KubeProvisioner;
pub use memory::{ClusterOp, HelmOp, InMemoryCluster, InMemoryHelm};
pub use types::{HelmRelease, NamespaceInfo, NamespaceSpec, NamespaceUsage, QuotaSpec};

/// Kubernetes API operations used by the provisioning sagas.
///
/// Every mutating call converges: creating an existing namespace or
/// deleting a missing one succeeds.
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    async fn create_namespace(&self, spec: &NamespaceSpec) -> ClusterResult<()>;

    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<NamespaceInfo>>;

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()>;

    /// Create or update the project quota object in `namespace`.
    async fn reconcile_quota(&self, namespace: &str, quota: &QuotaSpec) -> ClusterResult<()>;

    /// Create or update an opaque secret holding `data`.
    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> ClusterResult<()>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    /// Live CPU/memory consumption summed over the namespace's pods.
    async fn namespace_usage(&self, namespace: &str) -> ClusterResult<NamespaceUsage>;
}

/// Helm release management.
#[async_trait]
pub trait HelmInstaller: Send + Sync {
    /// `helm upgrade --install`, waiting for the release to become ready.
    async fn upgrade_install(&self, release: &HelmRelease) -> ClusterResult<()>;

    /// Remove a release; a missing release is not an error.
    async fn uninstall(&self, namespace: &str, release: &str) -> ClusterResult<()>;
}
