//! Admission gate for workload requests.
//!
//! Admission is serialized per project: the returned [`AdmissionPermit`]
//! holds the project's lock, and callers keep it until the workload row
//! reflecting the admitted reservation has been written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kubemanager_core::quantity::{format_mebibytes, format_millicores};
use kubemanager_state::Project;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ProvisionError, ProvisionResult};
use crate::quota::{QuotaAccountant, ResourceUsage};

/// Proof that a request fit the project's envelope. Dropping it releases
/// the project's admission lock.
#[derive(Debug)]
pub struct AdmissionPermit {
    pub project_id: Uuid,
    /// Usage after admitting the request.
    pub projected: ResourceUsage,
    _guard: OwnedMutexGuard<()>,
}

/// Checks `current + requested <= limit` under a per-project lock.
#[derive(Clone)]
pub struct AdmissionGate {
    accountant: QuotaAccountant,
    locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AdmissionGate {
    pub fn new(accountant: QuotaAccountant) -> Self {
        Self {
            accountant,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn accountant(&self) -> &QuotaAccountant {
        &self.accountant
    }

    fn lock_for(&self, project_id: &Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(*project_id).or_default().clone()
    }

    /// Drop the lock entry of a project that no longer exists. A caller
    /// still holding a permit keeps its own reference to the mutex.
    pub fn forget(&self, project_id: &Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.remove(project_id).is_some() {
            debug!(%project_id, "admission lock released");
        }
    }

    /// Admit `requested` into `project`. When `exclude` names an existing
    /// workload, its current reservation is replaced rather than added to.
    ///
    /// Storage is only checked when the request reserves any.
    pub async fn admit(
        &self,
        project: &Project,
        requested: ResourceUsage,
        exclude: Option<&Uuid>,
    ) -> ProvisionResult<AdmissionPermit> {
        let guard = self.lock_for(&project.id).lock_owned().await;

        let limits = ResourceUsage::limits_of(project)?;
        let current = self
            .accountant
            .total_usage_excluding(&project.id, exclude)?;
        let projected = current.saturating_add(requested);
        debug!(
            project_id = %project.id,
            %current,
            %requested,
            "admission check"
        );

        if projected.cpu_milli > limits.cpu_milli {
            return Err(exceeded(
                "cpu",
                format_millicores(projected.cpu_milli),
                &project.cpu_limit,
            ));
        }
        if projected.memory_bytes > limits.memory_bytes {
            return Err(exceeded(
                "memory",
                format_mebibytes(projected.memory_bytes),
                &project.memory_limit,
            ));
        }
        if requested.storage_bytes > 0 && projected.storage_bytes > limits.storage_bytes {
            return Err(exceeded(
                "storage",
                format_mebibytes(projected.storage_bytes),
                &project.storage_limit,
            ));
        }

        info!(project_id = %project.id, %projected, "workload admitted");
        Ok(AdmissionPermit {
            project_id: project.id,
            projected,
            _guard: guard,
        })
    }
}

fn exceeded(resource: &str, requested: String, limit: &str) -> ProvisionError {
    info!(resource, %requested, limit, "admission rejected");
    ProvisionError::QuotaExceeded {
        resource: resource.to_string(),
        requested,
        limit: limit.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use kubemanager_state::{ProjectStatus, StateStore, Workload, WorkloadStatus};

    use super::*;

    fn project(cpu: &str, memory: &str, storage: &str) -> Project {
        Project {
            id: Uuid::new_v4(),
            name: "p1".into(),
            description: String::new(),
            cpu_limit: cpu.into(),
            memory_limit: memory.into(),
            storage_limit: storage.into(),
            status: ProjectStatus::Ready,
            current_phase: "PROVISIONING_DONE".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn row(project_id: Uuid, cpu: &str) -> Workload {
        let id = Uuid::new_v4();
        let name = format!("w-{}", &id.simple().to_string()[..8]);
        Workload {
            id,
            project_id,
            name: name.clone(),
            namespace: "km-p1".into(),
            release_name: name,
            chart_name: "standard-app".into(),
            chart_version: "0.1.0".into(),
            image: "nginx".into(),
            cpu_limit: cpu.into(),
            cpu_request: cpu.into(),
            memory_limit: "128Mi".into(),
            memory_request: "128Mi".into(),
            storage_size: "1Gi".into(),
            storage_class: "local-path".into(),
            persistence_enabled: false,
            mount_path: "/data".into(),
            replicas: 1,
            target_port: 8080,
            service_type: "ClusterIP".into(),
            env_vars: BTreeMap::new(),
            external_url: None,
            status: WorkloadStatus::Starting,
            current_phase: "HELM_CHART_LOADING".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn gate() -> (StateStore, AdmissionGate) {
        let store = StateStore::open_in_memory().unwrap();
        let gate = AdmissionGate::new(QuotaAccountant::new(store.clone()));
        (store, gate)
    }

    #[tokio::test]
    async fn rejects_cpu_over_limit() {
        let (_store, gate) = gate();
        let p = project("1000m", "4Gi", "10Gi");
        let request = ResourceUsage::for_workload("1000m", "256Mi", "1Gi", false, 2).unwrap();

        let err = gate.admit(&p, request, None).await.unwrap_err();

        match err {
            ProvisionError::QuotaExceeded {
                resource,
                requested,
                limit,
            } => {
                assert_eq!(resource, "cpu");
                assert_eq!(requested, "2000m");
                assert_eq!(limit, "1000m");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exact_fit_is_admitted() {
        let (_store, gate) = gate();
        let p = project("1000m", "512Mi", "1Gi");
        let request = ResourceUsage::for_workload("500m", "256Mi", "1Gi", true, 2).unwrap();

        let permit = gate.admit(&p, request, None).await.unwrap();
        assert_eq!(permit.projected.cpu_milli, 1000);
    }

    #[tokio::test]
    async fn storage_checked_in_bytes() {
        let (_store, gate) = gate();
        let p = project("4", "4Gi", "1Gi");
        let request = ResourceUsage::for_workload("100m", "64Mi", "1025Mi", true, 1).unwrap();

        let err = gate.admit(&p, request, None).await.unwrap_err();
        assert!(matches!(err, ProvisionError::QuotaExceeded { ref resource, .. } if resource == "storage"));
    }

    #[tokio::test]
    async fn existing_usage_counts_unless_excluded() {
        let (store, gate) = gate();
        let p = project("1000m", "4Gi", "10Gi");
        let existing = row(p.id, "800m");
        store.insert_workload(&existing).unwrap();
        let request = ResourceUsage::for_workload("400m", "64Mi", "0", false, 1).unwrap();

        assert!(gate.admit(&p, request, None).await.is_err());
        // Resizing the existing workload replaces its reservation.
        gate.admit(&p, request, Some(&existing.id)).await.unwrap();
    }

    #[tokio::test]
    async fn admission_is_serialized_per_project() {
        let (store, gate) = gate();
        let p = project("1000m", "4Gi", "10Gi");
        let request = ResourceUsage::for_workload("600m", "64Mi", "0", false, 1).unwrap();

        let first = gate.admit(&p, request, None).await.unwrap();

        // A second admission for the same project waits for the permit.
        let contender = {
            let gate = gate.clone();
            let p = p.clone();
            tokio::spawn(async move { gate.admit(&p, request, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // Record the admitted workload, then release the lock.
        store.insert_workload(&row(p.id, "600m")).unwrap();
        drop(first);

        let err = contender.await.unwrap().unwrap_err();
        assert!(matches!(err, ProvisionError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn forgotten_project_leaves_no_lock_behind() {
        let (_store, gate) = gate();
        let kept = project("1000m", "4Gi", "10Gi");
        let gone = project("1000m", "4Gi", "10Gi");
        let request = ResourceUsage::for_workload("100m", "64Mi", "0", false, 1).unwrap();
        drop(gate.admit(&kept, request, None).await.unwrap());
        drop(gate.admit(&gone, request, None).await.unwrap());
        assert_eq!(gate.locks.lock().unwrap().len(), 2);

        gate.forget(&gone.id);
        gate.forget(&gone.id);

        let locks = gate.locks.lock().unwrap();
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key(&kept.id));
    }

    #[tokio::test]
    async fn malformed_project_limit_is_validation_error() {
        let (_store, gate) = gate();
        let p = project("plenty", "4Gi", "10Gi");
        let request = ResourceUsage::for_workload("1", "64Mi", "0", false, 1).unwrap();
        assert!(matches!(
            gate.admit(&p, request, None).await.unwrap_err(),
            ProvisionError::Validation(_)
        ));
    }
}
