//! End-to-end provisioning scenarios against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kubemanager_cluster::{
    ClusterOp, ClusterResult, HelmInstaller, HelmOp, HelmRelease, InMemoryCluster, InMemoryHelm,
    NamespaceSpec, NamespaceUsage,
};
use kubemanager_core::KubeManagerConfig;
use kubemanager_core::naming::{LABEL_MANAGED, LABEL_PROJECT_ID};
use kubemanager_provision::sagas::project::ProjectCreateContext;
use kubemanager_provision::sagas::PROJECT_CREATE;
use kubemanager_provision::{
    CreateProjectRequest, DeployWorkloadRequest, ProvisionError, ProvisionSettings, Provisioner,
    UpdateWorkloadRequest,
};
use kubemanager_saga::SagaOutcome;
use kubemanager_state::{
    Project, ProjectStatus, ROLE_OWNER, SagaRecord, SagaStatus, StateStore, WorkloadPhase,
    WorkloadStatus,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

struct Harness {
    store: StateStore,
    cluster: Arc<InMemoryCluster>,
    helm: Arc<InMemoryHelm>,
    provisioner: Provisioner,
}

/// Helm whose installs block until the test hands out a permit.
struct GatedHelm {
    inner: Arc<InMemoryHelm>,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl HelmInstaller for GatedHelm {
    async fn upgrade_install(&self, release: &HelmRelease) -> ClusterResult<()> {
        let permit = self.permits.acquire().await.unwrap();
        permit.forget();
        self.inner.upgrade_install(release).await
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> ClusterResult<()> {
        self.inner.uninstall(namespace, release).await
    }
}

fn harness() -> Harness {
    let helm = Arc::new(InMemoryHelm::new());
    build_harness(helm.clone(), helm)
}

/// Harness whose Helm installs wait on the returned semaphore.
fn gated_harness() -> (Harness, Arc<Semaphore>) {
    let helm = Arc::new(InMemoryHelm::new());
    let permits = Arc::new(Semaphore::new(0));
    let gated = Arc::new(GatedHelm {
        inner: helm.clone(),
        permits: permits.clone(),
    });
    (build_harness(gated, helm), permits)
}

fn build_harness(installer: Arc<dyn HelmInstaller>, helm: Arc<InMemoryHelm>) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    store.seed_default_roles().unwrap();
    let cluster = Arc::new(InMemoryCluster::new());

    let mut config = KubeManagerConfig::default();
    config.saga.initial_interval_ms = 1;
    config.cluster.vps_address = "10.0.0.1".to_string();
    let provisioner = Provisioner::new(
        store.clone(),
        cluster.clone(),
        installer,
        ProvisionSettings::from_config(&config),
    );
    Harness {
        store,
        cluster,
        helm,
        provisioner,
    }
}

fn project_request(name: &str, cpu: &str) -> CreateProjectRequest {
    CreateProjectRequest {
        name: name.to_string(),
        cpu_limit: cpu.to_string(),
        ..Default::default()
    }
}

fn workload_request(project_id: Uuid, name: &str) -> DeployWorkloadRequest {
    DeployWorkloadRequest {
        project_id,
        name: name.to_string(),
        image: "nginx:1.21".to_string(),
        cpu_limit: Some("250m".to_string()),
        memory_limit: Some("256Mi".to_string()),
        ..Default::default()
    }
}

async fn ready_project(h: &Harness, name: &str, cpu: &str) -> Project {
    let (_, handle) = h
        .provisioner
        .create_project(project_request(name, cpu), Uuid::new_v4())
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);
    h.store.get_project_by_name(name).unwrap().unwrap()
}

async fn wait_for_phase(store: &StateStore, workload_id: &Uuid, phase: WorkloadPhase) {
    for _ in 0..400 {
        let workload = store.get_workload(workload_id).unwrap().unwrap();
        if workload.current_phase == phase.as_str() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("workload {workload_id} never reached {phase}");
}

// ── Projects ───────────────────────────────────────────────────────

#[tokio::test]
async fn project_reaches_ready_with_namespace_and_quota() {
    let h = harness();
    let owner = Uuid::new_v4();

    let (accepted, handle) = h
        .provisioner
        .create_project(project_request("p1", ""), owner)
        .unwrap();
    assert_eq!(accepted.status, "PROVISIONING");
    assert!(accepted.saga_id.starts_with("project.create-"));
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);

    let status = h.provisioner.get_status(&accepted.resource_id).await.unwrap();
    assert_eq!(status.status, ProjectStatus::Ready);
    assert_eq!(status.phase, "PROVISIONING_DONE");
    let ns = status.namespace.unwrap();
    assert_eq!(ns.name, "km-p1");
    assert_eq!(
        ns.label(LABEL_PROJECT_ID),
        Some(accepted.resource_id.to_string().as_str())
    );

    let quota = h.cluster.quota("km-p1").unwrap();
    assert_eq!(quota.cpu, "2000m");
    assert_eq!(quota.memory, "4Gi");

    let member = h
        .store
        .get_member(&accepted.resource_id, &owner)
        .unwrap()
        .unwrap();
    let role = h.store.get_role_by_name(ROLE_OWNER).unwrap().unwrap();
    assert_eq!(member.role_id, role.id);

    let saga = h.provisioner.saga_status(&accepted.saga_id).unwrap();
    assert_eq!(saga.status, SagaStatus::Succeeded);
}

#[tokio::test]
async fn namespace_failure_rolls_back_project_record() {
    let h = harness();
    h.cluster.fail_always(ClusterOp::CreateNamespace);

    let (accepted, handle) = h
        .provisioner
        .create_project(project_request("p2", ""), Uuid::new_v4())
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::FailedCompensated);

    let err = h
        .provisioner
        .get_status(&accepted.resource_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::NotFound(_)));
    assert!(h.store.get_project_by_name("p2").unwrap().is_none());
    assert_eq!(h.cluster.calls(ClusterOp::CreateNamespace), 3);

    let saga = h.provisioner.saga_status(&accepted.saga_id).unwrap();
    assert_eq!(saga.failed_step.as_deref(), Some("create_namespace"));
}

#[tokio::test]
async fn quota_failure_removes_our_namespace() {
    let h = harness();
    h.cluster.fail_always(ClusterOp::ReconcileQuota);

    let (_, handle) = h
        .provisioner
        .create_project(project_request("p3", ""), Uuid::new_v4())
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::FailedCompensated);
    assert!(h.cluster.namespace("km-p3").is_none());
    assert!(h.store.get_project_by_name("p3").unwrap().is_none());
}

#[tokio::test]
async fn existing_namespace_is_adopted() {
    let h = harness();
    h.cluster.insert_namespace(NamespaceSpec {
        name: "km-p1".to_string(),
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
    });

    let (accepted, handle) = h
        .provisioner
        .create_project(project_request("p1", ""), Uuid::new_v4())
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);

    let project = h.store.get_project(&accepted.resource_id).unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Ready);
    assert_eq!(h.cluster.calls(ClusterOp::CreateNamespace), 1);
    assert!(h.cluster.quota("km-p1").is_some());
}

#[tokio::test]
async fn rollback_leaves_foreign_namespace_alone() {
    let h = harness();
    let foreign = Uuid::new_v4().to_string();
    h.cluster.insert_namespace(NamespaceSpec {
        name: "km-p3".to_string(),
        labels: BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_PROJECT_ID.to_string(), foreign.clone()),
        ]),
        annotations: BTreeMap::new(),
    });
    h.cluster.fail_always(ClusterOp::ReconcileQuota);

    let (_, handle) = h
        .provisioner
        .create_project(project_request("p3", ""), Uuid::new_v4())
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::FailedCompensated);

    let ns = h.cluster.namespace("km-p3").unwrap();
    assert_eq!(ns.labels.get(LABEL_PROJECT_ID), Some(&foreign));
    assert_eq!(h.cluster.calls(ClusterOp::DeleteNamespace), 0);
    assert!(h.store.get_project_by_name("p3").unwrap().is_none());
}

#[tokio::test]
async fn transient_namespace_error_is_retried() {
    let h = harness();
    h.cluster.fail_next(ClusterOp::CreateNamespace, 2);

    let project = ready_project(&h, "p4", "").await;
    assert_eq!(project.status, ProjectStatus::Ready);
    assert_eq!(h.cluster.calls(ClusterOp::CreateNamespace), 3);
}

#[tokio::test]
async fn duplicate_and_invalid_names_are_rejected() {
    let h = harness();
    ready_project(&h, "p1", "").await;

    let err = h
        .provisioner
        .create_project(project_request("p1", ""), Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Conflict(_)));

    let err = h
        .provisioner
        .create_project(project_request("Not_A_Label", ""), Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Validation(_)));

    let err = h
        .provisioner
        .create_project(project_request("p9", "lots"), Uuid::new_v4())
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Validation(_)));
}

#[tokio::test]
async fn status_reports_failure_when_namespace_disappears() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;

    h.cluster.remove_namespace("km-p1");
    let status = h.provisioner.get_status(&project.id).await.unwrap();
    assert_eq!(status.status, ProjectStatus::Error);
    assert_eq!(status.phase, "PROVISIONING_FAILED");

    // The stored row is left as it was.
    let stored = h.store.get_project(&project.id).unwrap().unwrap();
    assert_eq!(stored.status, ProjectStatus::Ready);
}

#[tokio::test]
async fn delete_project_removes_namespace_and_record() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;
    let (_, handle) = h
        .provisioner
        .deploy_workload(workload_request(project.id, "web"))
        .await
        .unwrap();
    handle.wait().await.unwrap();

    let (accepted, handle) = h.provisioner.delete_project(&project.id).unwrap();
    assert_eq!(accepted.status, "DELETING");
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);

    assert!(h.cluster.namespace("km-p1").is_none());
    assert!(h.store.get_project(&project.id).unwrap().is_none());
    assert!(h.store.list_workloads_for_project(&project.id).unwrap().is_empty());
}

#[tokio::test]
async fn failed_project_deletion_stays_deleting() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;
    h.cluster.fail_always(ClusterOp::DeleteNamespace);

    let (_, handle) = h.provisioner.delete_project(&project.id).unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::FailedCompensated);

    let stored = h.store.get_project(&project.id).unwrap().unwrap();
    assert_eq!(stored.status, ProjectStatus::Deleting);
    assert!(h.cluster.namespace("km-p1").is_some());

    let err = h.provisioner.delete_project(&project.id).unwrap_err();
    assert!(matches!(err, ProvisionError::Conflict(_)));
}

#[tokio::test]
async fn project_deleted_during_install_leaves_no_release() {
    let (h, permits) = gated_harness();
    let project = ready_project(&h, "p1", "").await;
    let (accepted, deploy) = h
        .provisioner
        .deploy_workload(workload_request(project.id, "web"))
        .await
        .unwrap();
    wait_for_phase(&h.store, &accepted.resource_id, WorkloadPhase::HelmInstalling).await;

    let (_, delete) = h.provisioner.delete_project(&project.id).unwrap();
    assert_eq!(delete.wait().await.unwrap(), SagaOutcome::Succeeded);

    permits.add_permits(1);
    assert_eq!(deploy.wait().await.unwrap(), SagaOutcome::FailedCompensated);

    assert!(h.store.get_workload(&accepted.resource_id).unwrap().is_none());
    assert!(h.helm.release("km-p1", "web").is_none());
    assert_eq!(h.helm.calls(HelmOp::Uninstall), 1);
}

#[tokio::test]
async fn metrics_combine_live_usage_and_reservations() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;
    let (_, handle) = h
        .provisioner
        .deploy_workload(DeployWorkloadRequest {
            replicas: Some(2),
            ..workload_request(project.id, "web")
        })
        .await
        .unwrap();
    handle.wait().await.unwrap();
    h.cluster.set_usage(
        "km-p1",
        NamespaceUsage {
            cpu_milli: 120,
            memory_bytes: 300 * 1024 * 1024,
        },
    );

    let metrics = h.provisioner.get_metrics(&project.id).await.unwrap();
    assert_eq!(metrics.cpu_usage, "120m");
    assert_eq!(metrics.memory_usage, "300Mi");
    assert_eq!(metrics.reserved.cpu_milli, 500);
    assert_eq!(metrics.reserved.memory_mi, 512);
    assert_eq!(metrics.reserved.storage_gi, 0);
    assert_eq!(metrics.cpu_limit, "2000m");
}

// ── Workloads ──────────────────────────────────────────────────────

#[tokio::test]
async fn admission_rejects_cpu_over_project_limit() {
    let h = harness();
    let project = ready_project(&h, "p1", "1000m").await;

    let err = h
        .provisioner
        .deploy_workload(DeployWorkloadRequest {
            cpu_limit: Some("1000m".to_string()),
            replicas: Some(2),
            ..workload_request(project.id, "w1")
        })
        .await
        .unwrap_err();

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
    assert!(h.store.list_workloads_for_project(&project.id).unwrap().is_empty());
    assert_eq!(h.helm.calls(HelmOp::UpgradeInstall), 0);
}

#[tokio::test]
async fn workload_deploys_with_secret_and_ingress() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;

    let mut req = workload_request(project.id, "web");
    req.secrets = BTreeMap::from([("DB_PASSWORD".to_string(), "hunter2".to_string())]);
    req.env_vars = BTreeMap::from([("MODE".to_string(), "prod".to_string())]);
    let (accepted, handle) = h.provisioner.deploy_workload(req).await.unwrap();
    assert_eq!(accepted.status, "STARTING");
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);

    let workload = h.provisioner.get_workload(&accepted.resource_id).unwrap();
    assert_eq!(workload.status, WorkloadStatus::Running);
    assert_eq!(workload.current_phase, "DEPLOYED");
    assert_eq!(workload.namespace, "km-p1");
    assert_eq!(workload.cpu_request, "250m");

    let short = &project.id.to_string()[..6];
    let host = format!("web-{short}.10.0.0.1.sslip.io");
    assert_eq!(workload.external_url, Some(format!("http://{host}")));

    let secret = h.cluster.secret("km-p1", "web-env").unwrap();
    assert_eq!(secret["DB_PASSWORD"], "hunter2");

    let release = h.helm.release("km-p1", "web").unwrap();
    assert_eq!(release.values["image"]["repository"], "nginx");
    assert_eq!(release.values["image"]["tag"], "1.21");
    assert_eq!(release.values["ingress"]["host"], host);
    assert_eq!(release.values["envSecretName"], "web-env");
    assert_eq!(release.values["envVars"]["MODE"], "prod");
}

#[tokio::test]
async fn helm_failure_keeps_failed_row_out_of_quota() {
    let h = harness();
    let project = ready_project(&h, "p1", "1000m").await;
    h.helm.fail_always(HelmOp::UpgradeInstall);

    let (accepted, handle) = h
        .provisioner
        .deploy_workload(DeployWorkloadRequest {
            cpu_limit: Some("1000m".to_string()),
            ..workload_request(project.id, "web")
        })
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::FailedCompensated);

    let workload = h.provisioner.get_workload(&accepted.resource_id).unwrap();
    assert_eq!(workload.status, WorkloadStatus::Failed);
    assert_eq!(workload.current_phase, "HELM_ERROR");

    // The failed row no longer reserves anything.
    h.helm.heal(HelmOp::UpgradeInstall);
    let (_, handle) = h
        .provisioner
        .deploy_workload(DeployWorkloadRequest {
            cpu_limit: Some("1000m".to_string()),
            ..workload_request(project.id, "api")
        })
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);
}

#[tokio::test]
async fn malformed_image_fails_before_helm() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;

    let (accepted, handle) = h
        .provisioner
        .deploy_workload(DeployWorkloadRequest {
            image: "a:b:c".to_string(),
            ..workload_request(project.id, "web")
        })
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::FailedCompensated);

    let workload = h.provisioner.get_workload(&accepted.resource_id).unwrap();
    assert_eq!(workload.status, WorkloadStatus::Failed);
    assert_eq!(workload.current_phase, "SECRET_CREATION_ERROR");
    assert_eq!(h.helm.calls(HelmOp::UpgradeInstall), 0);
}

#[tokio::test]
async fn duplicate_workload_name_conflicts() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;
    let (_, handle) = h
        .provisioner
        .deploy_workload(workload_request(project.id, "web"))
        .await
        .unwrap();
    handle.wait().await.unwrap();

    let err = h
        .provisioner
        .deploy_workload(workload_request(project.id, "web"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Conflict(_)));
}

#[tokio::test]
async fn update_rejects_storage_shrink_and_bad_image() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;
    let (accepted, handle) = h
        .provisioner
        .deploy_workload(DeployWorkloadRequest {
            persistence_enabled: true,
            storage_size: Some("2Gi".to_string()),
            ..workload_request(project.id, "db")
        })
        .await
        .unwrap();
    handle.wait().await.unwrap();

    let err = h
        .provisioner
        .update_workload(
            &accepted.resource_id,
            UpdateWorkloadRequest {
                storage_size: Some("1Gi".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Unsupported(_)));

    let err = h
        .provisioner
        .update_workload(
            &accepted.resource_id,
            UpdateWorkloadRequest {
                image: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Validation(_)));
}

#[tokio::test]
async fn update_resizes_within_quota() {
    let h = harness();
    let project = ready_project(&h, "p1", "1000m").await;
    let (accepted, handle) = h
        .provisioner
        .deploy_workload(DeployWorkloadRequest {
            cpu_limit: Some("500m".to_string()),
            ..workload_request(project.id, "web")
        })
        .await
        .unwrap();
    handle.wait().await.unwrap();
    let id = accepted.resource_id;

    // 2 × 500m replaces the existing 500m reservation instead of adding to it.
    let (accepted, handle) = h
        .provisioner
        .update_workload(
            &id,
            UpdateWorkloadRequest {
                replicas: Some(2),
                image: Some("nginx:1.25".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(accepted.status, "SCALING");
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);

    let workload = h.provisioner.get_workload(&id).unwrap();
    assert_eq!(workload.status, WorkloadStatus::Running);
    assert_eq!(workload.replicas, 2);
    let release = h.helm.release("km-p1", "web").unwrap();
    assert_eq!(release.values["replicaCount"], 2);
    assert_eq!(release.values["image"]["tag"], "1.25");

    let err = h
        .provisioner
        .update_workload(
            &id,
            UpdateWorkloadRequest {
                replicas: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::QuotaExceeded { .. }));
}

#[tokio::test]
async fn delete_workload_uninstalls_and_removes_row() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;
    let (accepted, handle) = h
        .provisioner
        .deploy_workload(workload_request(project.id, "web"))
        .await
        .unwrap();
    handle.wait().await.unwrap();

    let (_, handle) = h.provisioner.delete_workload(&accepted.resource_id).unwrap();
    assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);

    assert!(h.helm.release("km-p1", "web").is_none());
    assert!(h.cluster.secret("km-p1", "web-env").is_none());
    assert!(matches!(
        h.provisioner.get_workload(&accepted.resource_id).unwrap_err(),
        ProvisionError::NotFound(_)
    ));
}

#[tokio::test]
async fn delete_waits_for_install_to_finish() {
    let (h, permits) = gated_harness();
    let project = ready_project(&h, "p1", "").await;
    let (accepted, deploy) = h
        .provisioner
        .deploy_workload(workload_request(project.id, "web"))
        .await
        .unwrap();
    wait_for_phase(&h.store, &accepted.resource_id, WorkloadPhase::HelmInstalling).await;

    let err = h.provisioner.delete_workload(&accepted.resource_id).unwrap_err();
    assert!(matches!(err, ProvisionError::Conflict(_)));
    let stored = h.store.get_workload(&accepted.resource_id).unwrap().unwrap();
    assert_eq!(stored.status, WorkloadStatus::Starting);

    permits.add_permits(1);
    assert_eq!(deploy.wait().await.unwrap(), SagaOutcome::Succeeded);
    assert!(h.helm.release("km-p1", "web").is_some());

    let (_, delete) = h.provisioner.delete_workload(&accepted.resource_id).unwrap();
    assert_eq!(delete.wait().await.unwrap(), SagaOutcome::Succeeded);
    assert!(h.helm.release("km-p1", "web").is_none());
}

#[tokio::test]
async fn repeated_delete_is_refused() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;
    let (accepted, handle) = h
        .provisioner
        .deploy_workload(workload_request(project.id, "web"))
        .await
        .unwrap();
    handle.wait().await.unwrap();
    h.helm.fail_always(HelmOp::Uninstall);

    let (_, handle) = h.provisioner.delete_workload(&accepted.resource_id).unwrap();
    let err = h.provisioner.delete_workload(&accepted.resource_id).unwrap_err();
    assert!(matches!(err, ProvisionError::Conflict(_)));
    handle.wait().await.unwrap();

    let stored = h.store.get_workload(&accepted.resource_id).unwrap().unwrap();
    assert_eq!(stored.status, WorkloadStatus::Failed);
}

#[tokio::test]
async fn concurrent_deploys_with_one_name_admit_one() {
    let h = harness();
    let project = ready_project(&h, "p1", "").await;

    let (first, second) = tokio::join!(
        h.provisioner.deploy_workload(workload_request(project.id, "web")),
        h.provisioner.deploy_workload(workload_request(project.id, "web")),
    );
    let (ok, err) = match (first, second) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        (first, second) => panic!("expected one admission, got {first:?} and {second:?}"),
    };
    assert!(matches!(err, ProvisionError::Conflict(_)));
    assert_eq!(ok.1.wait().await.unwrap(), SagaOutcome::Succeeded);
    assert_eq!(
        h.store.list_workloads_for_project(&project.id).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn deploy_requires_ready_project() {
    let h = harness();
    let err = h
        .provisioner
        .deploy_workload(workload_request(Uuid::new_v4(), "web"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::NotFound(_)));

    let project = ready_project(&h, "p1", "").await;
    h.store
        .update_project_status(&project.id, ProjectStatus::Suspended, "SUSPENDED")
        .unwrap();
    let err = h
        .provisioner
        .deploy_workload(workload_request(project.id, "web"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Conflict(_)));
}

// ── Recovery ───────────────────────────────────────────────────────

#[tokio::test]
async fn interrupted_provisioning_resumes() {
    let h = harness();
    let project_id = Uuid::new_v4();
    let ctx = ProjectCreateContext {
        project_id,
        name: "p5".to_string(),
        description: String::new(),
        owner_id: Uuid::new_v4(),
        cpu_limit: "1".to_string(),
        memory_limit: "1Gi".to_string(),
        storage_limit: "1Gi".to_string(),
        namespace: "km-p5".to_string(),
        created_at: "2026-01-01T00:00:00Z".to_string(),
    };
    let record = SagaRecord::new(
        "project.create-recovered",
        PROJECT_CREATE,
        &project_id.to_string(),
        &[
            "create_project_record",
            "create_namespace",
            "reconcile_quota",
            "assign_owner_role",
            "mark_project_ready",
        ],
        serde_json::to_value(&ctx).unwrap(),
    );
    h.store.put_saga(&record).unwrap();

    let handles = h.provisioner.resume_incomplete().unwrap();
    assert_eq!(handles.len(), 1);
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap(), SagaOutcome::Succeeded);
    }

    let project = h.store.get_project(&project_id).unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Ready);
    assert!(h.cluster.namespace("km-p5").is_some());
    assert!(h.provisioner.resume_incomplete().unwrap().is_empty());
}
