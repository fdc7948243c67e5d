//! Workload deployment, update and deletion sagas.
//!
//! Deployment runs `mark_workload_starting → parse_image → ensure_secret →
//! install_chart → mark_workload_deployed`; update re-runs everything from
//! `parse_image` against the existing release. On failure the row is kept,
//! flagged FAILED with a phase naming the stage that broke, so operators
//! can inspect it. The one exception is a row deleted while its release
//! was being applied: that release is uninstalled again.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kubemanager_cluster::{ClusterProvisioner, HelmInstaller, HelmRelease};
use kubemanager_core::ImageRef;
use kubemanager_core::naming::{env_secret_name, ingress_host};
use kubemanager_saga::{FailureHook, SagaDefinition, Step, StepError, StepOptions, StepResult};
use kubemanager_state::{StateError, StateResult, StateStore, Workload, WorkloadPhase, WorkloadStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ChartSettings, SagaDeps, WORKLOAD_DELETE, WORKLOAD_DEPLOY, WORKLOAD_UPDATE};
use crate::error::step_error;

/// Extra time the install step gets on top of Helm's own `--wait` timeout.
const INSTALL_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// Data threaded through the workload sagas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadContext {
    pub workload_id: Uuid,
    pub project_id: Uuid,
    pub namespace: String,
    pub release_name: String,
    pub image: String,
    /// Secret contents; `None` leaves the existing secret untouched.
    pub secrets: Option<BTreeMap<String, String>>,
    pub image_ref: Option<ImageRef>,
    pub external_url: Option<String>,
}

impl WorkloadContext {
    pub fn for_workload(workload: &Workload, secrets: Option<BTreeMap<String, String>>) -> Self {
        Self {
            workload_id: workload.id,
            project_id: workload.project_id,
            namespace: workload.namespace.clone(),
            release_name: workload.release_name.clone(),
            image: workload.image.clone(),
            secrets,
            image_ref: None,
            external_url: None,
        }
    }
}

fn install_options(deps: &SagaDeps) -> StepOptions {
    let mut options = deps.profiles.remote.clone();
    options.timeout = options.timeout.max(deps.chart.timeout + INSTALL_GRACE);
    options
}

pub fn deploy_definition(deps: &SagaDeps) -> SagaDefinition<WorkloadContext> {
    SagaDefinition::new(WORKLOAD_DEPLOY)
        .step(
            MarkWorkloadStarting {
                store: deps.store.clone(),
            },
            deps.profiles.local.clone(),
        )
        .step(ParseImage, deps.profiles.local.clone())
        .step(
            EnsureSecret {
                cluster: deps.cluster.clone(),
            },
            deps.profiles.remote.clone(),
        )
        .step(InstallChart::new(deps), install_options(deps))
        .step(
            MarkWorkloadDeployed {
                store: deps.store.clone(),
            },
            deps.profiles.local.clone(),
        )
        .on_failure(WorkloadFailed {
            store: deps.store.clone(),
        })
}

/// Update re-applies the secret and chart for an already-admitted shape.
pub fn update_definition(deps: &SagaDeps) -> SagaDefinition<WorkloadContext> {
    SagaDefinition::new(WORKLOAD_UPDATE)
        .step(ParseImage, deps.profiles.local.clone())
        .step(
            EnsureSecret {
                cluster: deps.cluster.clone(),
            },
            deps.profiles.remote.clone(),
        )
        .step(InstallChart::new(deps), install_options(deps))
        .step(
            MarkWorkloadDeployed {
                store: deps.store.clone(),
            },
            deps.profiles.local.clone(),
        )
        .on_failure(WorkloadFailed {
            store: deps.store.clone(),
        })
}

pub fn delete_definition(deps: &SagaDeps) -> SagaDefinition<WorkloadContext> {
    SagaDefinition::new(WORKLOAD_DELETE)
        .step(
            UninstallRelease {
                store: deps.store.clone(),
                helm: deps.helm.clone(),
            },
            install_options(deps),
        )
        .step(
            DeleteSecret {
                cluster: deps.cluster.clone(),
            },
            deps.profiles.remote.clone(),
        )
        .step(
            DeleteWorkloadRecord {
                store: deps.store.clone(),
            },
            deps.profiles.local.clone(),
        )
        .on_failure(WorkloadFailed {
            store: deps.store.clone(),
        })
}

/// Helm values for the standard application chart.
pub fn helm_values(workload: &Workload, image: &ImageRef, host: &str) -> serde_json::Value {
    let mut values = json!({
        "replicaCount": workload.effective_replicas(),
        "image": {
            "repository": image.repository,
            "tag": image.tag,
        },
        "service": {
            "type": workload.service_type,
            "port": workload.target_port,
        },
        "ingress": {
            "enabled": true,
            "host": host,
        },
        "resources": {
            "limits": {
                "cpu": workload.cpu_limit,
                "memory": workload.memory_limit,
            },
            "requests": {
                "cpu": workload.cpu_request,
                "memory": workload.memory_request,
            },
        },
        "persistence": {
            "enabled": workload.persistence_enabled,
            "size": workload.storage_size,
            "storageClass": workload.storage_class,
            "mountPath": workload.mount_path,
        },
        "envSecretName": env_secret_name(&workload.release_name),
    });
    if !workload.env_vars.is_empty() {
        values["envVars"] = json!(workload.env_vars);
    }
    values
}

/// Rewrite the phase, keeping whatever status the workload has.
fn set_phase(store: &StateStore, id: &Uuid, phase: WorkloadPhase) -> StateResult<Workload> {
    store.modify_workload(id, |workload| {
        workload.current_phase = phase.as_str().to_string();
        Ok(())
    })
}

// ── Deployment steps ───────────────────────────────────────────────

struct MarkWorkloadStarting {
    store: StateStore,
}

#[async_trait]
impl Step<WorkloadContext> for MarkWorkloadStarting {
    fn name(&self) -> &'static str {
        "mark_workload_starting"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(WorkloadPhase::HelmPreparing.as_str())
    }

    async fn run(&self, ctx: &mut WorkloadContext) -> StepResult {
        self.store.update_workload_status(
            &ctx.workload_id,
            WorkloadStatus::Starting,
            WorkloadPhase::HelmPreparing.as_str(),
        )?;
        Ok(())
    }
}

struct ParseImage;

#[async_trait]
impl Step<WorkloadContext> for ParseImage {
    fn name(&self) -> &'static str {
        "parse_image"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(WorkloadPhase::HelmPreparing.as_str())
    }

    async fn run(&self, ctx: &mut WorkloadContext) -> StepResult {
        let image = ImageRef::parse(&ctx.image).map_err(|e| StepError::Validation(e.to_string()))?;
        ctx.image_ref = Some(image);
        Ok(())
    }
}

struct EnsureSecret {
    cluster: Arc<dyn ClusterProvisioner>,
}

#[async_trait]
impl Step<WorkloadContext> for EnsureSecret {
    fn name(&self) -> &'static str {
        "ensure_secret"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(WorkloadPhase::HelmPreparing.as_str())
    }

    async fn run(&self, ctx: &mut WorkloadContext) -> StepResult {
        let Some(data) = &ctx.secrets else {
            return Ok(());
        };
        self.cluster
            .ensure_secret(&ctx.namespace, &env_secret_name(&ctx.release_name), data)
            .await
            .map_err(step_error)
    }
}

struct InstallChart {
    store: StateStore,
    helm: Arc<dyn HelmInstaller>,
    chart: ChartSettings,
    public_address: String,
}

impl InstallChart {
    fn new(deps: &SagaDeps) -> Self {
        Self {
            store: deps.store.clone(),
            helm: deps.helm.clone(),
            chart: deps.chart.clone(),
            public_address: deps.public_address.clone(),
        }
    }

    /// The workload was deleted while its release was being applied. The
    /// release goes too and the step fails.
    async fn discard(&self, ctx: &WorkloadContext) -> StepResult {
        warn!(
            workload_id = %ctx.workload_id,
            release = %ctx.release_name,
            "workload removed during install, uninstalling release"
        );
        self.helm
            .uninstall(&ctx.namespace, &ctx.release_name)
            .await
            .map_err(step_error)?;
        Err(StepError::NotFound(format!("workload {}", ctx.workload_id)))
    }
}

#[async_trait]
impl Step<WorkloadContext> for InstallChart {
    fn name(&self) -> &'static str {
        "install_chart"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(WorkloadPhase::HelmInstalling.as_str())
    }

    async fn run(&self, ctx: &mut WorkloadContext) -> StepResult {
        let workload = match set_phase(&self.store, &ctx.workload_id, WorkloadPhase::HelmInstalling) {
            Ok(workload) => workload,
            Err(StateError::NotFound(_)) => return self.discard(ctx).await,
            Err(e) => return Err(e.into()),
        };
        let image = match &ctx.image_ref {
            Some(image) => image.clone(),
            None => ImageRef::parse(&ctx.image).map_err(|e| StepError::Validation(e.to_string()))?,
        };
        let host = ingress_host(&ctx.release_name, &ctx.project_id, &self.public_address);

        let release = HelmRelease {
            name: ctx.release_name.clone(),
            namespace: ctx.namespace.clone(),
            chart_path: self.chart.path.clone(),
            values: helm_values(&workload, &image, &host),
            timeout: self.chart.timeout,
        };
        self.helm.upgrade_install(&release).await.map_err(step_error)?;

        let url = format!("http://{host}");
        let recorded = self.store.modify_workload(&ctx.workload_id, |workload| {
            workload.external_url = Some(url.clone());
            Ok(())
        });
        match recorded {
            Ok(_) => {
                ctx.external_url = Some(url);
                Ok(())
            }
            Err(StateError::NotFound(_)) => self.discard(ctx).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Only a release whose workload row is gone is taken down.
    async fn compensate(&self, ctx: &WorkloadContext) -> StepResult {
        if self.store.get_workload(&ctx.workload_id)?.is_some() {
            return Ok(());
        }
        self.helm
            .uninstall(&ctx.namespace, &ctx.release_name)
            .await
            .map_err(step_error)?;
        info!(workload_id = %ctx.workload_id, release = %ctx.release_name, "orphaned release rolled back");
        Ok(())
    }
}

struct MarkWorkloadDeployed {
    store: StateStore,
}

#[async_trait]
impl Step<WorkloadContext> for MarkWorkloadDeployed {
    fn name(&self) -> &'static str {
        "mark_workload_deployed"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(WorkloadPhase::Deployed.as_str())
    }

    async fn run(&self, ctx: &mut WorkloadContext) -> StepResult {
        self.store.update_workload_status(
            &ctx.workload_id,
            WorkloadStatus::Running,
            WorkloadPhase::Deployed.as_str(),
        )?;
        info!(
            workload_id = %ctx.workload_id,
            release = %ctx.release_name,
            url = ctx.external_url.as_deref().unwrap_or(""),
            "workload deployed"
        );
        Ok(())
    }
}

/// Writes the terminal FAILED status. The phase tells which stage broke.
struct WorkloadFailed {
    store: StateStore,
}

#[async_trait]
impl FailureHook<WorkloadContext> for WorkloadFailed {
    async fn on_failure(
        &self,
        ctx: &WorkloadContext,
        failed_step: &str,
        error: &StepError,
    ) -> StepResult {
        let phase = match failed_step {
            "parse_image" | "ensure_secret" => WorkloadPhase::SecretCreationError,
            _ => WorkloadPhase::HelmError,
        };
        warn!(
            workload_id = %ctx.workload_id,
            step = failed_step,
            %phase,
            %error,
            "workload saga failed"
        );
        match self
            .store
            .update_workload_status(&ctx.workload_id, WorkloadStatus::Failed, phase.as_str())
        {
            Err(StateError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()).map_err(StepError::from),
        }
    }
}

// ── Deletion steps ─────────────────────────────────────────────────

struct UninstallRelease {
    store: StateStore,
    helm: Arc<dyn HelmInstaller>,
}

#[async_trait]
impl Step<WorkloadContext> for UninstallRelease {
    fn name(&self) -> &'static str {
        "uninstall_release"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(WorkloadPhase::HelmUninstalling.as_str())
    }

    async fn run(&self, ctx: &mut WorkloadContext) -> StepResult {
        set_phase(&self.store, &ctx.workload_id, WorkloadPhase::HelmUninstalling)?;
        self.helm
            .uninstall(&ctx.namespace, &ctx.release_name)
            .await
            .map_err(step_error)
    }
}

struct DeleteSecret {
    cluster: Arc<dyn ClusterProvisioner>,
}

#[async_trait]
impl Step<WorkloadContext> for DeleteSecret {
    fn name(&self) -> &'static str {
        "delete_secret"
    }

    async fn run(&self, ctx: &mut WorkloadContext) -> StepResult {
        self.cluster
            .delete_secret(&ctx.namespace, &env_secret_name(&ctx.release_name))
            .await
            .map_err(step_error)
    }
}

struct DeleteWorkloadRecord {
    store: StateStore,
}

#[async_trait]
impl Step<WorkloadContext> for DeleteWorkloadRecord {
    fn name(&self) -> &'static str {
        "delete_workload_record"
    }

    async fn run(&self, ctx: &mut WorkloadContext) -> StepResult {
        self.store.delete_workload(&ctx.workload_id)?;
        info!(workload_id = %ctx.workload_id, release = %ctx.release_name, "workload deleted");
        Ok(())
    }
}
