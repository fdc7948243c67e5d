//! Project provisioning and deletion sagas.
//!
//! Provisioning:
//!
//! ```text
//! create_project_record → create_namespace → reconcile_quota → assign_owner_role → mark_project_ready
//!   (delete record)        (delete namespace    (no-op)            (no-op)
//!                           if ours)
//! ```
//!
//! Deletion is forward-only: mark_project_deleting → delete_namespace →
//! delete_project_record.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kubemanager_cluster::{ClusterProvisioner, NamespaceSpec, QuotaSpec};
use kubemanager_core::naming::{ANNOTATION_CREATED_AT, LABEL_MANAGED, LABEL_NAME, LABEL_PROJECT_ID};
use kubemanager_saga::{FailureHook, SagaDefinition, Step, StepError, StepResult};
use kubemanager_state::{
    Project, ProjectPhase, ProjectStatus, ROLE_OWNER, StateError, StateStore, epoch_secs,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{PROJECT_CREATE, PROJECT_DELETE, SagaDeps};
use crate::admission::AdmissionGate;
use crate::error::step_error;
use crate::rbac::RbacService;

/// Data threaded through the provisioning saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCreateContext {
    pub project_id: Uuid,
    pub name: String,
    pub description: String,
    pub owner_id: Uuid,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub storage_limit: String,
    pub namespace: String,
    /// RFC 3339 creation time, recorded as a namespace annotation.
    pub created_at: String,
}

/// Data threaded through the deletion saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDeleteContext {
    pub project_id: Uuid,
    pub name: String,
    pub namespace: String,
}

fn set_phase(store: &StateStore, project_id: &Uuid, phase: ProjectPhase) -> StepResult {
    store.update_project_status(project_id, ProjectStatus::Provisioning, phase.as_str())?;
    Ok(())
}

pub fn create_definition(deps: &SagaDeps) -> SagaDefinition<ProjectCreateContext> {
    let local = deps.profiles.local.clone();
    let remote = deps.profiles.remote.clone();
    SagaDefinition::new(PROJECT_CREATE)
        .step(
            CreateProjectRecord {
                store: deps.store.clone(),
            },
            local.clone(),
        )
        .step(
            CreateNamespace {
                store: deps.store.clone(),
                cluster: deps.cluster.clone(),
            },
            remote.clone(),
        )
        .step(
            ReconcileQuota {
                store: deps.store.clone(),
                cluster: deps.cluster.clone(),
            },
            remote,
        )
        .step(
            AssignOwnerRole {
                store: deps.store.clone(),
                rbac: deps.rbac.clone(),
            },
            local.clone(),
        )
        .step(
            MarkProjectReady {
                store: deps.store.clone(),
            },
            local,
        )
        .on_failure(ProvisioningFailed {
            store: deps.store.clone(),
        })
}

pub fn delete_definition(deps: &SagaDeps) -> SagaDefinition<ProjectDeleteContext> {
    SagaDefinition::new(PROJECT_DELETE)
        .step(
            MarkProjectDeleting {
                store: deps.store.clone(),
            },
            deps.profiles.local.clone(),
        )
        .step(
            DeleteNamespace {
                cluster: deps.cluster.clone(),
            },
            deps.profiles.remote.clone(),
        )
        .step(
            DeleteProjectRecord {
                store: deps.store.clone(),
                gate: deps.gate.clone(),
            },
            deps.profiles.local.clone(),
        )
}

// ── Provisioning steps ─────────────────────────────────────────────

struct CreateProjectRecord {
    store: StateStore,
}

#[async_trait]
impl Step<ProjectCreateContext> for CreateProjectRecord {
    fn name(&self) -> &'static str {
        "create_project_record"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(ProjectPhase::DbInitializing.as_str())
    }

    async fn run(&self, ctx: &mut ProjectCreateContext) -> StepResult {
        let now = epoch_secs();
        let project = Project {
            id: ctx.project_id,
            name: ctx.name.clone(),
            description: ctx.description.clone(),
            cpu_limit: ctx.cpu_limit.clone(),
            memory_limit: ctx.memory_limit.clone(),
            storage_limit: ctx.storage_limit.clone(),
            status: ProjectStatus::Provisioning,
            current_phase: ProjectPhase::DbInitializing.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store
            .create_project_with_owner(&project, &ctx.owner_id, ROLE_OWNER)?;
        Ok(())
    }

    async fn compensate(&self, ctx: &ProjectCreateContext) -> StepResult {
        let existed = self.store.delete_project(&ctx.project_id)?;
        info!(project_id = %ctx.project_id, existed, "project record rolled back");
        Ok(())
    }
}

struct CreateNamespace {
    store: StateStore,
    cluster: Arc<dyn ClusterProvisioner>,
}

#[async_trait]
impl Step<ProjectCreateContext> for CreateNamespace {
    fn name(&self) -> &'static str {
        "create_namespace"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(ProjectPhase::NamespaceCreating.as_str())
    }

    async fn run(&self, ctx: &mut ProjectCreateContext) -> StepResult {
        set_phase(&self.store, &ctx.project_id, ProjectPhase::NamespaceCreating)?;
        let spec = NamespaceSpec {
            name: ctx.namespace.clone(),
            labels: BTreeMap::from([
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_PROJECT_ID.to_string(), ctx.project_id.to_string()),
                (LABEL_NAME.to_string(), ctx.name.clone()),
            ]),
            annotations: BTreeMap::from([(
                ANNOTATION_CREATED_AT.to_string(),
                ctx.created_at.clone(),
            )]),
        };
        self.cluster
            .create_namespace(&spec)
            .await
            .map_err(step_error)
    }

    /// Only a namespace labelled with this project's id is removed; a
    /// same-named namespace belonging to someone else is left alone.
    async fn compensate(&self, ctx: &ProjectCreateContext) -> StepResult {
        let Some(ns) = self
            .cluster
            .get_namespace(&ctx.namespace)
            .await
            .map_err(step_error)?
        else {
            return Ok(());
        };
        let ours = ctx.project_id.to_string();
        if ns.label(LABEL_PROJECT_ID) != Some(ours.as_str()) {
            warn!(
                namespace = %ctx.namespace,
                project_id = %ctx.project_id,
                "namespace not owned by this project, leaving it in place"
            );
            return Ok(());
        }
        self.cluster
            .delete_namespace(&ctx.namespace)
            .await
            .map_err(step_error)?;
        info!(namespace = %ctx.namespace, "namespace rolled back");
        Ok(())
    }
}

struct ReconcileQuota {
    store: StateStore,
    cluster: Arc<dyn ClusterProvisioner>,
}

#[async_trait]
impl Step<ProjectCreateContext> for ReconcileQuota {
    fn name(&self) -> &'static str {
        "reconcile_quota"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(ProjectPhase::QuotasApplying.as_str())
    }

    async fn run(&self, ctx: &mut ProjectCreateContext) -> StepResult {
        set_phase(&self.store, &ctx.project_id, ProjectPhase::QuotasApplying)?;
        let quota = QuotaSpec {
            cpu: ctx.cpu_limit.clone(),
            memory: ctx.memory_limit.clone(),
        };
        self.cluster
            .reconcile_quota(&ctx.namespace, &quota)
            .await
            .map_err(step_error)
    }
}

struct AssignOwnerRole {
    store: StateStore,
    rbac: Arc<dyn RbacService>,
}

#[async_trait]
impl Step<ProjectCreateContext> for AssignOwnerRole {
    fn name(&self) -> &'static str {
        "assign_owner_role"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(ProjectPhase::RbacSetting.as_str())
    }

    async fn run(&self, ctx: &mut ProjectCreateContext) -> StepResult {
        set_phase(&self.store, &ctx.project_id, ProjectPhase::RbacSetting)?;
        self.rbac
            .assign_role(&ctx.project_id, &ctx.owner_id, ROLE_OWNER)
            .await?;
        Ok(())
    }
}

struct MarkProjectReady {
    store: StateStore,
}

#[async_trait]
impl Step<ProjectCreateContext> for MarkProjectReady {
    fn name(&self) -> &'static str {
        "mark_project_ready"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(ProjectPhase::ProvisioningDone.as_str())
    }

    async fn run(&self, ctx: &mut ProjectCreateContext) -> StepResult {
        self.store.update_project_status(
            &ctx.project_id,
            ProjectStatus::Ready,
            ProjectPhase::ProvisioningDone.as_str(),
        )?;
        info!(project_id = %ctx.project_id, name = %ctx.name, "project ready");
        Ok(())
    }
}

/// Flags the project while its rollback runs.
struct ProvisioningFailed {
    store: StateStore,
}

#[async_trait]
impl FailureHook<ProjectCreateContext> for ProvisioningFailed {
    async fn on_failure(
        &self,
        ctx: &ProjectCreateContext,
        failed_step: &str,
        error: &StepError,
    ) -> StepResult {
        warn!(project_id = %ctx.project_id, step = failed_step, %error, "project provisioning failed");
        match self.store.update_project_status(
            &ctx.project_id,
            ProjectStatus::Error,
            ProjectPhase::RollbackStarted.as_str(),
        ) {
            // Never got past the first step.
            Err(StateError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()).map_err(StepError::from),
        }
    }
}

// ── Deletion steps ─────────────────────────────────────────────────

struct MarkProjectDeleting {
    store: StateStore,
}

#[async_trait]
impl Step<ProjectDeleteContext> for MarkProjectDeleting {
    fn name(&self) -> &'static str {
        "mark_project_deleting"
    }

    fn phase(&self) -> Option<&'static str> {
        Some(ProjectPhase::Deleting.as_str())
    }

    async fn run(&self, ctx: &mut ProjectDeleteContext) -> StepResult {
        self.store.update_project_status(
            &ctx.project_id,
            ProjectStatus::Deleting,
            ProjectPhase::Deleting.as_str(),
        )?;
        Ok(())
    }
}

struct DeleteNamespace {
    cluster: Arc<dyn ClusterProvisioner>,
}

#[async_trait]
impl Step<ProjectDeleteContext> for DeleteNamespace {
    fn name(&self) -> &'static str {
        "delete_namespace"
    }

    async fn run(&self, ctx: &mut ProjectDeleteContext) -> StepResult {
        self.cluster
            .delete_namespace(&ctx.namespace)
            .await
            .map_err(step_error)
    }
}

struct DeleteProjectRecord {
    store: StateStore,
    gate: AdmissionGate,
}

#[async_trait]
impl Step<ProjectDeleteContext> for DeleteProjectRecord {
    fn name(&self) -> &'static str {
        "delete_project_record"
    }

    async fn run(&self, ctx: &mut ProjectDeleteContext) -> StepResult {
        self.store.delete_project(&ctx.project_id)?;
        self.gate.forget(&ctx.project_id);
        info!(project_id = %ctx.project_id, name = %ctx.name, "project deleted");
        Ok(())
    }
}
