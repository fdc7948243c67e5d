//! Domain types for the KubeManager state store.
//!
//! These types represent the persisted state of projects, roles,
//! memberships, workloads and saga executions. All types are serializable
//! to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Built-in role names seeded at startup.
pub const ROLE_OWNER: &str = "Owner";
pub const ROLE_DEVELOPER: &str = "Developer";
pub const ROLE_VIEWER: &str = "Viewer";

/// All roles the store is seeded with.
pub const DEFAULT_ROLES: [&str; 3] = [ROLE_OWNER, ROLE_DEVELOPER, ROLE_VIEWER];

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Project ────────────────────────────────────────────────────────

/// Coarse lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Pending,
    Provisioning,
    Ready,
    Error,
    Deleting,
    Deleted,
    Suspended,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "PENDING",
            ProjectStatus::Provisioning => "PROVISIONING",
            ProjectStatus::Ready => "READY",
            ProjectStatus::Error => "ERROR",
            ProjectStatus::Deleting => "DELETING",
            ProjectStatus::Deleted => "DELETED",
            ProjectStatus::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained provisioning phase recorded alongside the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectPhase {
    #[serde(rename = "DB_INITIALIZING")]
    DbInitializing,
    #[serde(rename = "K8S_NS_CREATING")]
    NamespaceCreating,
    #[serde(rename = "K8S_QUOTAS_APPLYING")]
    QuotasApplying,
    #[serde(rename = "K8S_RBAC_SETTING")]
    RbacSetting,
    #[serde(rename = "PROVISIONING_DONE")]
    ProvisioningDone,
    #[serde(rename = "PROVISIONING_FAILED")]
    ProvisioningFailed,
    #[serde(rename = "ROLLBACK_STARTED")]
    RollbackStarted,
    #[serde(rename = "ROLLBACK_DONE")]
    RollbackDone,
    #[serde(rename = "DELETING")]
    Deleting,
}

impl ProjectPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectPhase::DbInitializing => "DB_INITIALIZING",
            ProjectPhase::NamespaceCreating => "K8S_NS_CREATING",
            ProjectPhase::QuotasApplying => "K8S_QUOTAS_APPLYING",
            ProjectPhase::RbacSetting => "K8S_RBAC_SETTING",
            ProjectPhase::ProvisioningDone => "PROVISIONING_DONE",
            ProjectPhase::ProvisioningFailed => "PROVISIONING_FAILED",
            ProjectPhase::RollbackStarted => "ROLLBACK_STARTED",
            ProjectPhase::RollbackDone => "ROLLBACK_DONE",
            ProjectPhase::Deleting => "DELETING",
        }
    }
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant project. Owns exactly one namespace and a resource envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: Uuid,
    /// Unique, DNS-label-safe name.
    pub name: String,
    pub description: String,
    /// CPU envelope, e.g. "2000m".
    pub cpu_limit: String,
    /// Memory envelope, e.g. "4Gi".
    pub memory_limit: String,
    /// Storage envelope, e.g. "10Gi".
    pub storage_limit: String,
    pub status: ProjectStatus,
    pub current_phase: String,
    /// Unix timestamp (seconds) when the project was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

// ── Roles & membership ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
}

/// Association of a user to a project with a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectMember {
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub joined_at: u64,
}

impl ProjectMember {
    /// Composite key used in the members table.
    pub fn table_key(&self) -> String {
        member_key(&self.project_id, &self.user_id)
    }
}

pub(crate) fn member_key(project_id: &Uuid, user_id: &Uuid) -> String {
    format!("{project_id}:{user_id}")
}

// ── Workload ───────────────────────────────────────────────────────

/// Runtime status of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkloadStatus {
    Starting,
    Running,
    Degraded,
    Failed,
    Scaling,
    Deleted,
}

impl WorkloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadStatus::Starting => "STARTING",
            WorkloadStatus::Running => "RUNNING",
            WorkloadStatus::Degraded => "DEGRADED",
            WorkloadStatus::Failed => "FAILED",
            WorkloadStatus::Scaling => "SCALING",
            WorkloadStatus::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment phase of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkloadPhase {
    HelmChartLoading,
    HelmPreparing,
    HelmInstalling,
    SecretCreationError,
    HelmError,
    HelmUninstalling,
    Deployed,
}

impl WorkloadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadPhase::HelmChartLoading => "HELM_CHART_LOADING",
            WorkloadPhase::HelmPreparing => "HELM_PREPARING",
            WorkloadPhase::HelmInstalling => "HELM_INSTALLING",
            WorkloadPhase::SecretCreationError => "SECRET_CREATION_ERROR",
            WorkloadPhase::HelmError => "HELM_ERROR",
            WorkloadPhase::HelmUninstalling => "HELM_UNINSTALLING",
            WorkloadPhase::Deployed => "DEPLOYED",
        }
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An application deployed into a project's namespace via a Helm release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workload {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub namespace: String,
    pub release_name: String,
    pub chart_name: String,
    pub chart_version: String,
    /// Container image as submitted, `repo[:tag]`.
    pub image: String,
    pub cpu_limit: String,
    pub cpu_request: String,
    pub memory_limit: String,
    pub memory_request: String,
    pub storage_size: String,
    pub storage_class: String,
    pub persistence_enabled: bool,
    pub mount_path: String,
    pub replicas: i32,
    pub target_port: u16,
    pub service_type: String,
    /// Plain environment variables passed through Helm values.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub external_url: Option<String>,
    pub status: WorkloadStatus,
    pub current_phase: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Workload {
    /// Replica count that gets deployed and reserved; anything below one counts as one.
    pub fn effective_replicas(&self) -> u64 {
        self.replicas.max(1) as u64
    }

    /// Whether this workload consumes part of its project's envelope.
    pub fn counts_toward_quota(&self) -> bool {
        !matches!(self.status, WorkloadStatus::Failed | WorkloadStatus::Deleted)
    }
}

// ── Sagas ──────────────────────────────────────────────────────────

/// Lifecycle of a saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Running,
    Compensating,
    Succeeded,
    FailedCompensated,
    FailedUnrecoverable,
}

impl SagaStatus {
    /// Terminal states are never resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Succeeded | SagaStatus::FailedCompensated | SagaStatus::FailedUnrecoverable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "RUNNING",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Succeeded => "SUCCEEDED",
            SagaStatus::FailedCompensated => "FAILED_COMPENSATED",
            SagaStatus::FailedUnrecoverable => "FAILED_UNRECOVERABLE",
        }
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step bookkeeping inside a saga record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepLogEntry {
    pub name: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub completed_at: Option<u64>,
    pub compensated_at: Option<u64>,
    pub compensation_error: Option<String>,
}

impl StepLogEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Durable record of one saga execution.
///
/// The serialized context is rewritten after every step so a restarted
/// process can pick up from the last completed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SagaRecord {
    pub id: String,
    /// Saga kind, e.g. "project.create".
    pub kind: String,
    /// Id of the resource this saga acts on.
    pub correlation_id: String,
    pub status: SagaStatus,
    /// Phase label of the step currently (or last) executing.
    pub phase: Option<String>,
    pub current_step: Option<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub steps: Vec<StepLogEntry>,
    pub context: serde_json::Value,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SagaRecord {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        correlation_id: impl Into<String>,
        step_names: &[&str],
        context: serde_json::Value,
    ) -> Self {
        let now = epoch_secs();
        Self {
            id: id.into(),
            kind: kind.into(),
            correlation_id: correlation_id.into(),
            status: SagaStatus::Running,
            phase: None,
            current_step: None,
            failed_step: None,
            error: None,
            steps: step_names.iter().map(|n| StepLogEntry::new(*n)).collect(),
            context,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepLogEntry> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepLogEntry> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Names of completed steps, in execution order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.is_completed())
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = epoch_secs();
    }
}
