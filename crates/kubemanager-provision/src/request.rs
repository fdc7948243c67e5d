//! Inputs and outputs of provisioning operations.

use std::collections::BTreeMap;

use kubemanager_cluster::NamespaceInfo;
use kubemanager_state::ProjectStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_REPLICAS: i32 = 1;
pub const DEFAULT_CPU: &str = "200m";
pub const DEFAULT_MEMORY: &str = "256Mi";
pub const DEFAULT_TARGET_PORT: u16 = 8080;
pub const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";
pub const DEFAULT_STORAGE_SIZE: &str = "1Gi";
pub const DEFAULT_STORAGE_CLASS: &str = "local-path";
pub const DEFAULT_MOUNT_PATH: &str = "/data";

/// Create a project. Empty limits fall back to the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub memory_limit: String,
    #[serde(default)]
    pub storage_limit: String,
}

/// Deploy a workload into a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployWorkloadRequest {
    pub project_id: Uuid,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub persistence_enabled: bool,
    #[serde(default)]
    pub storage_size: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub mount_path: Option<String>,
    /// Plain variables, passed through Helm values.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Sensitive variables, stored in the `<release>-env` secret.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

/// Change an existing workload. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateWorkloadRequest {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
    #[serde(default)]
    pub storage_size: Option<String>,
    #[serde(default)]
    pub env_vars: Option<BTreeMap<String, String>>,
    /// Replaces the whole secret when present.
    #[serde(default)]
    pub secrets: Option<BTreeMap<String, String>>,
}

/// Returned immediately by every saga-launching operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub saga_id: String,
    pub resource_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Answer of the project status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStatusView {
    pub project_id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    pub phase: String,
    pub namespace: Option<NamespaceInfo>,
    pub created_at: u64,
}

/// Reserved resources in reporting units (truncated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedResources {
    pub cpu_milli: u64,
    pub memory_mi: u64,
    pub storage_gi: u64,
}

/// Answer of the project metrics query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetrics {
    pub project_id: Uuid,
    /// Live CPU usage, e.g. `"350m"`.
    pub cpu_usage: String,
    /// Live memory usage, e.g. `"512Mi"`.
    pub memory_usage: String,
    pub reserved: ReservedResources,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub storage_limit: String,
}
