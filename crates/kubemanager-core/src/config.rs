//! kubemanager.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults the
//! platform ships with.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeManagerConfig {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    pub defaults: ProjectDefaults,
    pub saga: SagaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("/var/lib/kubemanager"),
        }
    }
}

/// Which cluster backend the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    #[default]
    Kubernetes,
    /// Namespaces, quotas, secrets and releases are simulated in memory.
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    /// Public address embedded in generated ingress hosts.
    pub vps_address: String,
    pub chart_path: PathBuf,
    pub chart_name: String,
    pub chart_version: String,
    pub helm_binary: PathBuf,
    pub helm_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Kubernetes,
            vps_address: "127.0.0.1".to_string(),
            chart_path: PathBuf::from("/app/charts/standard-app"),
            chart_name: "standard-app".to_string(),
            chart_version: "0.1.0".to_string(),
            helm_binary: PathBuf::from("helm"),
            helm_timeout_secs: 300,
        }
    }
}

/// Resource limits applied to a project when the request leaves them empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDefaults {
    pub cpu_limit: String,
    pub memory_limit: String,
    pub storage_limit: String,
}

impl Default for ProjectDefaults {
    fn default() -> Self {
        Self {
            cpu_limit: "2000m".to_string(),
            memory_limit: "4Gi".to_string(),
            storage_limit: "10Gi".to_string(),
        }
    }
}

impl ProjectDefaults {
    /// Fill empty limit strings with the defaults.
    pub fn apply(&self, cpu: &str, memory: &str, storage: &str) -> (String, String, String) {
        let pick = |value: &str, default: &str| {
            let value = value.trim();
            if value.is_empty() {
                default.to_string()
            } else {
                value.to_string()
            }
        };
        (
            pick(cpu, &self.cpu_limit),
            pick(memory, &self.memory_limit),
            pick(storage, &self.storage_limit),
        )
    }
}

/// Retry and timeout policy for saga steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    /// Timeout for steps that call the cluster API or Helm.
    pub remote_timeout_secs: u64,
    /// Timeout for steps that only touch the state store.
    pub local_timeout_secs: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 1000,
            backoff_coefficient: 2.0,
            remote_timeout_secs: 300,
            local_timeout_secs: 5,
        }
    }
}

impl KubeManagerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KubeManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
