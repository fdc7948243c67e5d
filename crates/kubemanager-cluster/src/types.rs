//! Plain data exchanged with cluster implementations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Namespace to create, with its ownership labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Observed namespace state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub name: String,
    /// `Active` or `Terminating` as reported by the API server.
    pub phase: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl NamespaceInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Hard limits of the per-namespace quota object. Applied to both
/// `requests.*` and `limits.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub cpu: String,
    pub memory: String,
}

/// Summed live usage of all pod containers in a namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceUsage {
    pub cpu_milli: u64,
    pub memory_bytes: u64,
}

/// Helm release to install or upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelmRelease {
    pub name: String,
    pub namespace: String,
    pub chart_path: PathBuf,
    pub values: serde_json::Value,
    pub timeout: Duration,
}
