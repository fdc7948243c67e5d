//! Helm installer backed by the `helm` CLI.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::HelmInstaller;
use crate::error::{ClusterError, ClusterResult};
use crate::types::HelmRelease;

/// Runs `helm` as a child process. The child is killed if the calling
/// future is dropped (step timeout).
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: PathBuf,
}

impl HelmCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<std::ffi::OsString>) -> ClusterResult<std::process::Output> {
        debug!(binary = ?self.binary, ?args, "running helm");
        Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ClusterError::Helm(format!("failed to spawn {}: {e}", self.binary.display())))
    }
}

impl Default for HelmCli {
    fn default() -> Self {
        Self::new("helm")
    }
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl HelmInstaller for HelmCli {
    async fn upgrade_install(&self, release: &HelmRelease) -> ClusterResult<()> {
        // JSON is valid YAML, so the values file can be written as-is.
        let body = serde_json::to_vec_pretty(&release.values)
            .map_err(|e| ClusterError::Invalid(format!("helm values: {e}")))?;
        let mut values = tempfile::Builder::new()
            .prefix("kubemanager-values-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| ClusterError::Helm(format!("values file: {e}")))?;
        values
            .write_all(&body)
            .and_then(|_| values.flush())
            .map_err(|e| ClusterError::Helm(format!("values file: {e}")))?;

        let args = vec![
            "upgrade".into(),
            "--install".into(),
            release.name.clone().into(),
            release.chart_path.clone().into_os_string(),
            "--namespace".into(),
            release.namespace.clone().into(),
            "--values".into(),
            values.path().as_os_str().to_owned(),
            "--wait".into(),
            "--timeout".into(),
            format!("{}s", release.timeout.as_secs()).into(),
        ];
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(ClusterError::Helm(format!(
                "upgrade --install {} failed: {}",
                release.name,
                stderr_of(&output)
            )));
        }
        info!(release = %release.name, namespace = %release.namespace, "helm release installed");
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> ClusterResult<()> {
        let args = vec![
            "uninstall".into(),
            release.into(),
            "--namespace".into(),
            namespace.into(),
            "--wait".into(),
        ];
        let output = self.run(args).await?;
        if output.status.success() {
            info!(%release, %namespace, "helm release uninstalled");
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if stderr.contains("not found") {
            debug!(%release, %namespace, "helm release already absent");
            return Ok(());
        }
        Err(ClusterError::Helm(format!("uninstall {release} failed: {stderr}")))
    }
}
