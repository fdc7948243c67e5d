//! kmd — the KubeManager daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Cluster backend (Kubernetes API + helm CLI, or in-memory)
//! - Provisioner and saga recovery
//! - REST API
//!
//! # Usage
//!
//! ```text
//! kmd serve --config /etc/kubemanager/kubemanager.toml --port 8080
//! kmd config --config /etc/kubemanager/kubemanager.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use kubemanager_cluster::{
    ClusterProvisioner, HelmCli, HelmInstaller, InMemoryCluster, InMemoryHelm, KubeProvisioner,
};
use kubemanager_core::KubeManagerConfig;
use kubemanager_core::config::ClusterMode;
use kubemanager_provision::{ProvisionSettings, Provisioner};
use kubemanager_state::StateStore;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,kmd=debug,kubemanager=debug";

#[derive(Parser)]
#[command(name = "kmd", about = "KubeManager control plane daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API and run provisioning sagas.
    Serve {
        /// Path to kubemanager.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Simulate the cluster and Helm in memory.
        #[arg(long)]
        in_memory: bool,
    },
    /// Print the effective configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            in_memory,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            if in_memory {
                config.cluster.mode = ClusterMode::InMemory;
            }
            serve(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<KubeManagerConfig> {
    match path {
        Some(path) => {
            let config = KubeManagerConfig::from_file(path)
                .map_err(|e| anyhow::anyhow!("load config {}: {e}", path.display()))?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(KubeManagerConfig::default()),
    }
}

async fn cluster_backend(
    config: &KubeManagerConfig,
) -> anyhow::Result<(Arc<dyn ClusterProvisioner>, Arc<dyn HelmInstaller>)> {
    match config.cluster.mode {
        ClusterMode::Kubernetes => {
            let cluster: Arc<dyn ClusterProvisioner> =
                Arc::new(KubeProvisioner::try_default().await?);
            let helm: Arc<dyn HelmInstaller> =
                Arc::new(HelmCli::new(&config.cluster.helm_binary));
            info!(helm = %config.cluster.helm_binary.display(), "kubernetes backend ready");
            Ok((cluster, helm))
        }
        ClusterMode::InMemory => {
            warn!("running against an in-memory cluster; nothing is deployed");
            let cluster: Arc<dyn ClusterProvisioner> = Arc::new(InMemoryCluster::new());
            let helm: Arc<dyn HelmInstaller> = Arc::new(InMemoryHelm::new());
            Ok((cluster, helm))
        }
    }
}

async fn serve(config: KubeManagerConfig) -> anyhow::Result<()> {
    info!(mode = ?config.cluster.mode, "KubeManager daemon starting");

    // ── State store ────────────────────────────────────────────

    let data_dir = &config.server.data_dir;
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("state.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let roles = store.seed_default_roles()?;
    info!(count = roles.len(), "default roles seeded");

    // ── Provisioner ────────────────────────────────────────────

    let (cluster, helm) = cluster_backend(&config).await?;
    let provisioner = Provisioner::new(
        store,
        cluster,
        helm,
        ProvisionSettings::from_config(&config),
    );

    // Unfinished sagas from a previous run continue in the background.
    let resumed = provisioner.resume_incomplete()?;
    info!(count = resumed.len(), "saga recovery done");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // ── API server ─────────────────────────────────────────────

    let router = kubemanager_api::build_router(provisioner);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("KubeManager daemon stopped; in-flight sagas resume on next start");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::parse_from([
            "kmd",
            "--log-format",
            "json",
            "serve",
            "--port",
            "9000",
            "--in-memory",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Serve {
                port, in_memory, ..
            } => {
                assert_eq!(port, Some(9000));
                assert!(in_memory);
            }
            Command::Config { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubemanager.toml");
        std::fs::write(
            &path,
            "[cluster]\nmode = \"in-memory\"\nvps_address = \"203.0.113.7\"\n\n[saga]\nmax_attempts = 5\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.cluster.mode, ClusterMode::InMemory);
        assert_eq!(config.cluster.vps_address, "203.0.113.7");
        assert_eq!(config.saga.max_attempts, 5);
        assert_eq!(config.server.port, 8080);
    }
}
