//! # dojo-agent
//!
//! Server binary: loads settings, picks a provisioner backend, wires the
//! session engine into the HTTP server and runs until ctrl-c.

#![deny(unsafe_code)]

mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dojo_runtime::{
    SessionManager, SessionManagerConfig, StaticCatalog, WorkshopCatalog, policy_from_settings,
    spawn_sweeper,
};
use dojo_sandbox::Provisioner;
use dojo_sandbox::http::HttpProvisioner;
use dojo_sandbox::local::LocalProvisioner;
use dojo_server::{DojoServer, ShutdownOutcome};
use dojo_settings::{DojoSettings, ProvisionerKind};
use tokio::net::TcpListener;

/// dojo workshop session server.
#[derive(Parser, Debug)]
#[command(name = "dojo", about = "Workshop session engine server")]
struct Cli {
    /// Settings file (defaults to `~/.dojo/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Workshop catalog file (overrides settings).
    #[arg(long)]
    workshops: Option<PathBuf>,
}

fn load(cli: &Cli) -> Result<DojoSettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(dojo_settings::settings_path);
    let mut settings = dojo_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(workshops) = &cli.workshops {
        settings.workshops.path.clone_from(workshops);
    }
    Ok(settings)
}

fn provisioner(settings: &DojoSettings) -> Arc<dyn Provisioner> {
    let p = &settings.provisioner;
    match p.kind {
        ProvisionerKind::Http => {
            let mut client = HttpProvisioner::new(
                p.base_url.clone(),
                Duration::from_millis(p.request_timeout_ms),
            );
            if let Some(token) = &p.api_token {
                client = client.with_api_token(token.clone());
            }
            tracing::info!(base_url = %p.base_url, "using http provisioner");
            Arc::new(client)
        }
        ProvisionerKind::Local => {
            tracing::warn!(root = %p.local_root.display(), "using local provisioner, commands run unisolated");
            Arc::new(LocalProvisioner::new(p.local_root.clone()))
        }
    }
}

/// Load the catalog; a missing file starts the server with no workshops.
fn catalog(path: &Path) -> Result<StaticCatalog> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "workshop catalog not found, starting with none");
        return Ok(StaticCatalog::default());
    }
    let catalog = StaticCatalog::load(path).context("Failed to load workshop catalog")?;
    tracing::info!(path = %path.display(), workshops = catalog.len(), "workshop catalog loaded");
    Ok(catalog)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    logging::init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics = dojo_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let catalog: Arc<dyn WorkshopCatalog> = Arc::new(catalog(&settings.workshops.path)?);
    let manager = Arc::new(
        SessionManager::new(
            provisioner(&settings),
            SessionManagerConfig::from_settings(&settings),
        )
        .with_scoring(policy_from_settings(&settings.scoring)),
    );

    let server = DojoServer::new(Arc::clone(&manager), catalog).with_metrics(metrics);
    let coordinator = Arc::clone(server.shutdown());
    let sweeper = spawn_sweeper(
        Arc::clone(&manager),
        Duration::from_millis(settings.session.sweep_interval_ms),
        coordinator.token(),
    );

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let serve = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");

    let timeout = Duration::from_millis(settings.server.shutdown_timeout_ms);
    match coordinator
        .graceful_shutdown(manager, vec![serve, sweeper], timeout)
        .await
    {
        ShutdownOutcome::Drained { sessions_ended } => {
            tracing::info!(sessions_ended, "Shutdown complete");
        }
        ShutdownOutcome::TimedOut => tracing::warn!("Shutdown incomplete"),
    }
    Ok(())
}
