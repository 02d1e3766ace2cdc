//! # conduit-agent
//!
//! Conduit server binary. Loads settings, starts the agent worker pool and
//! the turn scheduler, and serves viewers over HTTP/WebSocket until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use conduit_protocol::DemuxLimits;
use conduit_runtime::{ActiveStreamRegistry, EventEmitter, MemoryStore, TurnScheduler, UsageLedger};
use conduit_server::{ConduitServer, ServerConfig};
use conduit_settings::ConduitSettings;
use conduit_worker::{LaunchConfig, PoolConfig, ProcessBackend, WorkerPool};

/// Conduit: a streaming gateway in front of an agent CLI.
#[derive(Parser, Debug)]
#[command(name = "conduit-agent", about = "Conduit agent gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.conduit/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Agent CLI executable (overrides settings).
    #[arg(long)]
    agent_binary: Option<String>,

    /// Run every turn as a one-shot process.
    #[arg(long)]
    no_pool: bool,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut ConduitSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(binary) = &self.agent_binary {
            settings.agent.binary.clone_from(binary);
        }
        if self.no_pool {
            settings.pool.enabled = false;
        }
    }
}

fn init_logging(settings: &ConduitSettings) {
    if settings.logging.json {
        conduit_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        conduit_core::logging::init_subscriber(&settings.logging.level);
    }
}

/// Process backend for the configured pool mode.
fn build_backend(settings: &ConduitSettings) -> (ProcessBackend, Option<Arc<WorkerPool>>) {
    let launch = LaunchConfig::from_settings(&settings.agent, &settings.pool);
    if settings.pool.enabled {
        let pool = Arc::new(WorkerPool::new(launch, PoolConfig::from_settings(&settings.pool)));
        (ProcessBackend::pooled(Arc::clone(&pool)), Some(pool))
    } else {
        (ProcessBackend::one_shot_only(launch), None)
    }
}

fn build_scheduler(settings: &ConduitSettings, backend: ProcessBackend) -> Arc<TurnScheduler> {
    let scheduler = TurnScheduler::new(
        Arc::new(MemoryStore::new()),
        Arc::new(backend),
        Arc::new(ActiveStreamRegistry::new()),
        Arc::new(EventEmitter::new()),
        Arc::new(UsageLedger::new()),
    )
    .with_limits(DemuxLimits {
        thinking_summary_chars: settings.stream.thinking_summary_chars,
        step_input_chars: settings.stream.step_input_chars,
    });
    Arc::new(scheduler)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Settings come first: they carry the log level.
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(conduit_settings::settings_path);
    let mut settings = conduit_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);
    init_logging(&settings);

    let metrics = match conduit_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing::warn!(%error, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let (backend, pool) = build_backend(&settings);
    let scheduler = build_scheduler(&settings, backend);

    let mut server = ConduitServer::new(
        ServerConfig::from_settings(&settings.server),
        Arc::clone(&scheduler),
        pool.clone(),
    );
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    let mut handles = vec![tokio::spawn(server.event_bridge().run())];
    if let Some(pool) = &pool {
        handles.push(pool.spawn_reaper(server.shutdown().token()));
    }

    let (addr, serve) = server.listen().await.context("Failed to bind server")?;
    handles.push(serve);
    tracing::info!(
        agent = %settings.agent.binary,
        pooled = pool.is_some(),
        "Conduit listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(handles, None).await;
    scheduler.shutdown().await;
    if let Some(pool) = pool {
        pool.shutdown();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
