#![forbid(unsafe_code)]

//! Fleet agent: keeps a session with the server and executes leases.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fleet_agent::lease::ExecBlockFactory;
use fleet_agent::{AgentConfig, HandlerRegistry, HttpServerConnection, LeaseManager, Session, StatusSink};
use fleet_core::{new_ulid, AgentId, SessionId, SessionOutcome};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
struct Args {
    /// Config file (TOML). Defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server base URL, e.g. http://127.0.0.1:3000
    #[arg(long)]
    server: Option<String>,

    /// Agent identifier. A random one is generated when unset.
    #[arg(long)]
    agent_id: Option<String>,

    /// Root directory for lease bundles.
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load_from(path)?,
        None => AgentConfig::default(),
    };
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(agent_id) = args.agent_id {
        config.agent_id = Some(agent_id);
    }
    if let Some(dir) = args.working_dir {
        config.working_dir = dir;
    }

    tokio::fs::create_dir_all(&config.working_dir)
        .await
        .with_context(|| format!("create {}", config.working_dir.display()))?;

    let agent_id = config
        .agent_id
        .clone()
        .map(AgentId::from)
        .unwrap_or_else(AgentId::random);
    let connection = Arc::new(HttpServerConnection::new(
        config.server_url.clone(),
        config.request_timeout(),
    )?);
    let registry = Arc::new(HandlerRegistry::new().with(Arc::new(ExecBlockFactory)));
    let status = Arc::new(StatusSink::new());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    tracing::info!(
        agent_id = %agent_id,
        server = %config.server_url,
        payload_types = ?registry.payload_types(),
        "agent starting"
    );

    loop {
        let session = Session::new(
            agent_id.clone(),
            SessionId::from(new_ulid().to_string()),
            config.working_dir.clone(),
            connection.clone(),
        );
        let manager = LeaseManager::new(
            session,
            Arc::clone(&registry),
            Arc::clone(&status),
            config.lease_manager.clone(),
        );

        let result = manager.run(shutdown.clone()).await;
        match result.outcome {
            SessionOutcome::Terminate => {
                tracing::info!(reason = ?result.reason, "agent exiting");
                return Ok(());
            }
            SessionOutcome::BackOff => {
                let delay = config.session_restart_delay();
                tracing::warn!(
                    reason = ?result.reason,
                    delay_ms = delay.as_millis() as u64,
                    "session ended; restarting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
        }
    }
}
