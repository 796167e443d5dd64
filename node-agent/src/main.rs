//! Node Agent daemon

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use node_agent::comms::RegistrationToken;
use node_agent::config::{AgentConfig, CONFIG_ENV};
use node_agent::{logging, Agent};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "node-agent", version, about = "Host agent connecting this machine to its control plane")]
struct Args {
    /// Bootstrap configuration file
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// One-time registration token
    #[arg(long, env = "NODE_AGENT_REGISTRATION_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the initial log level
    #[arg(long)]
    log_level: Option<String>,
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut bootstrap = AgentConfig::load(args.config.as_deref())
        .await
        .context("Failed to load agent configuration")?;
    if let Some(dir) = args.data_dir {
        bootstrap.agent.data_dir = dir;
    }
    if let Some(level) = args.log_level {
        bootstrap.logging.level = level;
    }

    let log_control = logging::init(&bootstrap.logging.level)?;
    info!("Node agent {} starting", env!("CARGO_PKG_VERSION"));

    let agent = Agent::builder(bootstrap)
        .registration_token(args.token.map(|t| RegistrationToken::new(t, Utc::now())))
        .log_control(log_control)
        .start()
        .await
        .context("Failed to start agent")?;

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let reloader = agent.reloader();
        match signal(SignalKind::hangup()) {
            Ok(mut hup) => {
                tokio::spawn(async move {
                    while hup.recv().await.is_some() {
                        info!("SIGHUP received, reloading config");
                        reloader.trigger();
                    }
                });
            }
            Err(e) => warn!("SIGHUP handler unavailable: {}", e),
        }
    }

    agent.run(terminate()).await.context("Agent execution failed")?;
    Ok(())
}
