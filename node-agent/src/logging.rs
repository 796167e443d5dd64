//! Tracing setup with a reloadable level filter

use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*, reload, Registry};

/// Handle for changing the log level of a running agent
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
}

fn filter_for(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(format!("{level},hyper=warn,reqwest=warn,rusqlite=warn"))
        .with_context(|| format!("Invalid log level: {}", level))
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init(level: &str) -> Result<LogControl> {
    let (filter, env_override) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (filter_for(level)?, false),
    };
    let (filter, handle) = reload::Layer::new(filter);

    // A second init (tests, embedded use) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();

    Ok(LogControl { handle, env_override })
}

impl LogControl {
    pub fn set_level(&self, level: &str) -> Result<()> {
        if self.env_override {
            debug!("RUST_LOG is set, ignoring log level change to {}", level);
            return Ok(());
        }
        self.handle
            .reload(filter_for(level)?)
            .context("Failed to reload log filter")?;
        info!("Log level set to {}", level);
        Ok(())
    }
}
