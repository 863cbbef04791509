//! Structured logging setup

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins over the configured level
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
            .map_err(|e| anyhow!("Invalid {}: {}", EnvFilter::DEFAULT_ENV, e)),
        _ => EnvFilter::try_new(&config.level)
            .map_err(|e| anyhow!("Invalid logging.level '{}': {}", config.level, e)),
    }
}

/// Install the global subscriber; logs go to stderr so stdout stays
/// parseable for `--json` output
pub fn init(config: &LoggingConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config)?)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}
