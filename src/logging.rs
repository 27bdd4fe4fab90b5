//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Installs a global fmt subscriber. `RUST_LOG` overrides the configured
/// level. Calling it again after a subscriber is installed is a no-op.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::ConfigError(format!("Invalid log level {}: {}", config.level, e)))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        "compact" => builder.compact().try_init(),
        other => return Err(Error::ConfigError(format!("Invalid log format: {}", other))),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
