//! Binding Configuration
//!
//! Features:
//! - Default context options (encoding, per-database contexts)
//! - Logging setup
//! - Environment variable overrides
//! - JSON loading and validation

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Text encoding a context uses for keys and values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    Default,
    None,
    EucJp,
    Utf8,
    Sjis,
    Latin1,
    Koi8r,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Default
    }
}

impl std::str::FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "default" => Ok(Encoding::Default),
            "none" => Ok(Encoding::None),
            "euc-jp" | "eucjp" => Ok(Encoding::EucJp),
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "sjis" | "shift-jis" => Ok(Encoding::Sjis),
            "latin1" | "iso-8859-1" => Ok(Encoding::Latin1),
            "koi8r" | "koi8-r" => Ok(Encoding::Koi8r),
            _ => Err(Error::ConfigError(format!("Invalid encoding: {}", s))),
        }
    }
}

/// Options applied when a native context is initialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Encoding for keys and text values
    pub encoding: Encoding,

    /// The context is dedicated to one database; databases closed from
    /// such a context leave the context association in place
    pub per_db: bool,

    /// Upper bound on objects under construction at once (0 = unbounded)
    pub max_floating: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Default,
            per_db: false,
            max_floating: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Complete binding configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Options for the default context and for contexts created without
    /// explicit options
    pub context: ContextOptions,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl BindingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(encoding) = std::env::var("MANTIS_ENCODING") {
            self.context.encoding = encoding.parse()?;
        }
        if let Ok(per_db) = std::env::var("MANTIS_PER_DB") {
            self.context.per_db = per_db
                .parse()
                .map_err(|_| Error::ConfigError("Invalid MANTIS_PER_DB".to_string()))?;
        }
        if let Ok(max) = std::env::var("MANTIS_MAX_FLOATING") {
            self.context.max_floating = max
                .parse()
                .map_err(|_| Error::ConfigError("Invalid MANTIS_MAX_FLOATING".to_string()))?;
        }

        if let Ok(level) = std::env::var("MANTIS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("MANTIS_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(Error::ConfigError(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(Error::ConfigError(format!(
                "Invalid log format: {}. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }
}
