//! Tracing subscriber setup

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::OrchestratorError;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `tellask=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> Result<EnvFilter, OrchestratorError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| OrchestratorError::ConfigError(format!("invalid log level '{}': {e}", self.level))),
        }
    }
}

/// Install the global subscriber
///
/// Fails if the level is not a valid filter or a subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), OrchestratorError> {
    let filter = config.filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_ansi(config.ansi).with_target(true))
            .try_init()
    };

    result.map_err(|e| OrchestratorError::ConfigError(format!("failed to install logger: {e}")))
}
