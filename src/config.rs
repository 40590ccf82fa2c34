//! Orchestrator runtime configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::access::ReservedPaths;
use crate::error::OrchestratorError;
use crate::logging::LoggingConfig;

/// Runtime settings; every field has a default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deepest sideline below a mainline
    pub max_depth: usize,
    /// Generate/dispatch rounds allowed before a dialog must reply
    pub max_turns_per_reply: usize,
    pub reserved: ReservedPaths,
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_turns_per_reply: 16,
            reserved: ReservedPaths::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, OrchestratorError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| OrchestratorError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_depth == 0 {
            return Err(OrchestratorError::ConfigError(
                "max_depth must be at least 1".into(),
            ));
        }
        if self.max_turns_per_reply == 0 {
            return Err(OrchestratorError::ConfigError(
                "max_turns_per_reply must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
