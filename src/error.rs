//! Error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CallId, DialogId, DialogStatus};

/// Failures of orchestrator operations themselves
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Dialog not found
    #[error("Dialog not found: {0}")]
    DialogNotFound(DialogId),

    /// Transition not allowed from the current status
    #[error("Dialog {dialog} cannot {action} while {status}")]
    InvalidTransition {
        dialog: DialogId,
        status: DialogStatus,
        action: &'static str,
    },

    /// A reply arrived for a call the dialog is not waiting on
    #[error("Dialog {dialog} has no pending call {call}")]
    UnknownCall { dialog: DialogId, call: CallId },

    /// The generation loop for one reply did not settle
    #[error("Dialog {dialog} exceeded {limit} turns without a final reply")]
    TurnLimit { dialog: DialogId, limit: usize },

    /// Member referenced by a dialog is missing from the team
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    /// Generation collaborator failed
    #[error("Generation error: {0}")]
    Generation(#[source] anyhow::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Per-call failures, returned to the issuing dialog as reply values
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum CallError {
    /// First line of the block is not a target line
    #[error("Malformed call: first line must address a target (got {headline:?})")]
    MalformedCall { headline: String },

    /// Named member is not in the team
    #[error("Unknown target: @{agent}")]
    UnknownTarget { agent: String },

    /// Call is syntactically fine but not allowed here
    #[error("Invalid call usage: {reason}")]
    InvalidCallUsage { reason: String },

    /// The collaborator serving the call failed
    #[error("Delivery failed: {reason}")]
    DeliveryFailed { reason: String },
}

impl CallError {
    pub fn usage(reason: impl Into<String>) -> Self {
        CallError::InvalidCallUsage {
            reason: reason.into(),
        }
    }
}

/// A roster entry that failed validation; the member is left out of the team
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Invalid member '{member_id}': {message}")]
pub struct ConfigValidationError {
    pub member_id: String,
    pub message: String,
}

/// Roster states that prevent the team from loading at all
#[derive(Debug, Error)]
pub enum TeamError {
    #[error("Failed to read roster: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse roster: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Every member failed validation
    #[error("No usable members in roster ({} invalid)", .0.len())]
    NoUsableMembers(Vec<ConfigValidationError>),
}
