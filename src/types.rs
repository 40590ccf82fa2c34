//! Core identifiers and enums shared across the dialog tree

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_id!(
    /// Identifier of a dialog node, unique within the process
    DialogId
);

opaque_id!(
    /// Identifier of one delivery issued by a dialog
    CallId
);

/// Where a dialog sits in its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogScope {
    /// Root dialog carrying the shared task contract
    Mainline,
    /// Dialog created by a call from another dialog
    Sideline,
}

/// Lifecycle status of a dialog node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogStatus {
    /// Generating, or idle and ready for input
    Active,
    /// Waiting on the single reply to an ask-back
    Suspended,
    /// Waiting on every call issued in the current turn
    AwaitingReplies,
    /// Detached from dispatch; still readable
    Completed,
}

impl DialogStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DialogStatus::Completed)
    }
}

impl fmt::Display for DialogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DialogStatus::Active => "active",
            DialogStatus::Suspended => "suspended",
            DialogStatus::AwaitingReplies => "awaiting_replies",
            DialogStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// The four Tellask call kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Teammate,
    /// Fresh-boots reasoning on a toolless sideline of the caller itself
    SelfRoute,
    /// Clarification request from a sideline to its supdialog
    AskBack,
    AskHuman,
}

impl CallKind {
    /// Whether calls of this kind may carry a session slug
    pub fn allows_session(&self) -> bool {
        matches!(self, CallKind::Teammate | CallKind::SelfRoute)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallKind::Teammate => "teammate",
            CallKind::SelfRoute => "self_route",
            CallKind::AskBack => "ask_back",
            CallKind::AskHuman => "ask_human",
        };
        f.write_str(s)
    }
}
