//! # Tellask
//!
//! Dialog-tree orchestration for a team of LLM-driven agents that talk to
//! each other through the Tellask call protocol.
//!
//! Agents emit ordinary text. Lines starting with `!?` at column 0 form call
//! blocks addressed with `@name`; the orchestrator parses them out of the
//! generated stream as it arrives and turns each call into a sideline dialog,
//! a question back to the caller's supdialog, or a question to a human.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │  Generator   │─▶│Tellask Parser│─▶│  Dispatcher  │               │
//! │  └──────────────┘  └──────────────┘  └──────┬───────┘               │
//! └─────────────────────────────────────────────┼───────────────────────┘
//!                                               │ fan out, then join
//!          ┌────────────────────┬───────────────┼──────────────┐
//!          ▼                    ▼               ▼              ▼
//!   ┌─────────────┐      ┌─────────────┐  ┌───────────┐  ┌───────────┐
//!   │  Teammate   │      │  Self-route │  │ Ask-back  │  │ Ask-human │
//!   │  sideline   │      │ (toolless)  │  │ supdialog │  │   human   │
//!   └──────┬──────┘      └─────────────┘  └───────────┘  └───────────┘
//!          │ sessions keep a sideline resumable
//!     ┌────┴────┐
//!     ▼         ▼
//!   ┌───┐     ┌───┐
//!   │ S │     │ S │   nested sidelines
//!   └───┘     └───┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Mainline**: root dialog of a tree, owning the shared task contract
//! - **Sideline**: dialog opened by another dialog's call; its parent never changes
//! - **Session**: `(caller, callee, slug)` binding that makes a sideline resumable
//! - **Member**: static profile resolving capabilities and directory scopes

pub mod access;
pub mod channel;
pub mod collab;
pub mod config;
pub mod dialog;
pub mod dispatcher;
pub mod error;
pub mod hierarchy;
pub mod log;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod team;
pub mod tellask;
pub mod tools;
pub mod types;

pub use access::{AccessDenial, AccessEvaluator, AccessMode, DeniedScope, ReservedPaths, ReservedScope};
pub use channel::{event_channel, DialogEvent, EventSink, EventStream};
pub use collab::{
    text_stream, GenerationRequest, Generator, HumanInterface, HumanQuestion, InputSource,
    TextStream, TurnInput,
};
pub use config::OrchestratorConfig;
pub use dialog::{DialogHandle, DialogSnapshot, PendingCall};
pub use dispatcher::CallReply;
pub use error::{CallError, ConfigValidationError, OrchestratorError, TeamError};
pub use hierarchy::{DialogTree, DialogTreeView};
pub use log::{DialogLog, LogEntry, MemoryLog};
pub use logging::{init_logging, LoggingConfig};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use session::{SessionKey, SessionRegistry};
pub use team::{Member, ModelBinding, Team, TeamLoad};
pub use tellask::{parse_message, ParsedMessage, TellaskCall, TellaskEvent, TellaskParser};
pub use tools::{PathAccess, Tool, ToolCatalog, ToolContext, ToolError, ToolRegistry};
pub use types::{CallId, CallKind, DialogId, DialogScope, DialogStatus};
