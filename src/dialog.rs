//! Dialog node - one unit of conversational state

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channel::{DialogEvent, EventSink};
use crate::error::OrchestratorError;
use crate::types::{CallId, CallKind, DialogId, DialogScope, DialogStatus};

/// An outbound call the dialog is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: CallId,
    pub kind: CallKind,
    /// Member id, `human`, or `tellasker`
    pub target: String,
}

#[derive(Debug)]
struct DialogState {
    status: DialogStatus,
    pending: Vec<PendingCall>,
    /// Outstanding ask-back, at most one
    ask_back: Option<CallId>,
}

impl DialogState {
    fn settle(&mut self) -> DialogStatus {
        if self.status != DialogStatus::Completed {
            self.status = if self.ask_back.is_some() {
                DialogStatus::Suspended
            } else if !self.pending.is_empty() {
                DialogStatus::AwaitingReplies
            } else {
                DialogStatus::Active
            };
        }
        self.status
    }
}

/// A dialog node
///
/// State changes are serialized by a per-node lock; sibling dialogs never
/// contend with each other.
#[derive(Debug)]
pub struct Dialog {
    pub id: DialogId,
    pub scope: DialogScope,
    /// Dialog whose call created this one; fixed for life
    pub parent_id: Option<DialogId>,
    /// Mainline at the top of the tree
    pub root_id: DialogId,
    /// Member responding in this dialog
    pub agent_id: String,
    /// Fresh-boots sidelines may not run tools
    pub toolless: bool,
    pub session_slug: Option<String>,
    /// Distance from the mainline
    pub depth: usize,
    state: Mutex<DialogState>,
    /// Held while generating so a node runs one turn at a time
    turn: tokio::sync::Mutex<()>,
    events: EventSink,
}

impl Dialog {
    /// Create a mainline dialog
    pub fn mainline(agent_id: impl Into<String>, events: EventSink) -> Self {
        let id = DialogId::new();
        Self::build(id, DialogScope::Mainline, None, id, agent_id.into(), false, None, 0, events)
    }

    /// Create a sideline under `parent`
    pub fn sideline(
        parent: &Dialog,
        agent_id: impl Into<String>,
        toolless: bool,
        session_slug: Option<String>,
        events: EventSink,
    ) -> Self {
        Self::build(
            DialogId::new(),
            DialogScope::Sideline,
            Some(parent.id),
            parent.root_id,
            agent_id.into(),
            toolless,
            session_slug,
            parent.depth + 1,
            events,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: DialogId,
        scope: DialogScope,
        parent_id: Option<DialogId>,
        root_id: DialogId,
        agent_id: String,
        toolless: bool,
        session_slug: Option<String>,
        depth: usize,
        events: EventSink,
    ) -> Self {
        info!(
            dialog_id = %id,
            agent_id = %agent_id,
            scope = ?scope,
            parent = ?parent_id,
            toolless,
            "Creating dialog"
        );

        Self {
            id,
            scope,
            parent_id,
            root_id,
            agent_id,
            toolless,
            session_slug,
            depth,
            state: Mutex::new(DialogState {
                status: DialogStatus::Active,
                pending: Vec::new(),
                ask_back: None,
            }),
            turn: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn is_mainline(&self) -> bool {
        self.scope == DialogScope::Mainline
    }

    pub fn status(&self) -> DialogStatus {
        self.state.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.status() == DialogStatus::Completed
    }

    /// Calls issued and not yet answered
    pub fn pending_calls(&self) -> Vec<PendingCall> {
        self.state.lock().pending.clone()
    }

    pub fn has_pending_ask_back(&self) -> bool {
        self.state.lock().ask_back.is_some()
    }

    /// Register the outbound calls of a turn
    ///
    /// The dialog suspends if one of them is an ask-back, otherwise it awaits
    /// replies until every call has one.
    pub fn begin_calls(&self, calls: &[PendingCall]) -> Result<DialogStatus, OrchestratorError> {
        let mut state = self.state.lock();
        let before = state.status;

        if before == DialogStatus::Completed {
            return Err(self.invalid(before, "issue calls"));
        }

        let ask_backs: Vec<CallId> = calls
            .iter()
            .filter(|c| c.kind == CallKind::AskBack)
            .map(|c| c.call_id)
            .collect();
        if ask_backs.len() > 1 || (!ask_backs.is_empty() && state.ask_back.is_some()) {
            return Err(self.invalid(before, "issue a second ask-back"));
        }
        if let Some(&call_id) = ask_backs.first() {
            state.ask_back = Some(call_id);
        }

        state.pending.extend(calls.iter().cloned());
        let after = state.settle();
        drop(state);

        debug!(dialog_id = %self.id, calls = calls.len(), status = %after, "Calls registered");
        self.emit_if_changed(before, after);
        Ok(after)
    }

    /// Record the reply to one pending call
    pub fn deliver_reply(&self, call_id: CallId) -> Result<DialogStatus, OrchestratorError> {
        let mut state = self.state.lock();
        let before = state.status;

        let pos = state
            .pending
            .iter()
            .position(|c| c.call_id == call_id)
            .ok_or(OrchestratorError::UnknownCall {
                dialog: self.id,
                call: call_id,
            })?;
        state.pending.remove(pos);
        if state.ask_back == Some(call_id) {
            state.ask_back = None;
        }

        let after = state.settle();
        let remaining = state.pending.len();
        drop(state);

        debug!(dialog_id = %self.id, call_id = %call_id, remaining, status = %after, "Reply recorded");
        self.emit_if_changed(before, after);
        Ok(after)
    }

    /// Mark the dialog completed; refused while calls are outstanding
    ///
    /// Returns `false` if it was already completed.
    pub fn complete(&self) -> Result<bool, OrchestratorError> {
        let mut state = self.state.lock();
        let before = state.status;

        match before {
            DialogStatus::Completed => return Ok(false),
            _ if !state.pending.is_empty() => return Err(self.invalid(before, "complete")),
            _ => {}
        }

        state.status = DialogStatus::Completed;
        drop(state);

        info!(dialog_id = %self.id, agent_id = %self.agent_id, "Dialog completed");
        self.emit_if_changed(before, DialogStatus::Completed);
        Ok(true)
    }

    /// Wait for exclusive use of this dialog's generation turn
    pub async fn lock_turn(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.turn.lock().await
    }

    pub fn snapshot(&self) -> DialogSnapshot {
        let state = self.state.lock();
        DialogSnapshot {
            id: self.id,
            scope: self.scope,
            parent_id: self.parent_id,
            agent_id: self.agent_id.clone(),
            status: state.status,
            toolless: self.toolless,
            session_slug: self.session_slug.clone(),
            depth: self.depth,
            pending: state.pending.clone(),
        }
    }

    fn invalid(&self, status: DialogStatus, action: &'static str) -> OrchestratorError {
        OrchestratorError::InvalidTransition {
            dialog: self.id,
            status,
            action,
        }
    }

    fn emit_if_changed(&self, before: DialogStatus, after: DialogStatus) {
        if before != after {
            self.events.emit(DialogEvent::StatusChanged {
                dialog_id: self.id,
                status: after,
            });
        }
    }
}

/// Point-in-time view of a dialog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogSnapshot {
    pub id: DialogId,
    pub scope: DialogScope,
    pub parent_id: Option<DialogId>,
    pub agent_id: String,
    pub status: DialogStatus,
    pub toolless: bool,
    pub session_slug: Option<String>,
    pub depth: usize,
    pub pending: Vec<PendingCall>,
}

/// Shared handle to a dialog
#[derive(Debug, Clone)]
pub struct DialogHandle {
    inner: Arc<Dialog>,
}

impl DialogHandle {
    pub fn new(dialog: Dialog) -> Self {
        Self {
            inner: Arc::new(dialog),
        }
    }

    pub fn id(&self) -> DialogId {
        self.inner.id
    }
}

impl std::ops::Deref for DialogHandle {
    type Target = Dialog;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
