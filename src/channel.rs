//! Observable event stream for UI and audit consumers

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::tellask::TellaskCall;
use crate::types::{CallId, CallKind, DialogId, DialogScope, DialogStatus};

/// Something that happened in the dialog tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DialogEvent {
    DialogCreated {
        dialog_id: DialogId,
        parent_id: Option<DialogId>,
        agent_id: String,
        scope: DialogScope,
        toolless: bool,
    },
    StatusChanged {
        dialog_id: DialogId,
        status: DialogStatus,
    },
    /// One prose line of a generated response
    Prose {
        dialog_id: DialogId,
        line: String,
    },
    /// A call block finished parsing, malformed ones included
    CallParsed {
        dialog_id: DialogId,
        call: TellaskCall,
    },
    /// A call (or one target of it) was refused before delivery
    CallRejected {
        dialog_id: DialogId,
        target: Option<String>,
        error: CallError,
    },
    CallDispatched {
        dialog_id: DialogId,
        call_id: CallId,
        kind: CallKind,
        target: String,
    },
    ReplyDelivered {
        dialog_id: DialogId,
        call_id: CallId,
        target: String,
        ok: bool,
    },
}

/// Sending half, cloned into every component that reports events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DialogEvent>,
}

impl EventSink {
    /// A sink whose events go nowhere
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Report an event; nobody listening is not an error
    pub fn emit(&self, event: DialogEvent) {
        let _ = self.tx.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<DialogEvent>,
}

impl EventStream {
    /// Try to receive an event (non-blocking)
    pub fn try_recv(&mut self) -> Option<DialogEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event; `None` once every sink is dropped
    pub async fn recv(&mut self) -> Option<DialogEvent> {
        self.rx.recv().await
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<DialogEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Create a connected sink/stream pair
pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventStream { rx })
}
