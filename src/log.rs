//! Dialog history, treated as an append-only log

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::collab::TurnInput;
use crate::dispatcher::CallReply;
use crate::types::DialogId;

/// One record in a dialog's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LogEntry {
    Input(TurnInput),
    /// Full text of one generated response
    Response { text: String },
    /// Outcome of one call issued by this dialog
    Reply(CallReply),
}

/// Storage for dialog histories
pub trait DialogLog: Send + Sync {
    fn append(&self, dialog: DialogId, entry: LogEntry);

    fn read(&self, dialog: DialogId) -> Vec<LogEntry>;
}

/// In-process log
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: RwLock<HashMap<DialogId, Vec<LogEntry>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DialogLog for MemoryLog {
    fn append(&self, dialog: DialogId, entry: LogEntry) {
        self.entries.write().entry(dialog).or_default().push(entry);
    }

    fn read(&self, dialog: DialogId) -> Vec<LogEntry> {
        self.entries.read().get(&dialog).cloned().unwrap_or_default()
    }
}
