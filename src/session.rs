//! Session registry
//!
//! A session makes a teammate or self-route call resumable: every call with
//! the same caller, callee and slug inside one dialog tree lands in the same
//! callee dialog. Sessions never expire on their own; they are released when
//! the owning mainline completes.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{CallKind, DialogId};

/// Identity of one session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Mainline dialog owning the tree
    pub tree: DialogId,
    /// Self-route sessions live apart from teammate sessions with the same names
    pub kind: CallKind,
    pub caller: String,
    pub callee: String,
    pub slug: String,
}

impl SessionKey {
    pub fn new(
        tree: DialogId,
        kind: CallKind,
        caller: impl Into<String>,
        callee: impl Into<String>,
        slug: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            kind,
            caller: caller.into(),
            callee: callee.into(),
            slug: slug.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}→@{}#{}", self.caller, self.callee, self.slug)
    }
}

/// Maps session keys to the dialog carrying the conversation
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, DialogId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dialog bound to `key`, if any
    pub fn resolve(&self, key: &SessionKey) -> Option<DialogId> {
        self.sessions.read().get(key).copied()
    }

    /// Bind `key` to `dialog`, returning the previous binding
    pub fn bind(&self, key: SessionKey, dialog: DialogId) -> Option<DialogId> {
        debug!(session = %key, dialog_id = %dialog, "Binding session");
        self.sessions.write().insert(key, dialog)
    }

    /// Resolve `key`, or bind it to the dialog produced by `create`
    ///
    /// `is_live` rejects a stale binding, which is then replaced. Returns the
    /// dialog and whether it was newly created.
    pub fn resolve_or_bind<E>(
        &self,
        key: &SessionKey,
        is_live: impl Fn(DialogId) -> bool,
        create: impl FnOnce() -> Result<DialogId, E>,
    ) -> Result<(DialogId, bool), E> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(key).copied() {
            if is_live(existing) {
                return Ok((existing, false));
            }
            debug!(session = %key, stale = %existing, "Replacing stale session");
        }
        let dialog = create()?;
        sessions.insert(key.clone(), dialog);
        Ok((dialog, true))
    }

    /// Drop every session of a tree
    pub fn release_tree(&self, tree: DialogId) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|key, _| key.tree != tree);
        let released = before - sessions.len();
        if released > 0 {
            info!(tree = %tree, released, "Released sessions");
        }
        released
    }

    /// Sessions bound in one tree
    pub fn sessions_in(&self, tree: DialogId) -> Vec<(SessionKey, DialogId)> {
        self.sessions
            .read()
            .iter()
            .filter(|(key, _)| key.tree == tree)
            .map(|(key, dialog)| (key.clone(), *dialog))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
