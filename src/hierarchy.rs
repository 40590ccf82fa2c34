//! Dialog tree management
//!
//! Dialogs live in an arena keyed by id. Edges only point upward through
//! `parent_id`; the arena keeps a child index for navigation and snapshots.
//! Completed dialogs stay in the arena so they remain resolvable for audit.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::{DialogEvent, EventSink};
use crate::dialog::{Dialog, DialogHandle, DialogSnapshot};
use crate::error::{CallError, OrchestratorError};
use crate::types::{DialogId, DialogScope};

#[derive(Default)]
struct Arena {
    dialogs: HashMap<DialogId, DialogHandle>,
    children: HashMap<DialogId, Vec<DialogId>>,
}

/// Nested view of a dialog and its sidelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogTreeView {
    pub dialog: DialogSnapshot,
    pub children: Vec<DialogTreeView>,
}

/// Owns every dialog of the process
pub struct DialogTree {
    arena: RwLock<Arena>,
    events: EventSink,
    /// Deepest allowed sideline
    max_depth: usize,
}

impl DialogTree {
    pub fn new(events: EventSink, max_depth: usize) -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
            events,
            max_depth,
        }
    }

    /// Start a new tree
    pub fn create_mainline(&self, agent_id: impl Into<String>) -> DialogHandle {
        let handle = DialogHandle::new(Dialog::mainline(agent_id, self.events.clone()));
        self.insert(handle.clone());
        handle
    }

    /// Create a sideline whose parent is `parent`, forever
    pub fn create_sideline(
        &self,
        parent: &DialogHandle,
        agent_id: impl Into<String>,
        toolless: bool,
        session_slug: Option<String>,
    ) -> Result<DialogHandle, CallError> {
        if parent.is_completed() {
            return Err(CallError::usage(format!(
                "dialog {} is completed and cannot open sidelines",
                parent.id
            )));
        }
        if parent.depth + 1 > self.max_depth {
            return Err(CallError::usage(format!(
                "sideline depth limit of {} reached",
                self.max_depth
            )));
        }

        let dialog = Dialog::sideline(parent, agent_id, toolless, session_slug, self.events.clone());
        let handle = DialogHandle::new(dialog);
        self.insert(handle.clone());
        Ok(handle)
    }

    fn insert(&self, handle: DialogHandle) {
        {
            let mut arena = self.arena.write();
            if let Some(pid) = handle.parent_id {
                arena.children.entry(pid).or_default().push(handle.id);
            }
            arena.dialogs.insert(handle.id, handle.clone());
        }

        self.events.emit(DialogEvent::DialogCreated {
            dialog_id: handle.id,
            parent_id: handle.parent_id,
            agent_id: handle.agent_id.clone(),
            scope: handle.scope,
            toolless: handle.toolless,
        });
    }

    pub fn get(&self, id: &DialogId) -> Option<DialogHandle> {
        self.arena.read().dialogs.get(id).cloned()
    }

    pub fn get_or_err(&self, id: &DialogId) -> Result<DialogHandle, OrchestratorError> {
        self.get(id).ok_or(OrchestratorError::DialogNotFound(*id))
    }

    /// Exists and is not completed
    pub fn is_live(&self, id: &DialogId) -> bool {
        self.get(id).map_or(false, |d| !d.is_completed())
    }

    /// The supdialog, following the fixed creation edge
    pub fn parent(&self, id: &DialogId) -> Option<DialogHandle> {
        let arena = self.arena.read();
        let pid = arena.dialogs.get(id)?.parent_id?;
        arena.dialogs.get(&pid).cloned()
    }

    pub fn children(&self, id: &DialogId) -> Vec<DialogId> {
        self.arena
            .read()
            .children
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Distance from the mainline; 0 for unknown ids
    pub fn depth(&self, id: &DialogId) -> usize {
        self.get(id).map_or(0, |d| d.depth)
    }

    /// Parent chain from the closest supdialog up to the mainline
    pub fn ancestors(&self, id: &DialogId) -> Vec<DialogId> {
        let arena = self.arena.read();
        let mut chain = Vec::new();
        let mut current = arena.dialogs.get(id).and_then(|d| d.parent_id);

        while let Some(pid) = current {
            if chain.contains(&pid) || chain.len() > self.max_depth {
                break;
            }
            chain.push(pid);
            current = arena.dialogs.get(&pid).and_then(|d| d.parent_id);
        }

        chain
    }

    pub fn mainlines(&self) -> Vec<DialogId> {
        self.arena
            .read()
            .dialogs
            .values()
            .filter(|d| d.scope == DialogScope::Mainline)
            .map(|d| d.id)
            .collect()
    }

    /// Every dialog in the tree rooted at `root`
    pub fn dialogs_in(&self, root: &DialogId) -> Vec<DialogId> {
        self.arena
            .read()
            .dialogs
            .values()
            .filter(|d| d.root_id == *root)
            .map(|d| d.id)
            .collect()
    }

    /// Complete a dialog; sessions are the caller's concern
    pub fn complete(&self, id: &DialogId) -> Result<bool, OrchestratorError> {
        let dialog = self.get_or_err(id)?;
        let changed = dialog.complete()?;
        if changed {
            info!(dialog_id = %id, scope = ?dialog.scope, "Dialog detached");
        }
        Ok(changed)
    }

    /// Nested snapshot rooted at `id`
    pub fn snapshot(&self, id: &DialogId) -> Option<DialogTreeView> {
        let arena = self.arena.read();
        Self::build_view(&arena, id)
    }

    fn build_view(arena: &Arena, id: &DialogId) -> Option<DialogTreeView> {
        let dialog = arena.dialogs.get(id)?;
        let children = arena
            .children
            .get(id)
            .map(|ids| ids.iter().filter_map(|c| Self::build_view(arena, c)).collect())
            .unwrap_or_default();

        Some(DialogTreeView {
            dialog: dialog.snapshot(),
            children,
        })
    }

    pub fn len(&self) -> usize {
        self.arena.read().dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.read().dialogs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::event_channel;
    use crate::types::DialogStatus;

    fn tree() -> DialogTree {
        DialogTree::new(EventSink::disconnected(), 3)
    }

    #[test]
    fn test_tree_creation() {
        let tree = tree();
        assert!(tree.is_empty());
        assert!(tree.mainlines().is_empty());
    }

    #[test]
    fn test_add_sidelines() {
        let tree = tree();
        let root = tree.create_mainline("alice");
        let bob = tree.create_sideline(&root, "bob", false, None).unwrap();
        let carol = tree.create_sideline(&root, "carol", false, None).unwrap();

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.mainlines(), vec![root.id()]);
        assert_eq!(tree.children(&root.id()), vec![bob.id(), carol.id()]);
        assert_eq!(tree.parent(&bob.id()).map(|p| p.id()), Some(root.id()));
        assert!(tree.parent(&root.id()).is_none());
    }

    #[test]
    fn test_depth_and_ancestors() {
        let tree = tree();
        let root = tree.create_mainline("alice");
        let child = tree.create_sideline(&root, "bob", false, None).unwrap();
        let grandchild = tree.create_sideline(&child, "carol", false, None).unwrap();

        assert_eq!(tree.depth(&root.id()), 0);
        assert_eq!(tree.depth(&child.id()), 1);
        assert_eq!(tree.depth(&grandchild.id()), 2);
        assert_eq!(tree.depth(&DialogId::new()), 0);
        assert_eq!(tree.ancestors(&grandchild.id()), vec![child.id(), root.id()]);
        assert_eq!(tree.dialogs_in(&root.id()).len(), 3);
    }

    #[test]
    fn test_depth_limit() {
        let tree = tree();
        let mut current = tree.create_mainline("alice");
        for _ in 0..3 {
            current = tree.create_sideline(&current, "bob", false, None).unwrap();
        }
        let err = tree.create_sideline(&current, "bob", false, None).unwrap_err();
        assert!(matches!(err, CallError::InvalidCallUsage { .. }));
    }

    #[test]
    fn test_completed_dialog_stays_resolvable() {
        let tree = tree();
        let root = tree.create_mainline("alice");
        let side = tree.create_sideline(&root, "bob", false, None).unwrap();

        assert!(tree.complete(&side.id()).unwrap());
        assert!(!tree.is_live(&side.id()));
        assert_eq!(tree.get(&side.id()).unwrap().status(), DialogStatus::Completed);
        assert!(tree.create_sideline(&side, "carol", false, None).is_err());
        assert!(matches!(
            tree.complete(&DialogId::new()),
            Err(OrchestratorError::DialogNotFound(_))
        ));
    }

    #[test]
    fn test_snapshot() {
        let tree = tree();
        let root = tree.create_mainline("alice");
        let side = tree.create_sideline(&root, "alice", true, Some("think".into())).unwrap();
        tree.create_sideline(&side, "bob", false, None).unwrap();

        let view = tree.snapshot(&root.id()).unwrap();
        assert_eq!(view.dialog.agent_id, "alice");
        assert_eq!(view.children.len(), 1);
        assert!(view.children[0].dialog.toolless);
        assert_eq!(view.children[0].dialog.session_slug.as_deref(), Some("think"));
        assert_eq!(view.children[0].children[0].dialog.agent_id, "bob");
        assert!(tree.snapshot(&DialogId::new()).is_none());
    }

    #[test]
    fn test_creation_events() {
        let (sink, mut stream) = event_channel();
        let tree = DialogTree::new(sink, 4);
        let root = tree.create_mainline("alice");
        tree.create_sideline(&root, "bob", false, None).unwrap();

        let created: Vec<Option<DialogId>> = stream
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                DialogEvent::DialogCreated { parent_id, .. } => Some(parent_id),
                _ => None,
            })
            .collect();
        assert_eq!(created, vec![None, Some(root.id())]);
    }
}
