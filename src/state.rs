use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::bridge::EngineBridge;
use crate::error::BridgeError;
use crate::events;
use crate::mutation::{SceneMutation, SceneState};
use crate::project::SceneDocument;
use crate::scene::{EntityId, SceneGraphSnapshot, ScriptLibrary};

const MAX_UNDO_LEVELS: usize = 100;

/// Snapshot of undo/redo availability for UI state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub struct UndoState {
    pub can_undo: bool,
    pub can_redo: bool,
    pub undo_description: Option<String>,
    pub redo_description: Option<String>,
}

/// One undoable edit: the mutation as issued plus its inverse computed from
/// the pre-state.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub description: String,
    pub forward: SceneMutation,
    pub inverse: SceneMutation,
}

#[derive(Default)]
struct History {
    undo_stack: Vec<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
}

impl History {
    fn push(&mut self, entry: HistoryEntry) {
        self.undo_stack.push(entry);
        if self.undo_stack.len() > MAX_UNDO_LEVELS {
            self.undo_stack.remove(0);
        }
        self.redo_stack.clear();
    }

    fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

fn take_matching(stack: &mut Vec<HistoryEntry>, entry: &HistoryEntry) -> bool {
    match stack.iter().rposition(|e| e == entry) {
        Some(pos) => {
            stack.remove(pos);
            true
        }
        None => false,
    }
}

fn stale(action: &str, entry: &HistoryEntry, cause: &BridgeError) -> BridgeError {
    tracing::warn!(action, description = %entry.description, error = %cause, "dropping stale history entry");
    BridgeError::invalid(format!(
        "Cannot {action} \"{}\" because the scene changed underneath it ({cause}). \
         The entry was dropped from history.",
        entry.description
    ))
}

#[derive(Default)]
struct Inner {
    state: SceneState,
    history: History,
    next_id: u64,
}

/// Local mirror of the engine scene plus undo/redo history.
///
/// This is the only writer of the scene snapshot and the history stacks.
/// The lock is never held across an await.
#[derive(Default)]
pub struct SceneStore {
    inner: Mutex<Inner>,
}

impl SceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only access to the full local state. Locks for the duration of `f`.
    pub fn with_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SceneState) -> R,
    {
        let guard = self.inner.lock();
        f(&guard.state)
    }

    pub fn snapshot(&self) -> SceneGraphSnapshot {
        self.with_state(|s| s.scene.clone())
    }

    pub fn scripts(&self) -> ScriptLibrary {
        self.with_state(|s| s.scripts.clone())
    }

    pub fn to_document(&self) -> SceneDocument {
        self.with_state(|s| SceneDocument::new(s.scene.clone(), s.scripts.clone()))
    }

    /// Allocate a fresh entity id (`e{n}`) not present in the current scene.
    pub fn allocate_id(&self) -> EntityId {
        let mut inner = self.inner.lock();
        loop {
            inner.next_id += 1;
            let id = format!("e{}", inner.next_id);
            if !inner.state.scene.contains(&id) {
                return id;
            }
        }
    }

    /// Apply an edit optimistically and record exactly one history entry.
    pub fn apply(&self, mutation: SceneMutation) -> Result<HistoryEntry, BridgeError> {
        let mut inner = self.inner.lock();
        let inverse = mutation.apply(&mut inner.state)?;
        let entry = HistoryEntry {
            description: mutation.description(),
            forward: mutation,
            inverse,
        };
        inner.history.push(entry.clone());
        Ok(entry)
    }

    /// Undo a just-applied edit whose dispatch failed, dropping its history entry.
    pub fn revert(&self, entry: &HistoryEntry) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        entry.inverse.apply(&mut inner.state)?;
        if !take_matching(&mut inner.history.undo_stack, entry) {
            tracing::debug!(description = %entry.description, "reverted edit had no history entry");
        }
        Ok(())
    }

    /// Pop the most recent edit, apply its inverse locally and move it to the
    /// redo stack. The caller dispatches the inverse.
    ///
    /// An entry an authoritative push has made stale is dropped, so older
    /// history stays reachable.
    pub fn undo(&self) -> Result<HistoryEntry, BridgeError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .history
            .undo_stack
            .pop()
            .ok_or_else(|| BridgeError::invalid("Nothing to undo"))?;
        if let Err(e) = entry.inverse.apply(&mut inner.state) {
            return Err(stale("undo", &entry, &e));
        }
        inner.history.redo_stack.push(entry.clone());
        Ok(entry)
    }

    pub fn redo(&self) -> Result<HistoryEntry, BridgeError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .history
            .redo_stack
            .pop()
            .ok_or_else(|| BridgeError::invalid("Nothing to redo"))?;
        if let Err(e) = entry.forward.apply(&mut inner.state) {
            return Err(stale("redo", &entry, &e));
        }
        inner.history.undo_stack.push(entry.clone());
        Ok(entry)
    }

    /// Reverse a local undo whose dispatch failed: reapply the edit and return
    /// the entry to the undo stack.
    pub fn rollback_undo(&self, entry: &HistoryEntry) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        entry.forward.apply(&mut inner.state)?;
        if take_matching(&mut inner.history.redo_stack, entry) {
            inner.history.undo_stack.push(entry.clone());
        }
        Ok(())
    }

    /// Reverse a local redo whose dispatch failed.
    pub fn rollback_redo(&self, entry: &HistoryEntry) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock();
        entry.inverse.apply(&mut inner.state)?;
        if take_matching(&mut inner.history.undo_stack, entry) {
            inner.history.redo_stack.push(entry.clone());
        }
        Ok(())
    }

    /// Replace the scene wholesale with an engine push. History is kept.
    pub fn replace_authoritative(&self, scene: SceneGraphSnapshot) {
        let mut inner = self.inner.lock();
        inner.state.scene = scene;
    }

    pub fn replace_scripts(&self, scripts: ScriptLibrary) {
        self.inner.lock().state.scripts = scripts;
    }

    /// Swap in a new document and clear undo/redo history.
    pub fn load_document(&self, doc: SceneDocument) {
        let mut inner = self.inner.lock();
        inner.state = SceneState {
            scene: doc.scene,
            scripts: doc.scripts,
        };
        inner.history.clear();
    }

    pub fn reset_document(&self) {
        self.load_document(SceneDocument::default());
    }

    pub fn undo_state(&self) -> UndoState {
        let inner = self.inner.lock();
        UndoState {
            can_undo: !inner.history.undo_stack.is_empty(),
            can_redo: !inner.history.redo_stack.is_empty(),
            undo_description: inner.history.undo_stack.last().map(|e| e.description.clone()),
            redo_description: inner.history.redo_stack.last().map(|e| e.description.clone()),
        }
    }

    /// Follow authoritative pushes from the engine until the bridge is dropped.
    pub fn follow_events(self: &Arc<Self>, bridge: &EngineBridge) -> tokio::task::JoinHandle<()> {
        let mut rx = bridge.subscribe();
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => store.apply_event(&event.event_type, event.payload),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "scene store lagged behind engine events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn apply_event(&self, event_type: &str, payload: serde_json::Value) {
        match event_type {
            events::SCENE_GRAPH => match serde_json::from_value::<SceneGraphSnapshot>(payload) {
                Ok(scene) => {
                    if let Some(id) = scene.find_parent_cycle() {
                        tracing::warn!(entity = %id, "ignoring scene_graph push with a parent cycle");
                        return;
                    }
                    tracing::debug!(nodes = scene.nodes.len(), "authoritative scene push");
                    self.replace_authoritative(scene);
                }
                Err(e) => tracing::warn!(error = %e, "ignoring malformed scene_graph push"),
            },
            events::SCRIPT_LIBRARY => match serde_json::from_value::<ScriptLibrary>(payload) {
                Ok(scripts) => self.replace_scripts(scripts),
                Err(e) => tracing::warn!(error = %e, "ignoring malformed script_library push"),
            },
            other => tracing::trace!(event_type = other, "event not relevant to scene store"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::scene::{SceneNode, Transform};
    use crate::settings::DispatchSettings;

    fn store_with_entity() -> SceneStore {
        let store = SceneStore::new();
        store
            .apply(SceneMutation::CreateEntity {
                id: "e1".into(),
                node: SceneNode::new("Cube"),
            })
            .unwrap();
        store
    }

    fn move_to(x: f64) -> SceneMutation {
        SceneMutation::SetTransform {
            id: "e1".into(),
            transform: Transform {
                position: [x, 0.0, 0.0],
                ..Transform::default()
            },
        }
    }

    #[test]
    fn each_apply_pushes_one_entry_and_clears_redo() {
        let store = store_with_entity();
        store.apply(move_to(1.0)).unwrap();
        store.undo().unwrap();
        assert!(store.undo_state().can_redo);
        store.apply(move_to(2.0)).unwrap();
        let st = store.undo_state();
        assert!(!st.can_redo);
        assert_eq!(st.undo_description.as_deref(), Some("Transform e1"));
    }

    #[test]
    fn undo_redo_returns_to_same_snapshot() {
        let store = store_with_entity();
        store.apply(move_to(3.0)).unwrap();
        let after = store.snapshot();
        store.undo().unwrap();
        assert_eq!(store.snapshot().nodes["e1"].transform.position[0], 0.0);
        store.redo().unwrap();
        assert_eq!(store.snapshot(), after);
    }

    #[test]
    fn revert_removes_effect_and_entry() {
        let store = store_with_entity();
        let before = store.snapshot();
        let entry = store.apply(move_to(5.0)).unwrap();
        store.revert(&entry).unwrap();
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.undo_state().undo_description.as_deref(), Some("Create \"Cube\""));
    }

    #[test]
    fn rollback_undo_restores_stacks() {
        let store = store_with_entity();
        store.apply(move_to(5.0)).unwrap();
        let after = store.snapshot();
        let entry = store.undo().unwrap();
        store.rollback_undo(&entry).unwrap();
        assert_eq!(store.snapshot(), after);
        let st = store.undo_state();
        assert!(!st.can_redo);
        assert_eq!(st.undo_description.as_deref(), Some("Transform e1"));
    }

    #[test]
    fn history_is_capped() {
        let store = store_with_entity();
        for i in 0..(MAX_UNDO_LEVELS + 10) {
            #[allow(clippy::cast_precision_loss)]
            let x = i as f64 + 1.0;
            store.apply(move_to(x)).unwrap();
        }
        let mut undone = 0;
        while store.undo().is_ok() {
            undone += 1;
        }
        assert_eq!(undone, MAX_UNDO_LEVELS);
    }

    #[test]
    fn load_document_clears_history() {
        let store = store_with_entity();
        store.load_document(SceneDocument::default());
        let st = store.undo_state();
        assert!(!st.can_undo && !st.can_redo);
        assert!(store.snapshot().nodes.is_empty());
    }

    #[test]
    fn allocated_ids_skip_existing_entities() {
        let store = SceneStore::new();
        store
            .apply(SceneMutation::CreateEntity {
                id: "e1".into(),
                node: SceneNode::new("Taken"),
            })
            .unwrap();
        assert_eq!(store.allocate_id(), "e2");
        assert_eq!(store.allocate_id(), "e3");
    }

    #[test]
    fn stale_entry_is_dropped_so_older_history_stays_reachable() {
        let store = SceneStore::new();
        for (id, name) in [("e1", "A"), ("e2", "B")] {
            store
                .apply(SceneMutation::CreateEntity {
                    id: id.into(),
                    node: SceneNode::new(name),
                })
                .unwrap();
        }
        let mut pushed = SceneGraphSnapshot::default();
        pushed.nodes.insert("e1".into(), SceneNode::new("A"));
        pushed.root_ids.push("e1".into());
        store.replace_authoritative(pushed);

        let err = store.undo().unwrap_err();
        assert!(err.to_string().contains("dropped from history"));
        assert_eq!(
            store.undo_state().undo_description.as_deref(),
            Some("Create \"A\"")
        );
        let entry = store.undo().unwrap();
        assert_eq!(entry.description, "Create \"A\"");
        assert!(store.snapshot().nodes.is_empty());
        assert!(!store.undo_state().can_undo);
    }

    #[test]
    fn cyclic_scene_push_is_ignored() {
        let store = store_with_entity();
        let before = store.snapshot();
        store.apply_event(
            events::SCENE_GRAPH,
            json!({
                "nodes": {
                    "a": { "name": "A", "parentId": "b" },
                    "b": { "name": "B", "parentId": "a" }
                }
            }),
        );
        assert_eq!(store.snapshot(), before);

        // Delete still terminates on the untouched mirror.
        store.apply(SceneMutation::DeleteEntity { id: "e1".into() }).unwrap();
        assert!(store.snapshot().nodes.is_empty());
    }

    #[tokio::test]
    async fn scene_graph_event_replaces_snapshot() {
        let store = Arc::new(store_with_entity());
        let (bridge, _rx) = EngineBridge::channel(DispatchSettings::default());
        let handle = store.follow_events(&bridge);

        let pushed = json!({
            "nodes": { "e9": { "name": "FromEngine" } },
            "rootIds": ["e9"]
        });
        bridge.handle_frame(&json!({ "eventType": "scene_graph", "payload": pushed }).to_string());

        for _ in 0..50 {
            if store.snapshot().contains("e9") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let snap = store.snapshot();
        assert!(snap.contains("e9"));
        assert!(!snap.contains("e1"));
        assert!(store.undo_state().can_undo);
        handle.abort();
    }
}
