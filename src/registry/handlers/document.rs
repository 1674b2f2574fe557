#![allow(clippy::needless_pass_by_value)]

use std::path::Path;

use serde_json::json;

use crate::error::BridgeError;
use crate::project;
use crate::registry::params::{NoParams, PathParams};
use crate::registry::{CommandCategory, CommandOutput, HandlerBinding, HandlerKind, ToolContext};

pub fn handlers() -> Vec<HandlerBinding> {
    use CommandCategory::Document;
    use HandlerKind::Mutating;
    vec![
        HandlerBinding::typed("new_document", Document, Mutating, new_document),
        HandlerBinding::typed("load_document", Document, Mutating, load_document),
    ]
}

/// Document swaps are not undoable: the engine goes first and local state
/// (and history) only changes once it has accepted.
pub async fn new_document(ctx: ToolContext, _p: NoParams) -> Result<CommandOutput, BridgeError> {
    ctx.dispatch("new_document", json!({})).await?;
    ctx.store().reset_document();
    Ok(CommandOutput::unit("Started a new empty document."))
}

pub async fn load_document(ctx: ToolContext, p: PathParams) -> Result<CommandOutput, BridgeError> {
    let doc = project::load_document(Path::new(&p.path))?;
    let entities = doc.scene.nodes.len();
    let scripts = doc.scripts.len();
    let payload = serde_json::to_value(&doc)
        .map_err(|e| BridgeError::invalid(format!("Cannot encode document: {e}")))?;
    ctx.dispatch("load_document", json!({ "document": payload }))
        .await?;
    ctx.store().load_document(doc);
    Ok(CommandOutput::data(
        format!("Loaded {} ({entities} entities, {scripts} scripts).", p.path),
        json!({ "entities": entities, "scripts": scripts }),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use crate::project::{save_document, SceneDocument};
    use crate::registry::tests::{auto_reply, harness, seed};
    use crate::scene::{SceneGraphSnapshot, SceneNode};

    #[tokio::test]
    async fn load_replaces_scene_and_clears_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("level.json");
        let mut scene = SceneGraphSnapshot::default();
        scene.nodes.insert("hero".into(), SceneNode::new("Hero"));
        scene.root_ids.push("hero".into());
        save_document(&path, &SceneDocument::new(scene, Default::default())).unwrap();

        let mut h = harness();
        seed(&h, "e1", "Old");
        auto_reply(&mut h, None);
        let out = h
            .registry
            .invoke("load_document", json!({ "path": path.to_string_lossy() }), &h.ctx)
            .await
            .unwrap();
        assert!(out.success, "{out:?}");
        let snapshot = h.ctx.store().snapshot();
        assert!(snapshot.contains("hero"));
        assert!(!snapshot.contains("e1"));
        assert!(!h.ctx.store().undo_state().can_undo);
    }

    #[tokio::test]
    async fn engine_refusal_keeps_current_document() {
        let mut h = harness();
        seed(&h, "e1", "Keep");
        auto_reply(&mut h, Some("new_document"));
        let out = h.registry.invoke("new_document", json!({}), &h.ctx).await.unwrap();
        assert!(!out.success);
        assert!(h.ctx.store().snapshot().contains("e1"));
        assert!(h.ctx.store().undo_state().can_undo);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let h = harness();
        let out = h
            .registry
            .invoke("load_document", json!({ "path": "/nonexistent/scene.json" }), &h.ctx)
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(h.ctx.bridge().frames_sent(), 0);
    }
}
