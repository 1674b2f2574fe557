#![allow(clippy::needless_pass_by_value)]

use futures_util::future::join_all;
use serde_json::{json, Map, Value};

use super::common::{node, to_data};
use crate::error::BridgeError;
use crate::registry::params::{EntityIdParams, EntityIdsParams, FindEntitiesParams, HelpParams, NoParams};
use crate::registry::{CommandCategory, CommandOutput, HandlerBinding, HandlerKind, ToolContext};
use crate::scene::SceneGraphSnapshot;

pub fn handlers() -> Vec<HandlerBinding> {
    use CommandCategory::Query;
    vec![
        HandlerBinding::typed("get_scene_graph", Query, HandlerKind::Query, get_scene_graph),
        HandlerBinding::typed("get_entity", Query, HandlerKind::Query, get_entity),
        HandlerBinding::typed("find_entities", Query, HandlerKind::Query, find_entities),
        HandlerBinding::typed("inspect_entities", Query, HandlerKind::Query, inspect_entities),
        HandlerBinding::typed("get_undo_state", CommandCategory::History, HandlerKind::Query, get_undo_state),
        HandlerBinding::typed("help", Query, HandlerKind::Query, help),
    ]
}

/// Indented outline of the hierarchy, one entity per line.
fn outline(scene: &SceneGraphSnapshot) -> Vec<String> {
    fn walk(scene: &SceneGraphSnapshot, id: &str, depth: usize, out: &mut Vec<String>) {
        let Some(n) = scene.node(id) else { return };
        let mut line = format!("{}- {} ({id})", "  ".repeat(depth), n.name);
        if !n.visible {
            line.push_str(" [hidden]");
        }
        if !n.component_tags.is_empty() {
            let tags: Vec<&str> = n.component_tags.iter().map(String::as_str).collect();
            line.push_str(&format!(" {{{}}}", tags.join(", ")));
        }
        out.push(line);
        if depth < scene.nodes.len() {
            for child in scene.children_of(id) {
                walk(scene, &child, depth + 1, out);
            }
        }
    }

    let mut out = Vec::new();
    for root in &scene.root_ids {
        walk(scene, root, 0, &mut out);
    }
    out
}

pub async fn get_scene_graph(ctx: ToolContext, _p: NoParams) -> Result<CommandOutput, BridgeError> {
    let (scene, script_count) = ctx.store().with_state(|s| (s.scene.clone(), s.scripts.len()));
    let mut lines = vec![format!(
        "{} entities ({} roots), {} scripts, {} assets.",
        scene.nodes.len(),
        scene.root_ids.len(),
        script_count,
        scene.assets.len()
    )];
    lines.extend(outline(&scene));
    Ok(CommandOutput::data(lines.join("\n"), to_data(&scene)))
}

pub async fn get_entity(ctx: ToolContext, p: EntityIdParams) -> Result<CommandOutput, BridgeError> {
    let n = node(&ctx, &p.entity_id)?;
    let mut data = to_data(&n);
    if let Some(obj) = data.as_object_mut() {
        obj.insert("entityId".to_string(), Value::String(p.entity_id.clone()));
    }
    Ok(CommandOutput::data(
        serde_json::to_string_pretty(&data).unwrap_or_default(),
        data,
    ))
}

pub async fn find_entities(
    ctx: ToolContext,
    p: FindEntitiesParams,
) -> Result<CommandOutput, BridgeError> {
    let query = p
        .query
        .as_deref()
        .map(|q| q.trim().to_lowercase())
        .filter(|q| !q.is_empty());
    let matches: Vec<Value> = ctx.store().with_state(|s| {
        s.scene
            .nodes
            .iter()
            .filter(|(_, n)| {
                query
                    .as_deref()
                    .map_or(true, |q| n.name.to_lowercase().contains(q))
            })
            .filter(|(_, n)| {
                p.component
                    .as_ref()
                    .map_or(true, |c| n.component_tags.contains(c))
            })
            .map(|(id, n)| json!({ "entityId": id, "name": n.name }))
            .collect()
    });
    let message = if matches.is_empty() {
        "No matching entities.".to_string()
    } else {
        let names: Vec<String> = matches
            .iter()
            .map(|m| {
                format!(
                    "{} ({})",
                    m["name"].as_str().unwrap_or(""),
                    m["entityId"].as_str().unwrap_or("")
                )
            })
            .collect();
        format!("{} match(es): {}", matches.len(), names.join(", "))
    };
    Ok(CommandOutput::data(message, Value::Array(matches)))
}

/// Ask the engine about several entities at once. Queries run concurrently;
/// one entity failing does not fail the others.
///
/// Each query is the engine-side `inspect_entity` command, which is not a tool.
pub async fn inspect_entities(
    ctx: ToolContext,
    p: EntityIdsParams,
) -> Result<CommandOutput, BridgeError> {
    if p.entity_ids.is_empty() {
        return Err(BridgeError::validation("entityIds must not be empty"));
    }
    let queries = p
        .entity_ids
        .iter()
        .map(|id| ctx.dispatch("inspect_entity", json!({ "entityId": id })));
    let results = join_all(queries).await;

    let mut data = Map::new();
    let mut failed = 0;
    for (id, result) in p.entity_ids.iter().zip(results) {
        match result {
            Ok(value) => {
                data.insert(id.clone(), value);
            }
            Err(e) if e.is_fatal() || matches!(e, BridgeError::Cancelled) => return Err(e),
            Err(e) => {
                failed += 1;
                data.insert(id.clone(), json!({ "error": e.to_string() }));
            }
        }
    }
    let total = p.entity_ids.len();
    let message = if failed == 0 {
        format!("Inspected {total} entit{}.", if total == 1 { "y" } else { "ies" })
    } else {
        format!("Inspected {} of {total} entities; {failed} failed.", total - failed)
    };
    Ok(CommandOutput::data(message, Value::Object(data)))
}

pub async fn get_undo_state(ctx: ToolContext, _p: NoParams) -> Result<CommandOutput, BridgeError> {
    let state = ctx.store().undo_state();
    let message = format!(
        "Undo: {}. Redo: {}.",
        state.undo_description.as_deref().unwrap_or("nothing"),
        state.redo_description.as_deref().unwrap_or("nothing")
    );
    Ok(CommandOutput::data(message, to_data(&state)))
}

pub async fn help(ctx: ToolContext, p: HelpParams) -> Result<CommandOutput, BridgeError> {
    Ok(CommandOutput::unit(ctx.catalog().help_text(p.topic.as_deref())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use crate::registry::tests::{harness, seed};

    #[tokio::test]
    async fn inspect_runs_queries_concurrently_and_keeps_partial_results() {
        let mut h = harness();
        let mut rx = std::mem::replace(&mut h.outbound, tokio::sync::mpsc::unbounded_channel().1);
        let bridge = Arc::clone(h.ctx.bridge());
        let engine = tokio::spawn(async move {
            // Both requests must be in flight before either is answered.
            let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(bridge.pending_count(), 2);
            for req in [second, first] {
                let id = req["args"]["entityId"].as_str().unwrap();
                let reply = if id == "ghost" {
                    json!({ "correlationId": req["correlationId"], "ok": false, "error": "no such entity" })
                } else {
                    json!({ "correlationId": req["correlationId"], "ok": true, "result": { "fps": 60 } })
                };
                bridge.handle_frame(&reply.to_string());
            }
        });

        let out = h
            .registry
            .invoke("inspect_entities", json!({ "entityIds": ["e1", "ghost"] }), &h.ctx)
            .await
            .unwrap();
        engine.await.unwrap();
        assert!(out.success);
        assert_eq!(out.message, "Inspected 1 of 2 entities; 1 failed.");
        let data = out.result.unwrap();
        assert_eq!(data["e1"]["fps"], 60);
        assert!(data["ghost"]["error"].as_str().unwrap().contains("no such entity"));
    }

    #[tokio::test]
    async fn find_matches_name_and_component() {
        let h = harness();
        seed(&h, "e1", "Red Lamp");
        seed(&h, "e2", "Blue Lamp");
        seed(&h, "e3", "Table");
        let out = h
            .registry
            .invoke("find_entities", json!({ "query": "lamp" }), &h.ctx)
            .await
            .unwrap();
        assert_eq!(out.result.unwrap().as_array().unwrap().len(), 2);

        let out = h
            .registry
            .invoke("find_entities", json!({ "component": "light" }), &h.ctx)
            .await
            .unwrap();
        assert_eq!(out.message, "No matching entities.");
    }

    #[tokio::test]
    async fn scene_graph_outline_lists_hierarchy() {
        let h = harness();
        seed(&h, "e1", "Room");
        let out = h
            .registry
            .invoke("get_scene_graph", json!({}), &h.ctx)
            .await
            .unwrap();
        assert!(out.message.starts_with("1 entities (1 roots)"));
        assert!(out.message.contains("- Room (e1)"));
    }

    #[tokio::test]
    async fn help_is_answered_locally() {
        let h = harness();
        let out = h
            .registry
            .invoke("help", json!({ "topic": "history" }), &h.ctx)
            .await
            .unwrap();
        assert!(out.message.contains("- undo:"));
        assert!(out.message.contains("- get_undo_state:"));
        assert_eq!(h.ctx.bridge().frames_sent(), 0);
    }
}
