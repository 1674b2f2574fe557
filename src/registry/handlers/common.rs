use serde::Serialize;
use serde_json::Value;

use crate::error::BridgeError;
use crate::registry::ToolContext;
use crate::scene::SceneNode;

/// Clone an entity out of the local mirror.
pub fn node(ctx: &ToolContext, id: &str) -> Result<SceneNode, BridgeError> {
    ctx.store()
        .with_state(|s| s.scene.node(id).cloned())
        .ok_or_else(|| BridgeError::not_found(format!("Entity '{id}'")))
}

pub fn require_entity(ctx: &ToolContext, id: &str) -> Result<(), BridgeError> {
    if ctx.store().with_state(|s| s.scene.contains(id)) {
        Ok(())
    } else {
        Err(BridgeError::not_found(format!("Entity '{id}'")))
    }
}

pub fn to_data<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

/// `Name ("id")` for tool result messages.
pub fn label(ctx: &ToolContext, id: &str) -> String {
    match ctx.store().with_state(|s| s.scene.node(id).map(|n| n.name.clone())) {
        Some(name) => format!("\"{name}\" ({id})"),
        None => id.to_string(),
    }
}
