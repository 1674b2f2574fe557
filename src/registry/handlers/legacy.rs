//! Fallback tier: viewport and simulation commands the engine still handles
//! directly. Forwarded unchanged, with no local state or history.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BridgeError;
use crate::registry::{
    CommandCategory, CommandOutput, HandlerBinding, HandlerKind, ToolContext, ToolHandler,
};

const LEGACY_COMMANDS: &[&str] = &[
    "select_entity",
    "focus_entity",
    "set_gizmo_mode",
    "set_camera_view",
    "play_simulation",
    "pause_simulation",
];

pub struct LegacyPassthrough;

#[async_trait]
impl ToolHandler for LegacyPassthrough {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Legacy
    }

    async fn call(
        &self,
        command: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<CommandOutput, BridgeError> {
        let result = ctx.dispatch(command, args).await?;
        Ok(if result.is_null() {
            CommandOutput::unit(format!("{command} done."))
        } else {
            CommandOutput::data(format!("{command} done."), result)
        })
    }
}

/// One shared handler bound under every legacy name.
pub fn handlers() -> Vec<HandlerBinding> {
    let handler: Arc<dyn ToolHandler> = Arc::new(LegacyPassthrough);
    LEGACY_COMMANDS
        .iter()
        .copied()
        .map(|name| HandlerBinding::new(name, CommandCategory::Viewport, Arc::clone(&handler)))
        .collect()
}
