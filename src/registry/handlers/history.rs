#![allow(clippy::needless_pass_by_value)]

use super::common::to_data;
use crate::error::BridgeError;
use crate::registry::params::NoParams;
use crate::registry::{CommandCategory, CommandOutput, HandlerBinding, HandlerKind, ToolContext};

pub fn handlers() -> Vec<HandlerBinding> {
    use CommandCategory::History;
    use HandlerKind::Mutating;
    vec![
        HandlerBinding::typed("undo", History, Mutating, undo),
        HandlerBinding::typed("redo", History, Mutating, redo),
    ]
}

pub async fn undo(ctx: ToolContext, _p: NoParams) -> Result<CommandOutput, BridgeError> {
    let entry = ctx.undo().await?;
    Ok(CommandOutput::data(
        format!("Undone: {}", entry.description),
        to_data(&ctx.store().undo_state()),
    ))
}

pub async fn redo(ctx: ToolContext, _p: NoParams) -> Result<CommandOutput, BridgeError> {
    let entry = ctx.redo().await?;
    Ok(CommandOutput::data(
        format!("Redone: {}", entry.description),
        to_data(&ctx.store().undo_state()),
    ))
}
