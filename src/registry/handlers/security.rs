#![allow(clippy::needless_pass_by_value)]

use serde_json::json;

use super::common::to_data;
use crate::error::BridgeError;
use crate::registry::params::NoParams;
use crate::registry::{CommandCategory, CommandOutput, HandlerBinding, HandlerKind, ToolContext};
use crate::security::{self, SecurityReport};

pub fn handlers() -> Vec<HandlerBinding> {
    use CommandCategory::Security;
    use HandlerKind::Query;
    vec![
        HandlerBinding::typed("get_security_status", Security, Query, get_security_status),
        HandlerBinding::typed(
            "validate_project_security",
            Security,
            Query,
            validate_project_security,
        ),
    ]
}

fn run(ctx: &ToolContext) -> SecurityReport {
    ctx.store()
        .with_state(|s| security::validate(&s.scene, &s.scripts, &ctx.settings().security))
}

/// Active security settings plus whether AI batches go through review.
pub async fn get_security_status(
    ctx: ToolContext,
    _p: NoParams,
) -> Result<CommandOutput, BridgeError> {
    let settings = ctx.settings();
    let rules = &settings.security;
    let approval_mode = settings.agent.approval_mode;
    let message = format!(
        "Approval mode {}. Block policy {:?}, {} banned API(s), at most {} entities.",
        if approval_mode { "on" } else { "off" },
        rules.block_policy,
        rules.banned_apis.len(),
        rules.max_entities
    );
    let mut data = to_data(rules);
    if let Some(obj) = data.as_object_mut() {
        obj.insert("approval_mode".into(), json!(approval_mode));
    }
    Ok(CommandOutput::data(message, data))
}

pub async fn validate_project_security(
    ctx: ToolContext,
    _p: NoParams,
) -> Result<CommandOutput, BridgeError> {
    let report = run(&ctx);
    let mut lines = vec![report.summary()];
    for issue in &report.issues {
        let affected = if issue.affected_entity_ids.is_empty() {
            String::new()
        } else {
            format!(" [{}]", issue.affected_entity_ids.join(", "))
        };
        lines.push(format!(
            "  - {:?} {}: {}{affected}",
            issue.severity, issue.issue_kind, issue.message
        ));
    }
    Ok(CommandOutput::data(lines.join("\n"), to_data(&report)))
}
