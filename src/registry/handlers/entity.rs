#![allow(clippy::needless_pass_by_value)]

use serde_json::json;

use super::common::{label, node, require_entity};
use crate::error::BridgeError;
use crate::mutation::SceneMutation;
use crate::registry::params::{
    AssetParams, AttachScriptParams, ComponentParams, CreateEntityParams, EntityIdParams,
    NameParams, RenameEntityParams, ReparentParams, SetTransformParams, SetVisibilityParams,
    WriteScriptParams,
};
use crate::registry::validation::{validate_name, validate_vec3};
use crate::registry::{CommandCategory, CommandOutput, HandlerBinding, HandlerKind, ToolContext};
use crate::scene::SceneNode;

pub fn handlers() -> Vec<HandlerBinding> {
    use CommandCategory::{Entity, Script};
    use HandlerKind::Mutating;
    vec![
        HandlerBinding::typed("create_entity", Entity, Mutating, create_entity),
        HandlerBinding::typed("delete_entity", Entity, Mutating, delete_entity),
        HandlerBinding::typed("rename_entity", Entity, Mutating, rename_entity),
        HandlerBinding::typed("set_entity_visibility", Entity, Mutating, set_entity_visibility),
        HandlerBinding::typed("reparent_entity", Entity, Mutating, reparent_entity),
        HandlerBinding::typed("set_transform", Entity, Mutating, set_transform),
        HandlerBinding::typed("add_component", Entity, Mutating, add_component),
        HandlerBinding::typed("remove_component", Entity, Mutating, remove_component),
        HandlerBinding::typed("attach_asset", Entity, Mutating, attach_asset),
        HandlerBinding::typed("detach_asset", Entity, Mutating, detach_asset),
        HandlerBinding::typed("attach_script", Script, Mutating, attach_script),
        HandlerBinding::typed("write_script", Script, Mutating, write_script),
        HandlerBinding::typed("delete_script", Script, Mutating, delete_script),
    ]
}

pub async fn create_entity(
    ctx: ToolContext,
    p: CreateEntityParams,
) -> Result<CommandOutput, BridgeError> {
    let name = validate_name(&p.name)?;
    if let Some(parent) = &p.parent_id {
        require_entity(&ctx, parent)?;
    }
    let mut new_node = SceneNode::new(name.clone());
    new_node.parent_id.clone_from(&p.parent_id);
    new_node.component_tags = p.component_tags.into_iter().collect();

    let id = ctx.store().allocate_id();
    ctx.commit(SceneMutation::CreateEntity {
        id: id.clone(),
        node: new_node,
    })
    .await?;
    Ok(CommandOutput::data(
        format!("Created \"{name}\" ({id})."),
        json!({ "entityId": id }),
    ))
}

pub async fn delete_entity(ctx: ToolContext, p: EntityIdParams) -> Result<CommandOutput, BridgeError> {
    let what = label(&ctx, &p.entity_id);
    let removed = ctx.store().with_state(|s| s.scene.subtree(&p.entity_id).len());
    if removed == 0 {
        return Err(BridgeError::not_found(format!("Entity '{}'", p.entity_id)));
    }
    ctx.commit(SceneMutation::DeleteEntity { id: p.entity_id })
        .await?;
    Ok(CommandOutput::unit(if removed > 1 {
        format!("Deleted {what} and {} descendant(s).", removed - 1)
    } else {
        format!("Deleted {what}.")
    }))
}

pub async fn rename_entity(
    ctx: ToolContext,
    p: RenameEntityParams,
) -> Result<CommandOutput, BridgeError> {
    let name = validate_name(&p.name)?;
    let old = node(&ctx, &p.entity_id)?.name;
    ctx.commit(SceneMutation::Rename {
        id: p.entity_id.clone(),
        name: name.clone(),
    })
    .await?;
    Ok(CommandOutput::unit(format!(
        "Renamed \"{old}\" to \"{name}\" ({}).",
        p.entity_id
    )))
}

pub async fn set_entity_visibility(
    ctx: ToolContext,
    p: SetVisibilityParams,
) -> Result<CommandOutput, BridgeError> {
    let what = label(&ctx, &p.entity_id);
    ctx.commit(SceneMutation::SetVisibility {
        id: p.entity_id,
        visible: p.visible,
    })
    .await?;
    Ok(CommandOutput::unit(format!(
        "{what} is now {}.",
        if p.visible { "visible" } else { "hidden" }
    )))
}

pub async fn reparent_entity(
    ctx: ToolContext,
    p: ReparentParams,
) -> Result<CommandOutput, BridgeError> {
    let what = label(&ctx, &p.entity_id);
    let target = match &p.parent_id {
        Some(parent) => format!("under {}", label(&ctx, parent)),
        None => "to the root".to_string(),
    };
    ctx.commit(SceneMutation::Reparent {
        id: p.entity_id,
        parent_id: p.parent_id,
        root_index: None,
    })
    .await?;
    Ok(CommandOutput::unit(format!("Moved {what} {target}.")))
}

pub async fn set_transform(
    ctx: ToolContext,
    p: SetTransformParams,
) -> Result<CommandOutput, BridgeError> {
    if p.position.is_none() && p.rotation.is_none() && p.scale.is_none() {
        return Err(BridgeError::validation(
            "set_transform needs at least one of position, rotation, scale",
        ));
    }
    let mut transform = node(&ctx, &p.entity_id)?.transform;
    if let Some(v) = &p.position {
        transform.position = validate_vec3(v, "position")?;
    }
    if let Some(v) = &p.rotation {
        transform.rotation = validate_vec3(v, "rotation")?;
    }
    if let Some(v) = &p.scale {
        transform.scale = validate_vec3(v, "scale")?;
    }
    let what = label(&ctx, &p.entity_id);
    ctx.commit(SceneMutation::SetTransform {
        id: p.entity_id,
        transform,
    })
    .await?;
    Ok(CommandOutput::data(
        format!("Updated transform of {what}."),
        serde_json::to_value(transform).unwrap_or_default(),
    ))
}

pub async fn add_component(
    ctx: ToolContext,
    p: ComponentParams,
) -> Result<CommandOutput, BridgeError> {
    let component = validate_name(&p.component)?;
    let what = label(&ctx, &p.entity_id);
    ctx.commit(SceneMutation::AddComponent {
        id: p.entity_id,
        component: component.clone(),
    })
    .await?;
    Ok(CommandOutput::unit(format!("Added {component} to {what}.")))
}

pub async fn remove_component(
    ctx: ToolContext,
    p: ComponentParams,
) -> Result<CommandOutput, BridgeError> {
    let what = label(&ctx, &p.entity_id);
    ctx.commit(SceneMutation::RemoveComponent {
        id: p.entity_id,
        component: p.component.clone(),
    })
    .await?;
    Ok(CommandOutput::unit(format!("Removed {} from {what}.", p.component)))
}

pub async fn attach_asset(ctx: ToolContext, p: AssetParams) -> Result<CommandOutput, BridgeError> {
    let mut refs = node(&ctx, &p.entity_id)?.asset_refs;
    if refs.contains(&p.asset_id) {
        return Err(BridgeError::invalid(format!(
            "Asset '{}' is already attached to '{}'",
            p.asset_id, p.entity_id
        )));
    }
    refs.push(p.asset_id.clone());
    let what = label(&ctx, &p.entity_id);
    ctx.commit(SceneMutation::SetAssetRefs {
        id: p.entity_id,
        asset_refs: refs,
    })
    .await?;
    Ok(CommandOutput::unit(format!("Attached asset {} to {what}.", p.asset_id)))
}

pub async fn detach_asset(ctx: ToolContext, p: AssetParams) -> Result<CommandOutput, BridgeError> {
    let mut refs = node(&ctx, &p.entity_id)?.asset_refs;
    let before = refs.len();
    refs.retain(|a| a != &p.asset_id);
    if refs.len() == before {
        return Err(BridgeError::not_found(format!(
            "Asset '{}' on entity '{}'",
            p.asset_id, p.entity_id
        )));
    }
    let what = label(&ctx, &p.entity_id);
    ctx.commit(SceneMutation::SetAssetRefs {
        id: p.entity_id,
        asset_refs: refs,
    })
    .await?;
    Ok(CommandOutput::unit(format!("Detached asset {} from {what}.", p.asset_id)))
}

pub async fn attach_script(
    ctx: ToolContext,
    p: AttachScriptParams,
) -> Result<CommandOutput, BridgeError> {
    if let Some(script) = &p.script {
        if !ctx.store().with_state(|s| s.scripts.contains_key(script)) {
            return Err(BridgeError::not_found(format!("Script '{script}'")));
        }
    }
    let what = label(&ctx, &p.entity_id);
    ctx.commit(SceneMutation::AttachScript {
        id: p.entity_id,
        script: p.script.clone(),
    })
    .await?;
    Ok(CommandOutput::unit(match p.script {
        Some(script) => format!("Attached script \"{script}\" to {what}."),
        None => format!("Detached script from {what}."),
    }))
}

pub async fn write_script(
    ctx: ToolContext,
    p: WriteScriptParams,
) -> Result<CommandOutput, BridgeError> {
    let name = validate_name(&p.name)?;
    let bytes = p.source.len();
    let existed = ctx.store().with_state(|s| s.scripts.contains_key(&name));
    ctx.commit(SceneMutation::SetScript {
        name: name.clone(),
        source: Some(p.source),
    })
    .await?;
    Ok(CommandOutput::unit(format!(
        "{} script \"{name}\" ({bytes} bytes).",
        if existed { "Updated" } else { "Created" }
    )))
}

pub async fn delete_script(ctx: ToolContext, p: NameParams) -> Result<CommandOutput, BridgeError> {
    let users: Vec<String> = ctx.store().with_state(|s| {
        s.scene
            .nodes
            .iter()
            .filter(|(_, n)| n.script.as_deref() == Some(p.name.as_str()))
            .map(|(id, _)| id.clone())
            .collect()
    });
    ctx.commit(SceneMutation::SetScript {
        name: p.name.clone(),
        source: None,
    })
    .await?;
    let mut message = format!("Deleted script \"{}\".", p.name);
    if !users.is_empty() {
        message.push_str(&format!(
            " Still attached to: {}. Detach or rewrite it to avoid a missing_script finding.",
            users.join(", ")
        ));
    }
    Ok(CommandOutput::unit(message))
}
