#![allow(clippy::needless_pass_by_value)]

//! Multi-step edits. Each handler builds one `Batch` so the whole operation
//! is a single undo step.

use std::collections::{BTreeSet, HashMap};

use serde_json::json;

use super::common::{node, require_entity};
use crate::error::BridgeError;
use crate::mutation::SceneMutation;
use crate::registry::params::{CreatePrimitiveParams, DuplicateEntityParams, GroupEntitiesParams};
use crate::registry::validation::{validate_name, validate_vec3};
use crate::registry::{CommandCategory, CommandOutput, HandlerBinding, HandlerKind, ToolContext};
use crate::scene::{EntityId, SceneNode};

pub fn handlers() -> Vec<HandlerBinding> {
    use CommandCategory::Compound;
    vec![
        HandlerBinding::typed("duplicate_entity", Compound, HandlerKind::Compound, duplicate_entity),
        HandlerBinding::typed("create_primitive", Compound, HandlerKind::Compound, create_primitive),
        HandlerBinding::typed("group_entities", Compound, HandlerKind::Compound, group_entities),
    ]
}

pub async fn duplicate_entity(
    ctx: ToolContext,
    p: DuplicateEntityParams,
) -> Result<CommandOutput, BridgeError> {
    let source = node(&ctx, &p.entity_id)?;
    let copy_name = match &p.name {
        Some(n) => validate_name(n)?,
        None => format!("{} copy", source.name),
    };

    let originals: Vec<(EntityId, SceneNode)> = ctx.store().with_state(|s| {
        s.scene
            .subtree(&p.entity_id)
            .into_iter()
            .filter_map(|id| s.scene.node(&id).cloned().map(|n| (id, n)))
            .collect()
    });

    let mut remap: HashMap<EntityId, EntityId> = HashMap::with_capacity(originals.len());
    for (old, _) in &originals {
        remap.insert(old.clone(), ctx.store().allocate_id());
    }

    let mut mutations = Vec::with_capacity(originals.len());
    for (old, mut copy) in originals {
        let Some(new_id) = remap.get(&old).cloned() else {
            continue;
        };
        if old == p.entity_id {
            copy.name.clone_from(&copy_name);
        } else {
            copy.parent_id = copy.parent_id.and_then(|parent| remap.get(&parent).cloned());
        }
        mutations.push(SceneMutation::CreateEntity {
            id: new_id,
            node: copy,
        });
    }
    let count = mutations.len();
    let root_id = remap.get(&p.entity_id).cloned().unwrap_or_default();

    ctx.commit(SceneMutation::Batch {
        description: format!("Duplicate \"{}\"", source.name),
        mutations,
    })
    .await?;
    Ok(CommandOutput::data(
        format!(
            "Duplicated \"{}\" as \"{copy_name}\" ({root_id}), {count} entit{} created.",
            source.name,
            if count == 1 { "y" } else { "ies" }
        ),
        json!({ "entityId": root_id, "created": count }),
    ))
}

pub async fn create_primitive(
    ctx: ToolContext,
    p: CreatePrimitiveParams,
) -> Result<CommandOutput, BridgeError> {
    let name = match &p.name {
        Some(n) => validate_name(n)?,
        None => p.shape.label().to_string(),
    };
    if let Some(parent) = &p.parent_id {
        require_entity(&ctx, parent)?;
    }
    let position = p
        .position
        .as_deref()
        .map(|v| validate_vec3(v, "position"))
        .transpose()?;

    let mut mesh = SceneNode::new(name.clone());
    mesh.parent_id.clone_from(&p.parent_id);
    mesh.component_tags = BTreeSet::from([
        "mesh_renderer".to_string(),
        format!("{}_mesh", p.shape.label().to_lowercase()),
        "collider".to_string(),
    ]);

    let id = ctx.store().allocate_id();
    let mut mutations = vec![SceneMutation::CreateEntity {
        id: id.clone(),
        node: mesh.clone(),
    }];
    if let Some(position) = position {
        let mut transform = mesh.transform;
        transform.position = position;
        mutations.push(SceneMutation::SetTransform {
            id: id.clone(),
            transform,
        });
    }

    ctx.commit(SceneMutation::Batch {
        description: format!("Create {} \"{name}\"", p.shape.label()),
        mutations,
    })
    .await?;
    Ok(CommandOutput::data(
        format!("Created {} \"{name}\" ({id}).", p.shape.label().to_lowercase()),
        json!({ "entityId": id }),
    ))
}

pub async fn group_entities(
    ctx: ToolContext,
    p: GroupEntitiesParams,
) -> Result<CommandOutput, BridgeError> {
    if p.entity_ids.is_empty() {
        return Err(BridgeError::validation("entityIds must not be empty"));
    }
    let mut seen = BTreeSet::new();
    for id in &p.entity_ids {
        if !seen.insert(id.as_str()) {
            return Err(BridgeError::validation(format!("Entity '{id}' listed twice")));
        }
    }
    let name = match &p.name {
        Some(n) => validate_name(n)?,
        None => "Group".to_string(),
    };

    // The group takes the shared parent of its members, or the root.
    let mut parents = BTreeSet::new();
    for id in &p.entity_ids {
        parents.insert(node(&ctx, id)?.parent_id);
    }
    let group_parent = if parents.len() == 1 {
        parents.into_iter().next().flatten()
    } else {
        None
    };

    let group_id = ctx.store().allocate_id();
    let mut group = SceneNode::new(name.clone());
    group.parent_id = group_parent;

    let mut mutations = vec![SceneMutation::CreateEntity {
        id: group_id.clone(),
        node: group,
    }];
    mutations.extend(p.entity_ids.iter().map(|id| SceneMutation::Reparent {
        id: id.clone(),
        parent_id: Some(group_id.clone()),
        root_index: None,
    }));

    ctx.commit(SceneMutation::Batch {
        description: format!("Group {} entities", p.entity_ids.len()),
        mutations,
    })
    .await?;
    Ok(CommandOutput::data(
        format!(
            "Grouped {} entities under \"{name}\" ({group_id}).",
            p.entity_ids.len()
        ),
        json!({ "entityId": group_id }),
    ))
}
