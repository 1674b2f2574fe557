//! Primitive scene edits. Every edit can apply itself to a [`SceneState`],
//! returning the inverse edit computed from the pre-state, and lower itself to
//! the engine commands that make the same change authoritative.
//!
//! Lowered commands belong to the engine's wire vocabulary, which is not the
//! tool manifest. Most names coincide, but `set_asset_refs` has no tool of its
//! own (`attach_asset` and `detach_asset` both lower to it) and
//! `reparent_entity` carries a `rootIndex` the tool never takes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::BridgeError;
use crate::scene::{EntityId, SceneGraphSnapshot, SceneNode, ScriptLibrary, Transform};

/// Local mirror of everything an edit can touch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneState {
    pub scene: SceneGraphSnapshot,
    pub scripts: ScriptLibrary,
}

/// An undoable scene edit. Each variant corresponds to one engine-visible change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SceneMutation {
    CreateEntity {
        id: EntityId,
        node: SceneNode,
    },
    /// Removes the entity and its whole subtree.
    DeleteEntity {
        id: EntityId,
    },
    /// Re-inserts a deleted subtree. `nodes` are ordered parents first.
    RestoreSubtree {
        root: EntityId,
        nodes: Vec<(EntityId, SceneNode)>,
        root_index: Option<usize>,
    },
    Rename {
        id: EntityId,
        name: String,
    },
    SetVisibility {
        id: EntityId,
        visible: bool,
    },
    Reparent {
        id: EntityId,
        parent_id: Option<EntityId>,
        root_index: Option<usize>,
    },
    SetTransform {
        id: EntityId,
        transform: Transform,
    },
    AddComponent {
        id: EntityId,
        component: String,
    },
    RemoveComponent {
        id: EntityId,
        component: String,
    },
    SetAssetRefs {
        id: EntityId,
        asset_refs: Vec<String>,
    },
    AttachScript {
        id: EntityId,
        script: Option<String>,
    },
    /// `source: None` deletes the script.
    SetScript {
        name: String,
        source: Option<String>,
    },
    Batch {
        description: String,
        mutations: Vec<SceneMutation>,
    },
}

impl SceneMutation {
    /// Human-readable description for history entries and chat context.
    pub fn description(&self) -> String {
        match self {
            Self::CreateEntity { node, .. } => format!("Create \"{}\"", node.name),
            Self::DeleteEntity { id } => format!("Delete {id}"),
            Self::RestoreSubtree { root, .. } => format!("Restore {root}"),
            Self::Rename { name, .. } => format!("Rename to \"{name}\""),
            Self::SetVisibility { id, visible } => {
                if *visible {
                    format!("Show {id}")
                } else {
                    format!("Hide {id}")
                }
            }
            Self::Reparent { id, parent_id, .. } => match parent_id {
                Some(p) => format!("Move {id} under {p}"),
                None => format!("Move {id} to root"),
            },
            Self::SetTransform { id, .. } => format!("Transform {id}"),
            Self::AddComponent { component, .. } => format!("Add {component}"),
            Self::RemoveComponent { component, .. } => format!("Remove {component}"),
            Self::SetAssetRefs { id, .. } => format!("Update assets of {id}"),
            Self::AttachScript { id, script } => match script {
                Some(s) => format!("Attach script \"{s}\" to {id}"),
                None => format!("Detach script from {id}"),
            },
            Self::SetScript { name, source } => match source {
                Some(_) => format!("Write script \"{name}\""),
                None => format!("Delete script \"{name}\""),
            },
            Self::Batch { description, .. } => description.clone(),
        }
    }

    /// Apply to `state` and return the inverse built from the pre-state.
    /// On error the state is left untouched.
    pub fn apply(&self, state: &mut SceneState) -> Result<SceneMutation, BridgeError> {
        match self {
            Self::Batch {
                description,
                mutations,
            } => {
                let mut scratch = state.clone();
                let mut inverses = Vec::with_capacity(mutations.len());
                for m in mutations {
                    inverses.push(m.apply(&mut scratch)?);
                }
                inverses.reverse();
                *state = scratch;
                Ok(Self::Batch {
                    description: description.clone(),
                    mutations: inverses,
                })
            }
            Self::SetScript { name, source } => {
                let previous = match source {
                    Some(src) => state.scripts.insert(name.clone(), src.clone()),
                    None => Some(
                        state
                            .scripts
                            .remove(name)
                            .ok_or_else(|| BridgeError::not_found(format!("Script '{name}'")))?,
                    ),
                };
                Ok(Self::SetScript {
                    name: name.clone(),
                    source: previous,
                })
            }
            _ => apply_to_scene(self, &mut state.scene),
        }
    }

    /// Engine commands that make this edit authoritative, in order.
    pub fn engine_commands(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        self.lower_into(&mut out);
        out
    }

    fn lower_into(&self, out: &mut Vec<(String, Value)>) {
        match self {
            Self::CreateEntity { id, node } => out.push(cmd("create_entity", node_args(id, node))),
            Self::DeleteEntity { id } => out.push(cmd("delete_entity", json!({ "entityId": id }))),
            Self::RestoreSubtree { nodes, .. } => {
                for (id, node) in nodes {
                    out.push(cmd("create_entity", node_args(id, node)));
                }
            }
            Self::Rename { id, name } => {
                out.push(cmd("rename_entity", json!({ "entityId": id, "name": name })));
            }
            Self::SetVisibility { id, visible } => out.push(cmd(
                "set_entity_visibility",
                json!({ "entityId": id, "visible": visible }),
            )),
            Self::Reparent {
                id,
                parent_id,
                root_index,
            } => out.push(cmd(
                "reparent_entity",
                json!({ "entityId": id, "parentId": parent_id, "rootIndex": root_index }),
            )),
            Self::SetTransform { id, transform } => out.push(cmd(
                "set_transform",
                json!({
                    "entityId": id,
                    "position": transform.position,
                    "rotation": transform.rotation,
                    "scale": transform.scale,
                }),
            )),
            Self::AddComponent { id, component } => out.push(cmd(
                "add_component",
                json!({ "entityId": id, "component": component }),
            )),
            Self::RemoveComponent { id, component } => out.push(cmd(
                "remove_component",
                json!({ "entityId": id, "component": component }),
            )),
            Self::SetAssetRefs { id, asset_refs } => out.push(cmd(
                "set_asset_refs",
                json!({ "entityId": id, "assetIds": asset_refs }),
            )),
            Self::AttachScript { id, script } => out.push(cmd(
                "attach_script",
                json!({ "entityId": id, "script": script }),
            )),
            Self::SetScript { name, source } => match source {
                Some(src) => out.push(cmd("write_script", json!({ "name": name, "source": src }))),
                None => out.push(cmd("delete_script", json!({ "name": name }))),
            },
            Self::Batch { mutations, .. } => {
                for m in mutations {
                    m.lower_into(out);
                }
            }
        }
    }
}

fn cmd(name: &str, args: Value) -> (String, Value) {
    (name.to_string(), args)
}

fn node_args(id: &str, node: &SceneNode) -> Value {
    json!({
        "entityId": id,
        "name": node.name,
        "parentId": node.parent_id,
        "visible": node.visible,
        "componentTags": node.component_tags,
        "transform": node.transform,
        "assetRefs": node.asset_refs,
        "script": node.script,
    })
}

fn node_mut<'a>(scene: &'a mut SceneGraphSnapshot, id: &str) -> Result<&'a mut SceneNode, BridgeError> {
    scene
        .nodes
        .get_mut(id)
        .ok_or_else(|| BridgeError::not_found(format!("Entity '{id}'")))
}

fn require_parent(scene: &SceneGraphSnapshot, parent: Option<&EntityId>) -> Result<(), BridgeError> {
    match parent {
        Some(p) if !scene.contains(p) => Err(BridgeError::not_found(format!("Parent entity '{p}'"))),
        _ => Ok(()),
    }
}

fn insert_root(scene: &mut SceneGraphSnapshot, id: &str, index: Option<usize>) {
    let at = index.unwrap_or(scene.root_ids.len()).min(scene.root_ids.len());
    scene.root_ids.insert(at, id.to_string());
}

fn remove_root(scene: &mut SceneGraphSnapshot, id: &str) -> Option<usize> {
    let pos = scene.root_ids.iter().position(|r| r == id)?;
    scene.root_ids.remove(pos);
    Some(pos)
}

fn apply_to_scene(
    mutation: &SceneMutation,
    scene: &mut SceneGraphSnapshot,
) -> Result<SceneMutation, BridgeError> {
    use SceneMutation as M;

    match mutation {
        M::CreateEntity { id, node } => {
            if scene.contains(id) {
                return Err(BridgeError::invalid(format!("Entity '{id}' already exists")));
            }
            require_parent(scene, node.parent_id.as_ref())?;
            if node.parent_id.is_none() {
                insert_root(scene, id, None);
            }
            scene.nodes.insert(id.clone(), node.clone());
            Ok(M::DeleteEntity { id: id.clone() })
        }
        M::DeleteEntity { id } => {
            let ids = scene.subtree(id);
            if ids.is_empty() {
                return Err(BridgeError::not_found(format!("Entity '{id}'")));
            }
            let root_index = remove_root(scene, id);
            let nodes = ids
                .into_iter()
                .filter_map(|e| scene.nodes.remove(&e).map(|n| (e, n)))
                .collect();
            Ok(M::RestoreSubtree {
                root: id.clone(),
                nodes,
                root_index,
            })
        }
        M::RestoreSubtree {
            root,
            nodes,
            root_index,
        } => {
            if let Some((existing, _)) = nodes.iter().find(|(e, _)| scene.contains(e)) {
                return Err(BridgeError::invalid(format!("Entity '{existing}' already exists")));
            }
            let root_parent = nodes
                .iter()
                .find(|(e, _)| e == root)
                .ok_or_else(|| BridgeError::invalid(format!("Subtree is missing its root '{root}'")))?
                .1
                .parent_id
                .clone();
            require_parent(scene, root_parent.as_ref())?;
            if root_parent.is_none() {
                insert_root(scene, root, *root_index);
            }
            for (e, n) in nodes {
                scene.nodes.insert(e.clone(), n.clone());
            }
            Ok(M::DeleteEntity { id: root.clone() })
        }
        M::Rename { id, name } => {
            let node = node_mut(scene, id)?;
            let old = std::mem::replace(&mut node.name, name.clone());
            Ok(M::Rename {
                id: id.clone(),
                name: old,
            })
        }
        M::SetVisibility { id, visible } => {
            let node = node_mut(scene, id)?;
            let old = std::mem::replace(&mut node.visible, *visible);
            Ok(M::SetVisibility {
                id: id.clone(),
                visible: old,
            })
        }
        M::Reparent {
            id,
            parent_id,
            root_index,
        } => {
            let old_parent = scene
                .node(id)
                .ok_or_else(|| BridgeError::not_found(format!("Entity '{id}'")))?
                .parent_id
                .clone();
            require_parent(scene, parent_id.as_ref())?;
            if let Some(p) = parent_id {
                if scene.is_ancestor(id, p) {
                    return Err(BridgeError::invalid(format!(
                        "Cannot move '{id}' under its own descendant '{p}'"
                    )));
                }
            }
            let old_index = if old_parent.is_none() {
                remove_root(scene, id)
            } else {
                None
            };
            if parent_id.is_none() {
                insert_root(scene, id, *root_index);
            }
            node_mut(scene, id)?.parent_id.clone_from(parent_id);
            Ok(M::Reparent {
                id: id.clone(),
                parent_id: old_parent,
                root_index: old_index,
            })
        }
        M::SetTransform { id, transform } => {
            let node = node_mut(scene, id)?;
            let old = std::mem::replace(&mut node.transform, *transform);
            Ok(M::SetTransform {
                id: id.clone(),
                transform: old,
            })
        }
        M::AddComponent { id, component } => {
            let node = node_mut(scene, id)?;
            if !node.component_tags.insert(component.clone()) {
                return Err(BridgeError::invalid(format!(
                    "Entity '{id}' already has component '{component}'"
                )));
            }
            Ok(M::RemoveComponent {
                id: id.clone(),
                component: component.clone(),
            })
        }
        M::RemoveComponent { id, component } => {
            let node = node_mut(scene, id)?;
            if !node.component_tags.remove(component) {
                return Err(BridgeError::not_found(format!(
                    "Component '{component}' on entity '{id}'"
                )));
            }
            Ok(M::AddComponent {
                id: id.clone(),
                component: component.clone(),
            })
        }
        M::SetAssetRefs { id, asset_refs } => {
            let node = node_mut(scene, id)?;
            let old = std::mem::replace(&mut node.asset_refs, asset_refs.clone());
            Ok(M::SetAssetRefs {
                id: id.clone(),
                asset_refs: old,
            })
        }
        M::AttachScript { id, script } => {
            let node = node_mut(scene, id)?;
            let old = std::mem::replace(&mut node.script, script.clone());
            Ok(M::AttachScript {
                id: id.clone(),
                script: old,
            })
        }
        M::SetScript { .. } | M::Batch { .. } => Err(BridgeError::invalid(
            "script and batch edits are applied at the state level",
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn state() -> SceneState {
        let mut s = SceneState::default();
        SceneMutation::CreateEntity {
            id: "e1".into(),
            node: SceneNode::new("Root"),
        }
        .apply(&mut s)
        .unwrap();
        let mut child = SceneNode::new("Child");
        child.parent_id = Some("e1".into());
        SceneMutation::CreateEntity {
            id: "e2".into(),
            node: child,
        }
        .apply(&mut s)
        .unwrap();
        s
    }

    #[test]
    fn delete_then_inverse_restores_subtree() {
        let mut s = state();
        let before = s.clone();
        let inverse = SceneMutation::DeleteEntity { id: "e1".into() }
            .apply(&mut s)
            .unwrap();
        assert!(s.scene.nodes.is_empty());
        assert!(s.scene.root_ids.is_empty());
        inverse.apply(&mut s).unwrap();
        assert_eq!(s, before);
    }

    #[test]
    fn reparent_rejects_cycles() {
        let mut s = state();
        let err = SceneMutation::Reparent {
            id: "e1".into(),
            parent_id: Some("e2".into()),
            root_index: None,
        }
        .apply(&mut s)
        .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOperation { .. }));
    }

    #[test]
    fn reparent_to_root_and_back_keeps_root_order() {
        let mut s = state();
        let before = s.clone();
        let inverse = SceneMutation::Reparent {
            id: "e2".into(),
            parent_id: None,
            root_index: Some(0),
        }
        .apply(&mut s)
        .unwrap();
        assert_eq!(s.scene.root_ids, vec!["e2", "e1"]);
        inverse.apply(&mut s).unwrap();
        assert_eq!(s, before);
    }

    #[test]
    fn reparent_lowering_keeps_root_position() {
        let mut s = state();
        SceneMutation::CreateEntity {
            id: "e3".into(),
            node: SceneNode::new("Other"),
        }
        .apply(&mut s)
        .unwrap();
        let inverse = SceneMutation::Reparent {
            id: "e1".into(),
            parent_id: Some("e3".into()),
            root_index: None,
        }
        .apply(&mut s)
        .unwrap();

        let cmds = inverse.engine_commands();
        assert_eq!(cmds[0].0, "reparent_entity");
        assert_eq!(cmds[0].1["parentId"], serde_json::Value::Null);
        assert_eq!(cmds[0].1["rootIndex"], 0);
    }

    #[test]
    fn only_asset_refs_lowers_outside_the_tool_manifest() {
        let id = || "e1".to_string();
        let batch = SceneMutation::Batch {
            description: "all".into(),
            mutations: vec![
                SceneMutation::CreateEntity { id: id(), node: SceneNode::new("A") },
                SceneMutation::DeleteEntity { id: id() },
                SceneMutation::Rename { id: id(), name: "B".into() },
                SceneMutation::SetVisibility { id: id(), visible: false },
                SceneMutation::Reparent { id: id(), parent_id: None, root_index: None },
                SceneMutation::SetTransform { id: id(), transform: Transform::default() },
                SceneMutation::AddComponent { id: id(), component: "mesh".into() },
                SceneMutation::RemoveComponent { id: id(), component: "mesh".into() },
                SceneMutation::SetAssetRefs { id: id(), asset_refs: vec![] },
                SceneMutation::AttachScript { id: id(), script: None },
                SceneMutation::SetScript { name: "s".into(), source: Some(String::new()) },
                SceneMutation::SetScript { name: "s".into(), source: None },
            ],
        };
        let registry = crate::registry::Registry::builtin().unwrap();
        let outside: Vec<String> = batch
            .engine_commands()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !registry.manifest().iter().any(|c| &c.name == name))
            .collect();
        assert_eq!(outside, vec!["set_asset_refs"]);
    }

    #[test]
    fn failed_batch_leaves_state_untouched() {
        let mut s = state();
        let before = s.clone();
        let batch = SceneMutation::Batch {
            description: "two renames".into(),
            mutations: vec![
                SceneMutation::Rename {
                    id: "e1".into(),
                    name: "A".into(),
                },
                SceneMutation::Rename {
                    id: "ghost".into(),
                    name: "B".into(),
                },
            ],
        };
        assert!(batch.apply(&mut s).is_err());
        assert_eq!(s, before);
    }

    #[test]
    fn batch_inverse_runs_in_reverse() {
        let mut s = state();
        let before = s.clone();
        let batch = SceneMutation::Batch {
            description: "group".into(),
            mutations: vec![
                SceneMutation::CreateEntity {
                    id: "g".into(),
                    node: SceneNode::new("Group"),
                },
                SceneMutation::Reparent {
                    id: "e1".into(),
                    parent_id: Some("g".into()),
                    root_index: None,
                },
            ],
        };
        let inverse = batch.apply(&mut s).unwrap();
        assert_eq!(s.scene.root_ids, vec!["g"]);
        inverse.apply(&mut s).unwrap();
        assert_eq!(s, before);
    }

    #[test]
    fn script_edits_round_trip() {
        let mut s = state();
        let inverse = SceneMutation::SetScript {
            name: "spin".into(),
            source: Some("rotate(1)".into()),
        }
        .apply(&mut s)
        .unwrap();
        assert_eq!(
            inverse,
            SceneMutation::SetScript {
                name: "spin".into(),
                source: None
            }
        );
        inverse.apply(&mut s).unwrap();
        assert!(s.scripts.is_empty());
        assert!(SceneMutation::SetScript {
            name: "spin".into(),
            source: None
        }
        .apply(&mut s)
        .is_err());
    }

    #[test]
    fn batch_lowers_to_flat_engine_commands() {
        let batch = SceneMutation::Batch {
            description: "d".into(),
            mutations: vec![
                SceneMutation::Rename {
                    id: "e1".into(),
                    name: "A".into(),
                },
                SceneMutation::SetScript {
                    name: "s".into(),
                    source: None,
                },
            ],
        };
        let cmds = batch.engine_commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].0, "rename_entity");
        assert_eq!(cmds[0].1["entityId"], "e1");
        assert_eq!(cmds[1].0, "delete_script");
    }

    #[test]
    fn duplicate_component_is_rejected() {
        let mut s = state();
        let add = SceneMutation::AddComponent {
            id: "e1".into(),
            component: "mesh".into(),
        };
        add.apply(&mut s).unwrap();
        assert!(add.apply(&mut s).is_err());
    }
}
