//! Client-side mirror of the engine's scene hierarchy.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub type EntityId = String;

/// Script name → source. Scripts are referenced by name from scene nodes.
pub type ScriptLibrary = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: [f64; 3],
    pub rotation: [f64; 3],
    pub scale: [f64; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneNode {
    pub name: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    #[serde(default)]
    pub component_tags: BTreeSet<String>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub asset_refs: Vec<String>,
    #[serde(default)]
    pub script: Option<String>,
}

fn default_visible() -> bool {
    true
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visible: true,
            parent_id: None,
            component_tags: BTreeSet::new(),
            transform: Transform::default(),
            asset_refs: Vec::new(),
            script: None,
        }
    }
}

/// Mirror of the engine-side hierarchy. Mutated optimistically through the
/// state store and replaced wholesale by authoritative pushes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneGraphSnapshot {
    #[serde(default)]
    pub nodes: BTreeMap<EntityId, SceneNode>,
    #[serde(default)]
    pub root_ids: Vec<EntityId>,
    /// Asset ids known to the project. Nodes may only reference these.
    #[serde(default)]
    pub assets: BTreeSet<String>,
}

impl SceneGraphSnapshot {
    pub fn node(&self, id: &str) -> Option<&SceneNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Direct children of `id`, in id order.
    pub fn children_of(&self, id: &str) -> Vec<EntityId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.parent_id.as_deref() == Some(id))
            .map(|(child, _)| child.clone())
            .collect()
    }

    /// `id` and all of its descendants, parents before children.
    pub fn subtree(&self, id: &str) -> Vec<EntityId> {
        let mut out = Vec::new();
        if !self.contains(id) {
            return out;
        }
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let mut children = self.children_of(&next);
            children.reverse();
            out.push(next);
            stack.extend(children);
        }
        out
    }

    /// First entity (in id order) whose parent chain loops back on itself.
    pub fn find_parent_cycle(&self) -> Option<&EntityId> {
        let mut acyclic: BTreeSet<&str> = BTreeSet::new();
        for id in self.nodes.keys() {
            let mut path: BTreeSet<&str> = BTreeSet::new();
            let mut cursor = Some(id.as_str());
            while let Some(current) = cursor {
                if acyclic.contains(current) {
                    break;
                }
                if !path.insert(current) {
                    return Some(id);
                }
                cursor = self.nodes.get(current).and_then(|n| n.parent_id.as_deref());
            }
            acyclic.extend(path);
        }
        None
    }

    /// True if `ancestor` appears on the parent chain of `id` (or equals it).
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut cursor = Some(id.to_string());
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return false;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent_id.clone());
        }
        false
    }

    /// Depth of `id` in the hierarchy (roots are depth 1). Cycles stop the walk.
    pub fn depth_of(&self, id: &str) -> usize {
        let mut depth = 0;
        let mut cursor = self.nodes.get(id).map(|_| id.to_string());
        while let Some(current) = cursor {
            depth += 1;
            if depth > self.nodes.len() {
                break;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent_id.clone());
        }
        depth
    }

    pub fn max_depth(&self) -> usize {
        self.nodes.keys().map(|id| self.depth_of(id)).max().unwrap_or(0)
    }
}
