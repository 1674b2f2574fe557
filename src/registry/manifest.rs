//! The static command catalog: one descriptor per command, with a parameter
//! schema compiled into a validator at registry build time.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

const BUILTIN_MANIFEST: &str = include_str!("commands.json");

/// Schema for one named parameter. `type` is kept as a raw tag so entries
/// written for newer clients still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type", default)]
    pub type_tag: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(default)]
    pub properties: IndexMap<String, FieldSchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ParameterSchema {
    /// JSON-Schema object form used for tool definitions.
    pub fn to_json_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: ParameterSchema,
}

/// Ordered, name-indexed list of command descriptors. Immutable after load.
#[derive(Debug, Clone)]
pub struct Manifest {
    commands: Vec<CommandDescriptor>,
    index: HashMap<String, usize>,
}

impl Manifest {
    /// The manifest compiled into the crate.
    pub fn builtin() -> Result<Self, BridgeError> {
        Self::from_json(BUILTIN_MANIFEST)
    }

    pub fn from_json(json: &str) -> Result<Self, BridgeError> {
        let commands: Vec<CommandDescriptor> = serde_json::from_str(json)
            .map_err(|e| BridgeError::validation(format!("Invalid command manifest: {e}")))?;
        Self::new(commands)
    }

    pub fn new(commands: Vec<CommandDescriptor>) -> Result<Self, BridgeError> {
        let mut index = HashMap::with_capacity(commands.len());
        for (i, cmd) in commands.iter().enumerate() {
            if cmd.name.is_empty() {
                return Err(BridgeError::validation(format!(
                    "Manifest entry {i} has an empty name"
                )));
            }
            if index.insert(cmd.name.clone(), i).is_some() {
                return Err(BridgeError::validation(format!(
                    "Duplicate command in manifest: {}",
                    cmd.name
                )));
            }
            for req in &cmd.parameters.required {
                if !cmd.parameters.properties.contains_key(req) {
                    tracing::warn!(
                        command = %cmd.name,
                        field = %req,
                        "required field has no property schema"
                    );
                }
            }
        }
        Ok(Self { commands, index })
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.index.get(name).and_then(|&i| self.commands.get(i))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Anthropic-shaped tool list (`name`, `description`, `input_schema`).
    /// The OpenAI adapter in `llm` converts from this shape.
    pub fn to_llm_tools(&self) -> Value {
        Value::Array(
            self.commands
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "name": c.name,
                        "description": c.description,
                        "input_schema": c.parameters.to_json_schema(),
                    })
                })
                .collect(),
        )
    }

    /// JSON Schema formatted tool list for external consumers.
    pub fn to_json_schema(&self) -> Value {
        Value::Array(
            self.commands
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "name": c.name,
                        "description": c.description,
                        "inputSchema": c.parameters.to_json_schema(),
                    })
                })
                .collect(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn builtin_manifest_loads_in_order() {
        let m = Manifest::builtin().unwrap();
        assert!(m.len() > 20);
        assert_eq!(m.iter().next().unwrap().name, "create_entity");
        let rename = m.get("rename_entity").unwrap();
        assert_eq!(rename.parameters.required, vec!["entityId", "name"]);
        let keys: Vec<&String> = rename.parameters.properties.keys().collect();
        assert_eq!(keys, vec!["entityId", "name"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let json = r#"[
            {"name": "a", "description": "", "parameters": {"properties": {}, "required": []}},
            {"name": "a", "description": "", "parameters": {"properties": {}, "required": []}}
        ]"#;
        assert!(Manifest::from_json(json).is_err());
    }

    #[test]
    fn unknown_type_tags_still_load() {
        let json = r#"[{"name": "warp", "description": "d",
            "parameters": {"properties": {"v": {"type": "vector3"}}, "required": ["v"]}}]"#;
        let m = Manifest::from_json(json).unwrap();
        assert_eq!(
            m.get("warp").unwrap().parameters.properties["v"].type_tag.as_deref(),
            Some("vector3")
        );
    }

    #[test]
    fn llm_tools_carry_input_schema() {
        let m = Manifest::builtin().unwrap();
        let tools = m.to_llm_tools();
        let first = &tools.as_array().unwrap()[0];
        assert_eq!(first["name"], "create_entity");
        assert_eq!(first["input_schema"]["type"], "object");
        assert_eq!(first["input_schema"]["required"][0], "name");
    }
}
