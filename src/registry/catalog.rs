use std::collections::HashMap;
use std::sync::Arc;

use schemars::schema_for;
use serde_json::Value;

use super::manifest::{CommandDescriptor, Manifest};
use super::{CommandCategory, HandlerKind};

pub(super) fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

pub(super) fn schema_value<T: schemars::JsonSchema>() -> Value {
    let root = schema_for!(T);
    serde_json::to_value(root).unwrap_or_else(|_| empty_object_schema())
}

/// Read-only view of the bound command set: the manifest plus the category
/// and kind each binding declared. Drives `help` and tool export.
#[derive(Debug)]
pub struct Catalog {
    manifest: Arc<Manifest>,
    categories: HashMap<String, CommandCategory>,
    kinds: HashMap<String, HandlerKind>,
}

impl Catalog {
    pub(super) fn new(
        manifest: Arc<Manifest>,
        categories: HashMap<String, CommandCategory>,
        kinds: HashMap<String, HandlerKind>,
    ) -> Self {
        Self {
            manifest,
            categories,
            kinds,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn category_of(&self, name: &str) -> Option<CommandCategory> {
        self.categories.get(name).copied()
    }

    pub fn kind_of(&self, name: &str) -> Option<HandlerKind> {
        self.kinds.get(name).copied()
    }

    fn in_category(&self, category: CommandCategory) -> Vec<&CommandDescriptor> {
        self.manifest
            .iter()
            .filter(|c| self.category_of(&c.name) == Some(category))
            .collect()
    }

    /// Generate help text for command discovery.
    /// Three tiers: no topic → categories, category → command list, command → full schema.
    pub fn help_text(&self, topic: Option<&str>) -> String {
        match topic.map(str::trim).filter(|t| !t.is_empty()) {
            None => {
                let mut lines = vec!["Available command categories:".to_string()];
                for cat in CommandCategory::all() {
                    let count = self.in_category(*cat).len();
                    if count > 0 {
                        lines.push(format!("  {} ({count}): {}", cat.slug(), cat.description()));
                    }
                }
                lines.push(String::new());
                lines.push("Use help({topic: \"entity\"}) to list commands in a category.".to_string());
                lines.push(
                    "Use help({topic: \"set_transform\"}) for full parameter details.".to_string(),
                );
                lines.join("\n")
            }
            Some(topic) => {
                if let Some(cmd) = self.manifest.get(topic) {
                    let schema_str = serde_json::to_string_pretty(&cmd.parameters.to_json_schema())
                        .unwrap_or_else(|_| "{}".to_string());
                    let category = self.category_of(&cmd.name).map_or("unbound", |c| c.slug());
                    let undoable = matches!(
                        self.category_of(&cmd.name),
                        Some(CommandCategory::Entity | CommandCategory::Script | CommandCategory::Compound)
                    );
                    return format!(
                        "{}: {}\nCategory: {category} | Undoable: {}\n\nParameters:\n{schema_str}",
                        cmd.name,
                        cmd.description,
                        if undoable { "yes" } else { "no" },
                    );
                }

                let Some(category) = CommandCategory::from_slug(topic) else {
                    return format!(
                        "Unknown topic: \"{topic}\". Use help() to see categories and commands."
                    );
                };
                let matching = self.in_category(category);
                let mut lines = vec![format!("{} commands:", category.slug())];
                for cmd in &matching {
                    lines.push(format!("  - {}: {}", cmd.name, cmd.description));
                }
                lines.push(String::new());
                lines.push("Use help({topic: \"command_name\"}) for parameter details.".to_string());
                lines.join("\n")
            }
        }
    }

    /// Anthropic-shaped tool list for the agent.
    pub fn to_llm_tools(&self) -> Value {
        self.manifest.to_llm_tools()
    }

    /// JSON Schema formatted tool list with binding metadata.
    pub fn to_json_schema(&self) -> Value {
        Value::Array(
            self.manifest
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "name": c.name,
                        "description": c.description,
                        "category": self.category_of(&c.name),
                        "kind": self.kind_of(&c.name),
                        "inputSchema": c.parameters.to_json_schema(),
                    })
                })
                .collect(),
        )
    }
}
