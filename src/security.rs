//! Security gate: a fixed battery of static checks over the scene and its
//! script library. Pure; findings are advisory unless the approval policy
//! blocks on them.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::scene::{SceneGraphSnapshot, ScriptLibrary};
use crate::settings::SecuritySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub enum IssueKind {
    DanglingAssetReference,
    MissingScript,
    DisallowedApi,
    OrphanedEntity,
    ExcessiveEntityCount,
    ExcessiveComponents,
    ExcessiveHierarchyDepth,
    OversizedScript,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DanglingAssetReference => "dangling_asset_reference",
            Self::MissingScript => "missing_script",
            Self::DisallowedApi => "disallowed_api",
            Self::OrphanedEntity => "orphaned_entity",
            Self::ExcessiveEntityCount => "excessive_entity_count",
            Self::ExcessiveComponents => "excessive_components",
            Self::ExcessiveHierarchyDepth => "excessive_hierarchy_depth",
            Self::OversizedScript => "oversized_script",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub struct SecurityFinding {
    pub issue_kind: IssueKind,
    pub severity: Severity,
    pub affected_entity_ids: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub struct SecurityStats {
    pub entity_count: usize,
    pub script_count: usize,
    pub asset_count: usize,
    pub max_depth: usize,
    pub checks_run: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub struct SecurityReport {
    pub healthy: bool,
    pub issues: Vec<SecurityFinding>,
    pub stats: SecurityStats,
}

impl SecurityReport {
    pub fn has_kind(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.issue_kind == kind)
    }

    /// One-line summary for logs and tool results.
    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            return format!(
                "Healthy: {} entities, {} scripts, no issues.",
                self.stats.entity_count, self.stats.script_count
            );
        }
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.issue_kind.as_str()).or_default() += 1;
        }
        let parts: Vec<String> = counts.iter().map(|(k, n)| format!("{k} x{n}")).collect();
        format!(
            "{}: {} issue(s) ({})",
            if self.healthy { "Healthy with warnings" } else { "Unhealthy" },
            self.issues.len(),
            parts.join(", ")
        )
    }
}

const CHECKS: usize = 8;

/// Run every check over the given state.
pub fn validate(
    scene: &SceneGraphSnapshot,
    scripts: &ScriptLibrary,
    settings: &SecuritySettings,
) -> SecurityReport {
    let mut issues = Vec::new();

    check_asset_references(scene, &mut issues);
    check_missing_scripts(scene, scripts, &mut issues);
    check_disallowed_apis(scene, scripts, &settings.banned_apis, &mut issues);
    check_orphans(scene, &mut issues);
    check_entity_count(scene, settings.max_entities, &mut issues);
    check_component_counts(scene, settings.max_components_per_entity, &mut issues);
    check_hierarchy_depth(scene, settings.max_hierarchy_depth, &mut issues);
    check_script_sizes(scene, scripts, settings.max_script_bytes, &mut issues);

    let healthy = !issues
        .iter()
        .any(|i| matches!(i.severity, Severity::Error | Severity::Critical));
    SecurityReport {
        healthy,
        issues,
        stats: SecurityStats {
            entity_count: scene.nodes.len(),
            script_count: scripts.len(),
            asset_count: scene.assets.len(),
            max_depth: scene.max_depth(),
            checks_run: CHECKS,
        },
    }
}

fn entities_using_script(scene: &SceneGraphSnapshot, script: &str) -> Vec<String> {
    scene
        .nodes
        .iter()
        .filter(|(_, n)| n.script.as_deref() == Some(script))
        .map(|(id, _)| id.clone())
        .collect()
}

fn check_asset_references(scene: &SceneGraphSnapshot, issues: &mut Vec<SecurityFinding>) {
    for (id, node) in &scene.nodes {
        for asset in node.asset_refs.iter().filter(|a| !scene.assets.contains(*a)) {
            issues.push(SecurityFinding {
                issue_kind: IssueKind::DanglingAssetReference,
                severity: Severity::Error,
                affected_entity_ids: vec![id.clone()],
                message: format!("Entity '{}' references unknown asset '{asset}'", node.name),
            });
        }
    }
}

fn check_missing_scripts(
    scene: &SceneGraphSnapshot,
    scripts: &ScriptLibrary,
    issues: &mut Vec<SecurityFinding>,
) {
    for (id, node) in &scene.nodes {
        if let Some(script) = node.script.as_deref().filter(|s| !scripts.contains_key(*s)) {
            issues.push(SecurityFinding {
                issue_kind: IssueKind::MissingScript,
                severity: Severity::Warning,
                affected_entity_ids: vec![id.clone()],
                message: format!("Entity '{}' attaches missing script '{script}'", node.name),
            });
        }
    }
}

/// Call-site pattern for a banned API: the name at a word boundary followed
/// by a call or member access. Dotted names match as a whole path.
fn api_pattern(api: &str) -> Option<Regex> {
    let escaped = regex::escape(api);
    let pattern = if api.contains('.') {
        format!(r"\b{escaped}\b")
    } else {
        format!(r"\b{escaped}\s*[(.]")
    };
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(api, error = %e, "skipping banned API with invalid pattern");
            None
        }
    }
}

fn check_disallowed_apis(
    scene: &SceneGraphSnapshot,
    scripts: &ScriptLibrary,
    banned: &[String],
    issues: &mut Vec<SecurityFinding>,
) {
    let patterns: Vec<(&str, Regex)> = banned
        .iter()
        .filter_map(|api| api_pattern(api).map(|re| (api.as_str(), re)))
        .collect();
    for (name, source) in scripts {
        let hits: Vec<&str> = patterns
            .iter()
            .filter(|(_, re)| re.is_match(source))
            .map(|(api, _)| *api)
            .collect();
        if hits.is_empty() {
            continue;
        }
        issues.push(SecurityFinding {
            issue_kind: IssueKind::DisallowedApi,
            severity: Severity::Critical,
            affected_entity_ids: entities_using_script(scene, name),
            message: format!("Script '{name}' calls disallowed API: {}", hits.join(", ")),
        });
    }
}

fn check_orphans(scene: &SceneGraphSnapshot, issues: &mut Vec<SecurityFinding>) {
    for (id, node) in &scene.nodes {
        if let Some(parent) = node.parent_id.as_deref().filter(|p| !scene.contains(p)) {
            issues.push(SecurityFinding {
                issue_kind: IssueKind::OrphanedEntity,
                severity: Severity::Error,
                affected_entity_ids: vec![id.clone()],
                message: format!("Entity '{}' has missing parent '{parent}'", node.name),
            });
        }
    }
}

fn check_entity_count(scene: &SceneGraphSnapshot, max: usize, issues: &mut Vec<SecurityFinding>) {
    if scene.nodes.len() > max {
        issues.push(SecurityFinding {
            issue_kind: IssueKind::ExcessiveEntityCount,
            severity: Severity::Warning,
            affected_entity_ids: Vec::new(),
            message: format!("Scene has {} entities (limit {max})", scene.nodes.len()),
        });
    }
}

fn check_component_counts(
    scene: &SceneGraphSnapshot,
    max: usize,
    issues: &mut Vec<SecurityFinding>,
) {
    for (id, node) in &scene.nodes {
        if node.component_tags.len() > max {
            issues.push(SecurityFinding {
                issue_kind: IssueKind::ExcessiveComponents,
                severity: Severity::Warning,
                affected_entity_ids: vec![id.clone()],
                message: format!(
                    "Entity '{}' has {} components (limit {max})",
                    node.name,
                    node.component_tags.len()
                ),
            });
        }
    }
}

fn check_hierarchy_depth(
    scene: &SceneGraphSnapshot,
    max: usize,
    issues: &mut Vec<SecurityFinding>,
) {
    let too_deep: Vec<String> = scene
        .nodes
        .keys()
        .filter(|id| scene.depth_of(id) > max)
        .cloned()
        .collect();
    if !too_deep.is_empty() {
        issues.push(SecurityFinding {
            issue_kind: IssueKind::ExcessiveHierarchyDepth,
            severity: Severity::Warning,
            message: format!(
                "{} entities nested deeper than {max} levels (max depth {})",
                too_deep.len(),
                scene.max_depth()
            ),
            affected_entity_ids: too_deep,
        });
    }
}

fn check_script_sizes(
    scene: &SceneGraphSnapshot,
    scripts: &ScriptLibrary,
    max: usize,
    issues: &mut Vec<SecurityFinding>,
) {
    for (name, source) in scripts.iter().filter(|(_, s)| s.len() > max) {
        issues.push(SecurityFinding {
            issue_kind: IssueKind::OversizedScript,
            severity: Severity::Warning,
            affected_entity_ids: entities_using_script(scene, name),
            message: format!("Script '{name}' is {} bytes (limit {max})", source.len()),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::scene::SceneNode;

    fn scene_with_script(script: &str) -> SceneGraphSnapshot {
        let mut scene = SceneGraphSnapshot::default();
        let mut node = SceneNode::new("Player");
        node.script = Some(script.into());
        scene.nodes.insert("e1".into(), node);
        scene.root_ids.push("e1".into());
        scene
    }

    #[test]
    fn banned_api_call_is_critical() {
        let scene = scene_with_script("controller");
        let mut scripts = ScriptLibrary::new();
        scripts.insert("controller".into(), "let x = eval(input);".into());
        let report = validate(&scene, &scripts, &SecuritySettings::default());
        assert!(!report.healthy);
        assert_eq!(report.issues.len(), 1);
        let issue = &report.issues[0];
        assert_eq!(issue.issue_kind, IssueKind::DisallowedApi);
        assert_eq!(issue.severity, Severity::Critical);
        assert_eq!(issue.affected_entity_ids, vec!["e1"]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["issues"][0]["issueKind"], "disallowed_api");
    }

    #[test]
    fn banned_names_inside_identifiers_do_not_match() {
        let scene = scene_with_script("s");
        let mut scripts = ScriptLibrary::new();
        scripts.insert(
            "s".into(),
            "let evaluation = 1; retrieve(); myFunction(); const fetched = 2;".into(),
        );
        let report = validate(&scene, &scripts, &SecuritySettings::default());
        assert!(report.healthy, "{:?}", report.issues);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn member_access_and_dotted_names_match() {
        let scene = SceneGraphSnapshot::default();
        let mut scripts = ScriptLibrary::new();
        scripts.insert("a".into(), "localStorage.setItem('k', 1)".into());
        scripts.insert("b".into(), "let c = document.cookie;".into());
        let report = validate(&scene, &scripts, &SecuritySettings::default());
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues.iter().all(|i| i.issue_kind == IssueKind::DisallowedApi));
    }

    #[test]
    fn dangling_assets_and_orphans_are_errors() {
        let mut scene = SceneGraphSnapshot::default();
        let mut node = SceneNode::new("Tree");
        node.asset_refs.push("tree.glb".into());
        node.parent_id = Some("ghost".into());
        scene.nodes.insert("e1".into(), node);
        let report = validate(&scene, &ScriptLibrary::new(), &SecuritySettings::default());
        assert!(!report.healthy);
        assert!(report.has_kind(IssueKind::DanglingAssetReference));
        assert!(report.has_kind(IssueKind::OrphanedEntity));
    }

    #[test]
    fn resource_limits_are_warnings() {
        let settings = SecuritySettings {
            max_entities: 1,
            max_components_per_entity: 1,
            max_hierarchy_depth: 1,
            max_script_bytes: 4,
            ..SecuritySettings::default()
        };
        let mut scene = SceneGraphSnapshot::default();
        let mut parent = SceneNode::new("P");
        parent.component_tags.insert("mesh".into());
        parent.component_tags.insert("light".into());
        scene.nodes.insert("p".into(), parent);
        let mut child = SceneNode::new("C");
        child.parent_id = Some("p".into());
        child.script = Some("big".into());
        scene.nodes.insert("c".into(), child);
        let mut scripts = ScriptLibrary::new();
        scripts.insert("big".into(), "let a = 1;".into());

        let report = validate(&scene, &scripts, &settings);
        assert!(report.healthy);
        for kind in [
            IssueKind::ExcessiveEntityCount,
            IssueKind::ExcessiveComponents,
            IssueKind::ExcessiveHierarchyDepth,
            IssueKind::OversizedScript,
        ] {
            assert!(report.has_kind(kind), "missing {kind}");
        }
        assert_eq!(report.stats.max_depth, 2);
        assert_eq!(report.stats.checks_run, CHECKS);
    }

    #[test]
    fn missing_script_is_a_warning() {
        let scene = scene_with_script("gone");
        let report = validate(&scene, &ScriptLibrary::new(), &SecuritySettings::default());
        assert!(report.healthy);
        assert!(report.has_kind(IssueKind::MissingScript));
        assert!(report.summary().contains("missing_script x1"));
    }
}
