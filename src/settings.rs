use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::project::{read_json, write_json, ProjectError};
use crate::security::IssueKind;

// ── LLM provider types ──────────────────────────────────────────

/// Which LLM provider drives the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmProvider {
    Anthropic,
    OpenAiCompatible,
}

/// Full configuration for the chosen LLM provider.
///
/// The `api_key` field is never written to the settings file. It is stored in a
/// separate credentials file and loaded/saved via [`load_api_key`]/[`save_api_key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub provider: LlmProvider,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Base URL for OpenAI-compatible providers (ignored for Anthropic).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model override. None = use provider default.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            api_key: None,
            base_url: None,
            model: None,
            max_tokens: default_max_tokens(),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────

/// Engine dispatch timeouts. Some commands trigger heavy engine work, so the
/// default is generous; individual commands can be tightened or relaxed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub command_timeouts_ms: BTreeMap<String, u64>,
}

fn default_timeout_ms() -> u64 {
    120_000
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            command_timeouts_ms: BTreeMap::new(),
        }
    }
}

impl DispatchSettings {
    pub fn timeout_for(&self, command: &str) -> Duration {
        let ms = self
            .command_timeouts_ms
            .get(command)
            .copied()
            .unwrap_or(self.timeout_ms);
        Duration::from_millis(ms.max(1))
    }
}

// ── Reconciliation ───────────────────────────────────────────────

/// What to do with an optimistic local edit whose engine dispatch failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Undo the local effect immediately and drop its history entry.
    #[default]
    Revert,
    /// Keep the local effect; the next authoritative scene push corrects it.
    AwaitAuthoritative,
}

// ── Agent ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Require a reviewer before AI-proposed commands are dispatched.
    #[serde(default)]
    pub approval_mode: bool,
}

fn default_max_iterations() -> usize {
    10
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            approval_mode: false,
        }
    }
}

// ── Security ─────────────────────────────────────────────────────

/// How approval mode treats security findings a batch would introduce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Findings are attached to the review request; the reviewer decides.
    Advisory,
    /// Findings of a critical kind reject the batch without asking.
    #[default]
    BlockOnCritical,
    /// Any finding rejects the batch without asking.
    BlockOnAny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default = "default_banned_apis")]
    pub banned_apis: Vec<String>,
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    #[serde(default = "default_max_components")]
    pub max_components_per_entity: usize,
    #[serde(default = "default_max_depth")]
    pub max_hierarchy_depth: usize,
    #[serde(default = "default_max_script_bytes")]
    pub max_script_bytes: usize,
    #[serde(default)]
    pub block_policy: ApprovalPolicy,
    #[serde(default = "default_critical_kinds")]
    pub critical_kinds: Vec<IssueKind>,
}

fn default_banned_apis() -> Vec<String> {
    [
        "eval",
        "Function",
        "require",
        "import",
        "fetch",
        "XMLHttpRequest",
        "WebSocket",
        "localStorage",
        "document.cookie",
        "process.exit",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn default_max_entities() -> usize {
    10_000
}

fn default_max_components() -> usize {
    32
}

fn default_max_depth() -> usize {
    64
}

fn default_max_script_bytes() -> usize {
    64 * 1024
}

fn default_critical_kinds() -> Vec<IssueKind> {
    vec![IssueKind::DisallowedApi]
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            banned_apis: default_banned_apis(),
            max_entities: default_max_entities(),
            max_components_per_entity: default_max_components(),
            max_hierarchy_depth: default_max_depth(),
            max_script_bytes: default_max_script_bytes(),
            block_policy: ApprovalPolicy::default(),
            critical_kinds: default_critical_kinds(),
        }
    }
}

// ── Bridge settings ──────────────────────────────────────────────

/// Bridge-level settings stored in the config directory. Every field has a
/// serde default so partial files load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub reconcile: ReconcilePolicy,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub llm: LlmProviderConfig,
}

const SETTINGS_VERSION: u32 = 1;

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            dispatch: DispatchSettings::default(),
            reconcile: ReconcilePolicy::default(),
            agent: AgentSettings::default(),
            security: SecuritySettings::default(),
            llm: LlmProviderConfig::default(),
        }
    }
}

/// Load the API key from the separate credentials file.
pub fn load_api_key(config_dir: &Path) -> Option<String> {
    let path = crate::paths::credentials_path(config_dir);
    std::fs::read_to_string(path)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Save the API key to the separate credentials file (atomic write).
pub fn save_api_key(config_dir: &Path, key: &str) -> Result<(), ProjectError> {
    std::fs::create_dir_all(config_dir)?;
    let path = crate::paths::credentials_path(config_dir);
    if key.is_empty() {
        let _ = std::fs::remove_file(&path);
    } else {
        crate::project::atomic_write(&path, key.as_bytes())?;
    }
    Ok(())
}

/// Load settings from the config directory. Returns defaults when no file
/// exists; a corrupt file is reported rather than silently replaced.
pub fn load_settings(config_dir: &Path) -> Result<BridgeSettings, ProjectError> {
    let path = crate::paths::settings_path(config_dir);
    let mut settings = if path.exists() {
        read_json::<BridgeSettings>(&path)?
    } else {
        BridgeSettings::default()
    };
    if settings.llm.api_key.is_none() {
        settings.llm.api_key = load_api_key(config_dir);
    }
    Ok(settings)
}

pub fn save_settings(config_dir: &Path, settings: &BridgeSettings) -> Result<(), ProjectError> {
    std::fs::create_dir_all(config_dir)?;
    write_json(&crate::paths::settings_path(config_dir), settings)
}
