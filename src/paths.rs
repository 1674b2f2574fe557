//! Centralized path definitions for config files and log directories.
//!
//! Functions accept `&Path` so they work from the CLI and from embedding hosts.

use std::path::{Path, PathBuf};

/// Directory name under the platform config dir.
pub const APP_ID: &str = "scene-bridge";

// ── Leaf filenames ───────────────────────────────────────────────

pub const SETTINGS_FILE: &str = "bridge-settings.json";
pub const CREDENTIALS_FILE: &str = ".credentials";

// ── Directory names ──────────────────────────────────────────────

pub const AGENT_LOGS_DIR: &str = "agent-logs";

// ── Config-dir functions (take config_dir) ───────────────────────

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

pub fn credentials_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CREDENTIALS_FILE)
}

pub fn agent_logs_dir(config_dir: &Path) -> PathBuf {
    config_dir.join(AGENT_LOGS_DIR)
}
