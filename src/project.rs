//! Scene document I/O and the atomic JSON write helpers shared with settings.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use serde::{Deserialize, Serialize};

use crate::scene::{SceneGraphSnapshot, ScriptLibrary};

/// Scene document format version.
const DOCUMENT_VERSION: u32 = 1;

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

impl Serialize for ProjectError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ── Document ────────────────────────────────────────────────────────

/// A saved project: the scene hierarchy plus its script library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDocument {
    pub version: u32,
    #[serde(default)]
    pub scene: SceneGraphSnapshot,
    #[serde(default)]
    pub scripts: ScriptLibrary,
}

impl SceneDocument {
    pub fn new(scene: SceneGraphSnapshot, scripts: ScriptLibrary) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            scene,
            scripts,
        }
    }

    /// Structural checks: every root exists and is parentless, and no parent
    /// chain loops. Dangling parent references load fine and are reported by
    /// the security gate.
    pub fn check(&self) -> Result<(), ProjectError> {
        if self.version > DOCUMENT_VERSION {
            return Err(ProjectError::InvalidDocument(format!(
                "unsupported document version {} (max {DOCUMENT_VERSION})",
                self.version
            )));
        }
        for root in &self.scene.root_ids {
            let node = self.scene.nodes.get(root).ok_or_else(|| {
                ProjectError::InvalidDocument(format!("root '{root}' has no node"))
            })?;
            if node.parent_id.is_some() {
                return Err(ProjectError::InvalidDocument(format!(
                    "root '{root}' has a parent"
                )));
            }
        }
        if let Some(id) = self.scene.find_parent_cycle() {
            return Err(ProjectError::InvalidDocument(format!(
                "entity '{id}' is its own ancestor"
            )));
        }
        Ok(())
    }
}

pub fn load_document(path: &Path) -> Result<SceneDocument, ProjectError> {
    let doc: SceneDocument = read_json(path)?;
    doc.check()?;
    Ok(doc)
}

pub fn save_document(path: &Path, doc: &SceneDocument) -> Result<(), ProjectError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_json(path, doc)
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Per-file mutex map to serialize concurrent writes to the same path.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Atomically write bytes to a file using write-to-temp-then-rename.
///
/// Writes to a `.tmp` sibling, fsyncs, moves any existing file to `.bak`
/// (best-effort), then renames the temp file into place. A per-file lock
/// keeps concurrent callers from racing on the `.tmp` file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ProjectError> {
    let lock = {
        let mut locks = FILE_LOCKS
            .lock()
            .map_err(|e| ProjectError::Io(std::io::Error::other(e.to_string())))?;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    };
    let _guard = lock
        .lock()
        .map_err(|e| ProjectError::Io(std::io::Error::other(e.to_string())))?;

    let file_name = path.file_name().unwrap_or_default();

    let mut tmp_name = OsString::from(file_name);
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(&tmp_name);

    let mut bak_name = OsString::from(file_name);
    bak_name.push(".bak");
    let bak_path = path.with_file_name(&bak_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if path.exists() {
        let _ = fs::rename(path, &bak_path);
    }

    fs::rename(&tmp_path, path)?;

    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ProjectError> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProjectError> {
    let data = fs::read_to_string(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::scene::SceneNode;

    fn sample() -> SceneDocument {
        let mut scene = SceneGraphSnapshot::default();
        scene.nodes.insert("e1".into(), SceneNode::new("Camera"));
        scene.root_ids.push("e1".into());
        let mut scripts = ScriptLibrary::new();
        scripts.insert("spin".into(), "entity.rotate(1)".into());
        SceneDocument::new(scene, scripts)
    }

    #[test]
    fn document_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs").join("scene.json");
        save_document(&path, &sample()).unwrap();
        let loaded = load_document(&path).unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn rejects_dangling_root() {
        let mut doc = sample();
        doc.scene.root_ids.push("ghost".into());
        assert!(matches!(doc.check(), Err(ProjectError::InvalidDocument(_))));
    }

    #[test]
    fn rejects_parent_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.json");
        let mut doc = sample();
        let mut a = SceneNode::new("A");
        a.parent_id = Some("b".into());
        let mut b = SceneNode::new("B");
        b.parent_id = Some("a".into());
        doc.scene.nodes.insert("a".into(), a);
        doc.scene.nodes.insert("b".into(), b);
        save_document(&path, &doc).unwrap();
        assert!(matches!(load_document(&path), Err(ProjectError::InvalidDocument(_))));
    }

    #[test]
    fn second_write_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert_eq!(fs::read_to_string(dir.path().join("scene.json.bak")).unwrap(), "one");
    }
}
