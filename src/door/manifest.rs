//! Door manifests: how a door is launched and where it wants its drop-file.
//!
//! Each door lives in `<doors_dir>/<door_id>/` next to a `door.json`:
//!
//! ```json
//! {
//!   "name": "Legend of the Red Dragon",
//!   "executable": "LORD.EXE",
//!   "launch_command": "LORD.EXE /N{node} /P{dropfile}",
//!   "dropfile_path": "NODE{node}"
//! }
//! ```

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// File name of the manifest inside a door directory.
pub const MANIFEST_FILE: &str = "door.json";

/// Placeholder replaced with the node number.
const NODE_PLACEHOLDER: &str = "{node}";
/// Placeholder replaced with the DOS path of the drop-file.
const DROPFILE_PLACEHOLDER: &str = "{dropfile}";

/// On-disk door manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorManifest {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Executable, relative to the door directory.
    pub executable: String,
    /// DOS command line with `{node}` and `{dropfile}` placeholders.
    pub launch_command: String,
    /// Directory (relative to the door directory) the door reads its
    /// drop-file from. `{node}` is allowed. When absent the per-node default
    /// directory is used, mounted on its own drive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropfile_path: Option<String>,
}

/// A door resolved on disk.
#[derive(Debug, Clone)]
pub struct Door {
    /// Door id, also the directory name.
    pub id: String,
    /// Host directory of the door.
    pub directory: PathBuf,
    pub manifest: DoorManifest,
}

impl Door {
    /// Load and validate the manifest for `door_id`.
    pub fn load(doors_dir: &Path, door_id: &str) -> Result<Self, BridgeError> {
        validate_door_id(door_id)?;
        let directory = doors_dir.join(door_id);
        let manifest_path = directory.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
            BridgeError::InvalidManifest(format!("{}: {}", manifest_path.display(), e))
        })?;
        let manifest: DoorManifest = serde_json::from_str(&raw).map_err(|e| {
            BridgeError::InvalidManifest(format!("{}: {}", manifest_path.display(), e))
        })?;

        if manifest.launch_command.trim().is_empty() {
            return Err(BridgeError::InvalidManifest(format!(
                "{}: empty launch_command",
                door_id
            )));
        }
        ensure_relative(&manifest.executable, door_id)?;
        if let Some(custom) = manifest.dropfile_path.as_deref() {
            ensure_relative(custom, door_id)?;
        }
        if !directory.join(&manifest.executable).is_file() {
            return Err(BridgeError::InvalidManifest(format!(
                "{}: executable {} not found",
                door_id, manifest.executable
            )));
        }

        Ok(Self {
            id: door_id.to_string(),
            directory,
            manifest,
        })
    }

    /// Directory name of the door as DOS sees it (upper case).
    pub fn dos_dir_name(&self) -> String {
        self.id.to_ascii_uppercase()
    }

    /// Launch command with placeholders substituted.
    pub fn launch_command(&self, node: u32, dropfile: &str) -> String {
        self.manifest
            .launch_command
            .replace(NODE_PLACEHOLDER, &node.to_string())
            .replace(DROPFILE_PLACEHOLDER, dropfile)
    }

    /// Custom drop-file directory for `node`, relative to the door directory,
    /// with `/` separators. `None` when the manifest does not declare one.
    pub fn custom_dropfile_dir(&self, node: u32) -> Option<String> {
        self.manifest.dropfile_path.as_deref().map(|p| {
            p.replace(NODE_PLACEHOLDER, &node.to_string())
                .replace('\\', "/")
                .trim_matches('/')
                .to_string()
        })
    }
}

fn validate_door_id(door_id: &str) -> Result<(), BridgeError> {
    let valid = !door_id.is_empty()
        && door_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidManifest(format!(
            "invalid door id: {:?}",
            door_id
        )))
    }
}

/// Reject absolute paths and `..` so a manifest cannot point outside its door.
fn ensure_relative(path: &str, door_id: &str) -> Result<(), BridgeError> {
    let normalized = path.replace('\\', "/");
    let p = Path::new(&normalized);
    let escapes = p.is_absolute()
        || normalized.contains(':')
        || p.components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
    if escapes {
        return Err(BridgeError::InvalidManifest(format!(
            "{}: path escapes door directory: {}",
            door_id, path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_door(root: &Path, id: &str, manifest: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        std::fs::write(dir.join("LORD.EXE"), b"MZ").unwrap();
    }

    #[test]
    fn loads_manifest_and_substitutes() {
        let tmp = tempfile::tempdir().unwrap();
        write_door(
            tmp.path(),
            "lord",
            r#"{"name":"LORD","executable":"LORD.EXE","launch_command":"LORD.EXE /N{node} /P{dropfile}"}"#,
        );
        let door = Door::load(tmp.path(), "lord").unwrap();
        assert_eq!(door.dos_dir_name(), "LORD");
        assert_eq!(
            door.launch_command(3, "C:\\LORD\\DOOR.SYS"),
            "LORD.EXE /N3 /PC:\\LORD\\DOOR.SYS"
        );
        assert_eq!(door.custom_dropfile_dir(3), None);
    }

    #[test]
    fn custom_dropfile_dir_expands_node() {
        let tmp = tempfile::tempdir().unwrap();
        write_door(
            tmp.path(),
            "lord",
            r#"{"executable":"LORD.EXE","launch_command":"START.BAT {node}","dropfile_path":"NODES\\NODE{node}\\"}"#,
        );
        let door = Door::load(tmp.path(), "lord").unwrap();
        assert_eq!(door.custom_dropfile_dir(2).as_deref(), Some("NODES/NODE2"));
    }

    #[test]
    fn rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        write_door(
            tmp.path(),
            "lord",
            r#"{"executable":"LORD.EXE","launch_command":"LORD.EXE","dropfile_path":"../../etc"}"#,
        );
        assert!(matches!(
            Door::load(tmp.path(), "lord"),
            Err(BridgeError::InvalidManifest(_))
        ));
        assert!(Door::load(tmp.path(), "../lord").is_err());
    }

    #[test]
    fn missing_executable_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_door(
            tmp.path(),
            "bre",
            r#"{"executable":"BRE.EXE","launch_command":"BRE.EXE"}"#,
        );
        let err = Door::load(tmp.path(), "bre").unwrap_err();
        assert!(err.to_string().contains("BRE.EXE"));
    }
}
