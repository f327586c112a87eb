//! Door manifests and the drop-files written before a door is launched.

mod dropfile;
mod manifest;

pub use dropfile::{
    render_door_sys, write_door_sys, DropFileContext, UserProfile, DOOR_SYS, DOOR_SYS_LINES,
};
pub use manifest::{Door, DoorManifest, MANIFEST_FILE};

use std::path::{Path, PathBuf};

/// DOS drive letters an emulator mounts the host directories on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveLayout {
    /// Drive holding the doors root.
    pub doors: char,
    /// Drive holding the per-node drop-file directory.
    pub drops: char,
}

/// Where a session's drop-file lives on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropFilePlacement {
    /// Host directory holding DOOR.SYS.
    pub host_dir: PathBuf,
    /// Custom directory relative to the door (`/` separated) when the
    /// manifest declares one.
    pub door_relative: Option<String>,
}

impl DropFilePlacement {
    /// Full DOS path the door is told about via `{dropfile}`.
    ///
    /// The per-node default directory is mounted on its own drive, so the
    /// door reads DOOR.SYS there and nothing is written into the shared
    /// door directory.
    pub fn dos_path(&self, door: &Door, drives: DriveLayout) -> String {
        match &self.door_relative {
            Some(rel) => format!(
                "{}\\{}\\{}",
                door_dos_dir(door, drives),
                rel.replace('/', "\\").to_ascii_uppercase(),
                DOOR_SYS
            ),
            None => format!("{}:\\{}", drives.drops, DOOR_SYS),
        }
    }

    /// Whether the emulator must mount `host_dir` on the drops drive.
    pub fn needs_drop_drive(&self) -> bool {
        self.door_relative.is_none()
    }
}

/// DOS path of the door directory, e.g. `C:\LORD`.
pub fn door_dos_dir(door: &Door, drives: DriveLayout) -> String {
    format!("{}:\\{}", drives.doors, door.dos_dir_name())
}

/// Resolve where the drop-file for `node` goes: the manifest's custom
/// directory inside the door, or `<drop_root>/node<N>` otherwise.
pub fn resolve_dropfile(door: &Door, drop_root: &Path, node: u32) -> DropFilePlacement {
    match door.custom_dropfile_dir(node) {
        Some(custom) if !custom.is_empty() => DropFilePlacement {
            host_dir: custom
                .split('/')
                .fold(door.directory.clone(), |acc, part| acc.join(part)),
            door_relative: Some(custom),
        },
        _ => DropFilePlacement {
            host_dir: drop_root.join(format!("node{}", node)),
            door_relative: None,
        },
    }
}

/// Host path rendered for DOS tools that take `\` separators.
pub fn host_path_for_dos(path: &Path) -> String {
    path.display().to_string().replace('/', "\\")
}
