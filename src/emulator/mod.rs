//! Emulator adapters: launching a DOS emulator for one session and exposing
//! its serial line as a byte stream.
//!
//! # Architecture
//!
//! ```text
//!  SessionManager ── select_adapter() ──▶ Box<dyn EmulatorAdapter>
//!                                          ├─ DosBoxAdapter  (nullmodem, CP437)
//!                                          └─ DosEmuAdapter  ($_com1 tcp, UTF-8)
//!
//!  bridge listener 127.0.0.1:<port> ◀── emulator COM1 connects
//! ```
//!
//! The manager binds the transport listener before calling
//! [`EmulatorAdapter::launch`], so the emulator never dials a port nobody is
//! listening on.

mod dosbox;
mod dosemu;
mod transport;

pub use dosbox::DosBoxAdapter;
pub use dosemu::DosEmuAdapter;
pub use transport::{DataSink, TcpTransport};

use crate::codepage::WireEncoding;
use crate::config::{BridgeConfig, EmulatorChoice};
use crate::door::{Door, DriveLayout, DropFilePlacement};
use crate::error::BridgeError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::debug;

/// Everything an adapter needs to launch a door for one session.
#[derive(Debug)]
pub struct LaunchContext<'a> {
    pub session_id: &'a str,
    pub node: u32,
    /// Transport port the listener is bound to.
    pub port: u16,
    /// Scratch directory for generated configs and scripts.
    pub session_path: &'a Path,
    pub door: &'a Door,
    /// Host root that holds every door directory.
    pub doors_root: &'a Path,
    pub dropfile: &'a DropFilePlacement,
}

/// A spawned emulator process.
#[derive(Debug)]
pub struct LaunchedEmulator {
    pub child: Child,
    pub pid: u32,
}

/// Strategy interface over the supported emulators.
pub trait EmulatorAdapter: Send {
    /// Short adapter name for logs.
    fn name(&self) -> &'static str;

    /// Encoding of the bytes on the emulator's serial line.
    fn wire_encoding(&self) -> WireEncoding;

    /// Drive letters the adapter mounts the doors root and drop dir on.
    fn drive_layout(&self) -> DriveLayout;

    /// Write the emulator config, spawn the emulator and start serving its
    /// serial line on `listener`.
    fn launch(
        &mut self,
        ctx: &LaunchContext<'_>,
        listener: TcpListener,
    ) -> Result<LaunchedEmulator, BridgeError>;

    /// Register the callback for emulator output.
    fn on_data(&mut self, sink: DataSink);

    /// Send bytes to the emulator's serial line.
    fn write(&self, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Drop the serial line (carrier loss). Idempotent.
    fn close(&mut self);
}

/// Builds an adapter for a new session.
pub type AdapterFactory =
    Arc<dyn Fn(&BridgeConfig) -> Result<Box<dyn EmulatorAdapter>, BridgeError> + Send + Sync>;

/// Host platform, as far as emulator selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Windows,
    Linux,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            HostOs::Windows
        } else if cfg!(target_os = "linux") {
            HostOs::Linux
        } else {
            HostOs::Other
        }
    }
}

/// Emulator picked for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorKind {
    DosBox,
    DosEmu,
}

/// Pick an emulator. Windows always gets DOSBox; elsewhere DOSEMU wins when
/// it is installed, unless configuration forces one or the other.
pub fn choose_emulator(os: HostOs, choice: EmulatorChoice, dosemu_available: bool) -> EmulatorKind {
    if os == HostOs::Windows {
        return EmulatorKind::DosBox;
    }
    match choice {
        EmulatorChoice::Dosbox => EmulatorKind::DosBox,
        EmulatorChoice::Dosemu => EmulatorKind::DosEmu,
        EmulatorChoice::Auto if dosemu_available => EmulatorKind::DosEmu,
        EmulatorChoice::Auto => EmulatorKind::DosBox,
    }
}

/// Default factory: choose an emulator for this host and resolve its binary.
pub fn select_adapter(config: &BridgeConfig) -> Result<Box<dyn EmulatorAdapter>, BridgeError> {
    let os = HostOs::current();
    let dosemu = if os == HostOs::Windows {
        None
    } else {
        dosemu::find_dosemu(config).ok()
    };
    match choose_emulator(os, config.emulator, dosemu.is_some()) {
        EmulatorKind::DosEmu => {
            let executable = match dosemu {
                Some(path) => path,
                None => dosemu::find_dosemu(config)?,
            };
            Ok(Box::new(DosEmuAdapter::new(executable, config.headless)))
        }
        EmulatorKind::DosBox => {
            let executable = dosbox::find_dosbox(config)?;
            let template = match &config.dosbox_template {
                Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                    BridgeError::InvalidManifest(format!(
                        "DOSBox template {}: {}",
                        path.display(),
                        e
                    ))
                })?),
                None => None,
            };
            Ok(Box::new(DosBoxAdapter::new(
                executable,
                config.headless,
                os,
                template,
            )))
        }
    }
}

/// Resolve an executable: an explicit override (path or bare name) wins,
/// otherwise the first candidate found on PATH.
pub(crate) fn resolve_executable(
    override_path: Option<&Path>,
    candidates: &[&str],
) -> Result<PathBuf, BridgeError> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return which::which(path)
            .map_err(|_| BridgeError::ExecutableNotFound(path.display().to_string()));
    }
    candidates
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| BridgeError::ExecutableNotFound(candidates.join(" or ")))
}

/// Spawn an emulator process with no stdio attached.
///
/// The child is killed if its handle is dropped, so a lost handle cannot
/// leave an orphaned emulator behind.
pub(crate) fn spawn_emulator(
    program: &Path,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<LaunchedEmulator, BridgeError> {
    debug!(program = %program.display(), args = ?args, "Spawning emulator");
    let child = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BridgeError::SpawnFailed(format!("{}: {}", program.display(), e)))?;
    let pid = child
        .id()
        .ok_or_else(|| BridgeError::SpawnFailed("emulator exited during spawn".to_string()))?;
    Ok(LaunchedEmulator { child, pid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_always_gets_dosbox() {
        for choice in [EmulatorChoice::Auto, EmulatorChoice::Dosemu, EmulatorChoice::Dosbox] {
            assert_eq!(
                choose_emulator(HostOs::Windows, choice, true),
                EmulatorKind::DosBox
            );
        }
    }

    #[test]
    fn linux_prefers_dosemu_when_installed() {
        assert_eq!(
            choose_emulator(HostOs::Linux, EmulatorChoice::Auto, true),
            EmulatorKind::DosEmu
        );
        assert_eq!(
            choose_emulator(HostOs::Linux, EmulatorChoice::Auto, false),
            EmulatorKind::DosBox
        );
    }

    #[test]
    fn explicit_choice_wins_off_windows() {
        assert_eq!(
            choose_emulator(HostOs::Linux, EmulatorChoice::Dosbox, true),
            EmulatorKind::DosBox
        );
        assert_eq!(
            choose_emulator(HostOs::Other, EmulatorChoice::Dosemu, false),
            EmulatorKind::DosEmu
        );
    }

    #[test]
    fn missing_override_is_not_found() {
        let err = resolve_executable(
            Some(Path::new("/definitely/not/here/dosbox")),
            &["dosbox"],
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::ExecutableNotFound(_)));
    }

    #[test]
    fn missing_candidates_name_all_of_them() {
        let err = resolve_executable(None, &["no-such-emu-1", "no-such-emu-2"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Emulator executable not found: no-such-emu-1 or no-such-emu-2"
        );
    }

    #[cfg(unix)]
    #[test]
    fn override_file_is_used() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = tmp.path().join("dosbox");
        std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
        assert_eq!(resolve_executable(Some(&exe), &["dosbox"]).unwrap(), exe);
    }
}
