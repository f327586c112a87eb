//! DOSEMU adapter.
//!
//! DOSEMU boots its own C: drive, so the doors root and drop-file directory
//! are redirected onto E: and F: with `LREDIR` from a generated batch file.
//! COM1 is wired to the bridge's transport listener with the `$_com1` TCP
//! directive, and the external character set is UTF-8, so output arrives
//! host-native and is passed through untranslated.

use super::transport::{DataSink, TcpTransport};
use super::{resolve_executable, spawn_emulator, EmulatorAdapter, LaunchContext, LaunchedEmulator};
use crate::codepage::WireEncoding;
use crate::config::BridgeConfig;
use crate::door::{host_path_for_dos, DriveLayout};
use crate::error::BridgeError;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::info;

/// Generated rc file inside the session directory.
pub const RC_FILE: &str = "dosemu.rc";
/// Generated batch file inside the session directory.
pub const BATCH_FILE: &str = "LAUNCH.BAT";

const CANDIDATES: &[&str] = &["dosemu", "dosemu2"];

const DRIVES: DriveLayout = DriveLayout {
    doors: 'E',
    drops: 'F',
};

/// Locate the DOSEMU executable.
pub(crate) fn find_dosemu(config: &BridgeConfig) -> Result<PathBuf, BridgeError> {
    resolve_executable(config.dosemu_path.as_deref(), CANDIDATES)
}

/// DOSEMU launched with a TCP-backed COM1.
pub struct DosEmuAdapter {
    executable: PathBuf,
    headless: bool,
    transport: Option<TcpTransport>,
    pending_sink: Option<DataSink>,
}

impl DosEmuAdapter {
    pub fn new(executable: PathBuf, headless: bool) -> Self {
        Self {
            executable,
            headless,
            transport: None,
            pending_sink: None,
        }
    }
}

impl EmulatorAdapter for DosEmuAdapter {
    fn name(&self) -> &'static str {
        "dosemu"
    }

    fn wire_encoding(&self) -> WireEncoding {
        WireEncoding::Native
    }

    fn drive_layout(&self) -> DriveLayout {
        DRIVES
    }

    fn launch(
        &mut self,
        ctx: &LaunchContext<'_>,
        listener: TcpListener,
    ) -> Result<LaunchedEmulator, BridgeError> {
        let rc_path = ctx.session_path.join(RC_FILE);
        std::fs::write(&rc_path, render_rc(ctx.port))?;
        std::fs::write(ctx.session_path.join(BATCH_FILE), build_batch(ctx))?;

        let transport = TcpTransport::serve(listener, format!("dosemu:{}", ctx.session_id));
        if let Some(sink) = self.pending_sink.take() {
            transport.on_data(sink);
        }
        self.transport = Some(transport);

        let args = dosemu_args(&rc_path, ctx.session_path, self.headless);
        let launched = match spawn_emulator(&self.executable, &args, &[], ctx.session_path) {
            Ok(launched) => launched,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };
        info!(
            session_id = %ctx.session_id,
            pid = launched.pid,
            port = ctx.port,
            "DOSEMU launched"
        );
        Ok(launched)
    }

    fn on_data(&mut self, sink: DataSink) {
        match &self.transport {
            Some(transport) => transport.on_data(sink),
            None => self.pending_sink = Some(sink),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        self.transport
            .as_ref()
            .ok_or(BridgeError::TransportClosed)?
            .write(bytes)
    }

    fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }
}

/// DOSEMU rc file for one session.
pub fn render_rc(port: u16) -> String {
    format!(
        "$_cpu_vm = \"emulated\"\n\
         $_cpu_vm_dpmi = \"emulated\"\n\
         $_sound = (off)\n\
         $_speaker = \"\"\n\
         $_lpt1 = \"\"\n\
         $_layout = \"us\"\n\
         $_external_char_set = \"utf8\"\n\
         $_internal_char_set = \"cp437\"\n\
         $_com1 = \"tcp:127.0.0.1:{port}\"\n"
    )
}

/// DOS batch file: redirect host directories, run the door, leave the
/// emulator. CRLF line endings for DOS.
pub fn build_batch(ctx: &LaunchContext<'_>) -> String {
    let dropfile = ctx.dropfile.dos_path(ctx.door, DRIVES);

    let mut lines = vec![
        "@ECHO OFF".to_string(),
        format!(
            "LREDIR {}: LINUX\\FS{}",
            DRIVES.doors,
            host_path_for_dos(ctx.doors_root)
        ),
    ];
    if ctx.dropfile.needs_drop_drive() {
        lines.push(format!(
            "LREDIR {}: LINUX\\FS{}",
            DRIVES.drops,
            host_path_for_dos(&ctx.dropfile.host_dir)
        ));
    }
    lines.push(format!("{}:", DRIVES.doors));
    lines.push(format!("CD \\{}", ctx.door.dos_dir_name()));
    lines.push(ctx.door.launch_command(ctx.node, &dropfile));
    lines.push("EXITEMU".to_string());

    let mut batch = lines.join("\r\n");
    batch.push_str("\r\n");
    batch
}

/// Command-line flags for DOSEMU: private rc file, run the batch file from
/// the session directory on boot.
pub fn dosemu_args(rc_path: &Path, session_path: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        "-n".to_string(),
        "-f".to_string(),
        rc_path.display().to_string(),
    ];
    if headless {
        args.push("-dumb".to_string());
    }
    args.push("-K".to_string());
    args.push(session_path.display().to_string());
    args.push("-E".to_string());
    args.push(BATCH_FILE.to_string());
    args
}
