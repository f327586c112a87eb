//! DOSBox adapter.
//!
//! Each session gets its own `dosbox.conf` rendered from a template. COM1 is
//! a `nullmodem` in client mode pointed at the bridge's transport listener,
//! and `[autoexec]` mounts the doors, stages the drop-file and runs the door.

use super::transport::{DataSink, TcpTransport};
use super::{resolve_executable, spawn_emulator, EmulatorAdapter, HostOs, LaunchContext, LaunchedEmulator};
use crate::codepage::WireEncoding;
use crate::config::BridgeConfig;
use crate::door::DriveLayout;
use crate::error::BridgeError;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::info;

/// File name of the generated config inside the session directory.
pub const CONFIG_FILE: &str = "dosbox.conf";

/// Lighter vanilla DOSBox first; DOSBox-X as the fallback.
const CANDIDATES: &[&str] = &["dosbox", "dosbox-x"];

const DRIVES: DriveLayout = DriveLayout {
    doors: 'C',
    drops: 'D',
};

/// Built-in config template. `{port}` and `{autoexec}` are substituted.
pub const DEFAULT_TEMPLATE: &str = "\
[sdl]
fullscreen=false
autolock=false

[dosbox]
machine=svga_s3
memsize=16

[cpu]
core=auto
cputype=auto
cycles=max

[mixer]
nosound=true

[speaker]
pcspeaker=false

[serial]
serial1=nullmodem server:127.0.0.1 port:{port} transparent:1 rxdelay:0
serial2=disabled

[autoexec]
{autoexec}
";

/// Locate the DOSBox executable.
pub(crate) fn find_dosbox(config: &BridgeConfig) -> Result<PathBuf, BridgeError> {
    resolve_executable(config.dosbox_path.as_deref(), CANDIDATES)
}

/// DOSBox launched over a TCP nullmodem.
pub struct DosBoxAdapter {
    executable: PathBuf,
    headless: bool,
    os: HostOs,
    template: Option<String>,
    transport: Option<TcpTransport>,
    pending_sink: Option<DataSink>,
}

impl DosBoxAdapter {
    pub fn new(executable: PathBuf, headless: bool, os: HostOs, template: Option<String>) -> Self {
        Self {
            executable,
            headless,
            os,
            template,
            transport: None,
            pending_sink: None,
        }
    }
}

impl EmulatorAdapter for DosBoxAdapter {
    fn name(&self) -> &'static str {
        "dosbox"
    }

    fn wire_encoding(&self) -> WireEncoding {
        WireEncoding::Cp437
    }

    fn drive_layout(&self) -> DriveLayout {
        DRIVES
    }

    fn launch(
        &mut self,
        ctx: &LaunchContext<'_>,
        listener: TcpListener,
    ) -> Result<LaunchedEmulator, BridgeError> {
        let autoexec = build_autoexec(ctx);
        let template = self.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
        let config_path = ctx.session_path.join(CONFIG_FILE);
        std::fs::write(&config_path, render_config(template, ctx.port, &autoexec))?;

        let transport = TcpTransport::serve(listener, format!("dosbox:{}", ctx.session_id));
        if let Some(sink) = self.pending_sink.take() {
            transport.on_data(sink);
        }
        self.transport = Some(transport);

        let args = dosbox_args(&config_path, self.os, self.headless);
        let envs = dosbox_env(self.os, self.headless);
        let launched = match spawn_emulator(&self.executable, &args, &envs, ctx.session_path) {
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
            config = %config_path.display(),
            "DOSBox launched"
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

/// Build the `[autoexec]` block: mount the doors and the node's drop
/// directory, then run the door.
pub fn build_autoexec(ctx: &LaunchContext<'_>) -> String {
    let doors = DRIVES.doors.to_ascii_lowercase();
    let dropfile = ctx.dropfile.dos_path(ctx.door, DRIVES);

    let mut lines = vec![
        "@echo off".to_string(),
        format!("mount {} \"{}\"", doors, ctx.doors_root.display()),
    ];
    if ctx.dropfile.needs_drop_drive() {
        lines.push(format!(
            "mount {} \"{}\"",
            DRIVES.drops.to_ascii_lowercase(),
            ctx.dropfile.host_dir.display()
        ));
    }
    lines.push(format!("{}:", doors));
    lines.push(format!("cd \\{}", ctx.door.dos_dir_name()));
    lines.push(ctx.door.launch_command(ctx.node, &dropfile));
    lines.push("exit".to_string());
    lines.join("\n")
}

/// Substitute the transport port and autoexec block into a template.
pub fn render_config(template: &str, port: u16, autoexec: &str) -> String {
    template
        .replace("{port}", &port.to_string())
        .replace("{autoexec}", autoexec)
}

/// Command-line flags for DOSBox.
pub fn dosbox_args(config_path: &Path, os: HostOs, headless: bool) -> Vec<String> {
    let mut args = vec!["-conf".to_string(), config_path.display().to_string()];
    if headless {
        match os {
            HostOs::Windows => args.push("-nogui".to_string()),
            HostOs::Linux => args.push("-noconsole".to_string()),
            HostOs::Other => {}
        }
    }
    args.push("-exit".to_string());
    args
}

/// Extra environment for DOSBox.
pub fn dosbox_env(os: HostOs, headless: bool) -> Vec<(String, String)> {
    if headless && os != HostOs::Windows {
        vec![("SDL_VIDEODRIVER".to_string(), "dummy".to_string())]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::door::{resolve_dropfile, Door, DoorManifest};

    fn door(custom: Option<&str>) -> Door {
        Door {
            id: "lord".into(),
            directory: PathBuf::from("/srv/doors/lord"),
            manifest: DoorManifest {
                name: "LORD".into(),
                executable: "LORD.EXE".into(),
                launch_command: "LORD.EXE /N{node} /P{dropfile}".into(),
                dropfile_path: custom.map(str::to_string),
            },
        }
    }

    #[test]
    fn autoexec_points_door_at_node_drive() {
        let door = door(None);
        let placement = resolve_dropfile(&door, Path::new("/var/drops"), 2);
        let ctx = LaunchContext {
            session_id: "s1",
            node: 2,
            port: 10001,
            session_path: Path::new("/tmp/s1"),
            door: &door,
            doors_root: Path::new("/srv/doors"),
            dropfile: &placement,
        };
        let autoexec = build_autoexec(&ctx);
        let lines: Vec<&str> = autoexec.lines().collect();
        assert_eq!(
            lines,
            vec![
                "@echo off",
                "mount c \"/srv/doors\"",
                "mount d \"/var/drops/node2\"",
                "c:",
                "cd \\LORD",
                "LORD.EXE /N2 /PD:\\DOOR.SYS",
                "exit",
            ]
        );
    }

    #[test]
    fn autoexec_uses_custom_dropfile_in_place() {
        let door = door(Some("NODE{node}"));
        let placement = resolve_dropfile(&door, Path::new("/var/drops"), 5);
        let ctx = LaunchContext {
            session_id: "s1",
            node: 5,
            port: 10001,
            session_path: Path::new("/tmp/s1"),
            door: &door,
            doors_root: Path::new("/srv/doors"),
            dropfile: &placement,
        };
        let autoexec = build_autoexec(&ctx);
        assert!(!autoexec.contains("copy "));
        assert!(!autoexec.contains("mount d"));
        assert!(autoexec.contains("LORD.EXE /N5 /PC:\\LORD\\NODE5\\DOOR.SYS"));
    }

    #[test]
    fn config_substitutes_port_and_autoexec() {
        let rendered = render_config(DEFAULT_TEMPLATE, 10042, "@echo off\nexit");
        assert!(rendered.contains("serial1=nullmodem server:127.0.0.1 port:10042"));
        assert!(rendered.ends_with("[autoexec]\n@echo off\nexit\n"));
        assert!(!rendered.contains("{port}"));
    }

    #[test]
    fn headless_flags_per_platform() {
        let conf = Path::new("/tmp/s1/dosbox.conf");
        let linux = dosbox_args(conf, HostOs::Linux, true);
        assert!(linux.contains(&"-noconsole".to_string()));
        assert_eq!(
            dosbox_env(HostOs::Linux, true),
            vec![("SDL_VIDEODRIVER".to_string(), "dummy".to_string())]
        );

        let windows = dosbox_args(conf, HostOs::Windows, true);
        assert!(windows.contains(&"-nogui".to_string()));
        assert!(dosbox_env(HostOs::Windows, true).is_empty());

        let windowed = dosbox_args(conf, HostOs::Linux, false);
        assert_eq!(windowed, vec!["-conf", "/tmp/s1/dosbox.conf", "-exit"]);
        assert!(dosbox_env(HostOs::Linux, false).is_empty());
    }
}
