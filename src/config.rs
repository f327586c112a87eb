//! Runtime configuration, read from CLI flags or the environment.

use crate::session::{DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
use clap::{ArgAction, Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Default WebSocket port for the bridge.
pub const DEFAULT_WS_PORT: u16 = 7681;

/// Which emulator to launch doors under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmulatorChoice {
    /// DOSEMU when available on Linux, DOSBox otherwise.
    Auto,
    Dosbox,
    Dosemu,
}

/// Configuration for the bridge server (`serve`).
#[derive(Args, Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket bind host
    #[arg(long, env = "DOOR_WS_HOST", default_value = "0.0.0.0")]
    pub ws_host: String,
    /// WebSocket bind port
    #[arg(long, env = "DOOR_WS_PORT", default_value_t = DEFAULT_WS_PORT)]
    pub ws_port: u16,
    /// First TCP port handed to emulator transports
    #[arg(long, env = "DOOR_TCP_PORT_BASE", default_value_t = DEFAULT_PORT_RANGE_START)]
    pub tcp_port_base: u16,
    /// Last TCP port (inclusive) handed to emulator transports
    #[arg(long, env = "DOOR_TCP_PORT_MAX", default_value_t = DEFAULT_PORT_RANGE_END)]
    pub tcp_port_max: u16,
    /// How long a disconnected session keeps running (0 tears down at once)
    #[arg(long, env = "DOOR_GRACE_MS", default_value_t = 30_000)]
    pub grace_ms: u64,
    /// How long a torn-down emulator gets to exit before it is killed
    #[arg(long, env = "DOOR_KILL_TIMEOUT_MS", default_value_t = 5_000)]
    pub kill_timeout_ms: u64,
    /// Keep drop-files and emulator configs after teardown (debugging)
    #[arg(long, env = "DOOR_KEEP_FILES")]
    pub keep_files: bool,
    /// Emulator selection
    #[arg(long, env = "DOOR_EMULATOR", value_enum, default_value_t = EmulatorChoice::Auto)]
    pub emulator: EmulatorChoice,
    /// DOSBox executable override
    #[arg(long, env = "DOOR_DOSBOX_PATH")]
    pub dosbox_path: Option<PathBuf>,
    /// DOSEMU executable override
    #[arg(long, env = "DOOR_DOSEMU_PATH")]
    pub dosemu_path: Option<PathBuf>,
    /// Run emulators without a window
    #[arg(long, env = "DOOR_HEADLESS", default_value_t = true, action = ArgAction::Set)]
    pub headless: bool,
    /// DOSBox config template with {port} and {autoexec} placeholders
    #[arg(long, env = "DOOR_DOSBOX_TEMPLATE")]
    pub dosbox_template: Option<PathBuf>,
    /// SQLite database holding session rows
    #[arg(long, env = "DOOR_DB_PATH", default_value = "door_sessions.db")]
    pub db_path: PathBuf,
    /// Root directory of installed doors
    #[arg(long, env = "DOOR_DOORS_DIR", default_value = "doors")]
    pub doors_dir: PathBuf,
    /// Root of the per-node drop-file directories
    #[arg(long, env = "DOOR_DROP_DIR", default_value = "nodes")]
    pub drop_dir: PathBuf,
    /// Root of per-session scratch directories (defaults to the temp dir)
    #[arg(long, env = "DOOR_SESSION_DIR")]
    pub session_dir: Option<PathBuf>,
    /// Sysop name written to drop-files
    #[arg(long, env = "DOOR_SYSOP_NAME", default_value = "Sysop")]
    pub sysop_name: String,
}

impl BridgeConfig {
    /// `host:port` the WebSocket endpoint binds to.
    pub fn ws_bind_addr(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Directory that holds one scratch directory per session.
    pub fn session_root(&self) -> PathBuf {
        self.session_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("door-bridge"))
    }

    /// Check values clap cannot check on its own.
    pub fn validate(&self) -> Result<(), String> {
        if self.tcp_port_base == 0 || self.tcp_port_max < self.tcp_port_base {
            return Err(format!(
                "invalid TCP port range {}..={}",
                self.tcp_port_base, self.tcp_port_max
            ));
        }
        if self.ws_port >= self.tcp_port_base && self.ws_port <= self.tcp_port_max {
            return Err(format!(
                "WebSocket port {} overlaps the transport port range",
                self.ws_port
            ));
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: DEFAULT_WS_PORT,
            tcp_port_base: DEFAULT_PORT_RANGE_START,
            tcp_port_max: DEFAULT_PORT_RANGE_END,
            grace_ms: 30_000,
            kill_timeout_ms: 5_000,
            keep_files: false,
            emulator: EmulatorChoice::Auto,
            dosbox_path: None,
            dosemu_path: None,
            headless: true,
            dosbox_template: None,
            db_path: PathBuf::from("door_sessions.db"),
            doors_dir: PathBuf::from("doors"),
            drop_dir: PathBuf::from("nodes"),
            session_dir: None,
            sysop_name: "Sysop".to_string(),
        }
    }
}

/// Configuration for the telnet-side door client (`door`).
#[derive(Args, Debug, Clone)]
pub struct DoorClientConfig {
    /// Bridge host to connect to
    #[arg(long, env = "DOOR_BRIDGE_HOST", default_value = "127.0.0.1")]
    pub bridge_host: String,
    /// Bridge WebSocket port
    #[arg(long, env = "DOOR_BRIDGE_PORT", default_value_t = DEFAULT_WS_PORT)]
    pub bridge_port: u16,
    /// Session token minted by the BBS for this caller
    #[arg(long, env = "DOOR_TOKEN")]
    pub token: String,
    /// Idle time after which a lone ESC keypress is forwarded
    #[arg(long, env = "DOOR_ESC_FLUSH_MS", default_value_t = 75)]
    pub esc_flush_ms: u64,
}

impl DoorClientConfig {
    pub fn esc_flush(&self) -> Duration {
        Duration::from_millis(self.esc_flush_ms)
    }
}
