//! Test fixtures: a scratch door tree, an in-memory store and an adapter
//! that runs `sleep` in place of a DOS emulator.

use super::manager::SessionManager;
use super::store::SqliteSessionStore;
use super::types::SessionRow;
use crate::codepage::WireEncoding;
use crate::config::BridgeConfig;
use crate::door::DriveLayout;
use crate::emulator::{
    spawn_emulator, AdapterFactory, DataSink, EmulatorAdapter, LaunchContext, LaunchedEmulator,
    TcpTransport,
};
use crate::error::BridgeError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

static NEXT_PORT_BASE: AtomicU16 = AtomicU16::new(41000);

pub(crate) const LORD_MANIFEST: &str = r#"{
    "name": "Legend of the Red Dragon",
    "executable": "LORD.EXE",
    "launch_command": "LORD.EXE /N{node} /P{dropfile}"
}"#;

/// Stand-in emulator: serves the transport and spawns `sleep`.
pub(crate) struct FakeAdapter {
    sleep: &'static str,
    spawns: Arc<AtomicUsize>,
    transport: Option<TcpTransport>,
    pending_sink: Option<DataSink>,
}

impl EmulatorAdapter for FakeAdapter {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn wire_encoding(&self) -> WireEncoding {
        WireEncoding::Cp437
    }

    fn drive_layout(&self) -> DriveLayout {
        DriveLayout {
            doors: 'C',
            drops: 'D',
        }
    }

    fn launch(
        &mut self,
        ctx: &LaunchContext<'_>,
        listener: TcpListener,
    ) -> Result<LaunchedEmulator, BridgeError> {
        std::fs::write(ctx.session_path.join("fake.conf"), ctx.port.to_string())?;
        let transport = TcpTransport::serve(listener, "fake".to_string());
        if let Some(sink) = self.pending_sink.take() {
            transport.on_data(sink);
        }
        self.transport = Some(transport);
        self.spawns.fetch_add(1, Ordering::SeqCst);
        spawn_emulator(
            Path::new("sleep"),
            &[self.sleep.to_string()],
            &[],
            ctx.session_path,
        )
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

/// Poll `done` until it holds or about three seconds pass. Teardown
/// finishes on the blocking pool, so its effects land shortly after.
pub(crate) async fn eventually(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

pub(crate) struct Fixture {
    _tmp: TempDir,
    pub config: BridgeConfig,
    pub store: Arc<SqliteSessionStore>,
    pub spawns: Arc<AtomicUsize>,
    pub manager: Arc<SessionManager>,
}

pub(crate) struct FixtureOptions {
    pub grace_ms: u64,
    pub sleep: &'static str,
    pub ports: u16,
    pub fail_launch: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            grace_ms: 0,
            sleep: "30",
            ports: 4,
            fail_launch: false,
        }
    }
}

impl Fixture {
    pub fn new(options: FixtureOptions) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let lord = tmp.path().join("doors").join("lord");
        std::fs::create_dir_all(&lord).unwrap();
        std::fs::write(lord.join("LORD.EXE"), b"MZ").unwrap();
        std::fs::write(lord.join("door.json"), LORD_MANIFEST).unwrap();

        let base = NEXT_PORT_BASE.fetch_add(options.ports.max(1) + 1, Ordering::SeqCst);
        let config = BridgeConfig {
            tcp_port_base: base,
            tcp_port_max: base + options.ports.max(1) - 1,
            grace_ms: options.grace_ms,
            kill_timeout_ms: 200,
            doors_dir: tmp.path().join("doors"),
            drop_dir: tmp.path().join("nodes"),
            session_dir: Some(tmp.path().join("sessions")),
            ..BridgeConfig::default()
        };

        let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
        let spawns = Arc::new(AtomicUsize::new(0));
        let factory: AdapterFactory = if options.fail_launch {
            Arc::new(|_: &BridgeConfig| -> Result<Box<dyn EmulatorAdapter>, BridgeError> {
                Err(BridgeError::ExecutableNotFound("dosbox or dosbox-x".to_string()))
            })
        } else {
            let sleep = options.sleep;
            let counter = spawns.clone();
            Arc::new(
                move |_: &BridgeConfig| -> Result<Box<dyn EmulatorAdapter>, BridgeError> {
                    Ok(Box::new(FakeAdapter {
                        sleep,
                        spawns: counter.clone(),
                        transport: None,
                        pending_sink: None,
                    }))
                },
            )
        };
        let manager =
            SessionManager::with_adapter_factory(config.clone(), store.clone(), factory);

        Self {
            _tmp: tmp,
            config,
            store,
            spawns,
            manager,
        }
    }

    /// Insert a claimable row for `token` on `node`.
    pub fn add_row(&self, session_id: &str, token: &str, node: u32) -> SessionRow {
        let row = SessionRow {
            session_id: session_id.to_string(),
            user_id: 42,
            door_id: "lord".to_string(),
            node_number: node,
            ws_token: token.to_string(),
            session_path: None,
            user_data: Some(
                r#"{"real_name":"Seth Able","location":"Lewisville, TX","security_level":110}"#
                    .to_string(),
            ),
            tcp_port: None,
            emulator_pid: None,
            created_at: "2026-10-16 21:05:00".to_string(),
            ended_at: None,
        };
        self.store.insert(&row).unwrap();
        row
    }

    pub fn dropfile(&self, node: u32) -> PathBuf {
        self.config
            .drop_dir
            .join(format!("node{}", node))
            .join("DOOR.SYS")
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.config.session_root().join(session_id)
    }
}
