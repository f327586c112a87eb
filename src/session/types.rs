//! Session, session row and client binding types.

use super::timer::DelayedTask;
use crate::emulator::EmulatorAdapter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Emulator is being prepared and spawned.
    Launching,
    /// Emulator running with a client attached.
    Active,
    /// Client gone, emulator still running until the grace timer fires.
    DisconnectedGrace,
    /// Torn down; never seen in the live map.
    TornDown,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Launching => write!(f, "launching"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::DisconnectedGrace => write!(f, "disconnected_grace"),
            SessionStatus::TornDown => write!(f, "torn_down"),
        }
    }
}

/// A `door_sessions` row as created by the BBS API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: i64,
    pub door_id: String,
    pub node_number: u32,
    pub ws_token: String,
    pub session_path: Option<String>,
    /// JSON user profile used for the drop-file.
    pub user_data: Option<String>,
    pub tcp_port: Option<u16>,
    pub emulator_pid: Option<u32>,
    pub created_at: String,
    pub ended_at: Option<String>,
}

/// Public snapshot of a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: i64,
    pub door_id: String,
    pub node_number: u32,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    pub started_at: DateTime<Utc>,
    pub client_attached: bool,
}

/// Frame queued for a WebSocket client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Vec<u8>),
    Close(u16, String),
}

/// Input received from a WebSocket client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    Text(String),
    Binary(Vec<u8>),
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one connected client. The socket task owns the receiving end.
#[derive(Debug, Clone)]
pub struct ClientLink {
    id: u64,
    tx: mpsc::UnboundedSender<ClientFrame>,
}

impl ClientLink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame. Returns `false` once the socket task is gone.
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(ClientFrame::Close(code, reason.to_string()));
    }
}

/// On-disk artifacts owned by a session.
#[derive(Debug, Default, Clone)]
pub(crate) struct SessionFiles {
    /// Scratch directory holding emulator configs and scripts.
    pub session_path: Option<PathBuf>,
    /// DOOR.SYS written for this session.
    pub dropfile: Option<PathBuf>,
}

impl SessionFiles {
    pub fn is_empty(&self) -> bool {
        self.session_path.is_none() && self.dropfile.is_none()
    }
}

/// Emulator side of a session.
#[derive(Default)]
pub(crate) struct TransportState {
    pub adapter: Option<Box<dyn EmulatorAdapter>>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    /// Tells the exit watcher to force-kill the emulator.
    pub kill_tx: Option<oneshot::Sender<()>>,
}

/// The client currently attached, if any.
#[derive(Default)]
pub(crate) struct ClientBinding {
    link: Option<ClientLink>,
}

impl ClientBinding {
    /// Attach `link`, returning the link it supersedes.
    pub fn bind(&mut self, link: ClientLink) -> Option<ClientLink> {
        self.link.replace(link)
    }

    pub fn unbind(&mut self) -> Option<ClientLink> {
        self.link.take()
    }

    pub fn is_bound_to(&self, link_id: u64) -> bool {
        self.link.as_ref().is_some_and(|l| l.id == link_id)
    }

    pub fn link(&self) -> Option<&ClientLink> {
        self.link.as_ref()
    }
}

#[derive(Default)]
pub(crate) struct SessionTimers {
    pub grace: Option<DelayedTask>,
    pub kill: Option<DelayedTask>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ByteCounters {
    pub to_client: u64,
    pub to_emulator: u64,
}

/// A live session, owned by the session manager.
pub(crate) struct Session {
    pub session_id: String,
    pub user_id: i64,
    pub door_id: String,
    pub node_number: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub transport: TransportState,
    pub client: ClientBinding,
    pub files: SessionFiles,
    pub timers: SessionTimers,
    pub counters: ByteCounters,
    pub removing: bool,
}

impl Session {
    pub fn new(row: &SessionRow, link: ClientLink) -> Self {
        let mut client = ClientBinding::default();
        client.bind(link);
        Self {
            session_id: row.session_id.clone(),
            user_id: row.user_id,
            door_id: row.door_id.clone(),
            node_number: row.node_number,
            status: SessionStatus::Launching,
            started_at: Utc::now(),
            transport: TransportState::default(),
            client,
            files: SessionFiles::default(),
            timers: SessionTimers::default(),
            counters: ByteCounters::default(),
            removing: false,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            user_id: self.user_id,
            door_id: self.door_id.clone(),
            node_number: self.node_number,
            status: self.status,
            port: self.transport.port,
            pid: self.transport.pid,
            adapter: self.transport.adapter.as_ref().map(|a| a.name().to_string()),
            started_at: self.started_at,
            client_attached: self.client.link().is_some(),
        }
    }
}
