//! Session manager: claims session tokens, launches an emulator per session,
//! relays bytes between the client and the emulator, and tears sessions down.
//!
//! All live sessions sit in one map keyed by `ws_token`. The map lock is a
//! plain `std::sync::Mutex`: it is never held across an await, and every
//! decision that must be atomic (claim, rebind, begin teardown) happens in a
//! single critical section.

use super::port_allocator::PortPool;
use super::store::SessionStore;
use super::timer::DelayedTask;
use super::types::{
    ByteCounters, ClientFrame, ClientInput, ClientLink, Session, SessionFiles, SessionInfo,
    SessionRow, SessionStatus,
};
use crate::codepage::{StreamDecoder, WireEncoding};
use crate::config::BridgeConfig;
use crate::door::{
    door_dos_dir, resolve_dropfile, write_door_sys, Door, DriveLayout, DropFileContext,
    DropFilePlacement, UserProfile,
};
use crate::emulator::{select_adapter, AdapterFactory, DataSink, LaunchContext};
use crate::error::{BridgeError, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use bytes::Bytes;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Extra time `shutdown_all` waits on top of the kill timeout.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);
/// Ports tried per launch when the serial listener cannot bind.
const MAX_BIND_ATTEMPTS: usize = 8;

/// Point-in-time counts for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub live: usize,
    pub launching: usize,
    pub active: usize,
    pub grace: usize,
    pub ports_available: usize,
}

/// Owner of every live door session.
pub struct SessionManager {
    config: BridgeConfig,
    store: Arc<dyn SessionStore>,
    ports: PortPool,
    /// Live sessions keyed by `ws_token`.
    sessions: Mutex<HashMap<String, Session>>,
    adapter_factory: AdapterFactory,
    /// Exit watchers and blocking cleanup work.
    watchers: TaskTracker,
    this: Weak<SessionManager>,
}

impl SessionManager {
    /// Create a manager that picks a real emulator for each session.
    pub fn new(config: BridgeConfig, store: Arc<dyn SessionStore>) -> Arc<Self> {
        Self::with_adapter_factory(config, store, Arc::new(select_adapter))
    }

    pub fn with_adapter_factory(
        config: BridgeConfig,
        store: Arc<dyn SessionStore>,
        adapter_factory: AdapterFactory,
    ) -> Arc<Self> {
        let ports = PortPool::new(config.tcp_port_base, config.tcp_port_max);
        Arc::new_cyclic(|this| Self {
            config,
            store,
            ports,
            sessions: Mutex::new(HashMap::new()),
            adapter_factory,
            watchers: TaskTracker::new(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up the claimable row for `token`. `None` means the caller must
    /// close the connection with a policy violation.
    pub fn find_session_by_token(&self, token: &str) -> Result<Option<SessionRow>, BridgeError> {
        if token.is_empty() {
            return Ok(None);
        }
        self.store.find_active_by_token(token)
    }

    /// [`Self::find_session_by_token`] on the blocking pool.
    pub async fn lookup_token(&self, token: String) -> Result<Option<SessionRow>, BridgeError> {
        if token.is_empty() {
            return Ok(None);
        }
        let store = self.store.clone();
        run_blocking(move || store.find_active_by_token(&token)).await
    }

    /// Attach a client to the session for `row`.
    ///
    /// A live session for the token is reused: the new client replaces the
    /// old one, which is closed normally, and any grace timer is cancelled.
    /// Otherwise a session is claimed and its emulator launched. On error
    /// the client has already been sent a close frame.
    pub async fn handle_connection(
        &self,
        row: SessionRow,
        link: ClientLink,
    ) -> Result<(), BridgeError> {
        let token = row.ws_token.clone();
        let attached = {
            let mut sessions = self.sessions();
            match sessions.get_mut(&token) {
                Some(session) if session.removing => {
                    link.close(CLOSE_POLICY_VIOLATION, "Session is ending");
                    return Err(BridgeError::SessionNotFound(row.session_id.clone()));
                }
                Some(session) => {
                    if let Some(grace) = session.timers.grace.take() {
                        grace.cancel();
                    }
                    if session.status == SessionStatus::DisconnectedGrace {
                        session.status = SessionStatus::Active;
                    }
                    info!(
                        session_id = %session.session_id,
                        pid = ?session.transport.pid,
                        status = %session.status,
                        "Client reattached to running session"
                    );
                    Some(session.client.bind(link))
                }
                None => {
                    info!(
                        session_id = %row.session_id,
                        door_id = %row.door_id,
                        node = row.node_number,
                        "Claiming session"
                    );
                    sessions.insert(token.clone(), Session::new(&row, link));
                    None
                }
            }
        };

        match attached {
            Some(superseded) => {
                if let Some(previous) = superseded {
                    previous.close(CLOSE_NORMAL, "Session resumed from another connection");
                }
                Ok(())
            }
            None => self.launch_emulator(&row).await,
        }
    }

    /// Launch the emulator for a freshly claimed session. On failure the
    /// session is dropped and its client closed with the error's close code;
    /// the row is left for the web API to deal with.
    async fn launch_emulator(&self, row: &SessionRow) -> Result<(), BridgeError> {
        let err = match self.try_launch(row).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        error!(
            session_id = %row.session_id,
            door_id = %row.door_id,
            error = %err,
            "Emulator launch failed"
        );
        let removed = {
            let mut sessions = self.sessions();
            let owned = matches!(
                sessions.get(&row.ws_token),
                Some(s) if s.session_id == row.session_id && !s.removing
            );
            if owned {
                sessions.remove(&row.ws_token)
            } else {
                None
            }
        };
        if let Some(mut session) = removed {
            if let Some(grace) = session.timers.grace.take() {
                grace.cancel();
            }
            if let Some(link) = session.client.unbind() {
                link.close(err.close_code(), &err.to_string());
            }
        }
        Err(err)
    }

    async fn try_launch(&self, row: &SessionRow) -> Result<(), BridgeError> {
        let mut adapter = (self.adapter_factory)(&self.config)?;
        let mut pending = PendingLaunch::new(self);

        let config = self.config.clone();
        let launch_row = row.clone();
        let drives = adapter.drive_layout();
        let (files, prepared) = run_blocking(move || {
            let mut files = SessionFiles::default();
            let prepared = prepare_files(&config, &launch_row, drives, &mut files);
            Ok((files, prepared))
        })
        .await?;
        pending.files = files;
        let PreparedFiles {
            session_path,
            doors_root,
            door,
            placement,
        } = prepared?;

        let store = self.store.clone();
        let session_id = row.session_id.clone();
        let path = session_path.clone();
        run_blocking(move || store.update_session_path(&session_id, &path)).await?;

        let (port, listener) = self.bind_transport(&row.session_id).await?;
        pending.port = Some(port);

        let encoding = adapter.wire_encoding();
        adapter.on_data(self.emulator_sink(row, encoding));
        let ctx = LaunchContext {
            session_id: &row.session_id,
            node: row.node_number,
            port,
            session_path: &session_path,
            door: &door,
            doors_root: &doors_root,
            dropfile: &placement,
        };
        let launched = adapter.launch(&ctx, listener)?;
        let pid = launched.pid;

        let store = self.store.clone();
        let session_id = row.session_id.clone();
        if let Err(e) = run_blocking(move || store.update_transport(&session_id, port, pid)).await {
            adapter.close();
            return Err(e);
        }

        let adapter_name = adapter.name();
        let (kill_tx, kill_rx) = oneshot::channel();
        let mut adapter = Some(adapter);
        let committed = {
            let mut sessions = self.sessions();
            match sessions.get_mut(&row.ws_token) {
                Some(session) if session.session_id == row.session_id && !session.removing => {
                    session.status = if session.client.link().is_some() {
                        SessionStatus::Active
                    } else {
                        SessionStatus::DisconnectedGrace
                    };
                    session.transport.adapter = adapter.take();
                    session.transport.port = Some(port);
                    session.transport.pid = Some(pid);
                    session.transport.kill_tx = Some(kill_tx);
                    session.files = pending.commit();
                    true
                }
                _ => false,
            }
        };

        if !committed {
            // Torn down while launching; everything launched here is ours.
            info!(session_id = %row.session_id, "Session ended during launch");
            if let Some(mut adapter) = adapter {
                adapter.close();
            }
            let mut child = launched.child;
            let _ = child.start_kill();
            self.watchers.spawn(async move {
                let _ = child.wait().await;
            });
            return Ok(());
        }

        self.watchers.spawn(watch_emulator(
            self.this.clone(),
            row.ws_token.clone(),
            row.session_id.clone(),
            launched.child,
            kill_rx,
        ));
        info!(
            session_id = %row.session_id,
            adapter = adapter_name,
            port = port,
            pid = pid,
            "Session active"
        );
        Ok(())
    }

    /// Allocate a port and bind the emulator's serial listener on it.
    ///
    /// A port held by another process stays out of the pool while the next
    /// one is tried, so a single squatter cannot block every launch.
    async fn bind_transport(&self, session_id: &str) -> Result<(u16, TcpListener), BridgeError> {
        let mut squatted = Vec::new();
        let mut last_err = None;
        let bound = loop {
            if squatted.len() >= MAX_BIND_ATTEMPTS {
                break Err(last_err.take().unwrap_or(BridgeError::PortsExhausted));
            }
            let port = match self.ports.allocate() {
                Ok(port) => port,
                Err(e) => break Err(last_err.take().unwrap_or(e)),
            };
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => break Ok((port, listener)),
                Err(e) => {
                    warn!(session_id = %session_id, port, error = %e, "Serial port busy; trying the next one");
                    squatted.push(port);
                    last_err = Some(BridgeError::BindFailed {
                        port,
                        reason: e.to_string(),
                    });
                }
            }
        };
        for port in squatted {
            self.ports.release(port);
        }
        bound
    }

    /// Callback for emulator output: decode and forward to the bound client.
    fn emulator_sink(&self, row: &SessionRow, encoding: WireEncoding) -> DataSink {
        let manager = self.this.clone();
        let token = row.ws_token.clone();
        let session_id = row.session_id.clone();
        let decoder = Mutex::new(StreamDecoder::new(encoding));
        Arc::new(move |bytes: Bytes| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let text = decoder
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(&bytes);
            manager.relay_to_client(&token, &session_id, bytes.len(), text);
        })
    }

    fn relay_to_client(&self, token: &str, session_id: &str, raw_len: usize, text: String) {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(token) else {
            return;
        };
        if session.session_id != session_id || session.removing {
            return;
        }
        session.counters.to_client += raw_len as u64;
        match session.client.link() {
            Some(link) => {
                if !text.is_empty() {
                    link.send(ClientFrame::Text(text));
                }
            }
            None => debug!(
                session_id = %session_id,
                bytes = raw_len,
                "Dropping emulator output while no client is attached"
            ),
        }
    }

    /// Forward client input to the emulator. Text is encoded for the
    /// emulator's serial line; binary frames are written as-is.
    pub fn client_input(&self, token: &str, link_id: u64, input: ClientInput) {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(token) else {
            return;
        };
        if session.removing || !session.client.is_bound_to(link_id) {
            return;
        }
        let Some(adapter) = session.transport.adapter.as_ref() else {
            debug!(session_id = %session.session_id, "Dropping input before the emulator is up");
            return;
        };
        let bytes = match input {
            ClientInput::Text(text) => adapter.wire_encoding().encode(&text),
            ClientInput::Binary(bytes) => bytes,
        };
        match adapter.write(&bytes) {
            Ok(()) => session.counters.to_emulator += bytes.len() as u64,
            Err(e) => debug!(session_id = %session.session_id, error = %e, "Emulator write failed"),
        }
    }

    /// A client socket closed. Ignored if that client was already replaced.
    pub fn client_disconnected(&self, token: &str, link_id: u64) {
        let grace = self.config.grace();
        let teardown = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(token) else {
                return;
            };
            if session.removing || !session.client.is_bound_to(link_id) {
                return;
            }
            session.client.unbind();
            if grace.is_zero() {
                true
            } else {
                if session.status == SessionStatus::Active {
                    session.status = SessionStatus::DisconnectedGrace;
                }
                let manager = self.this.clone();
                let timer_token = token.to_string();
                let session_id = session.session_id.clone();
                let timer = DelayedTask::spawn(grace, async move {
                    if let Some(manager) = manager.upgrade() {
                        manager.grace_expired(&timer_token, &session_id);
                    }
                });
                if let Some(previous) = session.timers.grace.replace(timer) {
                    previous.cancel();
                }
                info!(
                    session_id = %session.session_id,
                    grace_ms = grace.as_millis() as u64,
                    "Client disconnected; holding session for reconnect"
                );
                false
            }
        };
        if teardown {
            self.remove_session(token, "Client disconnected");
        }
    }

    fn grace_expired(&self, token: &str, session_id: &str) {
        let expired = {
            let mut sessions = self.sessions();
            match sessions.get_mut(token) {
                Some(s)
                    if s.session_id == session_id
                        && !s.removing
                        && s.client.link().is_none() =>
                {
                    // This task is the timer; drop the handle rather than abort it.
                    s.timers.grace.take();
                    true
                }
                _ => false,
            }
        };
        if expired {
            info!(session_id = %session_id, "Grace period expired");
            self.remove_session(token, "Grace period expired");
        }
    }

    fn emulator_exited(&self, token: &str, session_id: &str, status: Option<ExitStatus>) {
        let current = {
            let sessions = self.sessions();
            matches!(sessions.get(token), Some(s) if s.session_id == session_id && !s.removing)
        };
        if current {
            info!(session_id = %session_id, exit = ?status, "Emulator exited");
            self.remove_session(token, "Door exited");
        }
    }

    /// Tear down the session for `token`. Returns `false` if there was
    /// nothing to tear down, including when teardown is already running.
    pub fn remove_session(&self, token: &str, reason: &str) -> bool {
        let teardown = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(token) else {
                return false;
            };
            if session.removing {
                return false;
            }
            session.removing = true;
            session.status = SessionStatus::TornDown;
            if let Some(grace) = session.timers.grace.take() {
                grace.cancel();
            }
            if let Some(link) = session.client.unbind() {
                link.close(CLOSE_NORMAL, reason);
            }
            // Carrier loss first, then give the door a window to exit.
            if let Some(adapter) = session.transport.adapter.as_mut() {
                adapter.close();
            }
            if let Some(kill_tx) = session.transport.kill_tx.take() {
                session.timers.kill = Some(DelayedTask::spawn(
                    self.config.kill_timeout(),
                    async move {
                        let _ = kill_tx.send(());
                    },
                ));
            }
            Teardown {
                session_id: session.session_id.clone(),
                started_at: session.started_at,
                counters: session.counters,
                port: session.transport.port.take(),
                files: std::mem::take(&mut session.files),
            }
        };

        if let Some(port) = teardown.port {
            self.ports.release(port);
        }
        let token = token.to_string();
        let reason = reason.to_string();
        match self.this.upgrade() {
            Some(manager) => self.spawn_blocking_tracked(move || {
                manager.finish_teardown(&token, &reason, teardown)
            }),
            None => self.finish_teardown(&token, &reason, teardown),
        }
        true
    }

    /// Blocking half of teardown: files, the row, then the map entry. The
    /// entry stays flagged `removing` until the row is gone.
    fn finish_teardown(&self, token: &str, reason: &str, teardown: Teardown) {
        cleanup_files(self.config.keep_files, &teardown.session_id, &teardown.files);
        if let Err(e) = self.store.delete(&teardown.session_id) {
            warn!(session_id = %teardown.session_id, error = %e, "Failed to delete session row");
        }
        self.sessions().remove(token);

        let uptime = Utc::now() - teardown.started_at;
        info!(
            session_id = %teardown.session_id,
            reason = reason,
            bytes_to_client = teardown.counters.to_client,
            bytes_to_emulator = teardown.counters.to_emulator,
            uptime_secs = uptime.num_seconds(),
            "Session torn down"
        );
    }

    /// Run blocking store or filesystem work on the blocking pool, tracked
    /// so `shutdown_all` waits for it. Runs inline outside a runtime.
    fn spawn_blocking_tracked<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            self.watchers.spawn_blocking(work);
        } else {
            work();
        }
    }

    /// Mark rows left open by a previous run as ended.
    pub fn recover_orphans(&self) -> Result<usize, BridgeError> {
        let ended = self.store.end_orphaned()?;
        if ended > 0 {
            warn!(count = ended, "Ended orphaned session rows from a previous run");
        }
        Ok(ended)
    }

    /// Tear down every live session and wait for the emulators to exit.
    pub async fn shutdown_all(&self) {
        let tokens: Vec<String> = self.sessions().keys().cloned().collect();
        let removed = tokens
            .iter()
            .filter(|token| self.remove_session(token, "Bridge shutting down"))
            .count();
        self.watchers.close();
        let window = self.config.kill_timeout() + SHUTDOWN_SLACK;
        if tokio::time::timeout(window, self.watchers.wait())
            .await
            .is_err()
        {
            warn!("Emulators still running after the shutdown window");
        }
        info!(sessions = removed, "All sessions shut down");
    }

    pub fn stats(&self) -> SessionStats {
        let sessions = self.sessions();
        let mut stats = SessionStats {
            live: sessions.len(),
            ports_available: self.ports.available_count(),
            ..SessionStats::default()
        };
        for session in sessions.values() {
            match session.status {
                SessionStatus::Launching => stats.launching += 1,
                SessionStatus::Active => stats.active += 1,
                SessionStatus::DisconnectedGrace => stats.grace += 1,
                SessionStatus::TornDown => {}
            }
        }
        stats
    }

    /// Snapshot of the live session for `token`.
    pub fn session_info(&self, token: &str) -> Option<SessionInfo> {
        self.sessions().get(token).map(Session::info)
    }
}

/// What teardown needs after the session leaves the lock.
struct Teardown {
    session_id: String,
    started_at: DateTime<Utc>,
    counters: ByteCounters,
    port: Option<u16>,
    files: SessionFiles,
}

/// Host-side files staged for a launch.
struct PreparedFiles {
    session_path: PathBuf,
    doors_root: PathBuf,
    door: Door,
    placement: DropFilePlacement,
}

/// Create the scratch directory, load the door and write DOOR.SYS. Every
/// path created is recorded in `files`, including on failure.
fn prepare_files(
    config: &BridgeConfig,
    row: &SessionRow,
    drives: DriveLayout,
    files: &mut SessionFiles,
) -> Result<PreparedFiles, BridgeError> {
    let session_root = config.session_root();
    std::fs::create_dir_all(&session_root)?;
    let session_path = std::fs::canonicalize(&session_root)?.join(&row.session_id);
    std::fs::create_dir_all(&session_path)?;
    files.session_path = Some(session_path.clone());

    let doors_root = std::fs::canonicalize(&config.doors_dir).map_err(|e| {
        BridgeError::InvalidManifest(format!(
            "doors directory {}: {}",
            config.doors_dir.display(),
            e
        ))
    })?;
    let door = Door::load(&doors_root, &row.door_id)?;

    let profile = UserProfile::from_json(row.user_data.as_deref().unwrap_or_default())?;
    std::fs::create_dir_all(&config.drop_dir)?;
    let drop_root = std::fs::canonicalize(&config.drop_dir)?;
    let placement = resolve_dropfile(&door, &drop_root, row.node_number);
    let door_dir = door_dos_dir(&door, drives);
    let dropfile = write_door_sys(
        &placement.host_dir,
        &profile,
        &DropFileContext {
            node: row.node_number,
            call_time: Local::now().naive_local(),
            sysop_name: &config.sysop_name,
            door_dos_dir: &door_dir,
        },
    )?;
    debug!(session_id = %row.session_id, path = %dropfile.display(), "Wrote drop-file");
    files.dropfile = Some(dropfile);

    Ok(PreparedFiles {
        session_path,
        doors_root,
        door,
        placement,
    })
}

/// Delete a session's drop-file and scratch directory. Errors are logged
/// and swallowed; files already gone are fine.
fn cleanup_files(keep_files: bool, session_id: &str, files: &SessionFiles) {
    if files.is_empty() {
        return;
    }
    if keep_files {
        debug!(session_id = %session_id, files = ?files, "Keeping session files");
        return;
    }
    if let Some(dropfile) = &files.dropfile {
        if let Err(e) = std::fs::remove_file(dropfile) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id = %session_id, path = %dropfile.display(), error = %e, "Failed to remove drop-file");
            }
        }
    }
    if let Some(dir) = &files.session_path {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id = %session_id, path = %dir.display(), error = %e, "Failed to remove session directory");
            }
        }
    }
}

/// Run a blocking store or filesystem call off the async workers.
async fn run_blocking<T, F>(work: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> Result<T, BridgeError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BridgeError::Io(std::io::Error::other(e)))?
}

/// Resources acquired by an in-flight launch. Released on drop unless
/// handed to the session with [`PendingLaunch::commit`].
struct PendingLaunch<'a> {
    manager: &'a SessionManager,
    port: Option<u16>,
    files: SessionFiles,
}

impl<'a> PendingLaunch<'a> {
    fn new(manager: &'a SessionManager) -> Self {
        Self {
            manager,
            port: None,
            files: SessionFiles::default(),
        }
    }

    fn commit(&mut self) -> SessionFiles {
        self.port = None;
        std::mem::take(&mut self.files)
    }
}

impl Drop for PendingLaunch<'_> {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.manager.ports.release(port);
        }
        let files = std::mem::take(&mut self.files);
        if files.is_empty() {
            return;
        }
        let label = files
            .session_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let keep_files = self.manager.config.keep_files;
        self.manager
            .spawn_blocking_tracked(move || cleanup_files(keep_files, &label, &files));
    }
}

/// Wait for the emulator to exit, force-killing it if the kill timer fires
/// first, then report the exit to the manager.
async fn watch_emulator(
    manager: Weak<SessionManager>,
    token: String,
    session_id: String,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            warn!(session_id = %session_id, "Emulator ignored hangup; killing it");
            if let Err(e) = child.start_kill() {
                debug!(session_id = %session_id, error = %e, "Kill failed");
            }
            child.wait().await
        }
    };
    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Failed to reap emulator");
            None
        }
    };
    if let Some(manager) = manager.upgrade() {
        manager.emulator_exited(&token, &session_id, status);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::testing::{eventually, Fixture, FixtureOptions};
    use super::*;
    use crate::error::CLOSE_INTERNAL_ERROR;
    use std::sync::atomic::Ordering;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn next_frame(rx: &mut UnboundedReceiver<ClientFrame>) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client link dropped")
    }

    async fn connect(fx: &Fixture, token: &str) -> (ClientLink, UnboundedReceiver<ClientFrame>) {
        let row = fx.manager.find_session_by_token(token).unwrap().unwrap();
        let (link, rx) = ClientLink::new();
        fx.manager.handle_connection(row, link.clone()).await.unwrap();
        (link, rx)
    }

    #[tokio::test]
    async fn unknown_or_ended_token_is_rejected() {
        let fx = Fixture::new(FixtureOptions::default());
        let mut ended = fx.add_row("s-ended", "ended-token", 1);
        fx.store.delete(&ended.session_id).unwrap();
        ended.ended_at = Some("2026-10-16 21:30:00".to_string());
        fx.store.insert(&ended).unwrap();

        assert!(fx.manager.find_session_by_token("no-such-token").unwrap().is_none());
        assert!(fx.manager.find_session_by_token("ended-token").unwrap().is_none());
        assert!(fx.manager.find_session_by_token("").unwrap().is_none());

        let stats = fx.manager.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.ports_available, 4);
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn launching_lord_records_port_and_pid() {
        let fx = Fixture::new(FixtureOptions::default());
        fx.add_row("s-lord", "lord-token", 1);

        let (_link, _rx) = connect(&fx, "lord-token").await;

        let info = fx.manager.session_info("lord-token").unwrap();
        assert_eq!(info.status, SessionStatus::Active);
        assert_eq!(info.port, Some(fx.config.tcp_port_base));
        assert!(info.pid.is_some());
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 1);
        assert_eq!(fx.manager.stats().ports_available, 3);

        let row = fx.store.get("s-lord").unwrap().unwrap();
        assert_eq!(row.tcp_port, info.port);
        assert_eq!(row.emulator_pid, info.pid);
        assert!(row.session_path.is_some());
        assert!(fx.session_dir("s-lord").join("fake.conf").is_file());

        let door_sys = std::fs::read(fx.dropfile(1)).unwrap();
        let text = String::from_utf8_lossy(&door_sys);
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines.len(), 53);
        assert_eq!(lines[3], "1");
        assert_eq!(lines[9], "Seth Able");

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn reconnect_rebinds_without_relaunch() {
        let fx = Fixture::new(FixtureOptions {
            grace_ms: 5_000,
            ..FixtureOptions::default()
        });
        fx.add_row("s-re", "re-token", 2);

        let (_first, mut first_rx) = connect(&fx, "re-token").await;
        let pid = fx.manager.session_info("re-token").unwrap().pid;

        let (_second, _second_rx) = connect(&fx, "re-token").await;
        assert_eq!(fx.manager.session_info("re-token").unwrap().pid, pid);
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 1);
        assert_eq!(fx.manager.stats().ports_available, 3);

        match next_frame(&mut first_rx).await {
            ClientFrame::Close(code, _) => assert_eq!(code, CLOSE_NORMAL),
            other => panic!("expected close, got {:?}", other),
        }

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn superseded_client_disconnect_is_ignored() {
        let fx = Fixture::new(FixtureOptions::default());
        fx.add_row("s-sup", "sup-token", 1);

        let (first, _first_rx) = connect(&fx, "sup-token").await;
        let (_second, _second_rx) = connect(&fx, "sup-token").await;

        // Zero grace, yet the stale socket closing must not end the session.
        fx.manager.client_disconnected("sup-token", first.id());
        assert_eq!(
            fx.manager.session_info("sup-token").unwrap().status,
            SessionStatus::Active
        );

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn zero_grace_disconnect_tears_down() {
        let fx = Fixture::new(FixtureOptions::default());
        fx.add_row("s-zero", "zero-token", 3);

        let (link, _rx) = connect(&fx, "zero-token").await;
        assert!(fx.dropfile(3).is_file());

        fx.manager.client_disconnected("zero-token", link.id());

        assert!(eventually(|| fx.manager.session_info("zero-token").is_none()).await);
        assert_eq!(fx.manager.stats().ports_available, 4);
        assert!(fx.store.get("s-zero").unwrap().is_none());
        assert!(!fx.dropfile(3).exists());
        assert!(!fx.session_dir("s-zero").exists());

        // The kill window is 200ms; the watcher must be done well within it.
        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn teardown_runs_once() {
        let fx = Fixture::new(FixtureOptions {
            grace_ms: 5_000,
            ..FixtureOptions::default()
        });
        fx.add_row("s-once", "once-token", 1);
        let (_link, _rx) = connect(&fx, "once-token").await;

        assert!(fx.manager.remove_session("once-token", "test"));
        assert!(!fx.manager.remove_session("once-token", "test"));
        assert_eq!(fx.manager.stats().ports_available, 4);
        assert!(eventually(|| fx.store.count().unwrap() == 0).await);

        // The released port is immediately reusable.
        fx.add_row("s-next", "next-token", 1);
        let (_next, _next_rx) = connect(&fx, "next-token").await;
        assert_eq!(
            fx.manager.session_info("next-token").unwrap().port,
            Some(fx.config.tcp_port_base)
        );

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn reconnect_during_grace_cancels_teardown() {
        let fx = Fixture::new(FixtureOptions {
            grace_ms: 150,
            ..FixtureOptions::default()
        });
        fx.add_row("s-grace", "grace-token", 1);

        let (link, _rx) = connect(&fx, "grace-token").await;
        fx.manager.client_disconnected("grace-token", link.id());
        assert_eq!(
            fx.manager.session_info("grace-token").unwrap().status,
            SessionStatus::DisconnectedGrace
        );

        let (_again, _again_rx) = connect(&fx, "grace-token").await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        let info = fx.manager.session_info("grace-token").unwrap();
        assert_eq!(info.status, SessionStatus::Active);
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 1);

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn grace_expiry_tears_down() {
        let fx = Fixture::new(FixtureOptions {
            grace_ms: 50,
            ..FixtureOptions::default()
        });
        fx.add_row("s-exp", "exp-token", 1);

        let (link, _rx) = connect(&fx, "exp-token").await;
        fx.manager.client_disconnected("exp-token", link.id());

        assert!(eventually(|| fx.manager.session_info("exp-token").is_none()).await);
        assert!(fx.store.get("s-exp").unwrap().is_none());
        assert_eq!(fx.manager.stats().ports_available, 4);
    }

    #[tokio::test]
    async fn emulator_exit_closes_client() {
        let fx = Fixture::new(FixtureOptions {
            sleep: "0.2",
            grace_ms: 5_000,
            ..FixtureOptions::default()
        });
        fx.add_row("s-exit", "exit-token", 1);

        let (_link, mut rx) = connect(&fx, "exit-token").await;
        match next_frame(&mut rx).await {
            ClientFrame::Close(code, _) => assert_eq!(code, CLOSE_NORMAL),
            other => panic!("expected close, got {:?}", other),
        }
        assert!(eventually(|| fx.manager.session_info("exit-token").is_none()).await);
        assert!(fx.store.get("s-exit").unwrap().is_none());
        assert_eq!(fx.manager.stats().ports_available, 4);
    }

    #[tokio::test]
    async fn launch_failure_closes_with_internal_error() {
        let fx = Fixture::new(FixtureOptions {
            fail_launch: true,
            ..FixtureOptions::default()
        });
        fx.add_row("s-fail", "fail-token", 1);

        let row = fx.manager.find_session_by_token("fail-token").unwrap().unwrap();
        let (link, mut rx) = ClientLink::new();
        let err = fx.manager.handle_connection(row, link).await.unwrap_err();
        assert!(matches!(err, BridgeError::ExecutableNotFound(_)));

        match next_frame(&mut rx).await {
            ClientFrame::Close(code, _) => assert_eq!(code, CLOSE_INTERNAL_ERROR),
            other => panic!("expected close, got {:?}", other),
        }
        assert!(fx.manager.session_info("fail-token").is_none());
        assert_eq!(fx.manager.stats().ports_available, 4);
        let row = fx.store.get("s-fail").unwrap().unwrap();
        assert!(row.session_path.is_none());
        assert!(row.tcp_port.is_none());
    }

    #[tokio::test]
    async fn exhausted_ports_fail_the_launch() {
        let fx = Fixture::new(FixtureOptions {
            ports: 1,
            ..FixtureOptions::default()
        });
        fx.add_row("s-a", "a-token", 1);
        fx.add_row("s-b", "b-token", 2);

        let (_a, _a_rx) = connect(&fx, "a-token").await;
        let row = fx.manager.find_session_by_token("b-token").unwrap().unwrap();
        let (link, _b_rx) = ClientLink::new();
        let err = fx.manager.handle_connection(row, link).await.unwrap_err();
        assert!(matches!(err, BridgeError::PortsExhausted));
        assert!(fx.manager.session_info("b-token").is_none());
        assert!(eventually(|| !fx.dropfile(2).exists()).await);
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 1);

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn busy_serial_port_is_skipped() {
        let fx = Fixture::new(FixtureOptions::default());
        let _squatter =
            std::net::TcpListener::bind(("127.0.0.1", fx.config.tcp_port_base)).unwrap();
        fx.add_row("s-busy", "busy-token", 1);

        let (_link, _rx) = connect(&fx, "busy-token").await;
        let info = fx.manager.session_info("busy-token").unwrap();
        assert_eq!(info.port, Some(fx.config.tcp_port_base + 1));
        assert_eq!(fx.manager.stats().ports_available, 3);
        assert_eq!(fx.store.get("s-busy").unwrap().unwrap().tcp_port, info.port);

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn bind_failure_on_every_port_rejects_launch() {
        let fx = Fixture::new(FixtureOptions {
            ports: 2,
            ..FixtureOptions::default()
        });
        let _squatters: Vec<_> = (0..2)
            .map(|i| {
                std::net::TcpListener::bind(("127.0.0.1", fx.config.tcp_port_base + i)).unwrap()
            })
            .collect();
        fx.add_row("s-bind", "bind-token", 4);

        let row = fx.manager.find_session_by_token("bind-token").unwrap().unwrap();
        let (link, mut rx) = ClientLink::new();
        let err = fx.manager.handle_connection(row, link).await.unwrap_err();
        assert!(matches!(err, BridgeError::BindFailed { .. }));

        match next_frame(&mut rx).await {
            ClientFrame::Close(code, _) => assert_eq!(code, CLOSE_INTERNAL_ERROR),
            other => panic!("expected close, got {:?}", other),
        }
        assert!(fx.manager.session_info("bind-token").is_none());
        assert_eq!(fx.manager.stats().ports_available, 2);
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 0);
        assert!(eventually(|| !fx.dropfile(4).exists()).await);
        assert!(eventually(|| !fx.session_dir("s-bind").exists()).await);
    }

    #[tokio::test]
    async fn relays_cp437_both_ways() {
        let fx = Fixture::new(FixtureOptions::default());
        fx.add_row("s-relay", "relay-token", 1);

        let (link, mut rx) = connect(&fx, "relay-token").await;
        let port = fx.manager.session_info("relay-token").unwrap().port.unwrap();
        let mut emulator = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        emulator.write_all(&[0xC9, 0xCD, 0xBB]).await.unwrap();
        assert_eq!(next_frame(&mut rx).await, ClientFrame::Text("╔═╗".to_string()));

        fx.manager
            .client_input("relay-token", link.id(), ClientInput::Text("é\r".to_string()));
        let mut got = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(3), emulator.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, [0x82, b'\r']);

        fx.manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn orphan_recovery_ends_open_rows() {
        let fx = Fixture::new(FixtureOptions::default());
        fx.add_row("s-orphan", "orphan-token", 1);
        assert_eq!(fx.manager.recover_orphans().unwrap(), 1);
        assert!(fx.manager.find_session_by_token("orphan-token").unwrap().is_none());
    }
}
