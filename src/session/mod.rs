//! Door sessions: one emulator per session token, reachable over WebSocket.
//!
//! # Architecture
//!
//! ```text
//!  browser / door client ──ws──▶ server::serve ──▶ SessionManager
//!                                                  ├─ sessions: HashMap<ws_token, Session>
//!                                                  ├─ ports: PortPool (10000-10099)
//!                                                  ├─ store: door_sessions rows
//!                                                  └─ adapter factory
//!                                                           │ TCP serial line
//!                           ┌───────────────────────────────┼──────────────┐
//!                           ▼                               ▼              ▼
//!                   ┌──────────────┐               ┌──────────────┐
//!                   │ node 1 LORD  │               │ node 2 TW2002│     ...
//!                   │ port 10000   │               │ port 10001   │
//!                   │ DOSBox       │               │ DOSEMU       │
//!                   └──────────────┘               └──────────────┘
//! ```
//!
//! Lifecycle per session:
//! `Launching → Active ⇄ DisconnectedGrace → TornDown`, with
//! `Active → TornDown` when the emulator exits.

mod manager;
mod port_allocator;
pub mod server;
mod store;
mod timer;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{SessionManager, SessionStats};
pub use port_allocator::{PortPool, DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
pub use store::{SessionStore, SqliteSessionStore};
pub use timer::DelayedTask;
pub use types::{ClientFrame, ClientInput, ClientLink, SessionInfo, SessionRow, SessionStatus};
