//! Door Game Session Bridge
//!
//! Runs classic DOS BBS door games inside a DOS emulator and exposes each
//! running game as a WebSocket session. A caller reaches a door either from a
//! browser terminal or from the telnet side of the BBS, which runs this crate
//! in `door` mode as a WebSocket client.
//!
//! # Architecture
//!
//! - **SessionManager**: owns every live session, keyed by the one-time
//!   `ws_token` the BBS minted. Claims tokens, launches emulators, relays
//!   bytes and tears sessions down after a reconnect grace period.
//!
//! - **PortPool**: hands out the local TCP ports used as emulated serial
//!   lines (default `10000..=10099`).
//!
//! - **EmulatorAdapter**: one implementation per DOS emulator (DOSBox,
//!   DOSEMU). Each writes its own configuration, spawns the emulator and owns
//!   the TCP transport the emulator dials into.
//!
//! - **server**: the `ws://host:port/?token=<token>` endpoint.
//!
//! - **client**: the telnet-side WebSocket client with a hand-rolled
//!   handshake and frame codec.
//!
//! # Wire format
//!
//! Door output is CP437. It is decoded to UTF-8 for WebSocket text frames and
//! encoded back to CP437 for the emulator and for telnet callers.

pub mod client;
pub mod codepage;
pub mod config;
pub mod door;
pub mod emulator;
pub mod error;
pub mod session;

pub use config::{BridgeConfig, DoorClientConfig, EmulatorChoice};
pub use error::BridgeError;
pub use session::{
    server, PortPool, SessionManager, SessionStats, SessionStore, SqliteSessionStore,
};
