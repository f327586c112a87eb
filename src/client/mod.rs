//! Telnet-side door client.
//!
//! Runs once per telnet caller over stdin/stdout, opens a WebSocket to the
//! bridge with a hand-rolled handshake and frame codec, and relays bytes in
//! both directions. Caller input is stripped of telnet commands and has its
//! ANSI key sequences rewritten to Doorway codes before it is sent.

pub mod frame;
pub mod handshake;
pub mod keys;
mod relay;
pub mod telnet;

pub use relay::{relay, run_door_client};
