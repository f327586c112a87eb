//! Error types for the door bridge.
//!
//! Every failure that can end a client connection maps to a WebSocket close
//! code via [`BridgeError::close_code`], so the front doors can report it
//! without inspecting the variant themselves.

use thiserror::Error;

/// WebSocket close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code for a policy violation (bad or ended token).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code for an internal server error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Errors raised by the session bridge and its front doors.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid or expired session token")]
    InvalidToken,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Emulator executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("No transport ports available")]
    PortsExhausted,

    #[error("Failed to bind transport listener on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Failed to spawn emulator: {0}")]
    SpawnFailed(String),

    #[error("Invalid door manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid user profile: {0}")]
    InvalidProfile(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Close code sent to a client whose connection ends with this error.
    pub fn close_code(&self) -> u16 {
        match self {
            BridgeError::InvalidToken | BridgeError::SessionNotFound(_) => CLOSE_POLICY_VIOLATION,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(e: rusqlite::Error) -> Self {
        BridgeError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::InvalidProfile(e.to_string())
    }
}
