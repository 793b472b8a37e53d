//! Domain-specific error types for the mirroring control plane.
//!
//! All fallible operations return `Result<T, MirrorError>`.
//! Peer input never panics; every fault is typed and local to one
//! connection.

use std::time::Duration;
use thiserror::Error;

use crate::session::ConnectionId;

/// The canonical error type for the control plane.
#[derive(Debug, Error)]
pub enum MirrorError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The peer violated the session protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The transport layer reported an I/O error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A channel or mailbox peer went away.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// No connection with this id is known to the server.
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// The server already holds its maximum number of sessions.
    #[error("connection limit reached (max {max})")]
    CapacityExceeded { max: usize },

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Capture Errors ───────────────────────────────────────────
    /// The frame pump failed.
    #[error("pump error: {0}")]
    Pump(#[from] PumpError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── PumpError ────────────────────────────────────────────────────

/// Faults that stop the frame pump.
///
/// None of these are retried by the pump itself; the restart policy
/// belongs to whoever launched it.
#[derive(Debug, Error)]
pub enum PumpError {
    /// The encoder refused both the requested and the fallback geometry.
    #[error("encoder configure failed at {width}x{height}: {reason}")]
    Configure {
        width: u32,
        height: u32,
        reason: String,
    },

    /// The encoder reported a fatal dequeue result.
    #[error("dequeue failed: {0}")]
    Dequeue(String),

    /// Output buffers could not be re-acquired mid-stream.
    #[error("buffer refresh failed: {0}")]
    Buffers(String),

    /// The worker thread panicked.
    #[error("pump thread panicked")]
    Panicked,
}

// ── BackendError ─────────────────────────────────────────────────

/// Error reported by an [`EncoderBackend`](crate::pump::EncoderBackend).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl From<&str> for BackendError {
    fn from(s: &str) -> Self {
        BackendError(s.to_string())
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for MirrorError {
    fn from(s: String) -> Self {
        MirrorError::Other(s)
    }
}

impl From<&str> for MirrorError {
    fn from(s: &str) -> Self {
        MirrorError::Other(s.to_string())
    }
}
