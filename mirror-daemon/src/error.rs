//! Daemon error type.
//!
//! Wire and socket faults are typed here; session-level faults come
//! from `mirror-core` and are wrapped unchanged.

use mirror_core::MirrorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    // ── Wire Errors ──────────────────────────────────────────────
    /// The packet did not start with `MRR0`.
    #[error("invalid magic bytes: expected MRR0")]
    InvalidMagic,

    /// The packet kind byte is not one we know.
    #[error("unknown packet kind: {0:#04x}")]
    UnknownKind(u8),

    /// The payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A well-formed packet arrived where the protocol forbids it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Serialization Errors ─────────────────────────────────────
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("compression error: {0}")]
    Compression(String),

    // ── Connection Errors ────────────────────────────────────────
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    // ── Session Errors ───────────────────────────────────────────
    #[error(transparent)]
    Session(#[from] MirrorError),

    /// Feature not available on this platform or configuration.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl From<bincode::Error> for DaemonError {
    fn from(e: bincode::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

impl From<DaemonError> for MirrorError {
    fn from(e: DaemonError) -> Self {
        match e {
            DaemonError::ProtocolViolation(what) => MirrorError::ProtocolViolation(what),
            DaemonError::InvalidMagic => MirrorError::ProtocolViolation("invalid magic"),
            DaemonError::ChecksumMismatch => MirrorError::ProtocolViolation("checksum mismatch"),
            DaemonError::Io(e) => MirrorError::Io(e),
            DaemonError::Session(e) => e,
            other => MirrorError::Encoding(other.to_string()),
        }
    }
}
