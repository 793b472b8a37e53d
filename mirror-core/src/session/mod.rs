//! Per-connection session management.
//!
//! - [`state`]: connection phase machine and per-connection bookkeeping
//! - [`transport`]: the wire-session seam the scheduler writes to
//! - [`scheduler`]: the periodic slice tick
//! - [`server`]: connection table, accept/receive/close, UI handle

pub mod scheduler;
pub mod server;
pub mod state;
pub mod transport;

use std::fmt;
use std::time::Duration;

use crate::queue::Watermarks;

pub use scheduler::SliceOutcome;
pub use server::{Accepted, SessionHandle, SessionServer};
pub use state::{CloseReason, ConnectionPhase, ConnectionSnapshot, ConnectionState};
pub use transport::{PeerEvent, SessionTransport};

// ── ConnectionId ─────────────────────────────────────────────────

/// Server-assigned connection id, unique for the server's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── SessionConfig ────────────────────────────────────────────────

/// Scheduling and liveness policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// A new connection must finish its handshake within this window.
    pub handshake_timeout: Duration,
    /// Capture must be running this long after the handshake.
    pub capture_start_timeout: Duration,
    /// Spacing between RTT probes.
    pub probe_interval: Duration,
    /// Unacknowledged probes tolerated before the peer is presumed dead.
    pub probe_drift_threshold: u16,
    /// Period of the slice tick while any connection exists.
    pub slice_interval: Duration,
    /// Period of the statistics line.
    pub stats_interval: Duration,
    pub watermarks: Watermarks,
    pub max_connections: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            capture_start_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_secs(5),
            probe_drift_threshold: 3,
            slice_interval: Duration::from_millis(20),
            stats_interval: Duration::from_secs(10),
            watermarks: Watermarks::default(),
            max_connections: 1,
        }
    }
}
