//! Connection phase machine and per-connection bookkeeping.
//!
//! Everything here is mutated only on the session thread. The UI
//! thread sees [`ConnectionSnapshot`]s published through the server's
//! connection table.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::trace;

use super::ConnectionId;
use crate::error::MirrorError;
use crate::events::CapabilitySet;
use crate::frame::Orientation;

/// Sent-probe timestamps kept for RTT samples.
const MAX_OUTSTANDING_PROBES: usize = 16;

// ── ConnectionPhase ──────────────────────────────────────────────

/// Lifecycle of one viewer session.
///
/// ```text
///  Connecting ──► Handshaking ──► Handshaked ──► Active
///       │              │               │            │
///       └──────────────┴───────► Closing ◄──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Socket accepted, record created.
    #[default]
    Connecting,

    /// Waiting for the peer to finish the protocol handshake.
    Handshaking,

    /// Handshake complete; capture not yet running for this peer.
    Handshaked {
        since: Instant,
    },

    /// Capture running; frames flow.
    Active {
        since: Instant,
    },

    /// Torn down. The record is discarded right after.
    Closing,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Handshaked { .. } => write!(f, "Handshaked"),
            Self::Active { .. } => write!(f, "Active"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

impl ConnectionPhase {
    /// Handshake finished and not closing.
    pub fn is_handshaked(&self) -> bool {
        matches!(self, Self::Handshaked { .. } | Self::Active { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Closing)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Connecting`.
    pub fn begin_handshake(&mut self) -> Result<(), MirrorError> {
        match self {
            Self::Connecting => {
                *self = Self::Handshaking;
                Ok(())
            }
            _ => Err(MirrorError::ProtocolViolation(
                "cannot handshake: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Handshaking`.
    pub fn complete_handshake(&mut self, now: Instant) -> Result<(), MirrorError> {
        match self {
            Self::Handshaking => {
                *self = Self::Handshaked { since: now };
                Ok(())
            }
            _ => Err(MirrorError::ProtocolViolation(
                "cannot complete handshake: not in Handshaking state",
            )),
        }
    }

    /// Valid from: `Handshaked`.
    pub fn activate(&mut self, now: Instant) -> Result<(), MirrorError> {
        match self {
            Self::Handshaked { .. } => {
                *self = Self::Active { since: now };
                Ok(())
            }
            _ => Err(MirrorError::ProtocolViolation(
                "cannot activate: not in Handshaked state",
            )),
        }
    }

    /// Move to `Closing` from any phase. Returns `false` if already
    /// closing.
    pub fn force_close(&mut self) -> bool {
        if self.is_closing() {
            return false;
        }
        *self = Self::Closing;
        true
    }
}

// ── CloseReason ──────────────────────────────────────────────────

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the host.
    Requested,
    /// The peer said goodbye.
    PeerGoodbye,
    /// Transport read or write failed.
    Io,
    /// The protocol layer reported a fault.
    Protocol,
    HandshakeTimeout,
    CaptureStartTimeout,
    /// Too many probes went unacknowledged.
    ProbeDrift,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "closed by host",
            Self::PeerGoodbye => "peer goodbye",
            Self::Io => "transport i/o error",
            Self::Protocol => "protocol fault",
            Self::HandshakeTimeout => "handshake timeout",
            Self::CaptureStartTimeout => "capture start timeout",
            Self::ProbeDrift => "rtt probe drift",
        };
        f.write_str(s)
    }
}

// ── ConnectionState ──────────────────────────────────────────────

/// Per-connection record owned by the session thread.
#[derive(Debug)]
pub struct ConnectionState {
    id: ConnectionId,
    created_at: Instant,
    phase: ConnectionPhase,
    handshaked_at: Option<Instant>,
    capture_started: bool,

    // RTT probing
    next_probe_seq: u16,
    last_acked_seq: Option<u16>,
    next_probe_at: Option<Instant>,
    outstanding: VecDeque<(u16, Instant)>,
    srtt: Option<Duration>,

    /// Orientation of the last frame handed to the transport.
    last_orientation: Option<Orientation>,
    capabilities: CapabilitySet,
    output_suppressed: bool,
    bytes_sent: u64,
    frames_sent: u64,
    close_reason: Option<CloseReason>,
}

impl ConnectionState {
    pub fn new(id: ConnectionId, now: Instant) -> Self {
        Self {
            id,
            created_at: now,
            phase: ConnectionPhase::Connecting,
            handshaked_at: None,
            capture_started: false,
            next_probe_seq: 0,
            last_acked_seq: None,
            next_probe_at: None,
            outstanding: VecDeque::new(),
            srtt: None,
            last_orientation: None,
            capabilities: CapabilitySet::empty(),
            output_suppressed: false,
            bytes_sent: 0,
            frames_sent: 0,
            close_reason: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn handshaked_at(&self) -> Option<Instant> {
        self.handshaked_at
    }

    pub fn is_handshaked(&self) -> bool {
        self.phase.is_handshaked()
    }

    /// Handshaked and the peer wants output.
    pub fn is_ready(&self) -> bool {
        self.is_handshaked() && !self.output_suppressed
    }

    pub fn capture_started(&self) -> bool {
        self.capture_started
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub fn begin_handshake(&mut self) -> Result<(), MirrorError> {
        self.phase.begin_handshake()
    }

    pub fn complete_handshake(&mut self, now: Instant) -> Result<(), MirrorError> {
        self.phase.complete_handshake(now)?;
        self.handshaked_at = Some(now);
        Ok(())
    }

    /// Capture reached "started" for this connection.
    pub fn mark_capture_started(&mut self, now: Instant) -> Result<(), MirrorError> {
        self.phase.activate(now)?;
        self.capture_started = true;
        Ok(())
    }

    /// Whether the handshake window has elapsed without a handshake.
    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_handshaked() && now.saturating_duration_since(self.created_at) >= timeout
    }

    /// Whether capture failed to start in time after the handshake.
    pub fn capture_start_expired(&self, now: Instant, timeout: Duration) -> bool {
        match self.handshaked_at {
            Some(at) if !self.capture_started => now.saturating_duration_since(at) >= timeout,
            _ => false,
        }
    }

    /// Mark the record as closing. Returns `false` if it already was.
    pub fn force_close(&mut self, reason: CloseReason) -> bool {
        if !self.phase.force_close() {
            return false;
        }
        self.close_reason = Some(reason);
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    // ── RTT probing ──────────────────────────────────────────────

    /// Schedule the first probe one interval from `now`. No-op once armed.
    pub fn arm_probes(&mut self, now: Instant, interval: Duration) {
        if self.next_probe_at.is_none() {
            self.next_probe_at = Some(now + interval);
        }
    }

    pub fn probe_due(&self, now: Instant) -> bool {
        self.next_probe_at.is_some_and(|at| now >= at)
    }

    pub fn next_probe_seq(&self) -> u16 {
        self.next_probe_seq
    }

    pub fn last_acked_seq(&self) -> Option<u16> {
        self.last_acked_seq
    }

    /// Probes sent since the last acknowledged one.
    pub fn probe_drift(&self) -> u16 {
        match self.last_acked_seq {
            Some(acked) => self.next_probe_seq.wrapping_sub(acked.wrapping_add(1)),
            None => self.next_probe_seq,
        }
    }

    /// Consume the next sequence number and schedule the following probe.
    pub fn record_probe_sent(&mut self, now: Instant, interval: Duration) -> u16 {
        let seq = self.next_probe_seq;
        self.next_probe_seq = seq.wrapping_add(1);
        if self.outstanding.len() == MAX_OUTSTANDING_PROBES {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back((seq, now));
        self.next_probe_at = Some(self.next_probe_at.unwrap_or(now) + interval);
        seq
    }

    /// Apply a peer acknowledgment. Returns the RTT sample, or `None`
    /// for a sequence number that was never sent or already acked.
    pub fn record_ack(&mut self, seq: u16, now: Instant) -> Option<Duration> {
        let pos = self.outstanding.iter().position(|(s, _)| *s == seq)?;
        let (_, sent_at) = self.outstanding[pos];
        // Anything older than the acked probe is superseded.
        self.outstanding.drain(..=pos);
        self.last_acked_seq = Some(seq);

        let sample = now.saturating_duration_since(sent_at);
        self.srtt = Some(match self.srtt {
            None => sample,
            Some(srtt) => srtt * 7 / 8 + sample / 8,
        });
        trace!(conn = %self.id, seq, ?sample, "probe acknowledged");
        Some(sample)
    }

    /// Smoothed round-trip time.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    // ── Stream state ─────────────────────────────────────────────

    /// Track the orientation of the next outgoing frame.
    ///
    /// The first frame sets the baseline. Afterwards, returns the
    /// previous orientation when it differs and a change message must
    /// precede the frame.
    pub fn observe_orientation(&mut self, orientation: Orientation) -> Option<Orientation> {
        match self.last_orientation.replace(orientation) {
            Some(prev) if prev != orientation => Some(prev),
            _ => None,
        }
    }

    pub fn last_orientation(&self) -> Option<Orientation> {
        self.last_orientation
    }

    pub fn record_frame_sent(&mut self, bytes: usize) {
        self.frames_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn set_output_suppressed(&mut self, suppressed: bool) {
        self.output_suppressed = suppressed;
    }

    pub fn output_suppressed(&self) -> bool {
        self.output_suppressed
    }

    pub fn set_capabilities(&mut self, caps: CapabilitySet) {
        self.capabilities = caps;
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            phase: self.phase,
            created_at: self.created_at,
            capture_started: self.capture_started,
            next_probe_seq: self.next_probe_seq,
            last_acked_seq: self.last_acked_seq,
            srtt: self.srtt,
            capabilities: self.capabilities,
            output_suppressed: self.output_suppressed,
            orientation: self.last_orientation,
            bytes_sent: self.bytes_sent,
            frames_sent: self.frames_sent,
        }
    }
}

// ── ConnectionSnapshot ───────────────────────────────────────────

/// Read-only copy of a [`ConnectionState`] for other threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub phase: ConnectionPhase,
    pub created_at: Instant,
    pub capture_started: bool,
    pub next_probe_seq: u16,
    pub last_acked_seq: Option<u16>,
    pub srtt: Option<Duration>,
    pub capabilities: CapabilitySet,
    pub output_suppressed: bool,
    pub orientation: Option<Orientation>,
    pub bytes_sent: u64,
    pub frames_sent: u64,
}

// ── Tests ────────────────────────────────────────────────────────
