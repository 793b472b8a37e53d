//! The wire-session seam.
//!
//! Framing, encryption and protocol decoding live behind
//! [`SessionTransport`]. The scheduler only asks how much is still
//! unwritten and hands over frames, probes and control events.

use crate::error::MirrorError;
use crate::events::{CapabilitySet, ClipboardPayload, ExplorerUpdate};
use crate::frame::{EncodedFrame, Orientation};

/// Something the peer told us, decoded from raw protocol bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The handshake sequence completed.
    HandshakeComplete,
    /// Acknowledgment of the RTT probe with this sequence number.
    ProbeAck(u16),
    /// Features supported by the viewer.
    Capabilities(CapabilitySet),
    /// Remote explorer activity, forwarded to the UI.
    Explorer(ExplorerUpdate),
    /// The viewer stopped (`true`) or resumed (`false`) wanting output.
    SuppressOutput(bool),
    /// The peer is leaving.
    Goodbye,
}

/// One accepted viewer session.
///
/// Sends must not block: they queue bytes and the caller checks
/// [`write_backlog_bytes`](Self::write_backlog_bytes) before the next
/// frame.
pub trait SessionTransport {
    /// Feed raw bytes read from the socket. A returned error is a
    /// protocol fault and closes the connection.
    fn ingest(&mut self, bytes: &[u8]) -> Result<Vec<PeerEvent>, MirrorError>;

    /// Bytes queued for the socket but not yet written.
    fn write_backlog_bytes(&self) -> usize;

    /// Backlog above which no new frame is handed over.
    fn alert_threshold(&self) -> usize;

    fn send_frame(&mut self, frame: EncodedFrame) -> Result<(), MirrorError>;

    fn send_probe(&mut self, seq: u16) -> Result<(), MirrorError>;

    fn send_orientation_change(
        &mut self,
        from: Orientation,
        to: Orientation,
    ) -> Result<(), MirrorError>;

    fn send_control_event(&mut self, update: &ExplorerUpdate) -> Result<(), MirrorError>;

    fn send_clipboard(&mut self, payload: &ClipboardPayload) -> Result<(), MirrorError>;

    /// Release the socket. Called exactly once, when the connection closes.
    fn close(&mut self);

    /// Whether the write backlog is over the alert threshold.
    fn backlog_alert(&self) -> bool {
        self.write_backlog_bytes() > self.alert_threshold()
    }
}
