//! The slice tick.
//!
//! [`SessionScheduler`] owns the capture pipeline (frame queue + pump)
//! and services one connection at a time, in this order:
//!
//! 1. handshake timeout
//! 2. capture start / capture-start timeout
//! 3. drain queued frames while the transport backlog allows
//! 4. pause/resume hysteresis
//! 5. RTT probe issue and drift check
//! 6. relay UI-originated requests
//!
//! Statistics are reported once per slice across all connections.
//! Nothing here blocks: transports are backlog-checked and pumps are
//! reaped only once their threads have exited.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use super::state::{CloseReason, ConnectionState};
use super::transport::SessionTransport;
use super::{ConnectionId, SessionConfig};
use crate::error::MirrorError;
use crate::events::SessionRequest;
use crate::pump::{CaptureLauncher, PumpHandle};
use crate::queue::{EncodedFrameQueue, PumpCommand};

/// A live connection: bookkeeping plus its transport.
#[derive(Debug)]
pub(crate) struct Connection<T> {
    pub(crate) state: ConnectionState,
    pub(crate) transport: T,
}

/// What one slice did.
#[derive(Debug, Default)]
pub struct SliceOutcome {
    /// Whether the tick should be re-armed.
    pub keep_running: bool,
    /// Connections force-closed during this slice.
    pub closed: Vec<(ConnectionId, CloseReason)>,
    /// Requests the host must act on (IP reconfiguration).
    pub deferred: Vec<SessionRequest>,
}

#[derive(Debug, Default)]
struct StatsClock {
    started: Option<Instant>,
    last: Option<Instant>,
}

// ── SessionScheduler ─────────────────────────────────────────────

pub struct SessionScheduler<L> {
    config: SessionConfig,
    launcher: L,
    queue: Arc<EncodedFrameQueue>,
    /// Connection the capture pipeline is attached to.
    owner: Option<ConnectionId>,
    pump: Option<PumpHandle>,
    /// Cancelled pumps whose threads have not been joined yet.
    retiring: Vec<PumpHandle>,
    /// Capture stopped on its own; no relaunch until released.
    halted: bool,
    stats: StatsClock,
}

impl<L: CaptureLauncher> SessionScheduler<L> {
    pub fn new(config: SessionConfig, launcher: L) -> Self {
        Self {
            config,
            launcher,
            queue: Arc::new(EncodedFrameQueue::new()),
            owner: None,
            pump: None,
            retiring: Vec::new(),
            halted: false,
            stats: StatsClock::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The queue of the current capture session.
    pub fn queue(&self) -> &Arc<EncodedFrameQueue> {
        &self.queue
    }

    pub fn capture_owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    pub fn pump(&self) -> Option<&PumpHandle> {
        self.pump.as_ref()
    }

    /// Whether capture stopped by itself (fault or end of stream).
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_paused(&self) -> bool {
        self.pump.as_ref().is_some_and(|p| p.is_paused())
    }

    /// Allow a halted pipeline to be launched again on the next slice.
    pub fn restart_capture(&mut self) {
        if self.halted {
            info!(conn = ?self.owner, "capture restart requested");
            self.halted = false;
        }
    }

    // ── Pipeline ─────────────────────────────────────────────────

    /// Join pumps whose threads have exited.
    pub(crate) fn reap(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) =
            self.retiring.drain(..).partition(|p| p.is_finished());
        self.retiring = pending;
        for handle in done {
            match handle.join() {
                Ok(exit) => debug!(?exit, "retired pump joined"),
                Err(e) => debug!("retired pump ended with error: {e}"),
            }
        }

        if self.pump.as_ref().is_some_and(|p| p.is_finished()) {
            if let Some(handle) = self.pump.take() {
                let owner = self.owner;
                match handle.join() {
                    Ok(exit) => info!(conn = ?owner, ?exit, "capture stopped"),
                    Err(e) => error!(conn = ?owner, "capture stopped: {e}"),
                }
                self.halted = true;
            }
        }
    }

    fn can_launch(&self, id: ConnectionId) -> bool {
        self.pump.is_none()
            && self.retiring.is_empty()
            && !self.halted
            && self.owner.is_none_or(|owner| owner == id)
    }

    fn launch(&mut self, id: ConnectionId) {
        // A fresh queue per capture session; a retired pump can never
        // push into it.
        self.queue = Arc::new(EncodedFrameQueue::new());
        self.owner = Some(id);
        match self.launcher.launch(Arc::clone(&self.queue)) {
            Ok(handle) => {
                info!(conn = %id, "capture launched");
                self.pump = Some(handle);
            }
            Err(e) => {
                error!(conn = %id, "capture launch failed: {e}");
                self.halted = true;
            }
        }
    }

    /// Detach the pipeline from `id` if it owns it.
    pub(crate) fn release(&mut self, id: ConnectionId) {
        if self.owner != Some(id) {
            return;
        }
        self.owner = None;
        self.halted = false;
        if let Some(handle) = self.pump.take() {
            handle.stop();
            self.retiring.push(handle);
        }
        let dropped = self.queue.clear();
        info!(conn = %id, dropped, "capture released");
    }

    /// Stop and join every pump. Blocks.
    pub(crate) fn shutdown(&mut self) {
        self.owner = None;
        if let Some(handle) = self.pump.take() {
            handle.stop();
            self.retiring.push(handle);
        }
        for handle in self.retiring.drain(..) {
            handle.stop();
            if let Err(e) = handle.join() {
                debug!("pump ended with error during shutdown: {e}");
            }
        }
        self.queue.clear();
    }

    // ── Per-connection service ───────────────────────────────────

    /// Run one slice for `conn`. An `Err` means the connection must be
    /// closed for that reason.
    pub(crate) fn service<T: SessionTransport>(
        &mut self,
        conn: &mut Connection<T>,
        relay: &[SessionRequest],
        now: Instant,
    ) -> Result<(), CloseReason> {
        let id = conn.state.id();

        // 1. handshake timeout
        if !conn.state.is_handshaked() {
            if conn
                .state
                .handshake_expired(now, self.config.handshake_timeout)
            {
                warn!(
                    conn = %id,
                    age = ?now.saturating_duration_since(conn.state.created_at()),
                    "handshake not completed in time"
                );
                return Err(CloseReason::HandshakeTimeout);
            }
            return Ok(());
        }

        // 2. capture start
        if conn.state.is_ready() && self.can_launch(id) {
            self.launch(id);
            conn.state.arm_probes(now, self.config.probe_interval);
        }
        if !conn.state.capture_started() {
            let started =
                self.owner == Some(id) && self.pump.as_ref().is_some_and(|p| p.is_started());
            if started {
                if let Err(e) = conn.state.mark_capture_started(now) {
                    debug!(conn = %id, "capture start not recorded: {e}");
                } else {
                    info!(conn = %id, "capture running");
                }
            } else if conn
                .state
                .capture_start_expired(now, self.config.capture_start_timeout)
            {
                warn!(
                    conn = %id,
                    backlog = conn.transport.write_backlog_bytes(),
                    alert = conn.transport.alert_threshold(),
                    next_seq = conn.state.next_probe_seq(),
                    acked = ?conn.state.last_acked_seq(),
                    "capture did not start in time"
                );
                return Err(CloseReason::CaptureStartTimeout);
            }
        }

        let owns_capture = self.owner == Some(id);

        // 3. frames
        if owns_capture && conn.state.capture_started() && conn.state.is_ready() {
            self.drain_frames(conn)?;
        }

        // 4. hysteresis
        if owns_capture {
            self.apply_watermarks(id);
        }

        // 5. probes
        if conn.state.probe_due(now) {
            let drift = conn.state.probe_drift();
            if drift >= self.config.probe_drift_threshold {
                warn!(
                    conn = %id,
                    next_seq = conn.state.next_probe_seq(),
                    acked = ?conn.state.last_acked_seq(),
                    drift,
                    threshold = self.config.probe_drift_threshold,
                    "peer stopped acknowledging probes"
                );
                return Err(CloseReason::ProbeDrift);
            }
            let seq = conn
                .state
                .record_probe_sent(now, self.config.probe_interval);
            conn.transport
                .send_probe(seq)
                .map_err(|e| io_fault(id, "probe", e))?;
            trace!(conn = %id, seq, "probe sent");
        }

        // 6. UI relay
        for request in relay {
            let sent = match request {
                SessionRequest::Explorer(update) => conn.transport.send_control_event(update),
                SessionRequest::Clipboard(payload) => conn.transport.send_clipboard(payload),
                SessionRequest::ReconfigureIp(_) => continue,
            };
            sent.map_err(|e| io_fault(id, "control event", e))?;
        }

        Ok(())
    }

    fn drain_frames<T: SessionTransport>(
        &mut self,
        conn: &mut Connection<T>,
    ) -> Result<(), CloseReason> {
        let id = conn.state.id();
        while !conn.transport.backlog_alert() {
            let Some(frame) = self.queue.pop() else {
                break;
            };
            if let Some(prev) = conn.state.observe_orientation(frame.orientation) {
                info!(conn = %id, from = %prev, to = %frame.orientation, "orientation changed");
                conn.transport
                    .send_orientation_change(prev, frame.orientation)
                    .map_err(|e| io_fault(id, "orientation change", e))?;
            }
            let size = frame.size();
            let seq = frame.sequence;
            conn.transport
                .send_frame(frame)
                .map_err(|e| io_fault(id, "frame", e))?;
            conn.state.record_frame_sent(size);
            trace!(conn = %id, seq, size, "frame sent");
        }
        Ok(())
    }

    fn apply_watermarks(&self, id: ConnectionId) {
        let Some(pump) = &self.pump else {
            return;
        };
        let depth = self.queue.len();
        match self.config.watermarks.evaluate(depth, pump.is_paused()) {
            Some(PumpCommand::Pause) => {
                pump.set_paused(true);
                debug!(conn = %id, depth, "capture paused");
            }
            Some(PumpCommand::Resume) => {
                pump.set_paused(false);
                debug!(conn = %id, depth, "capture resumed");
            }
            None => {}
        }
    }

    // ── Statistics ───────────────────────────────────────────────

    /// Emit the periodic statistics line for each handshaked connection.
    pub(crate) fn report<'a, T: SessionTransport + 'a>(
        &mut self,
        connections: impl Iterator<Item = &'a Connection<T>>,
        now: Instant,
    ) {
        let started = *self.stats.started.get_or_insert(now);
        let last = *self.stats.last.get_or_insert(now);
        let window_len = now.saturating_duration_since(last);
        if window_len < self.config.stats_interval {
            return;
        }
        self.stats.last = Some(now);

        let (window, max_frame) = match &self.pump {
            Some(pump) => (
                pump.control().take_window(),
                pump.control().max_frame_bytes(),
            ),
            None => (Default::default(), 0),
        };
        let queued = self.queue.len();
        let paused = self.is_paused();

        for conn in connections.filter(|c| c.state.is_handshaked()) {
            info!(
                conn = %conn.state.id(),
                elapsed = %format_hms(now.saturating_duration_since(started)),
                state = if paused { "paused" } else { "running" },
                queued,
                max_frame_kib = kib(max_frame),
                backlog_kib = kib(conn.transport.write_backlog_bytes()),
                alert_kib = kib(conn.transport.alert_threshold()),
                probe_next = conn.state.next_probe_seq(),
                probe_acked = ?conn.state.last_acked_seq(),
                output = if conn.state.output_suppressed() { "suppress" } else { "send" },
                window_secs = window_len.as_secs(),
                window_frames = window.frames,
                window_kib = kib(window.bytes as usize),
                sent_bytes = conn.state.bytes_sent(),
                "session stats"
            );
        }
    }

    /// Restart the statistics clock at the next slice.
    pub(crate) fn reset_stats(&mut self) {
        self.stats = StatsClock::default();
    }
}

fn io_fault(id: ConnectionId, what: &str, e: MirrorError) -> CloseReason {
    warn!(conn = %id, "failed to send {what}: {e}");
    CloseReason::Io
}

fn kib(bytes: usize) -> f64 {
    (bytes as f64 / 1024.0 * 10.0).round() / 10.0
}

/// `H:MM:SS`
pub(crate) fn format_hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
