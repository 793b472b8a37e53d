//! Connection table and the session-thread entry points.
//!
//! The host calls [`SessionServer::accept`] for each new socket,
//! [`on_receive`](SessionServer::on_receive) for each read, and
//! [`tick`](SessionServer::tick) every slice interval while the
//! previous tick (or accept) asked for it. All of these run on the
//! session thread. The UI thread talks to the server only through a
//! [`SessionHandle`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use super::scheduler::{Connection, SessionScheduler, SliceOutcome};
use super::state::{CloseReason, ConnectionSnapshot, ConnectionState};
use super::transport::{PeerEvent, SessionTransport};
use super::{ConnectionId, SessionConfig};
use crate::error::MirrorError;
use crate::events::{
    CapabilitySet, ClipboardPayload, ConnectionNotice, ExplorerUpdate, IpReconfigure,
    SessionRequest, UiEvent,
};
use crate::mailbox::{Mailbox, SurfaceHandle, SurfaceRegistry};
use crate::pump::CaptureLauncher;

type ConnectionTable = Arc<Mutex<Vec<ConnectionSnapshot>>>;

/// Result of a successful accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub id: ConnectionId,
    /// The slice tick was idle; the host must schedule it.
    pub arm_tick: bool,
}

// ── SessionServer ────────────────────────────────────────────────

pub struct SessionServer<T, L> {
    scheduler: SessionScheduler<L>,
    connections: BTreeMap<ConnectionId, Connection<T>>,
    table: ConnectionTable,
    requests: Arc<Mailbox<SessionRequest>>,
    surfaces: SurfaceRegistry<UiEvent>,
    next_id: u32,
    slice_running: bool,
}

impl<T: SessionTransport, L: CaptureLauncher> SessionServer<T, L> {
    /// `surfaces` is the UI layer's registry; session events go to
    /// whichever surface is active there.
    pub fn new(config: SessionConfig, launcher: L, surfaces: SurfaceRegistry<UiEvent>) -> Self {
        Self {
            scheduler: SessionScheduler::new(config, launcher),
            connections: BTreeMap::new(),
            table: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mailbox::new()),
            surfaces,
            next_id: 1,
            slice_running: false,
        }
    }

    /// Handle for the UI thread.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            table: Arc::clone(&self.table),
            requests: Arc::clone(&self.requests),
            surfaces: self.surfaces.clone(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        self.scheduler.config()
    }

    pub fn scheduler(&self) -> &SessionScheduler<L> {
        &self.scheduler
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionState> {
        self.connections.get(&id).map(|c| &c.state)
    }

    /// Whether the slice tick is currently armed.
    pub fn is_slice_running(&self) -> bool {
        self.slice_running
    }

    /// Allow a halted capture pipeline to start again.
    pub fn restart_capture(&mut self) {
        self.scheduler.restart_capture();
    }

    // ── Session-thread entry points ──────────────────────────────

    /// Register a newly accepted transport.
    ///
    /// Over capacity, the transport is closed and
    /// [`MirrorError::CapacityExceeded`] returned.
    pub fn accept(&mut self, mut transport: T, now: Instant) -> Result<Accepted, MirrorError> {
        let max = self.config().max_connections;
        if self.connections.len() >= max {
            warn!(max, "rejecting connection: server full");
            transport.close();
            return Err(MirrorError::CapacityExceeded { max });
        }

        let id = ConnectionId(self.next_id);
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);

        let mut state = ConnectionState::new(id, now);
        state.begin_handshake()?;
        self.connections.insert(id, Connection { state, transport });
        self.publish();

        let arm_tick = !self.slice_running;
        self.slice_running = true;
        info!(conn = %id, active = self.connections.len(), "connection accepted");
        Ok(Accepted { id, arm_tick })
    }

    /// Feed bytes read from connection `id`.
    ///
    /// Protocol faults close the connection and are not returned; only
    /// an unknown `id` is an error.
    pub fn on_receive(
        &mut self,
        id: ConnectionId,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), MirrorError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(MirrorError::ConnectionNotFound(id))?;

        let events = match conn.transport.ingest(bytes) {
            Ok(events) => events,
            Err(e) => {
                warn!(conn = %id, "protocol fault: {e}");
                self.close_inner(id, CloseReason::Protocol);
                self.publish();
                return Ok(());
            }
        };

        for event in events {
            if let Err(reason) = self.apply_peer_event(id, event, now) {
                self.close_inner(id, reason);
                break;
            }
        }
        self.publish();
        Ok(())
    }

    /// Close connection `id` at the host's request.
    pub fn close(&mut self, id: ConnectionId) -> Result<ConnectionSnapshot, MirrorError> {
        let snapshot = self
            .close_inner(id, CloseReason::Requested)
            .ok_or(MirrorError::ConnectionNotFound(id))?;
        self.publish();
        Ok(snapshot)
    }

    /// Mark connection `id` as failed at the transport level.
    pub fn fail(&mut self, id: ConnectionId) -> Result<ConnectionSnapshot, MirrorError> {
        let snapshot = self
            .close_inner(id, CloseReason::Io)
            .ok_or(MirrorError::ConnectionNotFound(id))?;
        self.publish();
        Ok(snapshot)
    }

    /// Run one slice over every connection.
    pub fn tick(&mut self, now: Instant) -> SliceOutcome {
        let mut outcome = SliceOutcome::default();

        let mut relay = Vec::new();
        for request in self.requests.drain() {
            match request {
                SessionRequest::ReconfigureIp(_) => outcome.deferred.push(request),
                other => relay.push(other),
            }
        }
        if !relay.is_empty() && !self.connections.values().any(|c| c.state.is_handshaked()) {
            debug!(dropped = relay.len(), "no live session for ui requests");
        }

        self.scheduler.reap();

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if let Err(reason) = self.scheduler.service(conn, &relay, now) {
                self.close_inner(id, reason);
                outcome.closed.push((id, reason));
            }
        }

        self.scheduler.report(self.connections.values(), now);

        outcome.keep_running = !self.connections.is_empty();
        if !outcome.keep_running && self.slice_running {
            debug!("no connections left; slice idle");
            self.slice_running = false;
            self.scheduler.reset_stats();
        }
        self.publish();
        outcome
    }

    /// Close every connection and join the capture pipeline. Blocks.
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_inner(id, CloseReason::Requested);
        }
        self.scheduler.shutdown();
        self.slice_running = false;
        self.publish();
    }

    // ── Internals ────────────────────────────────────────────────

    fn apply_peer_event(
        &mut self,
        id: ConnectionId,
        event: PeerEvent,
        now: Instant,
    ) -> Result<(), CloseReason> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        match event {
            PeerEvent::HandshakeComplete => {
                conn.state.complete_handshake(now).map_err(|e| {
                    warn!(conn = %id, "unexpected handshake: {e}");
                    CloseReason::Protocol
                })?;
                info!(conn = %id, "handshake complete");
                self.notify(UiEvent::Notice {
                    conn: id,
                    notice: ConnectionNotice::Finished,
                });
            }
            PeerEvent::ProbeAck(seq) => match conn.state.record_ack(seq, now) {
                Some(rtt) => trace!(conn = %id, seq, ?rtt, "rtt sample"),
                None => debug!(conn = %id, seq, "ignoring ack for unknown probe"),
            },
            PeerEvent::Capabilities(caps) => {
                conn.state.set_capabilities(caps);
                debug!(conn = %id, ?caps, "peer capabilities");
                self.notify(UiEvent::Capabilities { conn: id, caps });
            }
            PeerEvent::Explorer(update) => {
                self.notify(UiEvent::Explorer { conn: id, update });
            }
            PeerEvent::SuppressOutput(suppressed) => {
                debug!(conn = %id, suppressed, "output suppression changed");
                conn.state.set_output_suppressed(suppressed);
            }
            PeerEvent::Goodbye => return Err(CloseReason::PeerGoodbye),
        }
        Ok(())
    }

    fn close_inner(&mut self, id: ConnectionId, reason: CloseReason) -> Option<ConnectionSnapshot> {
        let mut conn = self.connections.remove(&id)?;
        conn.state.force_close(reason);
        conn.transport.close();
        self.scheduler.release(id);
        info!(
            conn = %id,
            %reason,
            frames = conn.state.frames_sent(),
            bytes = conn.state.bytes_sent(),
            "connection closed"
        );
        self.notify(UiEvent::Notice {
            conn: id,
            notice: ConnectionNotice::Closed,
        });
        Some(conn.state.snapshot())
    }

    fn notify(&self, event: UiEvent) {
        if !self.surfaces.deliver(event) {
            trace!("no active surface; ui event dropped");
        }
    }

    fn publish(&self) {
        let snapshots = self.connections.values().map(|c| c.state.snapshot()).collect();
        *lock_table(&self.table) = snapshots;
    }
}

fn lock_table(table: &Mutex<Vec<ConnectionSnapshot>>) -> MutexGuard<'_, Vec<ConnectionSnapshot>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

// ── SessionHandle ────────────────────────────────────────────────

/// UI-thread view of the server. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    table: ConnectionTable,
    requests: Arc<Mailbox<SessionRequest>>,
    surfaces: SurfaceRegistry<UiEvent>,
}

impl SessionHandle {
    /// Snapshot of every connection as of the last session-thread update.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        lock_table(&self.table).clone()
    }

    /// Whether any viewer has finished its handshake.
    pub fn is_connected(&self) -> bool {
        lock_table(&self.table).iter().any(|c| c.phase.is_handshaked())
    }

    /// Whether the connected viewer accepts dragged files.
    pub fn support_drag_copy(&self) -> bool {
        lock_table(&self.table)
            .iter()
            .any(|c| c.phase.is_handshaked() && c.capabilities.contains(CapabilitySet::DROP_COPY))
    }

    /// Queue a local explorer event for every viewer. Returns `false`
    /// (and drops it) when no viewer is connected.
    pub fn push_explorer_update(&self, update: ExplorerUpdate) -> bool {
        self.post_if_connected(SessionRequest::Explorer(update))
    }

    pub fn clipboard_updated(&self, text: impl Into<String>) -> bool {
        self.post_if_connected(SessionRequest::Clipboard(ClipboardPayload::Text(text.into())))
    }

    pub fn files_copied(&self, paths: Vec<PathBuf>) -> bool {
        self.post_if_connected(SessionRequest::Clipboard(ClipboardPayload::Files(paths)))
    }

    /// Ask the host to re-address a network interface. Always queued;
    /// it does not depend on a viewer.
    pub fn request_ip_reconfigure(&self, request: IpReconfigure) {
        self.requests.post(SessionRequest::ReconfigureIp(request));
    }

    /// Register the surface that should receive session events.
    pub fn register_surface(&self) -> SurfaceHandle<UiEvent> {
        self.surfaces.register()
    }

    /// Requests not yet picked up by the session thread.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    fn post_if_connected(&self, request: SessionRequest) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.requests.post(request);
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────
