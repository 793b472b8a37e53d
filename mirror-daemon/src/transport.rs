//! TCP implementation of the session transport.
//!
//! Each accepted socket is split in two. The write half is owned by a
//! writer task fed through an unbounded channel, so sends from the
//! session loop never block; the backlog counter covers bytes handed to
//! that channel and not yet written. The read half is owned by a
//! [`PeerReader`] task that forwards raw reads to the session loop,
//! where [`SessionTransport::ingest`] decodes them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use mirror_core::{
    ClipboardPayload, ConnectionId, EncodedFrame, ExplorerUpdate, MirrorError, Orientation,
    PeerEvent, SessionTransport,
};

use crate::wire::{DaemonMessage, Hello, MirrorCodec, PROTOCOL_VERSION, Packet, ViewerMessage, Welcome};

const READ_CHUNK: usize = 16 * 1024;

// ── Inbound ──────────────────────────────────────────────────────

/// What a reader task reports to the session loop.
#[derive(Debug)]
pub enum Inbound {
    Data { id: ConnectionId, bytes: Bytes },
    /// Orderly end of stream.
    Eof { id: ConnectionId },
    Failed { id: ConnectionId, error: std::io::Error },
}

impl Inbound {
    pub fn id(&self) -> ConnectionId {
        match self {
            Inbound::Data { id, .. } | Inbound::Eof { id } | Inbound::Failed { id, .. } => *id,
        }
    }
}

// ── TcpSessionTransport ──────────────────────────────────────────

pub struct TcpSessionTransport {
    peer: SocketAddr,
    codec: MirrorCodec,
    inbound: BytesMut,
    outbound: Option<mpsc::UnboundedSender<Packet>>,
    backlog: Arc<AtomicUsize>,
    alert_threshold: usize,
    viewer: Option<String>,
    reader_cancel: CancellationToken,
}

impl TcpSessionTransport {
    /// Split `stream`, spawn its writer task and return the transport
    /// together with the not-yet-started reader.
    pub fn split(stream: TcpStream, alert_threshold: usize) -> std::io::Result<(Self, PeerReader)> {
        let peer = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {e}");
        }
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        tokio::spawn(write_loop(write_half, rx, Arc::clone(&backlog), peer));

        let reader_cancel = CancellationToken::new();
        let reader = PeerReader {
            half: read_half,
            peer,
            cancel: reader_cancel.clone(),
        };
        let transport = Self {
            peer,
            codec: MirrorCodec,
            inbound: BytesMut::new(),
            outbound: Some(tx),
            backlog,
            alert_threshold,
            viewer: None,
            reader_cancel,
        };
        Ok((transport, reader))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Name the viewer gave in its hello, once received.
    pub fn viewer(&self) -> Option<&str> {
        self.viewer.as_deref()
    }

    fn enqueue(&mut self, message: DaemonMessage) -> Result<(), MirrorError> {
        let packet = message.to_packet()?;
        let tx = self.outbound.as_ref().ok_or(MirrorError::ChannelClosed)?;
        let len = packet.wire_len();
        self.backlog.fetch_add(len, Ordering::SeqCst);
        if tx.send(packet).is_err() {
            self.backlog.fetch_sub(len, Ordering::SeqCst);
            return Err(MirrorError::ChannelClosed);
        }
        Ok(())
    }

    fn on_hello(&mut self, hello: Hello) -> Result<PeerEvent, MirrorError> {
        if self.viewer.is_some() {
            return Err(MirrorError::ProtocolViolation("duplicate hello"));
        }
        if hello.version != PROTOCOL_VERSION {
            warn!(peer = %self.peer, version = hello.version, "unsupported viewer protocol");
            return Err(MirrorError::ProtocolViolation("unsupported protocol version"));
        }
        debug!(peer = %self.peer, viewer = %hello.viewer, "viewer hello");
        self.viewer = Some(hello.viewer);
        self.enqueue(DaemonMessage::Welcome(Welcome {
            version: PROTOCOL_VERSION,
            server: format!("mirrord/{}", env!("CARGO_PKG_VERSION")),
        }))?;
        Ok(PeerEvent::HandshakeComplete)
    }
}

impl SessionTransport for TcpSessionTransport {
    fn ingest(&mut self, bytes: &[u8]) -> Result<Vec<PeerEvent>, MirrorError> {
        self.inbound.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(packet) = self.codec.decode(&mut self.inbound)? {
            let message = ViewerMessage::from_packet(&packet)?;
            trace!(peer = %self.peer, kind = ?packet.kind(), "viewer packet");
            let event = match message {
                ViewerMessage::Hello(hello) => self.on_hello(hello)?,
                _ if self.viewer.is_none() => {
                    return Err(MirrorError::ProtocolViolation("message before hello"));
                }
                ViewerMessage::ProbeAck(seq) => PeerEvent::ProbeAck(seq),
                ViewerMessage::Capabilities(caps) => PeerEvent::Capabilities(caps),
                ViewerMessage::Explorer(update) => PeerEvent::Explorer(update),
                ViewerMessage::SuppressOutput(on) => PeerEvent::SuppressOutput(on),
                ViewerMessage::Goodbye => PeerEvent::Goodbye,
            };
            events.push(event);
        }
        Ok(events)
    }

    fn write_backlog_bytes(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    fn alert_threshold(&self) -> usize {
        self.alert_threshold
    }

    fn send_frame(&mut self, frame: EncodedFrame) -> Result<(), MirrorError> {
        self.enqueue(DaemonMessage::Frame(frame.into()))
    }

    fn send_probe(&mut self, seq: u16) -> Result<(), MirrorError> {
        self.enqueue(DaemonMessage::Probe(seq))
    }

    fn send_orientation_change(
        &mut self,
        from: Orientation,
        to: Orientation,
    ) -> Result<(), MirrorError> {
        self.enqueue(DaemonMessage::Orientation { from, to })
    }

    fn send_control_event(&mut self, update: &ExplorerUpdate) -> Result<(), MirrorError> {
        self.enqueue(DaemonMessage::Explorer(*update))
    }

    fn send_clipboard(&mut self, payload: &ClipboardPayload) -> Result<(), MirrorError> {
        self.enqueue(DaemonMessage::Clipboard(payload.clone()))
    }

    fn close(&mut self) {
        self.reader_cancel.cancel();
        if self.outbound.is_some() {
            // Best effort; the writer drains then shuts the socket down.
            let _ = self.enqueue(DaemonMessage::Goodbye);
            self.outbound = None;
        }
    }
}

impl Drop for TcpSessionTransport {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

async fn write_loop(
    half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    backlog: Arc<AtomicUsize>,
    peer: SocketAddr,
) {
    let mut sink = FramedWrite::new(half, MirrorCodec);
    while let Some(packet) = rx.recv().await {
        let len = packet.wire_len();
        let result = sink.send(packet).await;
        backlog.fetch_sub(len, Ordering::SeqCst);
        if let Err(e) = result {
            warn!(%peer, "write error: {e}");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(%peer, "shutdown error: {e}");
    }
}

// ── PeerReader ───────────────────────────────────────────────────

/// Read half of an accepted socket, started once the connection has
/// an id.
pub struct PeerReader {
    half: OwnedReadHalf,
    peer: SocketAddr,
    cancel: CancellationToken,
}

impl PeerReader {
    pub fn spawn(self, id: ConnectionId, events: mpsc::UnboundedSender<Inbound>) -> JoinHandle<()> {
        tokio::spawn(self.read_loop(id, events))
    }

    async fn read_loop(mut self, id: ConnectionId, events: mpsc::UnboundedSender<Inbound>) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = self.half.read_buf(&mut buf) => r,
            };
            let message = match read {
                Ok(0) => {
                    debug!(conn = %id, peer = %self.peer, "end of stream");
                    Inbound::Eof { id }
                }
                Ok(_) => Inbound::Data {
                    id,
                    bytes: buf.split().freeze(),
                },
                Err(error) => Inbound::Failed { id, error },
            };
            let last = !matches!(message, Inbound::Data { .. });
            if events.send(message).is_err() || last {
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
