//! Viewer wire protocol.
//!
//! Every packet is a fixed header followed by a bincode payload:
//!
//! ```text
//! magic:     [u8; 4]  "MRR0"
//! kind:      u8
//! length:    u32 LE   (payload bytes)
//! checksum:  u32 LE   (first 4 bytes of blake3(payload), 0 if empty)
//! payload:   [u8]
//! ```
//!
//! [`MirrorCodec`] frames packets on a byte stream; [`ViewerMessage`]
//! and [`DaemonMessage`] are the typed payloads in each direction.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use mirror_core::{CapabilitySet, ClipboardPayload, EncodedFrame, ExplorerUpdate, Orientation};

use crate::error::DaemonError;

// ── Constants ────────────────────────────────────────────────────

pub const MAGIC: [u8; 4] = *b"MRR0";
pub const HEADER_LENGTH: usize = 13;
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
pub const PROTOCOL_VERSION: u32 = 1;

// ── PacketKind ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Hello = 0x01,
    Welcome = 0x02,
    Frame = 0x10,
    Orientation = 0x11,
    Probe = 0x20,
    ProbeAck = 0x21,
    Capabilities = 0x30,
    Explorer = 0x31,
    Clipboard = 0x32,
    SuppressOutput = 0x33,
    Goodbye = 0x3f,
}

impl TryFrom<u8> for PacketKind {
    type Error = DaemonError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Hello,
            0x02 => Self::Welcome,
            0x10 => Self::Frame,
            0x11 => Self::Orientation,
            0x20 => Self::Probe,
            0x21 => Self::ProbeAck,
            0x30 => Self::Capabilities,
            0x31 => Self::Explorer,
            0x32 => Self::Clipboard,
            0x33 => Self::SuppressOutput,
            0x3f => Self::Goodbye,
            other => return Err(DaemonError::UnknownKind(other)),
        })
    }
}

// ── Packet ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: Bytes) -> Result<Self, DaemonError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(DaemonError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self { kind, payload })
    }

    pub fn empty(kind: PacketKind) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Build a packet with a bincode-encoded body.
    pub fn encode<T: Serialize>(kind: PacketKind, body: &T) -> Result<Self, DaemonError> {
        Self::new(kind, Bytes::from(bincode::serialize(body)?))
    }

    /// Decode the bincode body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DaemonError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Bytes this packet occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }
}

/// Payload checksum carried in the header.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let hash = blake3::hash(payload);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

// ── MirrorCodec ──────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct MirrorCodec;

impl tokio_util::codec::Decoder for MirrorCodec {
    type Item = Packet;
    type Error = DaemonError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Reject garbage as soon as the magic is readable.
        let seen = src.len().min(MAGIC.len());
        if src[..seen] != MAGIC[..seen] {
            return Err(DaemonError::InvalidMagic);
        }
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let kind = src[4];
        let length = u32::from_le_bytes([src[5], src[6], src[7], src[8]]) as usize;
        let expected = u32::from_le_bytes([src[9], src[10], src[11], src[12]]);
        if length > MAX_PAYLOAD_SIZE {
            return Err(DaemonError::PayloadTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if src.len() < HEADER_LENGTH + length {
            src.reserve(HEADER_LENGTH + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LENGTH);
        let payload = src.split_to(length).freeze();
        if checksum(&payload) != expected {
            return Err(DaemonError::ChecksumMismatch);
        }
        Ok(Some(Packet {
            kind: PacketKind::try_from(kind)?,
            payload,
        }))
    }
}

impl tokio_util::codec::Encoder<Packet> for MirrorCodec {
    type Error = DaemonError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.wire_len());
        dst.put_slice(&MAGIC);
        dst.put_u8(item.kind as u8);
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_u32_le(checksum(&item.payload));
        dst.put_slice(&item.payload);
        Ok(())
    }
}

// ── Messages ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    /// Free-form viewer name, for the logs.
    pub viewer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub version: u32,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub sequence: u64,
    pub pts_us: u64,
    pub sync: bool,
    pub orientation: Orientation,
    pub data: Bytes,
}

impl From<EncodedFrame> for FrameMessage {
    fn from(frame: EncodedFrame) -> Self {
        Self {
            sequence: frame.sequence,
            pts_us: frame.pts_us,
            sync: frame.sync,
            orientation: frame.orientation,
            data: frame.payload,
        }
    }
}

/// Viewer → daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerMessage {
    Hello(Hello),
    ProbeAck(u16),
    Capabilities(CapabilitySet),
    Explorer(ExplorerUpdate),
    SuppressOutput(bool),
    Goodbye,
}

impl ViewerMessage {
    pub fn to_packet(&self) -> Result<Packet, DaemonError> {
        match self {
            Self::Hello(hello) => Packet::encode(PacketKind::Hello, hello),
            Self::ProbeAck(seq) => Packet::encode(PacketKind::ProbeAck, seq),
            Self::Capabilities(caps) => Packet::encode(PacketKind::Capabilities, caps),
            Self::Explorer(update) => Packet::encode(PacketKind::Explorer, update),
            Self::SuppressOutput(on) => Packet::encode(PacketKind::SuppressOutput, on),
            Self::Goodbye => Ok(Packet::empty(PacketKind::Goodbye)),
        }
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, DaemonError> {
        Ok(match packet.kind() {
            PacketKind::Hello => Self::Hello(packet.decode()?),
            PacketKind::ProbeAck => Self::ProbeAck(packet.decode()?),
            PacketKind::Capabilities => Self::Capabilities(packet.decode()?),
            PacketKind::Explorer => Self::Explorer(packet.decode()?),
            PacketKind::SuppressOutput => Self::SuppressOutput(packet.decode()?),
            PacketKind::Goodbye => Self::Goodbye,
            _ => return Err(DaemonError::ProtocolViolation("daemon packet sent by viewer")),
        })
    }
}

/// Daemon → viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    Welcome(Welcome),
    Frame(FrameMessage),
    Orientation { from: Orientation, to: Orientation },
    Probe(u16),
    Explorer(ExplorerUpdate),
    Clipboard(ClipboardPayload),
    Goodbye,
}

impl DaemonMessage {
    pub fn to_packet(&self) -> Result<Packet, DaemonError> {
        match self {
            Self::Welcome(welcome) => Packet::encode(PacketKind::Welcome, welcome),
            Self::Frame(frame) => Packet::encode(PacketKind::Frame, frame),
            Self::Orientation { from, to } => Packet::encode(PacketKind::Orientation, &(from, to)),
            Self::Probe(seq) => Packet::encode(PacketKind::Probe, seq),
            Self::Explorer(update) => Packet::encode(PacketKind::Explorer, update),
            Self::Clipboard(payload) => Packet::encode(PacketKind::Clipboard, payload),
            Self::Goodbye => Ok(Packet::empty(PacketKind::Goodbye)),
        }
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, DaemonError> {
        Ok(match packet.kind() {
            PacketKind::Welcome => Self::Welcome(packet.decode()?),
            PacketKind::Frame => Self::Frame(packet.decode()?),
            PacketKind::Orientation => {
                let (from, to): (Orientation, Orientation) = packet.decode()?;
                Self::Orientation { from, to }
            }
            PacketKind::Probe => Self::Probe(packet.decode()?),
            PacketKind::Explorer => Self::Explorer(packet.decode()?),
            PacketKind::Clipboard => Self::Clipboard(packet.decode()?),
            PacketKind::Goodbye => Self::Goodbye,
            _ => return Err(DaemonError::ProtocolViolation("viewer packet sent by daemon")),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::ExplorerCode;
    use tokio_util::codec::{Decoder, Encoder};

    fn encoded(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        MirrorCodec.encode(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn header_layout() {
        let packet = ViewerMessage::ProbeAck(7).to_packet().unwrap();
        let body = packet.payload().clone();
        let buf = encoded(packet);
        assert_eq!(&buf[..4], b"MRR0");
        assert_eq!(buf[4], PacketKind::ProbeAck as u8);
        assert_eq!(u32::from_le_bytes(buf[5..9].try_into().unwrap()) as usize, body.len());
        assert_eq!(u32::from_le_bytes(buf[9..13].try_into().unwrap()), checksum(&body));
        assert_eq!(buf.len(), HEADER_LENGTH + body.len());
    }

    #[test]
    fn empty_payload_has_zero_checksum() {
        let buf = encoded(Packet::empty(PacketKind::Goodbye));
        assert_eq!(buf.len(), HEADER_LENGTH);
        assert_eq!(&buf[9..13], &[0, 0, 0, 0]);
    }

    #[test]
    fn decode_waits_for_a_full_packet() {
        let full = encoded(
            ViewerMessage::Hello(Hello {
                version: PROTOCOL_VERSION,
                viewer: "test".into(),
            })
            .to_packet()
            .unwrap(),
        );
        let mut codec = MirrorCodec;
        let mut src = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            src.put_u8(*byte);
            let out = codec.decode(&mut src).unwrap();
            if i + 1 < full.len() {
                assert!(out.is_none(), "decoded early at byte {i}");
            } else {
                let packet = out.unwrap();
                assert_eq!(packet.kind(), PacketKind::Hello);
                assert!(src.is_empty());
            }
        }
    }

    #[test]
    fn two_packets_in_one_read() {
        let mut src = encoded(ViewerMessage::SuppressOutput(true).to_packet().unwrap());
        src.extend_from_slice(&encoded(Packet::empty(PacketKind::Goodbye)));
        let mut codec = MirrorCodec;
        let first = codec.decode(&mut src).unwrap().unwrap();
        let second = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(
            ViewerMessage::from_packet(&first).unwrap(),
            ViewerMessage::SuppressOutput(true)
        );
        assert_eq!(second.kind(), PacketKind::Goodbye);
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn bad_magic_rejected_early() {
        let mut src = BytesMut::from(&b"MRX"[..]);
        assert!(matches!(MirrorCodec.decode(&mut src), Err(DaemonError::InvalidMagic)));

        let mut partial = BytesMut::from(&b"MR"[..]);
        assert!(MirrorCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_rejected() {
        let mut buf = encoded(
            ViewerMessage::Explorer(ExplorerUpdate::with_args(ExplorerCode::StartDrag, 1, 2, 3))
                .to_packet()
                .unwrap(),
        );
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(MirrorCodec.decode(&mut buf), Err(DaemonError::ChecksumMismatch)));
    }

    #[test]
    fn oversize_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(PacketKind::Frame as u8);
        buf.put_u32_le((MAX_PAYLOAD_SIZE + 1) as u32);
        buf.put_u32_le(0);
        assert!(matches!(
            MirrorCodec.decode(&mut buf),
            Err(DaemonError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(0x7e);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        assert!(matches!(MirrorCodec.decode(&mut buf), Err(DaemonError::UnknownKind(0x7e))));
    }

    #[test]
    fn frame_message_keeps_payload() {
        let frame = EncodedFrame {
            sequence: 9,
            payload: Bytes::from_static(b"IDR"),
            pts_us: 33_000,
            sync: true,
            orientation: Orientation::Deg90,
        };
        let packet = DaemonMessage::Frame(frame.into()).to_packet().unwrap();
        let mut buf = encoded(packet);
        let decoded = MirrorCodec.decode(&mut buf).unwrap().unwrap();
        match DaemonMessage::from_packet(&decoded).unwrap() {
            DaemonMessage::Frame(msg) => {
                assert_eq!(msg.sequence, 9);
                assert!(msg.sync);
                assert_eq!(msg.orientation, Orientation::Deg90);
                assert_eq!(&msg.data[..], b"IDR");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn direction_is_enforced() {
        let probe = DaemonMessage::Probe(1).to_packet().unwrap();
        assert!(matches!(
            ViewerMessage::from_packet(&probe),
            Err(DaemonError::ProtocolViolation(_))
        ));
        let hello = ViewerMessage::Hello(Hello {
            version: 1,
            viewer: String::new(),
        })
        .to_packet()
        .unwrap();
        assert!(DaemonMessage::from_packet(&hello).is_err());
    }
}
