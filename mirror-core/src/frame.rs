//! Encoded frame types shared between the pump, the queue and the
//! session scheduler.
//!
//! An [`EncodedFrame`] is produced once by the pump and never mutated
//! afterwards; ownership moves queue → scheduler → transport.

use std::fmt;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

// ── Orientation ──────────────────────────────────────────────────

/// Display orientation reported by the capture backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    /// Rotation in degrees.
    pub const fn degrees(self) -> u32 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 90,
            Orientation::Deg180 => 180,
            Orientation::Deg270 => 270,
        }
    }

    /// Whether width and height are swapped relative to the panel.
    pub const fn is_rotated(self) -> bool {
        matches!(self, Orientation::Deg90 | Orientation::Deg270)
    }
}

impl TryFrom<u32> for Orientation {
    type Error = MirrorError;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Orientation::Deg0),
            90 => Ok(Orientation::Deg90),
            180 => Ok(Orientation::Deg180),
            270 => Ok(Orientation::Deg270),
            _ => Err(MirrorError::UnknownVariant {
                type_name: "Orientation",
                value: degrees as u64,
            }),
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

// ── BufferFlags ──────────────────────────────────────────────────

bitflags! {
    /// Flags attached to a unit dequeued from the encoder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Self-contained frame; decoding can restart here.
        const SYNC_FRAME = 0x1;
        /// In-band stream configuration, not picture data.
        const CODEC_CONFIG = 0x2;
        /// Last unit of the stream.
        const END_OF_STREAM = 0x4;
    }
}

// ── EncodedFrame ─────────────────────────────────────────────────

/// One compressed frame ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Production order, assigned by the pump starting at 0.
    pub sequence: u64,
    /// Compressed bytes. For sync frames this already includes any
    /// pending configuration payload.
    pub payload: Bytes,
    /// Presentation timestamp in microseconds.
    pub pts_us: u64,
    /// Whether this is a sync frame (keyframe).
    pub sync: bool,
    /// Display orientation at capture time.
    pub orientation: Orientation,
}

impl EncodedFrame {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_from_degrees() {
        assert_eq!(Orientation::try_from(90).unwrap(), Orientation::Deg90);
        assert_eq!(Orientation::try_from(270).unwrap().degrees(), 270);
        assert!(Orientation::try_from(45).is_err());
    }

    #[test]
    fn rotated_orientations() {
        assert!(!Orientation::Deg0.is_rotated());
        assert!(Orientation::Deg90.is_rotated());
        assert!(!Orientation::Deg180.is_rotated());
        assert!(Orientation::Deg270.is_rotated());
    }

    #[test]
    fn frame_size_is_payload_len() {
        let frame = EncodedFrame {
            sequence: 0,
            payload: Bytes::from_static(b"abcd"),
            pts_us: 0,
            sync: false,
            orientation: Orientation::Deg0,
        };
        assert_eq!(frame.size(), 4);
    }
}
