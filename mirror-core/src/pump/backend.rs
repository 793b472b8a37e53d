//! The encoder backend seam.
//!
//! Platform capture and hardware encoding live behind
//! [`EncoderBackend`]; the pump only sees configure / poll / toggle
//! calls and classified poll results.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::frame::{BufferFlags, Orientation};

/// Geometry used when the requested resolution is refused (720p).
pub const FALLBACK_WIDTH: u32 = 1280;
pub const FALLBACK_HEIGHT: u32 = 720;

// ── EncoderConfig ────────────────────────────────────────────────

/// Encoder and virtual-display parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second fed to the encoder.
    pub framerate: u32,
    /// Target bitrate in bits per second.
    pub bitrate_bps: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: FALLBACK_WIDTH,
            height: FALLBACK_HEIGHT,
            framerate: 30,
            bitrate_bps: 4_000_000,
        }
    }
}

impl EncoderConfig {
    /// The 720p fallback, keeping the requested aspect's orientation
    /// (portrait requests get 720x1280).
    pub fn fallback(&self) -> Self {
        let portrait = self.height > self.width;
        let (width, height) = if portrait {
            (FALLBACK_HEIGHT, FALLBACK_WIDTH)
        } else {
            (FALLBACK_WIDTH, FALLBACK_HEIGHT)
        };
        Self {
            width,
            height,
            ..*self
        }
    }

    /// Whether this already is the fallback geometry.
    pub fn is_fallback(&self) -> bool {
        let fb = self.fallback();
        self.width == fb.width && self.height == fb.height
    }
}

// ── Poll results ─────────────────────────────────────────────────

/// One unit of encoder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputUnit {
    pub data: Bytes,
    /// Presentation timestamp in microseconds; 0 means "not provided".
    pub pts_us: u64,
    pub flags: BufferFlags,
}

/// Classified result of one bounded encoder dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// An output unit is ready.
    Data(OutputUnit),
    /// Output format changed; carries the in-band configuration payload
    /// that must precede the next sync frame.
    FormatChanged(Bytes),
    /// Output buffer handles must be refreshed.
    BuffersChanged,
    /// Nothing ready within the wait.
    TryAgain,
    /// Unrecoverable dequeue fault.
    Fatal(String),
}

// ── EncoderBackend ───────────────────────────────────────────────

/// Capture + encode collaborator driven by the pump thread.
pub trait EncoderBackend: Send {
    /// Configure the encoder and virtual display, then start encoding.
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), BackendError>;

    /// Dequeue one output unit, waiting at most `timeout`.
    fn poll(&mut self, timeout: Duration) -> PollOutcome;

    /// Toggle dropping of input frames. The pipeline stays alive, so
    /// resuming is cheap.
    fn set_drop_input_frames(&mut self, drop: bool);

    /// Current display orientation.
    fn orientation(&mut self) -> Orientation;

    /// Re-apply output region and rotation after an orientation change.
    fn apply_projection(&mut self, orientation: Orientation) -> Result<(), BackendError>;

    /// Re-acquire output buffer handles.
    fn refresh_buffers(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Release encoder resources. Called once when the pump exits.
    fn shutdown(&mut self) {}
}

impl<B: EncoderBackend + ?Sized> EncoderBackend for Box<B> {
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), BackendError> {
        (**self).configure(config)
    }

    fn poll(&mut self, timeout: Duration) -> PollOutcome {
        (**self).poll(timeout)
    }

    fn set_drop_input_frames(&mut self, drop: bool) {
        (**self).set_drop_input_frames(drop)
    }

    fn orientation(&mut self) -> Orientation {
        (**self).orientation()
    }

    fn apply_projection(&mut self, orientation: Orientation) -> Result<(), BackendError> {
        (**self).apply_projection(orientation)
    }

    fn refresh_buffers(&mut self) -> Result<(), BackendError> {
        (**self).refresh_buffers()
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}
