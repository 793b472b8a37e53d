//! Frame queue between the pump thread and the session thread, plus
//! the watermark policy that throttles the pump.
//!
//! The queue is deliberately unbounded. Dropping an already-encoded
//! frame would break the decoder's reference chain, so growth is
//! bounded by pausing the encoder instead: once depth reaches the
//! HIGH watermark the pump is paused, and it only resumes after depth
//! falls to the LOW watermark.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::MirrorError;
use crate::frame::EncodedFrame;

// ── EncodedFrameQueue ────────────────────────────────────────────

/// Single-producer / single-consumer FIFO of encoded frames.
///
/// Insertion order is delivery order.
#[derive(Debug, Default)]
pub struct EncodedFrameQueue {
    frames: Mutex<VecDeque<EncodedFrame>>,
}

impl EncodedFrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame. Called only by the pump.
    pub fn push(&self, frame: EncodedFrame) {
        self.lock().push_back(frame);
    }

    /// Take the oldest frame. Called only by the scheduler.
    pub fn pop(&self) -> Option<EncodedFrame> {
        self.lock().pop_front()
    }

    /// Current depth, the backpressure signal.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discard every queued frame, returning how many were dropped.
    ///
    /// Only valid when the stream they belong to has ended.
    pub fn clear(&self) -> usize {
        let mut frames = self.lock();
        let n = frames.len();
        frames.clear();
        n
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EncodedFrame>> {
        // A poisoned queue still holds valid frames; keep going.
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Watermarks ───────────────────────────────────────────────────

/// Queue-depth thresholds for pausing and resuming the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Depth at which the pump is paused.
    pub high: usize,
    /// Depth at which a paused pump resumes.
    pub low: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self { high: 4, low: 1 }
    }
}

impl Watermarks {
    /// Build a validated pair; `low` must be strictly below `high`.
    pub fn new(high: usize, low: usize) -> Result<Self, MirrorError> {
        if low >= high {
            return Err(MirrorError::Other(format!(
                "low watermark {low} must be below high watermark {high}"
            )));
        }
        Ok(Self { high, low })
    }

    /// Decide whether the pump should change state.
    ///
    /// Returns a command only on a transition, so a steady depth never
    /// re-asserts pause or resume.
    pub fn evaluate(&self, depth: usize, paused: bool) -> Option<PumpCommand> {
        if depth >= self.high && !paused {
            Some(PumpCommand::Pause)
        } else if depth <= self.low && paused {
            Some(PumpCommand::Resume)
        } else {
            None
        }
    }
}

/// Pause/resume request derived from [`Watermarks::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpCommand {
    Pause,
    Resume,
}

// ── Tests ────────────────────────────────────────────────────────
