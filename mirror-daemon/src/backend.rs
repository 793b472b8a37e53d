//! Synthetic capture source.
//!
//! Stands in for a hardware encoder on hosts without one: renders a
//! moving test pattern at the configured rate, compresses it with zstd
//! and reports it through the same [`EncoderBackend`] contract a real
//! encoder would. A configuration payload is announced after every
//! (re)configuration and projection change, and every GOP starts with a
//! sync frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use mirror_core::{
    BackendError, BufferFlags, EncoderBackend, EncoderConfig, Orientation, OutputUnit, PollOutcome,
};

use crate::config::CaptureConfig;

/// Magic prefix of the configuration payload.
pub const CONFIG_MAGIC: &[u8; 4] = b"MRRC";

/// One pattern byte per block of this many pixels along each axis.
const BLOCK: u32 = 8;

// ── OrientationDial ──────────────────────────────────────────────

/// Shared, externally settable display orientation.
#[derive(Debug, Clone, Default)]
pub struct OrientationDial(Arc<AtomicU32>);

impl OrientationDial {
    pub fn get(&self) -> Orientation {
        Orientation::try_from(self.0.load(Ordering::SeqCst)).unwrap_or_default()
    }

    pub fn set(&self, orientation: Orientation) {
        self.0.store(orientation.degrees(), Ordering::SeqCst);
    }

    /// Turn a quarter clockwise; returns the new orientation.
    pub fn rotate(&self) -> Orientation {
        let next = match self.get() {
            Orientation::Deg0 => Orientation::Deg90,
            Orientation::Deg90 => Orientation::Deg180,
            Orientation::Deg180 => Orientation::Deg270,
            Orientation::Deg270 => Orientation::Deg0,
        };
        self.set(next);
        next
    }
}

// ── SyntheticBackend ─────────────────────────────────────────────

pub struct SyntheticBackend {
    config: Option<EncoderConfig>,
    gop_secs: u32,
    compression_level: i32,
    max_dimension: u32,
    dial: OrientationDial,
    projection: Orientation,
    frame_index: u64,
    next_due: Option<Instant>,
    announce: bool,
    force_sync: bool,
    drop_input: bool,
    frame_limit: Option<u64>,
    epoch: Instant,
}

impl SyntheticBackend {
    pub fn new(capture: &CaptureConfig, dial: OrientationDial) -> Self {
        Self {
            config: None,
            gop_secs: capture.gop_secs.max(1),
            compression_level: capture.compression_level,
            max_dimension: capture.max_dimension.max(16),
            projection: dial.get(),
            dial,
            frame_index: 0,
            next_due: None,
            announce: false,
            force_sync: false,
            drop_input: false,
            frame_limit: None,
            epoch: Instant::now(),
        }
    }

    /// End the stream after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Frames between sync frames.
    fn gop_frames(&self, config: &EncoderConfig) -> u64 {
        u64::from(config.framerate.max(1)) * u64::from(self.gop_secs)
    }

    /// Geometry after projection.
    fn output_size(&self, config: &EncoderConfig) -> (u32, u32) {
        if self.projection.is_rotated() {
            (config.height, config.width)
        } else {
            (config.width, config.height)
        }
    }

    fn config_payload(&self, config: &EncoderConfig) -> Bytes {
        let (width, height) = self.output_size(config);
        let mut buf = BytesMut::with_capacity(20);
        buf.put_slice(CONFIG_MAGIC);
        buf.put_u32_le(width);
        buf.put_u32_le(height);
        buf.put_u32_le(config.framerate);
        buf.put_u32_le(config.bitrate_bps);
        buf.freeze()
    }

    fn render(&self, index: u64, config: &EncoderConfig) -> Result<Bytes, String> {
        let (width, height) = self.output_size(config);
        let cols = (width / BLOCK).max(1) as usize;
        let rows = (height / BLOCK).max(1) as usize;
        let shift = index as usize;
        let mut raw = Vec::with_capacity(cols * rows);
        for y in 0..rows {
            for x in 0..cols {
                raw.push(((x + y + shift) & 0xff) as u8);
            }
        }
        zstd::encode_all(raw.as_slice(), self.compression_level)
            .map(Bytes::from)
            .map_err(|e| format!("zstd encode failed: {e}"))
    }

    /// Sleep until the next frame is due, at most `timeout`.
    /// Returns `false` if it is still not due.
    fn wait_for_slot(&mut self, config: &EncoderConfig, timeout: Duration) -> bool {
        let interval = Duration::from_secs(1) / config.framerate.max(1);
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return false;
            }
            std::thread::sleep(wait);
        }
        // Never accumulate a burst after a stall.
        self.next_due = Some((due + interval).max(Instant::now()));
        true
    }
}

impl EncoderBackend for SyntheticBackend {
    fn configure(&mut self, config: &EncoderConfig) -> Result<(), BackendError> {
        if config.width == 0 || config.height == 0 {
            return Err("empty geometry".into());
        }
        if config.width > self.max_dimension || config.height > self.max_dimension {
            return Err(BackendError(format!(
                "{}x{} exceeds the {} pixel limit",
                config.width, config.height, self.max_dimension
            )));
        }
        info!(
            width = config.width,
            height = config.height,
            fps = config.framerate,
            "synthetic capture configured"
        );
        self.config = Some(*config);
        self.next_due = None;
        self.announce = true;
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> PollOutcome {
        let Some(config) = self.config else {
            return PollOutcome::Fatal("encoder not configured".into());
        };
        if self.announce {
            self.announce = false;
            self.force_sync = true;
            return PollOutcome::FormatChanged(self.config_payload(&config));
        }
        if self.frame_limit.is_some_and(|limit| self.frame_index >= limit) {
            return PollOutcome::Data(OutputUnit {
                data: Bytes::new(),
                pts_us: 0,
                flags: BufferFlags::END_OF_STREAM,
            });
        }
        if !self.wait_for_slot(&config, timeout) {
            return PollOutcome::TryAgain;
        }
        if self.drop_input {
            return PollOutcome::TryAgain;
        }

        let index = self.frame_index;
        let sync = self.force_sync || index % self.gop_frames(&config) == 0;
        let data = match self.render(index, &config) {
            Ok(data) => data,
            Err(e) => return PollOutcome::Fatal(e),
        };
        self.frame_index += 1;
        self.force_sync = false;
        PollOutcome::Data(OutputUnit {
            data,
            pts_us: self.epoch.elapsed().as_micros() as u64,
            flags: if sync {
                BufferFlags::SYNC_FRAME
            } else {
                BufferFlags::empty()
            },
        })
    }

    fn set_drop_input_frames(&mut self, drop: bool) {
        debug!(drop, "synthetic capture input gate");
        self.drop_input = drop;
    }

    fn orientation(&mut self) -> Orientation {
        self.dial.get()
    }

    fn apply_projection(&mut self, orientation: Orientation) -> Result<(), BackendError> {
        self.projection = orientation;
        self.announce = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        debug!(frames = self.frame_index, "synthetic capture stopped");
        self.config = None;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    fn backend() -> SyntheticBackend {
        let capture = CaptureConfig {
            framerate: 60,
            ..CaptureConfig::default()
        };
        SyntheticBackend::new(&capture, OrientationDial::default())
    }

    fn config() -> EncoderConfig {
        EncoderConfig {
            framerate: 60,
            ..EncoderConfig::default()
        }
    }

    fn next_data(b: &mut SyntheticBackend) -> OutputUnit {
        for _ in 0..50 {
            if let PollOutcome::Data(unit) = b.poll(WAIT) {
                return unit;
            }
        }
        panic!("no frame produced");
    }

    #[test]
    fn unconfigured_poll_is_fatal() {
        assert!(matches!(backend().poll(WAIT), PollOutcome::Fatal(_)));
    }

    #[test]
    fn oversize_geometry_refused() {
        let mut b = backend();
        let big = EncoderConfig {
            width: 8192,
            height: 4320,
            ..config()
        };
        assert!(b.configure(&big).is_err());
        assert!(b.configure(&big.fallback()).is_ok());
    }

    #[test]
    fn announces_config_then_sync_frame() {
        let mut b = backend();
        b.configure(&config()).unwrap();
        match b.poll(WAIT) {
            PollOutcome::FormatChanged(payload) => {
                assert_eq!(&payload[..4], CONFIG_MAGIC);
                assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 1280);
                assert_eq!(u32::from_le_bytes(payload[8..12].try_into().unwrap()), 720);
            }
            other => panic!("expected format change, got {other:?}"),
        }
        let first = next_data(&mut b);
        assert!(first.flags.contains(BufferFlags::SYNC_FRAME));
        let second = next_data(&mut b);
        assert!(!second.flags.contains(BufferFlags::SYNC_FRAME));
        let decoded = zstd::decode_all(&second.data[..]).unwrap();
        assert_eq!(decoded.len(), (1280 / 8) * (720 / 8));
    }

    #[test]
    fn gop_boundary_is_sync() {
        let capture = CaptureConfig {
            framerate: 60,
            ..CaptureConfig::default()
        };
        let mut b = SyntheticBackend::new(&capture, OrientationDial::default());
        b.configure(&config()).unwrap();
        let _ = b.poll(WAIT);
        let syncs: Vec<bool> = (0..61)
            .map(|_| next_data(&mut b).flags.contains(BufferFlags::SYNC_FRAME))
            .collect();
        assert!(syncs[0]);
        assert!(syncs[1..60].iter().all(|s| !s));
        assert!(syncs[60]);
    }

    #[test]
    fn projection_swaps_geometry_and_reannounces() {
        let dial = OrientationDial::default();
        let mut b = SyntheticBackend::new(&CaptureConfig::default(), dial.clone());
        b.configure(&config()).unwrap();
        let _ = b.poll(WAIT);
        let _ = next_data(&mut b);

        assert_eq!(dial.rotate(), Orientation::Deg90);
        assert_eq!(b.orientation(), Orientation::Deg90);
        b.apply_projection(Orientation::Deg90).unwrap();
        match b.poll(WAIT) {
            PollOutcome::FormatChanged(payload) => {
                assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 720);
                assert_eq!(u32::from_le_bytes(payload[8..12].try_into().unwrap()), 1280);
            }
            other => panic!("expected format change, got {other:?}"),
        }
        assert!(next_data(&mut b).flags.contains(BufferFlags::SYNC_FRAME));
    }

    #[test]
    fn dropped_input_yields_no_frames() {
        let mut b = backend();
        b.configure(&config()).unwrap();
        let _ = b.poll(WAIT);
        b.set_drop_input_frames(true);
        for _ in 0..5 {
            assert_eq!(b.poll(WAIT), PollOutcome::TryAgain);
        }
        b.set_drop_input_frames(false);
        let _ = next_data(&mut b);
    }

    #[test]
    fn frame_limit_ends_stream() {
        let mut b = backend().with_frame_limit(2);
        b.configure(&config()).unwrap();
        let _ = b.poll(WAIT);
        let _ = next_data(&mut b);
        let _ = next_data(&mut b);
        let end = next_data(&mut b);
        assert!(end.flags.contains(BufferFlags::END_OF_STREAM));
    }

    #[test]
    fn short_timeout_reports_try_again() {
        let capture = CaptureConfig {
            framerate: 1,
            ..CaptureConfig::default()
        };
        let mut b = SyntheticBackend::new(&capture, OrientationDial::default());
        b.configure(&EncoderConfig {
            framerate: 1,
            ..EncoderConfig::default()
        })
        .unwrap();
        let _ = b.poll(WAIT);
        let _ = next_data(&mut b);
        assert_eq!(b.poll(Duration::from_millis(5)), PollOutcome::TryAgain);
    }

    #[test]
    fn dial_rotates_full_circle() {
        let dial = OrientationDial::default();
        let seen: Vec<_> = (0..4).map(|_| dial.rotate()).collect();
        assert_eq!(
            seen,
            [
                Orientation::Deg90,
                Orientation::Deg180,
                Orientation::Deg270,
                Orientation::Deg0
            ]
        );
    }
}
