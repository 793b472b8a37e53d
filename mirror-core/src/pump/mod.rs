//! Frame encoder pump.
//!
//! Drives an [`EncoderBackend`] on a dedicated worker thread and
//! appends every produced [`EncodedFrame`] to the shared
//! [`EncodedFrameQueue`].
//!
//! ```text
//!  session thread                      pump thread
//!  ┌──────────────┐  set_paused()   ┌────────────────────────────┐
//!  │ scheduler    │ ──────────────► │ apply drop-input toggle    │
//!  │              │                 │ check orientation          │
//!  │              │  stop()/cancel  │ poll(250 ms)               │
//!  │              │ ──────────────► │  DATA → EncodedFrame ──┐   │
//!  │   pop() ◄────┼─────────────────┼────────── queue ◄──────┘   │
//!  └──────────────┘                 └────────────────────────────┘
//! ```
//!
//! Cancellation is cooperative: the token is only observed at the top
//! of an iteration, never in the middle of a dequeue wait.

pub mod backend;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BackendError, MirrorError, PumpError};
use crate::frame::{BufferFlags, EncodedFrame, Orientation};
use crate::queue::EncodedFrameQueue;

pub use backend::{EncoderBackend, EncoderConfig, OutputUnit, PollOutcome};

/// Bounded wait for one encoder dequeue.
pub const PUMP_POLL_TIMEOUT: Duration = Duration::from_millis(250);

// ── PumpControl ──────────────────────────────────────────────────

/// State shared between the pump thread and its controller.
#[derive(Debug)]
pub struct PumpControl {
    cancel: CancellationToken,
    paused: AtomicBool,
    pause_dirty: AtomicBool,
    started: AtomicBool,
    orientation: AtomicU32,
    window_frames: AtomicU64,
    window_bytes: AtomicU64,
    total_frames: AtomicU64,
    max_frame_bytes: AtomicUsize,
}

/// Production counters for one statistics window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpWindow {
    pub frames: u64,
    pub bytes: u64,
}

impl PumpControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            paused: AtomicBool::new(false),
            pause_dirty: AtomicBool::new(false),
            started: AtomicBool::new(false),
            orientation: AtomicU32::new(Orientation::Deg0.degrees()),
            window_frames: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
            total_frames: AtomicU64::new(0),
            max_frame_bytes: AtomicUsize::new(0),
        }
    }

    /// Request a pause state. Returns `false` if it was already in effect.
    pub fn set_paused(&self, paused: bool) -> bool {
        if self.paused.swap(paused, Ordering::AcqRel) == paused {
            return false;
        }
        self.pause_dirty.store(true, Ordering::Release);
        true
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Consume a pending pause change, if any.
    fn take_pause_change(&self) -> Option<bool> {
        if self.pause_dirty.swap(false, Ordering::AcqRel) {
            Some(self.is_paused())
        } else {
            None
        }
    }

    /// Whether the encoder was configured and the loop is producing.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Orientation most recently observed by the pump.
    pub fn orientation(&self) -> Orientation {
        Orientation::try_from(self.orientation.load(Ordering::Acquire)).unwrap_or_default()
    }

    fn set_orientation(&self, orientation: Orientation) {
        self.orientation
            .store(orientation.degrees(), Ordering::Release);
    }

    fn record_frame(&self, bytes: usize) {
        self.window_frames.fetch_add(1, Ordering::Relaxed);
        self.window_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        self.max_frame_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Read and reset the current statistics window.
    pub fn take_window(&self) -> PumpWindow {
        PumpWindow {
            frames: self.window_frames.swap(0, Ordering::Relaxed),
            bytes: self.window_bytes.swap(0, Ordering::Relaxed),
        }
    }

    /// Frames produced since the pump started.
    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    /// Largest single frame produced so far.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes.load(Ordering::Relaxed)
    }
}

// ── FrameEncoderPump ─────────────────────────────────────────────

/// Why a pump loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The controller cancelled it.
    Cancelled,
    /// The encoder signalled end of stream.
    EndOfStream,
}

/// Encoder loop state. Lives entirely on the pump thread.
pub struct FrameEncoderPump<B: EncoderBackend> {
    backend: B,
    config: EncoderConfig,
    queue: Arc<EncodedFrameQueue>,
    control: Arc<PumpControl>,
    /// Configuration payload waiting for the next sync frame.
    pending_config: Option<Bytes>,
    orientation: Orientation,
    next_sequence: u64,
    epoch: Instant,
    poll_timeout: Duration,
}

impl<B: EncoderBackend> FrameEncoderPump<B> {
    /// Configure the backend at `requested`, retrying once at the 720p
    /// fallback before giving up.
    pub fn start(
        mut backend: B,
        requested: EncoderConfig,
        queue: Arc<EncodedFrameQueue>,
        control: Arc<PumpControl>,
    ) -> Result<Self, PumpError> {
        let config = match backend.configure(&requested) {
            Ok(()) => requested,
            Err(e) if !requested.is_fallback() => {
                let fallback = requested.fallback();
                warn!(
                    "encoder refused {}x{} ({e}); retrying at {}x{}",
                    requested.width, requested.height, fallback.width, fallback.height
                );
                backend
                    .configure(&fallback)
                    .map_err(|e| PumpError::Configure {
                        width: fallback.width,
                        height: fallback.height,
                        reason: e.0,
                    })?;
                fallback
            }
            Err(e) => {
                return Err(PumpError::Configure {
                    width: requested.width,
                    height: requested.height,
                    reason: e.0,
                });
            }
        };

        let orientation = backend.orientation();
        control.set_orientation(orientation);
        control.mark_started();
        info!(
            width = config.width,
            height = config.height,
            fps = config.framerate,
            bitrate = config.bitrate_bps,
            %orientation,
            "encoder started"
        );

        Ok(Self {
            backend,
            config,
            queue,
            control,
            pending_config: None,
            orientation,
            next_sequence: 0,
            epoch: Instant::now(),
            poll_timeout: PUMP_POLL_TIMEOUT,
        })
    }

    /// Override the bounded dequeue wait.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Configuration actually in effect (may be the fallback).
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Run until cancelled, end of stream, or a fatal fault.
    pub fn run(&mut self) -> Result<PumpExit, PumpError> {
        let result = self.run_loop();
        self.backend.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<PumpExit, PumpError> {
        while !self.control.is_cancelled() {
            if let Some(drop) = self.control.take_pause_change() {
                debug!(drop, "toggling drop-input-frames");
                self.backend.set_drop_input_frames(drop);
            }

            self.check_orientation();

            match self.backend.poll(self.poll_timeout) {
                PollOutcome::Data(unit) => {
                    if self.handle_unit(unit) {
                        info!("encoder signalled end of stream");
                        return Ok(PumpExit::EndOfStream);
                    }
                }
                PollOutcome::FormatChanged(config) => {
                    debug!(bytes = config.len(), "encoder format changed");
                    self.pending_config = Some(config);
                }
                PollOutcome::BuffersChanged => {
                    debug!("encoder buffers changed");
                    self.backend
                        .refresh_buffers()
                        .map_err(|BackendError(e)| PumpError::Buffers(e))?;
                }
                PollOutcome::TryAgain => {}
                PollOutcome::Fatal(reason) => return Err(PumpError::Dequeue(reason)),
            }
        }
        Ok(PumpExit::Cancelled)
    }

    /// Returns `true` when the unit ends the stream.
    fn handle_unit(&mut self, unit: OutputUnit) -> bool {
        let eos = unit.flags.contains(BufferFlags::END_OF_STREAM);

        if unit.flags.contains(BufferFlags::CODEC_CONFIG) {
            if !unit.data.is_empty() {
                self.pending_config = Some(unit.data);
            }
            return eos;
        }

        if !unit.data.is_empty() {
            let frame = self.build_frame(unit);
            self.control.record_frame(frame.size());
            self.queue.push(frame);
        }
        eos
    }

    fn build_frame(&mut self, unit: OutputUnit) -> EncodedFrame {
        let sync = unit.flags.contains(BufferFlags::SYNC_FRAME);
        let payload = match self.pending_config.take() {
            Some(config) if sync => {
                let mut buf = BytesMut::with_capacity(config.len() + unit.data.len());
                buf.extend_from_slice(&config);
                buf.extend_from_slice(&unit.data);
                buf.freeze()
            }
            // Not a sync frame: keep the payload for the next one.
            pending => {
                self.pending_config = pending;
                unit.data
            }
        };

        let pts_us = if unit.pts_us == 0 {
            self.epoch.elapsed().as_micros() as u64
        } else {
            unit.pts_us
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        EncodedFrame {
            sequence,
            payload,
            pts_us,
            sync,
            orientation: self.orientation,
        }
    }

    fn check_orientation(&mut self) {
        let current = self.backend.orientation();
        if current == self.orientation {
            return;
        }
        info!(from = %self.orientation, to = %current, "display orientation changed");
        if let Err(e) = self.backend.apply_projection(current) {
            warn!("failed to re-apply projection for {current}: {e}");
        }
        self.orientation = current;
        self.control.set_orientation(current);
    }
}

// ── PumpHandle ───────────────────────────────────────────────────

/// Owner-side handle to a pump running on its own thread.
///
/// Dropping the handle cancels the pump but does not wait for it.
#[derive(Debug)]
pub struct PumpHandle {
    control: Arc<PumpControl>,
    thread: Option<JoinHandle<Result<PumpExit, PumpError>>>,
}

impl PumpHandle {
    /// Spawn a pump with the default dequeue wait.
    pub fn spawn<B>(
        backend: B,
        config: EncoderConfig,
        queue: Arc<EncodedFrameQueue>,
    ) -> Result<Self, MirrorError>
    where
        B: EncoderBackend + 'static,
    {
        Self::spawn_with(backend, config, queue, PUMP_POLL_TIMEOUT)
    }

    /// Spawn a pump. The encoder is configured on the worker thread, so
    /// configuration failures surface through [`join`](Self::join) and
    /// [`is_started`](Self::is_started) stays `false`.
    pub fn spawn_with<B>(
        backend: B,
        config: EncoderConfig,
        queue: Arc<EncodedFrameQueue>,
        poll_timeout: Duration,
    ) -> Result<Self, MirrorError>
    where
        B: EncoderBackend + 'static,
    {
        let control = Arc::new(PumpControl::new(CancellationToken::new()));
        let worker_control = Arc::clone(&control);

        let thread = std::thread::Builder::new()
            .name("frame-pump".into())
            .spawn(move || {
                let mut pump = match FrameEncoderPump::start(backend, config, queue, worker_control) {
                    Ok(pump) => pump.with_poll_timeout(poll_timeout),
                    Err(e) => {
                        error!("frame pump setup failed: {e}");
                        return Err(e);
                    }
                };
                let result = pump.run();
                match &result {
                    Ok(exit) => info!(?exit, "frame pump stopped"),
                    Err(e) => error!("frame pump failed: {e}"),
                }
                result
            })?;

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    pub fn control(&self) -> &Arc<PumpControl> {
        &self.control
    }

    pub fn is_started(&self) -> bool {
        self.control.is_started()
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Request a pause state; see [`PumpControl::set_paused`].
    pub fn set_paused(&self, paused: bool) -> bool {
        self.control.set_paused(paused)
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Signal the pump to stop at the top of its next iteration.
    pub fn stop(&self) {
        self.control.cancel();
    }

    /// Wait for the worker thread and return how it ended.
    pub fn join(mut self) -> Result<PumpExit, PumpError> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or(Err(PumpError::Panicked)),
            None => Ok(PumpExit::Cancelled),
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.control.cancel();
        }
    }
}

// ── CaptureLauncher ──────────────────────────────────────────────

/// How the scheduler starts a pump for a newly ready connection.
pub trait CaptureLauncher: Send {
    fn launch(&mut self, queue: Arc<EncodedFrameQueue>) -> Result<PumpHandle, MirrorError>;
}

/// Launcher that builds a fresh backend per capture session.
pub struct BackendLauncher<F, B> {
    config: EncoderConfig,
    factory: F,
    poll_timeout: Duration,
    _backend: PhantomData<fn() -> B>,
}

impl<F, B> BackendLauncher<F, B>
where
    F: FnMut() -> Result<B, BackendError> + Send,
    B: EncoderBackend + 'static,
{
    pub fn new(config: EncoderConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            poll_timeout: PUMP_POLL_TIMEOUT,
            _backend: PhantomData,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

impl<F, B> CaptureLauncher for BackendLauncher<F, B>
where
    F: FnMut() -> Result<B, BackendError> + Send,
    B: EncoderBackend + 'static,
{
    fn launch(&mut self, queue: Arc<EncodedFrameQueue>) -> Result<PumpHandle, MirrorError> {
        let backend = (self.factory)()
            .map_err(|e| MirrorError::Other(format!("capture backend unavailable: {e}")))?;
        PumpHandle::spawn_with(backend, self.config, queue, self.poll_timeout)
    }
}

// ── Tests ────────────────────────────────────────────────────────
