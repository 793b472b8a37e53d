//! # mirror-core
//!
//! Session control plane for mirroring the local screen to a remote
//! viewer.
//!
//! This crate contains:
//! - **Frame pump**: `FrameEncoderPump` drives an `EncoderBackend` on its
//!   own thread and fills the `EncodedFrameQueue`
//! - **Backpressure**: `Watermarks` hysteresis for pausing the pump
//! - **Sessions**: `ConnectionState` lifecycle, the `SessionScheduler`
//!   slice tick, and `SessionServer` with its UI-side `SessionHandle`
//! - **Mailbox**: `Mailbox` and the `SurfaceRegistry` for session → UI
//!   delivery
//! - **Netcfg**: `NetConfigBridge`, the keyed request/response bridge to
//!   the network-configuration daemon
//! - **Error**: `MirrorError` / `PumpError`, `thiserror`-based
//!
//! Nothing here spawns an async runtime. The host decides what the
//! session thread is and calls the server's entry points from it.

pub mod error;
pub mod events;
pub mod frame;
pub mod mailbox;
pub mod netcfg;
pub mod pump;
pub mod queue;
pub mod session;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use error::{BackendError, MirrorError, PumpError};
pub use events::{
    CapabilitySet, ClipboardPayload, ConnectionNotice, ExplorerCode, ExplorerUpdate,
    IpReconfigure, SessionRequest, UiEvent,
};
pub use frame::{BufferFlags, EncodedFrame, Orientation};
pub use mailbox::{Mailbox, SurfaceHandle, SurfaceId, SurfaceRegistry};
pub use netcfg::{AddressChange, Broadcast, LineRoute, NetConfigBridge, NetResponse};
pub use pump::{
    BackendLauncher, CaptureLauncher, EncoderBackend, EncoderConfig, FrameEncoderPump,
    OutputUnit, PollOutcome, PumpControl, PumpExit, PumpHandle, PumpWindow,
};
pub use queue::{EncodedFrameQueue, PumpCommand, Watermarks};
pub use session::scheduler::SessionScheduler;
pub use session::{
    Accepted, CloseReason, ConnectionId, ConnectionPhase, ConnectionSnapshot, ConnectionState,
    PeerEvent, SessionConfig, SessionHandle, SessionServer, SessionTransport, SliceOutcome,
};
