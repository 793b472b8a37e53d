//! Headless UI surface.
//!
//! Registers itself as the active surface and logs whatever the
//! session layer delivers. It runs on its own thread, the way a real
//! UI thread would.

use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use mirror_core::{CapabilitySet, ConnectionNotice, SessionHandle, UiEvent};

const DRAIN_WAIT: Duration = Duration::from_millis(250);

pub struct ConsoleSurface {
    handle: SessionHandle,
}

impl ConsoleSurface {
    pub fn new(handle: SessionHandle) -> Self {
        Self { handle }
    }

    /// Start the surface thread; it unregisters when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("console-surface".into())
            .spawn(move || {
                let surface = self.handle.register_surface();
                info!(surface = %surface.id(), "console surface active");
                while !cancel.is_cancelled() {
                    for event in surface.drain_timeout(DRAIN_WAIT) {
                        info!("{}", describe(&event));
                    }
                }
            })
    }
}

/// One log line for `event`.
pub fn describe(event: &UiEvent) -> String {
    match event {
        UiEvent::Notice {
            conn,
            notice: ConnectionNotice::Finished,
        } => format!("viewer {conn} connected"),
        UiEvent::Notice {
            conn,
            notice: ConnectionNotice::Closed,
        } => format!("viewer {conn} disconnected"),
        UiEvent::Capabilities { conn, caps } => {
            let drag = if caps.contains(CapabilitySet::DROP_COPY) {
                "supports"
            } else {
                "does not support"
            };
            format!("viewer {conn} {drag} drag copy")
        }
        UiEvent::Explorer { conn, update } => match update.position() {
            Some((x, y)) => format!("viewer {conn} explorer {} at {x},{y}", update.code),
            None => format!("viewer {conn} explorer {}", update.code),
        },
    }
}
