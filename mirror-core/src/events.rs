//! Out-of-band UI events exchanged between the session thread and the
//! UI thread.
//!
//! Session → UI: [`UiEvent`] (connect/disconnect notices, peer
//! capabilities, remote explorer activity).
//! UI → session: [`SessionRequest`] (local explorer state, clipboard,
//! IP reconfiguration).

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;
use crate::session::ConnectionId;

// ── ExplorerCode ─────────────────────────────────────────────────

/// Remote-explorer event codes carried by [`ExplorerUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ExplorerCode {
    /// The explorer screen became visible.
    Shown = 1,
    /// The explorer screen was hidden or the app went to background.
    Hidden = 2,
    /// A drag started at `(args[0], args[1])`.
    StartDrag = 3,
    /// A drag ended at `(args[0], args[1])`.
    EndDrag = 4,
    /// Whether the clipboard can be pasted into the current folder.
    CanPaste = 5,
}

impl TryFrom<u32> for ExplorerCode {
    type Error = MirrorError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Shown),
            2 => Ok(Self::Hidden),
            3 => Ok(Self::StartDrag),
            4 => Ok(Self::EndDrag),
            5 => Ok(Self::CanPaste),
            _ => Err(MirrorError::UnknownVariant {
                type_name: "ExplorerCode",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for ExplorerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Shown => "shown",
            Self::Hidden => "hidden",
            Self::StartDrag => "start-drag",
            Self::EndDrag => "end-drag",
            Self::CanPaste => "can-paste",
        };
        f.write_str(name)
    }
}

/// An explorer event: a code plus up to three integer arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerUpdate {
    pub code: ExplorerCode,
    pub args: [i32; 3],
}

impl ExplorerUpdate {
    pub fn new(code: ExplorerCode) -> Self {
        Self { code, args: [0; 3] }
    }

    pub fn with_args(code: ExplorerCode, a: i32, b: i32, c: i32) -> Self {
        Self {
            code,
            args: [a, b, c],
        }
    }

    /// Drag coordinates for `StartDrag` / `EndDrag`.
    pub fn position(&self) -> Option<(i32, i32)> {
        match self.code {
            ExplorerCode::StartDrag | ExplorerCode::EndDrag => Some((self.args[0], self.args[1])),
            _ => None,
        }
    }
}

// ── CapabilitySet ────────────────────────────────────────────────

bitflags! {
    /// Features the remote viewer announced during the session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CapabilitySet: u32 {
        /// Files can be dragged from the device and copied by the viewer.
        const DROP_COPY = 0x1;
    }
}

// ── Session → UI ─────────────────────────────────────────────────

/// Lifecycle notice for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionNotice {
    /// The handshake finished; the session is live.
    Finished,
    /// The connection closed.
    Closed,
}

/// Event for the active UI surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Notice {
        conn: ConnectionId,
        notice: ConnectionNotice,
    },
    Capabilities {
        conn: ConnectionId,
        caps: CapabilitySet,
    },
    Explorer {
        conn: ConnectionId,
        update: ExplorerUpdate,
    },
}

// ── UI → session ─────────────────────────────────────────────────

/// Clipboard content offered to the remote viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipboardPayload {
    Text(String),
    /// Paths of files copied in the local explorer.
    Files(Vec<PathBuf>),
}

/// New static address for a local interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpReconfigure {
    pub iface: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

/// Request posted by the UI thread to the session thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Explorer(ExplorerUpdate),
    Clipboard(ClipboardPayload),
    /// Handed back to the host; the session layer never performs it.
    ReconfigureIp(IpReconfigure),
}
