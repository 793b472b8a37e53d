//! Connection to the local network-configuration daemon.
//!
//! The bridge itself lives in `mirror-core`; this module opens the
//! socket and runs the line reader that feeds replies back into it.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use mirror_core::{AddressChange, Broadcast, LineRoute, NetConfigBridge};

use crate::error::DaemonError;

pub type NetBridge = NetConfigBridge<Box<dyn Write + Send>>;

/// Build a bridge over an already-connected byte stream pair and start
/// its reader thread.
pub fn attach<R>(
    reader: R,
    writer: Box<dyn Write + Send>,
    timeout: Duration,
) -> Result<Arc<NetBridge>, DaemonError>
where
    R: Read + Send + 'static,
{
    let bridge = Arc::new(NetConfigBridge::new(writer).with_timeout(timeout));
    bridge.set_broadcast_listener(|broadcast| debug!(?broadcast, "netcfg broadcast"));

    let feed = Arc::clone(&bridge);
    std::thread::Builder::new()
        .name("netcfg-reader".into())
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) => {
                        if let LineRoute::Unmatched(seq) = feed.on_line(&line) {
                            debug!(seq, "netcfg reply without a waiter");
                        }
                    }
                    Err(e) => {
                        warn!("netcfg socket read error: {e}");
                        break;
                    }
                }
            }
            debug!("netcfg reader stopped");
        })?;
    Ok(bridge)
}

/// Send interface address changes to `changes`; other broadcasts are
/// only logged.
pub fn forward_address_changes(
    bridge: &NetBridge,
    changes: mpsc::UnboundedSender<AddressChange>,
) {
    bridge.set_broadcast_listener(move |broadcast| match broadcast {
        Broadcast::Address(change) => {
            debug!(
                iface = %change.iface,
                address = %change.address,
                removed = change.removed,
                "interface address changed"
            );
            let _ = changes.send(change.clone());
        }
        Broadcast::Other(words) => debug!(event = ?words, "netcfg broadcast"),
    });
}

/// Connect to the daemon listening on the local socket at `path`.
#[cfg(unix)]
pub fn connect(path: &Path, timeout: Duration) -> Result<Arc<NetBridge>, DaemonError> {
    let stream = std::os::unix::net::UnixStream::connect(path)?;
    let writer = stream.try_clone()?;
    attach(stream, Box::new(writer), timeout)
}

#[cfg(not(unix))]
pub fn connect(_path: &Path, _timeout: Duration) -> Result<Arc<NetBridge>, DaemonError> {
    Err(DaemonError::Unsupported("netcfg sockets require a unix host"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::os::unix::net::UnixStream;

    /// Answer every request with a canned reply, like the real daemon.
    fn serve(stream: UnixStream) {
        let mut out = stream.try_clone().unwrap();
        std::thread::spawn(move || {
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                let mut words = line.split_whitespace();
                let seq = words.next().unwrap_or("0").to_string();
                let reply = match words.collect::<Vec<_>>().as_slice() {
                    ["launcher", "netid", iface] => format!("200 {seq} {iface} 100"),
                    ["interface", "getcfg", _] => {
                        format!("200 {seq} 00:11:22:33:44:55 10.0.0.5 24 up")
                    }
                    _ => format!("200 {seq} ok"),
                };
                if writeln!(out, "{reply}").is_err() {
                    break;
                }
            }
        });
    }

    fn bridge() -> Arc<NetBridge> {
        let (ours, theirs) = UnixStream::pair().unwrap();
        serve(theirs);
        let writer = ours.try_clone().unwrap();
        attach(ours, Box::new(writer), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn request_gets_keyed_reply() {
        let bridge = bridge();
        let reply = bridge.request("launcher broadcast enable").unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.text, "ok");
    }

    #[test]
    fn reconfigure_reports_previous_address() {
        let bridge = bridge();
        let previous = bridge
            .reconfigure(&mirror_core::IpReconfigure {
                iface: "eth0".into(),
                address: Ipv4Addr::new(192, 168, 7, 2),
                prefix_len: 24,
                gateway: Ipv4Addr::new(192, 168, 7, 1),
            })
            .unwrap();
        assert_eq!(previous, Some(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let missing = Path::new("/nonexistent/netcfg.sock");
        assert!(matches!(
            connect(missing, Duration::from_millis(100)),
            Err(DaemonError::Io(_))
        ));
    }

    #[test]
    fn address_changes_are_forwarded() {
        let bridge = bridge();
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_address_changes(&bridge, tx);

        bridge.on_line("600 Iface linkstate eth0 up");
        bridge.on_line("614 Address removed 10.0.0.5/24 eth0 128 0");
        let change = rx.try_recv().unwrap();
        assert_eq!(change.iface, "eth0");
        assert_eq!(change.address, Ipv4Addr::new(10, 0, 0, 5));
        assert!(change.removed);
        assert!(rx.try_recv().is_err());
    }
}
