//! Daemon service loop.
//!
//! One task owns the [`SessionServer`] and is therefore the session
//! thread: it accepts sockets, feeds reads into the server, runs the
//! slice tick while the server asks for it and carries out IP
//! reconfiguration requests the tick hands back.
//!
//! The listener follows the host's addressing: it is rebound after a
//! reconfigure and whenever the address it is bound to disappears and
//! comes back. A failed bind keeps the sessions running and is retried.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mirror_core::{
    AddressChange, BackendError, BackendLauncher, CloseReason, ConnectionId, IpReconfigure,
    MirrorError, SessionHandle, SessionRequest, SessionServer, SurfaceRegistry,
};

use crate::backend::{OrientationDial, SyntheticBackend};
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::netcfg::{self, NetBridge};
use crate::transport::{Inbound, TcpSessionTransport};

type BackendFactory = Box<dyn FnMut() -> Result<SyntheticBackend, BackendError> + Send>;
pub type DaemonLauncher = BackendLauncher<BackendFactory, SyntheticBackend>;
pub type DaemonServer = SessionServer<TcpSessionTransport, DaemonLauncher>;

type NetcfgResult = (IpReconfigure, Result<Option<Ipv4Addr>, MirrorError>);

/// Delay between attempts to bind a listener that could not be rebound.
pub const REBIND_RETRY: Duration = Duration::from_secs(1);

// ── MirrorService ────────────────────────────────────────────────

pub struct MirrorService {
    config: DaemonConfig,
    server: DaemonServer,
    dial: OrientationDial,
    cancel: CancellationToken,
    netcfg: Option<Arc<NetBridge>>,
}

impl MirrorService {
    pub fn new(config: DaemonConfig) -> Self {
        let dial = OrientationDial::default();
        let capture = config.capture.clone();
        let factory_dial = dial.clone();
        let factory: BackendFactory =
            Box::new(move || Ok(SyntheticBackend::new(&capture, factory_dial.clone())));
        let launcher = BackendLauncher::new(config.to_encoder_config(), factory);
        let server = SessionServer::new(config.to_session_config(), launcher, SurfaceRegistry::new());
        Self {
            config,
            server,
            dial,
            cancel: CancellationToken::new(),
            netcfg: None,
        }
    }

    /// Use an existing bridge instead of connecting to the configured
    /// socket.
    pub fn with_netcfg(mut self, bridge: Arc<NetBridge>) -> Self {
        self.netcfg = Some(bridge);
        self
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// UI-side handle to the session server.
    pub fn session_handle(&self) -> SessionHandle {
        self.server.handle()
    }

    pub fn orientation_dial(&self) -> OrientationDial {
        self.dial.clone()
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(self) -> Result<(), DaemonError> {
        let addr = self.config.listen_addr()?;
        let listener = bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve viewers on `listener` until the stop handle is cancelled.
    pub async fn serve(mut self, listener: TcpListener) -> Result<(), DaemonError> {
        if self.netcfg.is_none() && self.config.netcfg.enabled {
            match netcfg::connect(&self.config.netcfg.socket, self.config.netcfg_timeout()) {
                Ok(bridge) => self.netcfg = Some(bridge),
                Err(e) => warn!(
                    "netcfg unavailable at {}: {e}",
                    self.config.netcfg.socket.display()
                ),
            }
        }
        self.spawn_rotator();

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let (netcfg_tx, mut netcfg_rx) = mpsc::unbounded_channel::<NetcfgResult>();
        let (address_tx, mut address_rx) = mpsc::unbounded_channel::<AddressChange>();
        if let Some(bridge) = &self.netcfg {
            netcfg::forward_address_changes(bridge, address_tx.clone());
        }
        let slice = self.server.config().slice_interval;
        let mut bind_addr = listener.local_addr()?;
        let mut listener = Some(listener);
        let mut next_tick: Option<Instant> = None;
        let mut rebind_at: Option<Instant> = None;

        loop {
            let deadline = next_tick.unwrap_or_else(Instant::now);
            let retry = rebind_at.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                accepted = accept_next(listener.as_ref()) => match accepted {
                    Ok((stream, _)) => {
                        if self.on_accept(stream, &inbound_tx) && next_tick.is_none() {
                            next_tick = Some(Instant::now() + slice);
                        }
                    }
                    Err(e) => warn!("accept error: {e}"),
                },

                Some(inbound) = inbound_rx.recv() => self.on_inbound(inbound),

                _ = tokio::time::sleep_until(deadline), if next_tick.is_some() => {
                    let outcome = self.server.tick(now());
                    for (id, reason) in &outcome.closed {
                        log_close(*id, *reason);
                    }
                    for request in outcome.deferred {
                        if let SessionRequest::ReconfigureIp(request) = request {
                            self.reconfigure(request, &netcfg_tx);
                        }
                    }
                    next_tick = outcome.keep_running.then(|| Instant::now() + slice);
                }

                _ = tokio::time::sleep_until(retry), if rebind_at.is_some() => {
                    listener = rebind(bind_addr).await;
                    rebind_at = listener.is_none().then(|| Instant::now() + REBIND_RETRY);
                }

                Some((request, result)) = netcfg_rx.recv() => match result {
                    Ok(previous) => {
                        bind_addr = rebind_target(bind_addr, &request, previous);
                        info!(
                            iface = %request.iface,
                            previous = ?previous,
                            address = %request.address,
                            listen = %bind_addr,
                            "ip reconfigured; rebinding listener"
                        );
                        drop(listener.take());
                        listener = rebind(bind_addr).await;
                        rebind_at = listener.is_none().then(|| Instant::now() + REBIND_RETRY);
                    }
                    Err(e) => warn!(iface = %request.iface, "ip reconfigure failed: {e}"),
                },

                Some(change) = address_rx.recv() => {
                    let ours = bind_addr.ip() == IpAddr::V4(change.address);
                    if ours && change.removed {
                        warn!(
                            iface = %change.iface,
                            address = %change.address,
                            "listening address removed; waiting for it to return"
                        );
                        drop(listener.take());
                        rebind_at = Some(Instant::now() + REBIND_RETRY);
                    } else if ours && listener.is_none() {
                        info!(
                            iface = %change.iface,
                            address = %change.address,
                            "listening address restored"
                        );
                        listener = rebind(bind_addr).await;
                        rebind_at = listener.is_none().then(|| Instant::now() + REBIND_RETRY);
                    } else if change.removed && bind_addr.ip().is_unspecified() {
                        info!(
                            iface = %change.iface,
                            address = %change.address,
                            "address removed; viewers reached through it will time out"
                        );
                    }
                }
            }
        }

        drop(address_tx);
        info!("stopping");
        self.server.shutdown();
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Returns whether the slice tick must be armed.
    fn on_accept(&mut self, stream: TcpStream, inbound: &mpsc::UnboundedSender<Inbound>) -> bool {
        let (transport, reader) =
            match TcpSessionTransport::split(stream, self.config.network.alert_threshold_bytes) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("dropping socket: {e}");
                    return false;
                }
            };
        let peer = transport.peer();
        match self.server.accept(transport, now()) {
            Ok(accepted) => {
                info!(conn = %accepted.id, %peer, "viewer connected");
                reader.spawn(accepted.id, inbound.clone());
                accepted.arm_tick
            }
            Err(e) => {
                warn!(%peer, "viewer rejected: {e}");
                false
            }
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        let id = inbound.id();
        let result = match inbound {
            Inbound::Data { bytes, .. } => self.server.on_receive(id, &bytes, now()),
            Inbound::Eof { .. } => self.server.close(id).map(|_| ()),
            Inbound::Failed { error, .. } => {
                warn!(conn = %id, "read error: {error}");
                self.server.fail(id).map(|_| ())
            }
        };
        // The server may have closed the connection first.
        if let Err(MirrorError::ConnectionNotFound(_)) = result {
            debug!(conn = %id, "input for a closed connection");
        }
    }

    /// Carry out an IP change on a blocking thread; the result comes
    /// back through `results`.
    fn reconfigure(&self, request: IpReconfigure, results: &mpsc::UnboundedSender<NetcfgResult>) {
        let Some(bridge) = self.netcfg.clone() else {
            warn!(iface = %request.iface, "no netcfg bridge; ip reconfigure dropped");
            return;
        };
        let results = results.clone();
        tokio::task::spawn_blocking(move || {
            let result = bridge.reconfigure(&request);
            let _ = results.send((request, result));
        });
    }

    fn spawn_rotator(&self) {
        let secs = self.config.capture.rotate_every_secs;
        if secs == 0 {
            return;
        }
        let dial = self.dial.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(secs);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let orientation = dial.rotate();
                        debug!(%orientation, "synthetic display rotated");
                    }
                }
            }
        });
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, DaemonError> {
    let listener = TcpListener::bind(addr).await?;
    info!("mirrord listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Bind `addr` again, logging a failure; `None` means retry later.
async fn rebind(addr: SocketAddr) -> Option<TcpListener> {
    match bind(addr).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!(%addr, "rebind failed, retrying in {REBIND_RETRY:?}: {e}");
            None
        }
    }
}

/// Where to listen after `request` was applied.
///
/// A listener on a wildcard address stays put. One bound to the
/// interface's previous address moves to the new one on the same port.
fn rebind_target(
    current: SocketAddr,
    request: &IpReconfigure,
    previous: Option<Ipv4Addr>,
) -> SocketAddr {
    match current {
        SocketAddr::V4(v4) if previous == Some(*v4.ip()) => {
            SocketAddr::from((request.address, v4.port()))
        }
        _ => current,
    }
}

/// Session-clock reading for the server entry points.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn accept_next(
    listener: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

fn log_close(id: ConnectionId, reason: CloseReason) {
    match reason {
        CloseReason::Requested | CloseReason::PeerGoodbye => {
            info!(conn = %id, %reason, "viewer disconnected")
        }
        _ => error!(conn = %id, %reason, "viewer dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> IpReconfigure {
        IpReconfigure {
            iface: "eth0".into(),
            address: Ipv4Addr::new(192, 168, 7, 2),
            prefix_len: 24,
            gateway: Ipv4Addr::new(192, 168, 7, 1),
        }
    }

    #[test]
    fn wildcard_listener_stays_put() {
        let current: SocketAddr = "0.0.0.0:7340".parse().unwrap();
        let previous = Some(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(rebind_target(current, &request(), previous), current);
    }

    #[test]
    fn listener_on_previous_address_follows_it() {
        let current: SocketAddr = "10.0.0.5:7340".parse().unwrap();
        let previous = Some(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(
            rebind_target(current, &request(), previous),
            "192.168.7.2:7340".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn listener_on_another_address_stays_put() {
        let current: SocketAddr = "127.0.0.1:7340".parse().unwrap();
        assert_eq!(
            rebind_target(current, &request(), Some(Ipv4Addr::new(10, 0, 0, 5))),
            current
        );
        assert_eq!(rebind_target(current, &request(), None), current);
    }
}
