//! End-to-end tests: a real `MirrorService` on a loopback socket and a
//! minimal viewer speaking the wire protocol.

use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use mirror_core::{
    CapabilitySet, ConnectionNotice, ExplorerCode, ExplorerUpdate, IpReconfigure, Orientation,
    SessionHandle, UiEvent,
};
use mirror_daemon::DaemonError;
use mirror_daemon::backend::{CONFIG_MAGIC, OrientationDial};
use mirror_daemon::config::DaemonConfig;
use mirror_daemon::service::MirrorService;
use mirror_daemon::wire::{
    DaemonMessage, FrameMessage, Hello, MirrorCodec, PROTOCOL_VERSION, ViewerMessage, Welcome,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ──────────────────────────────────────────────────────

struct Daemon {
    addr: SocketAddr,
    stop: CancellationToken,
    handle: SessionHandle,
    dial: OrientationDial,
    task: JoinHandle<Result<(), DaemonError>>,
}

impl Daemon {
    async fn start(config: DaemonConfig) -> Self {
        Self::start_with(MirrorService::new(config)).await
    }

    async fn start_with(service: MirrorService) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = service.stop_handle();
        let handle = service.session_handle();
        let dial = service.orientation_dial();
        let task = tokio::spawn(service.serve(listener));
        Self {
            addr,
            stop,
            handle,
            dial,
            task,
        }
    }

    async fn stop(self) {
        self.stop.cancel();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("service did not stop")
            .unwrap()
            .unwrap();
    }
}

fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.capture.framerate = 30;
    config.capture.width = 320;
    config.capture.height = 240;
    config
}

struct Viewer {
    framed: Framed<TcpStream, MirrorCodec>,
}

impl Viewer {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, MirrorCodec),
        }
    }

    async fn send(&mut self, message: ViewerMessage) {
        self.framed.send(message.to_packet().unwrap()).await.unwrap();
    }

    /// Next message, or `None` once the daemon closed the socket.
    async fn recv(&mut self) -> Option<DaemonMessage> {
        let packet = tokio::time::timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for the daemon")?
            .ok()?;
        Some(DaemonMessage::from_packet(&packet).unwrap())
    }

    async fn hello(&mut self) -> Welcome {
        self.send(ViewerMessage::Hello(Hello {
            version: PROTOCOL_VERSION,
            viewer: "integration".into(),
        }))
        .await;
        match self.recv().await {
            Some(DaemonMessage::Welcome(welcome)) => welcome,
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    /// Skip to the first message `pick` accepts.
    async fn wait_for<T>(&mut self, mut pick: impl FnMut(DaemonMessage) -> Option<T>) -> T {
        loop {
            match self.recv().await {
                Some(message) => {
                    if let Some(found) = pick(message) {
                        return found;
                    }
                }
                None => panic!("daemon closed the connection"),
            }
        }
    }

    async fn next_frame(&mut self) -> FrameMessage {
        self.wait_for(|m| match m {
            DaemonMessage::Frame(frame) => Some(frame),
            _ => None,
        })
        .await
    }

    /// Read until the daemon's goodbye and the end of the stream.
    async fn expect_goodbye(&mut self) {
        let mut said_goodbye = false;
        while let Some(message) = self.recv().await {
            if message == DaemonMessage::Goodbye {
                said_goodbye = true;
            }
        }
        assert!(said_goodbye, "stream ended without a goodbye");
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(unix)]
type NetBridge = mirror_daemon::netcfg::NetBridge;

/// Stand-in for the network-configuration daemon: records commands,
/// answers each one, and can push broadcasts.
#[cfg(unix)]
struct FakeNetd {
    bridge: Arc<NetBridge>,
    commands: Arc<Mutex<Vec<String>>>,
    out: std::os::unix::net::UnixStream,
}

#[cfg(unix)]
impl FakeNetd {
    /// `address` is what `interface getcfg` reports.
    fn start(address: &str) -> Self {
        use std::os::unix::net::UnixStream;

        let (ours, theirs) = UnixStream::pair().unwrap();
        let commands = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&commands);
        let out = theirs.try_clone().unwrap();
        let mut replies = theirs.try_clone().unwrap();
        let address = address.to_string();
        std::thread::spawn(move || {
            for line in BufReader::new(theirs).lines() {
                let Ok(line) = line else { break };
                let (seq, command) = line.split_once(' ').unwrap();
                let reply = match command.split_whitespace().collect::<Vec<_>>().as_slice() {
                    ["launcher", "netid", iface] => format!("200 {seq} {iface} 100"),
                    ["interface", "getcfg", _] => format!("200 {seq} aa:bb {address} 24 up"),
                    _ => format!("200 {seq} ok"),
                };
                seen.lock().unwrap().push(command.to_string());
                if writeln!(replies, "{reply}").is_err() {
                    break;
                }
            }
        });
        let writer = ours.try_clone().unwrap();
        let bridge =
            mirror_daemon::netcfg::attach(ours, Box::new(writer), Duration::from_secs(2)).unwrap();
        Self {
            bridge,
            commands,
            out,
        }
    }

    fn broadcast(&mut self, line: &str) {
        writeln!(self.out, "{line}").unwrap();
    }

    fn finished(&self) -> bool {
        self.commands
            .lock()
            .unwrap()
            .last()
            .is_some_and(|c| c == "launcher broadcast enable")
    }
}

/// Keep connecting until a viewer is welcomed; false after ~2.5 s.
#[cfg(unix)]
async fn welcomed_eventually(addr: SocketAddr) -> bool {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            let mut again = Viewer {
                framed: Framed::new(stream, MirrorCodec),
            };
            let hello = ViewerMessage::Hello(Hello {
                version: PROTOCOL_VERSION,
                viewer: "after-rebind".into(),
            })
            .to_packet()
            .unwrap();
            if again.framed.send(hello).await.is_ok()
                && matches!(again.recv().await, Some(DaemonMessage::Welcome(_)))
            {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_then_frames() {
    let daemon = Daemon::start(test_config()).await;
    let mut viewer = Viewer::connect(daemon.addr).await;

    let welcome = viewer.hello().await;
    assert_eq!(welcome.version, PROTOCOL_VERSION);
    assert!(welcome.server.starts_with("mirrord/"));

    let first = viewer.next_frame().await;
    assert!(first.sync, "first frame must be a sync frame");
    assert!(first.data.starts_with(CONFIG_MAGIC), "config must precede the first frame");

    let second = viewer.next_frame().await;
    assert!(second.sequence > first.sequence);
    assert!(!second.data.starts_with(CONFIG_MAGIC));

    assert!(daemon.handle.is_connected());
    daemon.stop().await;
}

#[tokio::test]
async fn test_goodbye_closes_session() {
    let daemon = Daemon::start(test_config()).await;
    let mut viewer = Viewer::connect(daemon.addr).await;
    viewer.hello().await;
    viewer.send(ViewerMessage::Goodbye).await;
    viewer.expect_goodbye().await;

    let handle = daemon.handle.clone();
    eventually(|| !handle.is_connected()).await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_second_viewer_rejected() {
    let daemon = Daemon::start(test_config()).await;
    let mut first = Viewer::connect(daemon.addr).await;
    first.hello().await;

    let mut second = Viewer::connect(daemon.addr).await;
    second.expect_goodbye().await;

    // The first session is unaffected.
    first.next_frame().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_silent_viewer_times_out() {
    let mut config = test_config();
    config.session.handshake_timeout_secs = 1;
    let daemon = Daemon::start(config).await;

    let mut viewer = Viewer::connect(daemon.addr).await;
    viewer.expect_goodbye().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_garbage_is_a_protocol_fault() {
    use tokio::io::AsyncWriteExt;

    let daemon = Daemon::start(test_config()).await;
    let mut stream = TcpStream::connect(daemon.addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut viewer = Viewer {
        framed: Framed::new(stream, MirrorCodec),
    };
    viewer.expect_goodbye().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_probes_are_acknowledged() {
    let mut config = test_config();
    config.session.probe_interval_secs = 1;
    let daemon = Daemon::start(config).await;

    let mut viewer = Viewer::connect(daemon.addr).await;
    viewer.hello().await;
    let seq = viewer
        .wait_for(|m| match m {
            DaemonMessage::Probe(seq) => Some(seq),
            _ => None,
        })
        .await;
    viewer.send(ViewerMessage::ProbeAck(seq)).await;

    let handle = daemon.handle.clone();
    eventually(|| {
        handle
            .connections()
            .first()
            .is_some_and(|c| c.last_acked_seq == Some(seq) && c.srtt.is_some())
    })
    .await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_surface_sees_lifecycle_and_capabilities() {
    let daemon = Daemon::start(test_config()).await;
    let surface = daemon.handle.register_surface();

    let mut viewer = Viewer::connect(daemon.addr).await;
    viewer.hello().await;
    viewer
        .send(ViewerMessage::Capabilities(CapabilitySet::DROP_COPY))
        .await;
    viewer
        .send(ViewerMessage::Explorer(ExplorerUpdate::new(ExplorerCode::Shown)))
        .await;

    let mut events = Vec::new();
    eventually(|| {
        events.extend(surface.drain());
        events.len() >= 3
    })
    .await;
    assert!(matches!(
        events[0],
        UiEvent::Notice {
            notice: ConnectionNotice::Finished,
            ..
        }
    ));
    assert!(matches!(
        events[1],
        UiEvent::Capabilities { caps, .. } if caps == CapabilitySet::DROP_COPY
    ));
    assert!(matches!(events[2], UiEvent::Explorer { .. }));
    let handle = daemon.handle.clone();
    eventually(|| handle.support_drag_copy()).await;

    viewer.send(ViewerMessage::Goodbye).await;
    viewer.expect_goodbye().await;
    let mut closed = false;
    eventually(|| {
        closed |= surface.drain().iter().any(|e| {
            matches!(
                e,
                UiEvent::Notice {
                    notice: ConnectionNotice::Closed,
                    ..
                }
            )
        });
        closed
    })
    .await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_ui_requests_reach_viewer() {
    let daemon = Daemon::start(test_config()).await;
    let mut viewer = Viewer::connect(daemon.addr).await;
    viewer.hello().await;

    let update = ExplorerUpdate::with_args(ExplorerCode::StartDrag, 10, 20, 0);
    assert!(daemon.handle.push_explorer_update(update));
    let got = viewer
        .wait_for(|m| match m {
            DaemonMessage::Explorer(u) => Some(u),
            _ => None,
        })
        .await;
    assert_eq!(got, update);

    assert!(daemon.handle.clipboard_updated("copied text"));
    let clip = viewer
        .wait_for(|m| match m {
            DaemonMessage::Clipboard(c) => Some(c),
            _ => None,
        })
        .await;
    assert_eq!(clip, mirror_core::ClipboardPayload::Text("copied text".into()));
    daemon.stop().await;
}

#[tokio::test]
async fn test_rotation_announced_before_frame() {
    let daemon = Daemon::start(test_config()).await;
    let mut viewer = Viewer::connect(daemon.addr).await;
    viewer.hello().await;
    viewer.next_frame().await;

    daemon.dial.rotate();
    let (next, from, to) = loop {
        match viewer.recv().await {
            Some(DaemonMessage::Orientation { from, to }) => {
                break (viewer.next_frame().await, from, to);
            }
            Some(DaemonMessage::Frame(frame)) => {
                assert_eq!(frame.orientation, Orientation::Deg0, "rotated frame arrived unannounced");
            }
            Some(_) => {}
            None => panic!("daemon closed the connection"),
        }
    };
    assert_eq!((from, to), (Orientation::Deg0, Orientation::Deg90));
    assert_eq!(next.orientation, Orientation::Deg90);
    assert!(next.sync);
    assert!(next.data.starts_with(CONFIG_MAGIC));
    daemon.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_ip_reconfigure_runs_through_netcfg() {
    let netd = FakeNetd::start("10.0.0.5");
    let daemon =
        Daemon::start_with(MirrorService::new(test_config()).with_netcfg(netd.bridge.clone())).await;
    let mut viewer = Viewer::connect(daemon.addr).await;
    viewer.hello().await;

    daemon.handle.request_ip_reconfigure(IpReconfigure {
        iface: "eth0".into(),
        address: Ipv4Addr::new(192, 168, 7, 2),
        prefix_len: 24,
        gateway: Ipv4Addr::new(192, 168, 7, 1),
    });
    eventually(|| netd.finished()).await;
    assert!(
        netd.commands
            .lock()
            .unwrap()
            .contains(&"network route add 100 eth0 0.0.0.0/0 192.168.7.1".to_string())
    );

    // The listener is rebound; a new viewer still gets in.
    viewer.send(ViewerMessage::Goodbye).await;
    viewer.expect_goodbye().await;
    let handle = daemon.handle.clone();
    eventually(|| !handle.is_connected()).await;

    assert!(welcomed_eventually(daemon.addr).await, "no viewer accepted after rebind");
    daemon.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_rebind_keeps_sessions_alive() {
    // The listener sits on the interface's old address; the new one is
    // not local, so binding it fails.
    let netd = FakeNetd::start("127.0.0.1");
    let daemon =
        Daemon::start_with(MirrorService::new(test_config()).with_netcfg(netd.bridge.clone())).await;
    let mut viewer = Viewer::connect(daemon.addr).await;
    viewer.hello().await;
    viewer.next_frame().await;

    daemon.handle.request_ip_reconfigure(IpReconfigure {
        iface: "lo".into(),
        address: Ipv4Addr::new(192, 0, 2, 7),
        prefix_len: 24,
        gateway: Ipv4Addr::new(192, 0, 2, 1),
    });
    eventually(|| netd.finished()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!daemon.task.is_finished(), "service exited after a failed rebind");
    let before = viewer.next_frame().await;
    let after = viewer.next_frame().await;
    assert!(after.sequence > before.sequence);
    assert!(daemon.handle.is_connected());
    daemon.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_listener_follows_address_broadcasts() {
    let mut netd = FakeNetd::start("10.0.0.5");
    let daemon =
        Daemon::start_with(MirrorService::new(test_config()).with_netcfg(netd.bridge.clone())).await;

    netd.broadcast("614 Address removed 127.0.0.1/8 lo 128 0");
    let mut refused = false;
    for _ in 0..100 {
        if TcpStream::connect(daemon.addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "listener still open after its address was removed");

    netd.broadcast("614 Address updated 127.0.0.1/8 lo 128 0");
    assert!(welcomed_eventually(daemon.addr).await, "listener not restored");
    daemon.stop().await;
}
