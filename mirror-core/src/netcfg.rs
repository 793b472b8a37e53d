//! Request/response bridge to the device network-configuration daemon.
//!
//! Commands go out as `"<seq> <command>\n"`. Replies come back as
//! `"<code> <seq> <words...>"` lines, fed in by whoever reads the
//! daemon's socket via [`NetConfigBridge::on_line`]. A reply whose
//! second token is not a number is an unsolicited broadcast.
//!
//! Broadcasts are handed to the listener as a [`Broadcast`]; interface
//! address changes (code 614) arrive already parsed.
//!
//! [`request`](NetConfigBridge::request) blocks the caller for up to
//! three seconds; never call it from the session tick.

use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::error::MirrorError;
use crate::events::IpReconfigure;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Broadcast code for an interface address being added or removed.
pub const INTERFACE_ADDRESS_CHANGE: i32 = 614;

/// First sequence number; the counter wraps from `i32::MAX` back here.
pub const SEQ_MIN: i32 = 1;

/// A keyed reply from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetResponse {
    pub code: i32,
    /// Remaining words, space-joined.
    pub text: String,
}

impl NetResponse {
    /// 2xx codes are successes.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// How [`NetConfigBridge::on_line`] routed a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRoute {
    /// Filled the slot of a waiting request.
    Reply(i32),
    /// No request is waiting on this sequence number (late reply).
    Unmatched(i32),
    Broadcast,
    /// Fewer than two tokens.
    Noise,
}

/// An IPv4 address appearing on or leaving an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressChange {
    pub iface: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub removed: bool,
}

impl AddressChange {
    /// `614 Address updated|removed <addr>/<prefix> <iface> <flags> <scope>`.
    ///
    /// IPv6 addresses and malformed lines yield `None`.
    pub fn parse(tokens: &[&str]) -> Option<Self> {
        let [code, "Address", kind, cidr, iface, _flags, _scope] = tokens else {
            return None;
        };
        if code.parse::<i32>().ok()? != INTERFACE_ADDRESS_CHANGE {
            return None;
        }
        let removed = match *kind {
            "updated" => false,
            "removed" => true,
            _ => return None,
        };
        let (address, prefix) = cidr.split_once('/')?;
        let prefix_len = prefix.parse::<u8>().ok().filter(|p| *p <= 32)?;
        Some(Self {
            iface: (*iface).to_string(),
            address: address.parse().ok()?,
            prefix_len,
            removed,
        })
    }
}

/// An unsolicited line from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast<'a> {
    Address(AddressChange),
    /// Any other broadcast, as whitespace-split words.
    Other(&'a [&'a str]),
}

type BroadcastListener = Box<dyn Fn(&Broadcast<'_>) + Send + Sync>;

struct Slots {
    next_seq: i32,
    pending: HashMap<i32, Option<NetResponse>>,
}

// ── NetConfigBridge ──────────────────────────────────────────────

pub struct NetConfigBridge<W> {
    writer: Mutex<W>,
    slots: Mutex<Slots>,
    replied: Condvar,
    listener: Mutex<Option<BroadcastListener>>,
    timeout: Duration,
}

impl<W: Write> NetConfigBridge<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            slots: Mutex::new(Slots {
                next_seq: SEQ_MIN,
                pending: HashMap::new(),
            }),
            replied: Condvar::new(),
            listener: Mutex::new(None),
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route unsolicited broadcasts to `listener`.
    pub fn set_broadcast_listener(
        &self,
        listener: impl Fn(&Broadcast<'_>) + Send + Sync + 'static,
    ) {
        *relock(self.listener.lock()) = Some(Box::new(listener));
    }

    /// Send `command` and wait for its keyed reply.
    pub fn request(&self, command: &str) -> Result<NetResponse, MirrorError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(MirrorError::Other("empty netcfg command".into()));
        }

        let seq = {
            let mut slots = self.lock_slots();
            let seq = slots.next_seq;
            slots.next_seq = if seq == i32::MAX { SEQ_MIN } else { seq + 1 };
            slots.pending.insert(seq, None);
            seq
        };

        let written = {
            let mut writer = relock(self.writer.lock());
            writeln!(writer, "{seq} {command}").and_then(|()| writer.flush())
        };
        if let Err(e) = written {
            self.lock_slots().pending.remove(&seq);
            return Err(e.into());
        }
        debug!(seq, command, "netcfg request sent");

        let deadline = Instant::now() + self.timeout;
        let mut slots = self.lock_slots();
        loop {
            if matches!(slots.pending.get(&seq), Some(Some(_))) {
                if let Some(Some(response)) = slots.pending.remove(&seq) {
                    trace!(seq, code = response.code, "netcfg reply");
                    return Ok(response);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                slots.pending.remove(&seq);
                warn!(seq, command, "netcfg request timed out");
                return Err(MirrorError::Timeout(self.timeout));
            }
            slots = match self.replied.wait_timeout(slots, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Feed one line read from the daemon.
    pub fn on_line(&self, line: &str) -> LineRoute {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            trace!(line, "netcfg noise");
            return LineRoute::Noise;
        }

        let code = tokens[0].parse::<i32>().unwrap_or(0);
        let seq = match parse_seq(tokens[1]) {
            Some(seq) => seq,
            None => {
                if let Some(listener) = relock(self.listener.lock()).as_ref() {
                    let broadcast = match AddressChange::parse(&tokens) {
                        Some(change) => Broadcast::Address(change),
                        None => Broadcast::Other(&tokens),
                    };
                    listener(&broadcast);
                }
                return LineRoute::Broadcast;
            }
        };

        let mut slots = self.lock_slots();
        match slots.pending.get_mut(&seq) {
            Some(slot) => {
                *slot = Some(NetResponse {
                    code,
                    text: tokens[2..].join(" "),
                });
                drop(slots);
                self.replied.notify_all();
                LineRoute::Reply(seq)
            }
            None => {
                debug!(seq, code, "netcfg reply for no waiting request");
                LineRoute::Unmatched(seq)
            }
        }
    }

    /// Re-address `request.iface` and reinstall its routes.
    ///
    /// Returns the address the interface had before, if it reported one.
    pub fn reconfigure(&self, request: &IpReconfigure) -> Result<Option<Ipv4Addr>, MirrorError> {
        if request.address.is_unspecified() || request.gateway.is_unspecified() {
            return Err(MirrorError::Other(
                "address and gateway must be specified".into(),
            ));
        }
        if !(1..32).contains(&request.prefix_len) {
            return Err(MirrorError::Other(format!(
                "invalid prefix length {}",
                request.prefix_len
            )));
        }
        let iface = &request.iface;

        // "<iface> <netId>"
        let reply = self.request(&format!("launcher netid {iface}"))?;
        let net_id = match reply.text.split_whitespace().collect::<Vec<_>>().as_slice() {
            [name, id] if *name == iface.as_str() => id.parse::<i32>().ok(),
            _ => None,
        }
        .ok_or_else(|| MirrorError::Other(format!("no network id for {iface}: {}", reply.text)))?;

        // "<mac> <addr> <prefix> <flags...>"
        let previous = self
            .request(&format!("interface getcfg {iface}"))?
            .text
            .split_whitespace()
            .nth(1)
            .and_then(|addr| addr.parse::<Ipv4Addr>().ok())
            .filter(|addr| !addr.is_unspecified());

        let subnet = subnet_of(request.gateway, request.prefix_len);
        let prefix = request.prefix_len;
        let commands = [
            format!("interface clearaddrs {iface}"),
            format!(
                "interface setcfg {iface} {} {prefix} multicast up broadcast running",
                request.address
            ),
            format!("network route add {net_id} {iface} {subnet}/{prefix}"),
            format!("network route add {net_id} {iface} 0.0.0.0/0 {}", request.gateway),
        ];

        // Broadcasts are muted while the address changes hands and must be
        // re-enabled whatever happens in between.
        let applied = self
            .request_logged("launcher broadcast disable")
            .and_then(|()| {
                commands
                    .iter()
                    .try_for_each(|command| self.request_logged(command))
            });
        let unmuted = self.request_logged("launcher broadcast enable");
        applied.and(unmuted)?;

        info!(
            %iface,
            previous = ?previous,
            address = %request.address,
            prefix,
            gateway = %request.gateway,
            "interface reconfigured"
        );
        Ok(previous)
    }

    /// Send `command`; a refusal is logged, only transport faults fail.
    fn request_logged(&self, command: &str) -> Result<(), MirrorError> {
        let reply = self.request(command)?;
        if !reply.is_ok() {
            warn!(command, code = reply.code, text = %reply.text, "netcfg command refused");
        }
        Ok(())
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        relock(self.slots.lock())
    }
}

fn relock<G>(result: Result<G, PoisonError<G>>) -> G {
    result.unwrap_or_else(|e| e.into_inner())
}

/// Digits only; anything else marks a broadcast.
fn parse_seq(token: &str) -> Option<i32> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Network address of `addr` under a `prefix_len`-bit mask.
pub fn subnet_of(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let mask = match prefix_len {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => !((1u32 << (32 - p)) - 1),
    };
    Ipv4Addr::from(u32::from(addr) & mask)
}

// ── Tests ────────────────────────────────────────────────────────
