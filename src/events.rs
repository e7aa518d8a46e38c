//! UDP event sink.
//!
//! The router is not the event logger; it just ships msgpack-encoded event
//! maps at a configured UDP target, both for its own lifecycle events and
//! for `LOG_MESSAGE` control traffic forwarded on behalf of participants.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::error::{Error, Result};

/// Default port of the event logger daemon.
pub const EVENT_LOGGER_PORT: u16 = 7197;

/// Fire-and-forget sender of event payloads.
#[derive(Debug)]
pub struct EventSender {
    socket: Option<UdpSocket>,
    target: Option<SocketAddr>,
}

impl EventSender {
    /// A sender that discards everything.
    pub fn disabled() -> Self {
        Self {
            socket: None,
            target: None,
        }
    }

    /// Resolve the target and open a socket. A target that fails to
    /// resolve is a startup error; the caller treats it as fatal.
    pub fn new(target: Option<&str>) -> Result<Self> {
        let Some(target) = target else {
            tracing::debug!("Event sender not enabled");
            return Ok(Self::disabled());
        };

        let addr = resolve_target(target)?;
        let bind: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind)?;

        tracing::debug!(target = %addr, "Event sender initialized");
        Ok(Self {
            socket: Some(socket),
            target: Some(addr),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// Ship one encoded event. Failures are logged and swallowed; losing an
    /// event never costs a connection.
    pub fn send(&self, payload: &[u8]) {
        let (Some(socket), Some(target)) = (&self.socket, self.target) else {
            tracing::trace!("Event sender disabled; discarding event");
            return;
        };
        if let Err(e) = socket.send_to(payload, target) {
            tracing::warn!(error = %e, "Event send failed");
        }
    }

    /// Encode and ship a [`LoggedEvent`].
    pub fn send_event(&self, event: &LoggedEvent) {
        if self.is_enabled() {
            self.send(&event.to_msgpack());
        }
    }
}

fn resolve_target(target: &str) -> Result<SocketAddr> {
    // Accept "host:port" or bare "host" with the logger's default port.
    let with_port;
    let spec = if target.contains(':') && target.rsplit(':').next().is_some_and(|p| p.parse::<u16>().is_ok()) {
        target
    } else {
        with_port = format!("{target}:{EVENT_LOGGER_PORT}");
        &with_port
    };
    spec.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::AddressResolution(target.to_string()))
}

/// A string map event, encoded as msgpack by hand.
///
/// Only fixmap/map16 and fixstr/str16 are needed: nothing larger fits in a
/// single UDP packet anyway.
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    // Insertion-ordered key/value pairs; re-adding a key overwrites in place.
    kv: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl LoggedEvent {
    pub fn new(event_type: &str, sender: &str) -> Self {
        let mut event = Self {
            kv: Vec::new(),
            index: HashMap::new(),
        };
        event.add("type", event_type);
        event.add("sender", sender);
        event
    }

    pub fn add(&mut self, key: &str, value: &str) {
        match self.index.get(key) {
            Some(&i) => self.kv[i].1 = value.to_string(),
            None => {
                self.index.insert(key.to_string(), self.kv.len());
                self.kv.push((key.to_string(), value.to_string()));
            }
        }
    }

    pub fn to_msgpack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);

        let len = self.kv.len();
        if len < 16 {
            out.push(0x80 | len as u8);
        } else {
            out.push(0xde);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }

        for (key, value) in &self.kv {
            pack_str(&mut out, key);
            pack_str(&mut out, value);
        }
        out
    }
}

fn pack_str(out: &mut Vec<u8>, s: &str) {
    let len = s.len();
    if len < 32 {
        out.push(0xa0 | len as u8);
    } else {
        out.push(0xda);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
    out.extend_from_slice(s.as_bytes());
}
