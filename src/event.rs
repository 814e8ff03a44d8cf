use crate::error::Fault;
use crate::frame::{self, MIN_FRAME_LEN};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Where an upstream request entered the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Shine,
    Tcp { endpoint: SocketAddr, peer: SocketAddr },
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Origin::Shine => f.write_str("SHINE"),
            Origin::Tcp { peer, .. } => write!(f, "TCP:{}", peer),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn now_iso() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// One JSON line on the sniff stream / wire log.
///
/// REQ and RSP describe the two halves of a transaction, ERR a failed one,
/// INFO a lifecycle transition (`event` names it).
#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
    pub ts: String,
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc_ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireEvent {
    fn bare(role: &'static str) -> Self {
        WireEvent {
            ts: now_iso(),
            role,
            event: None,
            from_client: None,
            to_client: None,
            uid: None,
            func: None,
            addr: None,
            count: None,
            value: None,
            bytes: None,
            crc_ok: None,
            hex: None,
            reason: None,
            port: None,
            error: None,
        }
    }

    fn with_frame(mut self, bytes: &[u8]) -> Self {
        if bytes.len() >= MIN_FRAME_LEN {
            self.uid = Some(bytes[0]);
            self.func = Some(bytes[1]);
            let fields = frame::decode_fields(bytes);
            self.addr = fields.addr;
            self.count = fields.count;
            self.value = fields.value;
        }
        self.bytes = Some(bytes.len());
        self.crc_ok = Some(frame::crc_ok(bytes));
        self.hex = Some(to_hex(bytes));
        self
    }

    /// REQ: a request frame is about to hit the downstream wire.
    #[must_use]
    pub fn request(origin: &Origin, bytes: &[u8]) -> Self {
        let mut ev = WireEvent::bare("REQ").with_frame(bytes);
        ev.from_client = Some(origin.to_string());
        ev
    }

    /// RSP: the downstream answered with a CRC-verified frame.
    ///
    /// `addr`/`count`/`value` describe the matched request, since a read
    /// response body carries register data, not the address it answered for.
    #[must_use]
    pub fn response(origin: &Origin, bytes: &[u8], request: &[u8]) -> Self {
        let mut ev = WireEvent::bare("RSP").with_frame(bytes);
        let req_fields = frame::decode_fields(request);
        ev.addr = req_fields.addr;
        ev.count = req_fields.count;
        ev.value = req_fields.value;
        ev.to_client = Some(origin.to_string());
        ev
    }

    /// ERR: the transaction failed; `partial` carries whatever bytes arrived.
    #[must_use]
    pub fn fault(origin: &Origin, fault: Fault, partial: Option<&[u8]>) -> Self {
        let mut ev = match partial {
            Some(bytes) if !bytes.is_empty() => WireEvent::bare("ERR").with_frame(bytes),
            _ => WireEvent::bare("ERR"),
        };
        ev.to_client = Some(origin.to_string());
        ev.reason = Some(fault.reason());
        ev
    }

    /// ERR: an inbound frame dropped before it ever reached the wire.
    #[must_use]
    pub fn drop_inbound(origin: &Origin, fault: Fault, bytes: &[u8]) -> Self {
        let mut ev = WireEvent::bare("ERR").with_frame(bytes);
        ev.from_client = Some(origin.to_string());
        ev.reason = Some(fault.reason());
        ev
    }

    /// INFO: a lifecycle transition (port up/down, shutdown, ...).
    #[must_use]
    pub fn info(event: &str) -> Self {
        let mut ev = WireEvent::bare("INFO");
        ev.event = Some(event.to_string());
        ev
    }

    #[must_use]
    pub fn on_port(mut self, port: &str) -> Self {
        self.port = Some(port.to_string());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// A consumer of serialized wire events. Sink failures must never reach the
/// broker loop, so `handle` is infallible and expected to swallow its own
/// errors.
pub trait EventSink: Send + Sync {
    fn handle(&self, line: &str);
}

/// Fans serialized events out to every registered sink.
#[derive(Clone, Default)]
pub struct EventHub {
    sinks: Arc<Vec<Box<dyn EventSink>>>,
}

impl EventHub {
    #[must_use]
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        EventHub {
            sinks: Arc::new(sinks),
        }
    }

    pub fn emit(&self, event: &WireEvent) {
        if self.sinks.is_empty() {
            return;
        }
        match serde_json::to_string(event) {
            Ok(line) => {
                for sink in self.sinks.iter() {
                    sink.handle(&line);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize wire event: {}", e),
        }
    }
}
