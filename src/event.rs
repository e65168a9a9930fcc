// src/event.rs - traffic events, sinks and application attribution
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use metrics::counter;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tracing::info;

use crate::sniff::Headers;
use crate::tcp::{FlowKey, Transport};
use crate::tracker::{now_ms, ConnectionTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppProtocol {
    Udp,
    Tcp,
    Http,
    Https,
    Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Read off the virtual interface.
    Sniff,
    /// Recovered by the TLS interception relay.
    Mitm,
}

fn serialize_icon<S: Serializer>(icon: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match icon {
        Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

/// Owner of a flow, as reported by the host platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentity {
    pub uid: u32,
    #[serde(rename = "packageName")]
    pub package: String,
    #[serde(rename = "appName")]
    pub display_name: String,
    pub is_system_app: bool,
    #[serde(rename = "appIcon", serialize_with = "serialize_icon", skip_serializing_if = "Option::is_none")]
    pub icon: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    pub id: u64,
    pub timestamp: u64,
    pub protocol: AppProtocol,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub url: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Headers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Headers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub size: u64,
    #[serde(flatten)]
    pub app: Option<AppIdentity>,
    pub source: EventSource,
    pub is_decrypted: bool,
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

impl TrafficEvent {
    fn base(id: u64, key: &FlowKey, protocol: AppProtocol) -> Self {
        Self {
            id,
            timestamp: now_ms(),
            protocol,
            src_ip: key.src_ip.to_string(),
            src_port: key.src_port,
            dst_ip: key.dst_ip.to_string(),
            dst_port: key.dst_port,
            method: None,
            status_code: None,
            url: format!("{}:{}", key.dst_ip, key.dst_port),
            domain: key.dst_ip.to_string(),
            request_headers: None,
            response_headers: None,
            request_body: None,
            response_body: None,
            tls_server_name: None,
            bytes_sent: 0,
            bytes_received: 0,
            size: 0,
            app: None,
            source: EventSource::Sniff,
            is_decrypted: false,
        }
    }

    /// One event per outbound UDP datagram.
    pub fn datagram(id: u64, key: &FlowKey, size: usize, bytes_sent: u64, bytes_received: u64) -> Self {
        let mut event = Self::base(id, key, AppProtocol::Udp);
        event.method = Some("UDP".to_string());
        event.size = size as u64;
        event.bytes_sent = bytes_sent;
        event.bytes_received = bytes_received;
        if key.dst_port == 53 {
            event.domain = "DNS".to_string();
        }
        event
    }

    pub fn from_tracker(id: u64, tracker: &ConnectionTracker) -> Self {
        let key = &tracker.key;
        let request = tracker.request.as_ref();
        let response = tracker.response.as_ref();
        let has_http = request.is_some() || response.is_some();

        let protocol = if key.transport == Transport::Udp {
            AppProtocol::Udp
        } else if has_http && tracker.decrypted {
            AppProtocol::Https
        } else if has_http {
            AppProtocol::Http
        } else if tracker.is_tls() {
            AppProtocol::Tls
        } else {
            AppProtocol::Tcp
        };

        let mut event = Self::base(id, key, protocol);
        event.bytes_sent = tracker.bytes_sent;
        event.bytes_received = tracker.bytes_received;
        event.tls_server_name = tracker.tls_server_name.clone();
        event.is_decrypted = tracker.decrypted;
        event.source = if tracker.decrypted {
            EventSource::Mitm
        } else {
            EventSource::Sniff
        };

        let host = request
            .and_then(|r| r.host.clone())
            .or_else(|| tracker.tls_server_name.clone());
        if let Some(host) = &host {
            event.domain = strip_port(host).to_string();
        }

        if let Some(req) = request {
            let scheme = if tracker.decrypted { "https" } else { "http" };
            let authority = host.clone().unwrap_or_else(|| key.dst_ip.to_string());
            event.url = format!("{}://{}{}", scheme, authority, req.path);
            event.method = Some(req.method.clone());
            event.request_headers = Some(req.headers.clone());
            event.request_body = req.body.clone();
        }
        if let Some(resp) = response {
            event.status_code = Some(resp.status_code);
            event.response_headers = Some(resp.headers.clone());
            event.response_body = resp.body.clone();
        }
        event
    }
}

/// Maps a flow to the application that owns it.
pub trait AppAttributor: Send + Sync + fmt::Debug {
    fn attribute(&self, transport: Transport, local: SocketAddrV4, remote: SocketAddrV4) -> Option<AppIdentity>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoAttribution;

impl AppAttributor for NoAttribution {
    fn attribute(&self, _: Transport, _: SocketAddrV4, _: SocketAddrV4) -> Option<AppIdentity> {
        None
    }
}

/// Fire-and-forget consumer of traffic events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TrafficEvent);
}

impl EventSink for mpsc::UnboundedSender<TrafficEvent> {
    fn emit(&self, event: TrafficEvent) {
        // A closed receiver just means nobody is listening anymore.
        let _ = self.send(event);
    }
}

/// Writes each event as a single JSON line to the `tunscope::events` target.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: TrafficEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => info!(target: "tunscope::events", "{}", line),
            Err(e) => tracing::warn!("Failed to serialize event {}: {}", event.id, e),
        }
    }
}

/// Numbers, attributes and delivers events.
pub struct EventPipeline {
    sink: Arc<dyn EventSink>,
    attributor: Arc<dyn AppAttributor>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPipeline")
            .field("attributor", &self.attributor)
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl EventPipeline {
    pub fn new(sink: Arc<dyn EventSink>, attributor: Arc<dyn AppAttributor>) -> Self {
        Self {
            sink,
            attributor,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn deliver(&self, key: &FlowKey, mut event: TrafficEvent) {
        event.app = self.attributor.attribute(key.transport, key.client(), key.server());
        counter!("tunscope_events_emitted_total", "protocol" => format!("{:?}", event.protocol)).increment(1);
        self.sink.emit(event);
    }

    pub fn datagram(&self, key: &FlowKey, size: usize, bytes_sent: u64, bytes_received: u64) {
        let event = TrafficEvent::datagram(self.next_id(), key, size, bytes_sent, bytes_received);
        self.deliver(key, event);
    }

    /// Emits the flow's event unless one already went out.
    pub fn flow(&self, tracker: &mut ConnectionTracker) -> bool {
        if !tracker.mark_emitted() {
            return false;
        }
        let event = TrafficEvent::from_tracker(self.next_id(), tracker);
        self.deliver(&tracker.key, event);
        true
    }
}
