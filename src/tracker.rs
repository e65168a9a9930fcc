// src/tracker.rs - per-flow accumulation of bytes and sniffed metadata
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::sniff::{self, Direction, HttpMessage, HttpRequest, HttpResponse, SniffOutcome};
use crate::tcp::FlowKey;
use crate::tls::{self, TlsProbe, TLS_HANDSHAKE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Scanning,
    Complete,
    Abandoned,
}

#[derive(Debug)]
struct Stream {
    phase: StreamPhase,
    buffer: BytesMut,
}

impl Stream {
    fn new() -> Self {
        Self {
            phase: StreamPhase::Scanning,
            buffer: BytesMut::new(),
        }
    }

    fn finish(&mut self, phase: StreamPhase) {
        self.phase = phase;
        self.buffer = BytesMut::new();
    }
}

/// How the payload of a flow was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    Plaintext,
    /// Wire bytes are TLS; content only visible if the relay decrypts.
    Encrypted,
}

#[derive(Debug)]
pub struct ConnectionTracker {
    pub key: FlowKey,
    pub started_at_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub tls_server_name: Option<String>,
    pub decrypted: bool,
    visibility: Visibility,
    client_probe: BytesMut,
    outgoing: Stream,
    incoming: Stream,
    max_buffer: usize,
    event_emitted: bool,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ConnectionTracker {
    pub fn new(key: FlowKey, max_buffer: usize) -> Self {
        Self {
            key,
            started_at_ms: now_ms(),
            bytes_sent: 0,
            bytes_received: 0,
            request: None,
            response: None,
            tls_server_name: None,
            decrypted: false,
            visibility: Visibility::Plaintext,
            client_probe: BytesMut::new(),
            outgoing: Stream::new(),
            incoming: Stream::new(),
            max_buffer,
            event_emitted: false,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.visibility == Visibility::Encrypted
    }

    pub fn request_parsed(&self) -> bool {
        self.request.is_some()
    }

    pub fn response_parsed(&self) -> bool {
        self.response.is_some()
    }

    pub fn event_emitted(&self) -> bool {
        self.event_emitted
    }

    fn stream_mut(&mut self, direction: Direction) -> &mut Stream {
        match direction {
            Direction::Outgoing => &mut self.outgoing,
            Direction::Incoming => &mut self.incoming,
        }
    }

    /// Byte accounting without sniffing, used for datagrams.
    pub fn count(&mut self, direction: Direction, len: usize) {
        match direction {
            Direction::Outgoing => self.bytes_sent += len as u64,
            Direction::Incoming => self.bytes_received += len as u64,
        }
    }

    /// Bytes exactly as they crossed the virtual interface.
    pub fn observe_wire(&mut self, direction: Direction, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.count(direction, data.len());

        if direction == Direction::Outgoing && self.bytes_sent == data.len() as u64 && data[0] == TLS_HANDSHAKE {
            self.visibility = Visibility::Encrypted;
            self.outgoing.finish(StreamPhase::Abandoned);
            self.incoming.finish(StreamPhase::Abandoned);
        }

        if self.is_tls() {
            if direction == Direction::Outgoing && self.tls_server_name.is_none() {
                self.probe_client_hello(data);
            }
            return;
        }
        self.feed(direction, data, false);
    }

    /// Plaintext recovered by the interception relay.
    pub fn observe_decrypted(&mut self, direction: Direction, data: &[u8]) {
        if !self.decrypted {
            self.decrypted = true;
            self.visibility = Visibility::Encrypted;
            self.outgoing = Stream::new();
            self.incoming = Stream::new();
        }
        self.feed(direction, data, false);
    }

    /// Records a server name learned out of band, e.g. by the relay's own
    /// handshake. A name already parsed off the wire wins.
    pub fn note_server_name(&mut self, name: &str) {
        if self.tls_server_name.is_none() && !name.is_empty() {
            self.tls_server_name = Some(name.to_ascii_lowercase());
        }
    }

    fn probe_client_hello(&mut self, data: &[u8]) {
        if self.client_probe.len() + data.len() > self.max_buffer {
            self.client_probe = BytesMut::new();
            return;
        }
        self.client_probe.extend_from_slice(data);
        match tls::probe(&self.client_probe) {
            Ok(TlsProbe::Incomplete) => return,
            Ok(TlsProbe::Hello(hello)) => {
                self.tls_server_name = hello.server_name();
                debug!("{} SNI {:?}", self.key, self.tls_server_name);
            }
            Ok(TlsProbe::NotTls) => {}
            Err(e) => debug!("{} ClientHello not parsed: {}", self.key, e),
        }
        self.client_probe = BytesMut::new();
    }

    fn feed(&mut self, direction: Direction, data: &[u8], flush: bool) {
        let max_buffer = self.max_buffer;
        let key = self.key;
        let stream = self.stream_mut(direction);
        if stream.phase != StreamPhase::Scanning {
            return;
        }
        stream.buffer.extend_from_slice(data);

        let message = match sniff::sniff(&stream.buffer, direction, flush) {
            Ok(outcome) => {
                stream.buffer.advance(outcome.consumed);
                match outcome.message {
                    Some(message) => {
                        stream.finish(StreamPhase::Complete);
                        Some(message)
                    }
                    None if flush => {
                        stream.finish(StreamPhase::Abandoned);
                        None
                    }
                    None if stream.buffer.len() > max_buffer => {
                        // Over the cap: keep the message if its headers are in,
                        // with the body cut short.
                        match sniff::sniff(&stream.buffer, direction, true) {
                            Ok(SniffOutcome {
                                message: Some(message),
                                ..
                            }) => {
                                stream.finish(StreamPhase::Complete);
                                Some(message)
                            }
                            Ok(_) => {
                                stream.finish(StreamPhase::Abandoned);
                                None
                            }
                            Err(e) => {
                                debug!("{} oversized {:?} message not parsed: {}", key, direction, e);
                                stream.finish(StreamPhase::Abandoned);
                                None
                            }
                        }
                    }
                    None => None,
                }
            }
            Err(e) => {
                debug!("{} sniffing {:?} abandoned: {}", key, direction, e);
                stream.finish(StreamPhase::Abandoned);
                None
            }
        };

        match message {
            Some(HttpMessage::Request(req)) => self.request = Some(req),
            Some(HttpMessage::Response(resp)) => self.response = Some(resp),
            None => {}
        }
    }

    /// Accepts whatever partial messages are buffered. Called on teardown.
    pub fn flush(&mut self) {
        for direction in [Direction::Outgoing, Direction::Incoming] {
            self.feed(direction, &[], true);
        }
    }

    pub fn ready_to_emit(&self) -> bool {
        !self.event_emitted && self.request.is_some() && self.response.is_some()
    }

    /// Flips `event_emitted` false -> true. Only the caller that gets `true`
    /// may emit.
    pub fn mark_emitted(&mut self) -> bool {
        if self.event_emitted {
            return false;
        }
        self.event_emitted = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::Transport;
    use crate::tls::tests::client_hello;

    fn tracker() -> ConnectionTracker {
        let key = FlowKey::new(
            "10.0.0.2:40000".parse().unwrap(),
            "1.2.3.4:80".parse().unwrap(),
            Transport::Tcp,
        );
        ConnectionTracker::new(key, 64 * 1024)
    }

    #[test]
    fn test_request_split_across_chunks() {
        let mut t = tracker();
        t.observe_wire(Direction::Outgoing, b"GET /index.html HT");
        t.observe_wire(Direction::Outgoing, b"TP/1.1\r\nHost: example.com\r\n");
        assert!(!t.request_parsed());
        t.observe_wire(Direction::Outgoing, b"\r\n");

        let req = t.request.as_ref().unwrap();
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.host.as_deref(), Some("example.com"));
        assert_eq!(t.bytes_sent, 47);
        assert!(!t.ready_to_emit());

        t.observe_wire(Direction::Incoming, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        assert!(t.ready_to_emit());
        assert!(t.mark_emitted());
        assert!(!t.mark_emitted());
        assert!(!t.ready_to_emit());
    }

    #[test]
    fn test_flush_tags_partial_body() {
        let mut t = tracker();
        t.observe_wire(Direction::Outgoing, b"POST /a HTTP/1.1\r\nContent-Length: 100\r\n\r\npart");
        assert!(!t.request_parsed());
        t.flush();
        assert_eq!(
            t.request.as_ref().unwrap().body.as_deref(),
            Some("part [Truncated]")
        );
        assert!(!t.response_parsed());
    }

    #[test]
    fn test_tls_wire_records_sni_and_skips_http() {
        let mut t = tracker();
        let hello = client_hello(Some("b.example.org"));
        let (head, tail) = hello.split_at(20);
        t.observe_wire(Direction::Outgoing, head);
        assert_eq!(t.tls_server_name, None);
        t.observe_wire(Direction::Outgoing, tail);

        assert_eq!(t.tls_server_name.as_deref(), Some("b.example.org"));
        assert!(t.is_tls());
        t.observe_wire(Direction::Incoming, b"HTTP/1.1 200 OK\r\n\r\n");
        assert!(!t.response_parsed());
        assert_eq!(t.bytes_sent, hello.len() as u64);
    }

    #[test]
    fn test_decrypted_bytes_are_sniffed() {
        let mut t = tracker();
        t.observe_wire(Direction::Outgoing, &client_hello(Some("a.com")));
        t.observe_decrypted(Direction::Outgoing, b"GET /secret HTTP/1.1\r\nHost: a.com\r\n\r\n");
        t.observe_decrypted(Direction::Incoming, b"HTTP/1.1 404 Not Found\r\n\r\n");

        assert!(t.decrypted);
        assert_eq!(t.request.as_ref().unwrap().path, "/secret");
        assert_eq!(t.response.as_ref().unwrap().status_code, 404);
        assert!(t.ready_to_emit());
    }

    #[test]
    fn test_oversized_direction_is_abandoned() {
        let key = FlowKey::new(
            "10.0.0.2:40000".parse().unwrap(),
            "1.2.3.4:80".parse().unwrap(),
            Transport::Tcp,
        );
        let mut t = ConnectionTracker::new(key, 32);
        t.observe_wire(Direction::Outgoing, b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaa");
        t.observe_wire(Direction::Outgoing, b"\r\n\r\n");
        assert!(!t.request_parsed());
        assert_eq!(t.bytes_sent, 55);
    }

    #[test]
    fn test_oversized_body_keeps_parsed_headers() {
        let key = FlowKey::new(
            "10.0.0.2:40000".parse().unwrap(),
            "1.2.3.4:80".parse().unwrap(),
            Transport::Tcp,
        );
        let mut t = ConnectionTracker::new(key, 64);
        t.observe_wire(
            Direction::Outgoing,
            b"POST /upload HTTP/1.1\r\nHost: a.com\r\nContent-Length: 1000\r\n\r\n",
        );
        assert!(!t.request_parsed());
        t.observe_wire(Direction::Outgoing, &[b'x'; 100]);
        t.flush();

        let req = t.request.as_ref().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/upload");
        assert!(req.truncated);
        assert!(req.body.as_deref().unwrap().ends_with("[Truncated]"));
    }
}
