// src/tcp.rs - flow identity and the synthetic TCP peer
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::device::PacketWriter;
use crate::packet::{build_tcp_packet, tcp_flags, OutboundSegment};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// Identifies one captured flow. `src` is always the captured client side.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub transport: Transport,
}

impl FlowKey {
    pub fn new(client: SocketAddrV4, server: SocketAddrV4, transport: Transport) -> Self {
        Self {
            src_ip: *client.ip(),
            src_port: client.port(),
            dst_ip: *server.ip(),
            dst_port: server.port(),
            transport,
        }
    }

    pub fn client(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_ip, self.src_port)
    }

    pub fn server(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_ip, self.dst_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.transport, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPhase {
    /// Real connect in flight, no SYN-ACK sent yet.
    SynSent,
    Established,
    /// FIN or RST seen from either side.
    Closing,
}

/// What to do with a client data segment given the current `client_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentDisposition {
    /// Forward `payload[offset..]`; the head was already forwarded.
    Forward { offset: usize },
    /// Entirely before `client_seq`: a retransmission.
    Duplicate,
    /// Starts beyond `client_seq`: a hole we cannot fill.
    Gap,
    NotEstablished,
}

#[derive(Debug, Clone)]
pub struct SequenceState {
    pub phase: TcpPhase,
    pub client_isn: u32,
    /// Next byte expected from the captured client.
    pub client_seq: u32,
    /// Last acknowledgement number the client sent us.
    pub client_ack: u32,
    /// Next sequence number this engine emits as the synthetic peer.
    pub server_seq: u32,
    /// What the last emitted segment acknowledged.
    pub server_ack: u32,
    recovery_ack: Option<u32>,
}

impl SequenceState {
    /// State for a fresh SYN; the SYN itself consumes one sequence number.
    pub fn from_syn(syn_seq: u32) -> Self {
        Self {
            phase: TcpPhase::SynSent,
            client_isn: syn_seq,
            client_seq: syn_seq.wrapping_add(1),
            client_ack: 0,
            server_seq: 0,
            server_ack: 0,
            recovery_ack: None,
        }
    }

    /// State rebuilt from a data segment of a flow we never saw a SYN for.
    /// The client's ACK number tells us where our stream has to resume.
    pub fn recovering(seq: u32, ack: u32) -> Self {
        Self {
            phase: TcpPhase::SynSent,
            client_isn: seq,
            client_seq: seq,
            client_ack: ack,
            server_seq: 0,
            server_ack: 0,
            recovery_ack: Some(ack),
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery_ack.is_some()
    }

    pub fn classify(&self, seq: u32, len: usize) -> SegmentDisposition {
        if self.phase != TcpPhase::Established {
            return SegmentDisposition::NotEstablished;
        }

        let behind = self.client_seq.wrapping_sub(seq);
        // Anything less than half the sequence space behind us is old data.
        if behind == 0 {
            SegmentDisposition::Forward { offset: 0 }
        } else if behind < 0x8000_0000 {
            if (behind as usize) < len {
                SegmentDisposition::Forward { offset: behind as usize }
            } else {
                SegmentDisposition::Duplicate
            }
        } else {
            SegmentDisposition::Gap
        }
    }

    pub fn advance_client(&mut self, len: usize) {
        self.client_seq = self.client_seq.wrapping_add(len as u32);
    }

    pub fn advance_server(&mut self, len: usize) {
        self.server_seq = self.server_seq.wrapping_add(len as u32);
    }
}

/// One captured TCP connection and the real socket standing in for its peer.
pub struct TcpSession {
    pub key: FlowKey,
    window: u16,
    state: Mutex<SequenceState>,
    upstream: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    tasks: Mutex<Vec<AbortHandle>>,
    writer_task: Mutex<Option<AbortHandle>>,
    last_activity: Mutex<Instant>,
}

impl fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSession")
            .field("key", &self.key)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl TcpSession {
    pub fn new(key: FlowKey, state: SequenceState, window: u16) -> Self {
        Self {
            key,
            window,
            state: Mutex::new(state),
            upstream: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            writer_task: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn snapshot(&self) -> SequenceState {
        self.state.lock().clone()
    }

    pub fn phase(&self) -> TcpPhase {
        self.state.lock().phase
    }

    pub fn client_isn(&self) -> u32 {
        self.state.lock().client_isn
    }

    pub fn note_client_ack(&self, ack: u32) {
        self.state.lock().client_ack = ack;
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn attach_upstream(&self, tx: mpsc::UnboundedSender<Bytes>) {
        *self.upstream.lock() = Some(tx);
    }

    pub fn register_task(&self, handle: AbortHandle) {
        self.tasks.lock().push(handle);
    }

    /// The upstream writer is left to drain on `close` and only stopped by
    /// `abort`.
    pub fn set_writer_task(&self, handle: AbortHandle) {
        *self.writer_task.lock() = Some(handle);
    }

    fn outbound(&self, state: &SequenceState, sequence: u32, flags: u8) -> OutboundSegment {
        OutboundSegment {
            source: self.key.server(),
            destination: self.key.client(),
            sequence,
            acknowledgement: state.client_seq,
            flags,
            window: self.window,
        }
    }

    /// Moves to ESTABLISHED once the real socket connected. Emits the SYN-ACK
    /// for a normal handshake; a recovered flow resumes silently at the
    /// client's ACK. Returns whether a SYN-ACK was written.
    pub fn establish(&self, writer: &PacketWriter, isn: u32) -> bool {
        let mut state = self.state.lock();
        state.server_ack = state.client_seq;
        state.phase = TcpPhase::Established;

        if let Some(ack) = state.recovery_ack.take() {
            state.server_seq = ack;
            return false;
        }

        state.server_seq = isn;
        let packet = build_tcp_packet(&self.outbound(&state, isn, tcp_flags::SYN_ACK), &[]);
        if writer.write(packet) {
            state.advance_server(1);
            true
        } else {
            false
        }
    }

    /// Writes one synthetic segment toward the client. `server_seq` advances
    /// by the payload length only when the frame reached the interface.
    pub fn emit(&self, writer: &PacketWriter, flags: u8, payload: &[u8]) -> bool {
        let mut state = self.state.lock();
        let packet = build_tcp_packet(&self.outbound(&state, state.server_seq, flags), payload);
        if !writer.write(packet) {
            return false;
        }
        state.server_ack = state.client_seq;
        state.advance_server(payload.len());
        true
    }

    /// Accepts a client data segment: forwards the unseen part to the real
    /// socket and advances `client_seq` by exactly what was forwarded.
    pub fn forward(&self, seq: u32, payload: &[u8]) -> (SegmentDisposition, usize) {
        let mut state = self.state.lock();
        let disposition = state.classify(seq, payload.len());

        let SegmentDisposition::Forward { offset } = disposition else {
            return (disposition, 0);
        };

        let fresh = &payload[offset..];
        let sent = match self.upstream.lock().as_ref() {
            Some(tx) => tx.send(Bytes::copy_from_slice(fresh)).is_ok(),
            None => false,
        };
        if !sent {
            return (disposition, 0);
        }

        state.advance_client(fresh.len());
        (disposition, fresh.len())
    }

    /// FIN+ACK toward the client. When answering the client's own FIN the
    /// acknowledgement covers that FIN's sequence number.
    pub fn emit_fin(&self, writer: &PacketWriter, acknowledge_client_fin: bool) -> bool {
        let mut state = self.state.lock();
        if acknowledge_client_fin {
            state.advance_client(1);
        }
        state.phase = TcpPhase::Closing;
        let packet = build_tcp_packet(&self.outbound(&state, state.server_seq, tcp_flags::FIN_ACK), &[]);
        writer.write(packet)
    }

    /// Stops reading upstream. Bytes already queued for the real socket are
    /// still written before the writer shuts it down.
    pub fn close(&self) {
        self.state.lock().phase = TcpPhase::Closing;
        self.upstream.lock().take();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// Like `close`, but also kills the writer without draining.
    pub fn abort(&self) {
        self.close();
        if let Some(handle) = self.writer_task.lock().take() {
            handle.abort();
        }
    }
}
