// src/pump.rs - capture loop: frames in, flows out
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::device::PacketWriter;
use crate::event::EventPipeline;
use crate::graceful::GracefulShutdown;
use crate::packet::{self, tcp_flags, Ipv4Frame, TcpHeader, PROTO_TCP, PROTO_UDP};
use crate::protect::{protected_tcp_socket, SocketProtector};
use crate::sniff::Direction;
use crate::state::{FlowManager, RelayMode, RelayTarget};
use crate::tcp::{FlowKey, SegmentDisposition, SequenceState, TcpPhase, TcpSession, Transport};
use crate::tracker::ConnectionTracker;
use crate::udp::UdpFlow;

const UPSTREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    ClientFin,
    ClientReset,
    RemoteClosed,
    /// A SYN with a new initial sequence took over the key.
    Replaced,
    ConnectFailed,
    Idle,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Direct,
    Relay(SocketAddrV4, RelayMode),
}

/// Everything the pump and the per-flow socket tasks share.
pub struct FlowContext {
    pub config: EngineConfig,
    pub flows: Arc<FlowManager>,
    pub events: Arc<EventPipeline>,
    pub protector: Arc<dyn SocketProtector>,
    pub writer: PacketWriter,
    /// Where relayed flows are sent; `None` when no relay runs.
    pub relay_addr: Option<SocketAddrV4>,
}

impl FlowContext {
    fn route(&self, key: &FlowKey) -> Route {
        let Some(addr) = self.relay_addr else {
            return Route::Direct;
        };
        let interception = &self.config.interception;
        if interception.intercepts(key.dst_port) {
            Route::Relay(addr, RelayMode::Intercept)
        } else if interception.tunnels(key.dst_port) {
            Route::Relay(addr, RelayMode::Tunnel)
        } else {
            Route::Direct
        }
    }

    fn is_current(&self, session: &Arc<TcpSession>) -> bool {
        self.flows
            .tcp_session(&session.key)
            .is_some_and(|current| Arc::ptr_eq(&current, session))
    }

    /// Feeds wire bytes to the flow's tracker and emits once both sides
    /// parsed.
    pub fn observe(&self, key: &FlowKey, direction: Direction, data: &[u8]) {
        let Some(tracker) = self.flows.tracker(key) else {
            return;
        };
        let mut tracker = tracker.lock();
        tracker.observe_wire(direction, data);
        if tracker.ready_to_emit() {
            self.events.flow(&mut tracker);
        }
    }

    fn open_session(self: &Arc<Self>, key: FlowKey, state: SequenceState) {
        let route = self.route(&key);
        let bind = match route {
            Route::Direct => None,
            Route::Relay(addr, _) => Some(SocketAddr::from((*addr.ip(), 0))),
        };

        let socket = match protected_tcp_socket(self.protector.as_ref(), bind) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{} abandoned: {}", key, e);
                return;
            }
        };

        let (target, relay_port) = match route {
            Route::Direct => (key.server(), None),
            Route::Relay(addr, mode) => {
                let port = match socket.local_addr() {
                    Ok(local) => local.port(),
                    Err(e) => {
                        warn!("{} abandoned, loopback socket has no port: {}", key, e);
                        return;
                    }
                };
                let target = RelayTarget {
                    key,
                    destination: key.server(),
                    mode,
                };
                (addr, Some((port, target)))
            }
        };

        let recovering = state.is_recovering();
        let session = Arc::new(TcpSession::new(key, state, self.config.tcp_window));
        self.flows.reset_tracker(key, self.config.max_sniff_buffer);
        self.flows.insert_tcp(session.clone());
        if let Some((port, relay_target)) = relay_port {
            self.flows.register_relay_target(port, relay_target);
        }
        counter!("tunscope_flows_opened_total", "transport" => "tcp").increment(1);
        debug!("{} opened (recovering: {}, via {:?})", key, recovering, route);

        let handle = tokio::spawn(run_upstream(self.clone(), session.clone(), socket, target)).abort_handle();
        session.register_task(handle);
    }

    /// Single exit path for every TCP session.
    pub fn teardown(&self, session: &Arc<TcpSession>, reason: Teardown) {
        let Some(tracker) = self.flows.remove_tcp_if(session) else {
            session.close();
            return;
        };

        let established = session.phase() == TcpPhase::Established;
        match reason {
            Teardown::ClientFin if established => {
                session.emit_fin(&self.writer, true);
            }
            Teardown::RemoteClosed | Teardown::Idle if established => {
                session.emit_fin(&self.writer, false);
            }
            _ => {}
        }

        match reason {
            Teardown::ClientFin | Teardown::RemoteClosed => {
                session.close();
                self.flows.release_relay(&session.key);
            }
            _ => {
                session.abort();
                self.flows.abort_relay(&session.key);
            }
        }

        if reason != Teardown::ConnectFailed {
            let mut tracker = tracker.lock();
            tracker.flush();
            self.events.flow(&mut tracker);
        }
        debug!("{} closed ({:?})", session.key, reason);
    }

    pub fn sweep_idle(&self) {
        let idle = self.config.idle_timeout();
        self.flows.reap_released_relays(idle);
        for session in self.flows.idle_tcp(idle) {
            self.teardown(&session, Teardown::Idle);
        }
        for key in self.flows.idle_udp(idle) {
            if let Some((flow, _)) = self.flows.remove_udp(&key) {
                flow.close();
                debug!("{} expired", key);
            }
        }
    }

    /// Tears down every flow, emitting pending events, then empties the
    /// tables.
    pub fn drain(&self) {
        for session in self.flows.tcp_sessions() {
            self.teardown(&session, Teardown::Shutdown);
        }
        for key in self.flows.udp_keys() {
            if let Some((flow, _)) = self.flows.remove_udp(&key) {
                flow.close();
            }
        }
        self.flows.clear();
    }
}

async fn run_upstream(ctx: Arc<FlowContext>, session: Arc<TcpSession>, socket: TcpSocket, target: SocketAddrV4) {
    let key = session.key;
    let stream = match socket.connect(SocketAddr::V4(target)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("{} connect to {} failed: {}", key, target, e);
            ctx.teardown(&session, Teardown::ConnectFailed);
            return;
        }
    };
    if !ctx.is_current(&session) {
        return;
    }

    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    session.attach_upstream(tx);
    let writer_task = tokio::spawn(write_upstream(key, writer, rx)).abort_handle();
    session.set_writer_task(writer_task);

    if session.establish(&ctx.writer, rand::random::<u32>()) {
        debug!("{} SYN-ACK sent", key);
    }

    read_upstream(&ctx, &session, reader).await;
    ctx.teardown(&session, Teardown::RemoteClosed);
}

async fn read_upstream(ctx: &FlowContext, session: &TcpSession, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; ctx.config.mtu.saturating_sub(packet::IPV4_HEADER_LEN + packet::TCP_HEADER_LEN).max(536)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("{} remote closed", session.key);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("{} upstream read failed: {}", session.key, e);
                return;
            }
        };

        session.touch();
        let data = &buf[..n];
        if !session.emit(&ctx.writer, tcp_flags::PSH_ACK, data) {
            debug!("{} virtual interface gone", session.key);
            return;
        }
        ctx.observe(&session.key, Direction::Incoming, data);
    }
}

async fn write_upstream(key: FlowKey, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(chunk) = rx.recv().await {
        match timeout(UPSTREAM_WRITE_TIMEOUT, writer.write_all(&chunk)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("{} upstream write failed: {}", key, e);
                return;
            }
            Err(_) => {
                warn!("{} upstream write stalled, giving up", key);
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Reads frames off the virtual interface and drives every flow.
pub struct PacketPump {
    ctx: Arc<FlowContext>,
}

impl PacketPump {
    pub fn new(ctx: Arc<FlowContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<FlowContext> {
        &self.ctx
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<Bytes>, shutdown: GracefulShutdown) {
        info!("Packet pump started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => {
                        info!("Virtual interface closed");
                        break;
                    }
                },
            }
        }
        info!("Packet pump stopped");
    }

    /// Handles one raw frame. Never awaits.
    pub fn handle_frame(&self, frame: &[u8]) {
        let Some(ip) = packet::parse_ipv4(frame) else {
            counter!("tunscope_frames_total", "result" => "malformed").increment(1);
            return;
        };
        match ip.header.protocol {
            PROTO_UDP => self.handle_udp(&ip),
            PROTO_TCP => self.handle_tcp(&ip),
            _ => {
                counter!("tunscope_frames_total", "result" => "ignored").increment(1);
            }
        }
    }

    fn handle_udp(&self, ip: &Ipv4Frame<'_>) {
        let Some(datagram) = packet::parse_udp(ip.payload) else {
            counter!("tunscope_frames_total", "result" => "malformed").increment(1);
            return;
        };
        counter!("tunscope_frames_total", "result" => "udp").increment(1);
        if datagram.payload.is_empty() {
            return;
        }

        let ctx = &self.ctx;
        let key = FlowKey::new(
            SocketAddrV4::new(ip.header.source, datagram.header.source_port),
            SocketAddrV4::new(ip.header.destination, datagram.header.destination_port),
            Transport::Udp,
        );

        let (flow, tracker) = match ctx.flows.udp_flow(&key) {
            Some(flow) => (flow, ctx.flows.tracker_or_insert(key, ctx.config.max_sniff_buffer)),
            None => {
                let tracker = Arc::new(Mutex::new(ConnectionTracker::new(key, ctx.config.max_sniff_buffer)));
                match UdpFlow::open(
                    key,
                    ctx.protector.as_ref(),
                    ctx.writer.clone(),
                    tracker.clone(),
                    ctx.flows.clone(),
                ) {
                    Ok(flow) => {
                        let flow = Arc::new(flow);
                        ctx.flows.insert_udp(flow.clone(), tracker.clone());
                        counter!("tunscope_flows_opened_total", "transport" => "udp").increment(1);
                        debug!("{} opened", key);
                        (flow, tracker)
                    }
                    Err(e) => {
                        warn!("{} abandoned: {}", key, e);
                        return;
                    }
                }
            }
        };

        let size = datagram.payload.len();
        let (sent, received) = {
            let mut tracker = tracker.lock();
            tracker.count(Direction::Outgoing, size);
            (tracker.bytes_sent, tracker.bytes_received)
        };
        ctx.events.datagram(&key, size, sent, received);
        flow.send(datagram.payload);
    }

    fn handle_tcp(&self, ip: &Ipv4Frame<'_>) {
        let Some(segment) = packet::parse_tcp(ip.payload) else {
            counter!("tunscope_frames_total", "result" => "malformed").increment(1);
            return;
        };
        counter!("tunscope_frames_total", "result" => "tcp").increment(1);

        let ctx = &self.ctx;
        let header = &segment.header;
        let key = FlowKey::new(
            SocketAddrV4::new(ip.header.source, header.source_port),
            SocketAddrV4::new(ip.header.destination, header.destination_port),
            Transport::Tcp,
        );

        if header.has(tcp_flags::RST) {
            if let Some(session) = ctx.flows.tcp_session(&key) {
                ctx.teardown(&session, Teardown::ClientReset);
            }
            return;
        }

        if header.has(tcp_flags::SYN) && !header.has(tcp_flags::ACK) {
            self.on_syn(key, header.sequence);
            return;
        }

        let Some(session) = ctx.flows.tcp_session(&key) else {
            if !segment.payload.is_empty() && ctx.config.late_packet_recovery && !header.has(tcp_flags::FIN) {
                debug!("{} data without a session, recovering", key);
                ctx.open_session(key, SequenceState::recovering(header.sequence, header.acknowledgement));
            }
            return;
        };

        session.touch();
        if header.has(tcp_flags::ACK) {
            session.note_client_ack(header.acknowledgement);
        }
        if !segment.payload.is_empty() {
            self.on_client_data(&session, header, segment.payload);
        }
        if header.has(tcp_flags::FIN) {
            ctx.teardown(&session, Teardown::ClientFin);
        }
    }

    fn on_syn(&self, key: FlowKey, isn: u32) {
        if let Some(existing) = self.ctx.flows.tcp_session(&key) {
            if existing.client_isn() == isn {
                debug!("{} duplicate SYN ignored", key);
                return;
            }
            self.ctx.teardown(&existing, Teardown::Replaced);
        }
        self.ctx.open_session(key, SequenceState::from_syn(isn));
    }

    fn on_client_data(&self, session: &Arc<TcpSession>, header: &TcpHeader, payload: &[u8]) {
        let (disposition, forwarded) = session.forward(header.sequence, payload);
        match disposition {
            SegmentDisposition::NotEstablished => return,
            SegmentDisposition::Forward { offset } if forwarded > 0 => {
                self.ctx
                    .observe(&session.key, Direction::Outgoing, &payload[offset..offset + forwarded]);
            }
            SegmentDisposition::Gap => debug!("{} out-of-order segment dropped", session.key),
            _ => {}
        }
        session.emit(&self.ctx.writer, tcp_flags::ACK, &[]);
    }
}
