// src/udp.rs
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::device::PacketWriter;
use crate::error::{Error, Result};
use crate::packet::build_udp_packet;
use crate::protect::SocketProtector;
use crate::sniff::Direction;
use crate::state::{FlowManager, SharedTracker};
use crate::tcp::FlowKey;

const MAX_DATAGRAM: usize = 65535;

/// A connected datagram socket standing in for one captured UDP flow.
#[derive(Debug)]
pub struct UdpFlow {
    pub key: FlowKey,
    socket: Arc<UdpSocket>,
    /// Second handle on the same socket. Sends go through it so they never
    /// depend on the reactor having polled the socket yet.
    sender: Socket,
    reader: AbortHandle,
    last_activity: Arc<Mutex<Instant>>,
}

impl UdpFlow {
    /// Opens, excludes and connects the real socket, then starts the reader
    /// that turns replies into synthetic datagrams. Must run inside a tokio
    /// runtime; never awaits. A reader that fails for good removes the flow
    /// from `flows`, so the next datagram reopens it.
    pub fn open(
        key: FlowKey,
        protector: &dyn SocketProtector,
        writer: PacketWriter,
        tracker: SharedTracker,
        flows: Arc<FlowManager>,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if !protector.exclude(&socket) {
            return Err(Error::Exclusion(key.to_string()));
        }
        socket.connect(&SocketAddr::V4(key.server()).into())?;
        socket.set_nonblocking(true)?;
        let sender = socket.try_clone()?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);

        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let reader = tokio::spawn(read_replies(
            key,
            socket.clone(),
            writer,
            tracker,
            flows,
            last_activity.clone(),
        ))
        .abort_handle();

        Ok(Self {
            key,
            socket,
            sender,
            reader,
            last_activity,
        })
    }

    pub(crate) fn uses_socket(&self, socket: &Arc<UdpSocket>) -> bool {
        Arc::ptr_eq(&self.socket, socket)
    }

    /// Non-blocking send; a full socket buffer drops the datagram.
    pub fn send(&self, payload: &[u8]) -> bool {
        *self.last_activity.lock() = Instant::now();
        match self.sender.send(payload) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("{} send buffer full, dropping {} bytes", self.key, payload.len());
                false
            }
            Err(e) => {
                debug!("{} send failed: {}", self.key, e);
                false
            }
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn close(&self) {
        self.reader.abort();
    }
}

impl Drop for UdpFlow {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(
    key: FlowKey,
    socket: Arc<UdpSocket>,
    writer: PacketWriter,
    tracker: SharedTracker,
    flows: Arc<FlowManager>,
    last_activity: Arc<Mutex<Instant>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            // ICMP errors surface here on connected sockets and only concern
            // the datagram that caused them.
            Err(e) if is_transient(&e) => {
                debug!("{} receive error, still listening: {}", key, e);
                continue;
            }
            Err(e) => {
                warn!("{} receive failed: {}", key, e);
                break;
            }
        };

        *last_activity.lock() = Instant::now();
        tracker.lock().count(Direction::Incoming, n);
        if !writer.write(build_udp_packet(key.server(), key.client(), &buf[..n])) {
            debug!("{} virtual interface gone, stopping reader", key);
            break;
        }
    }

    if flows.remove_udp_if(&key, |flow| flow.uses_socket(&socket)).is_some() {
        debug!("{} removed after its reader stopped", key);
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || e.raw_os_error().is_some_and(|code| {
        code == libc::EHOSTUNREACH || code == libc::ENETUNREACH || code == libc::EMSGSIZE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{self, InterfaceHandle};
    use crate::packet::{parse_ipv4, parse_udp};
    use crate::protect::NoExclusion;
    use crate::tcp::Transport;
    use crate::tracker::ConnectionTracker;
    use std::net::SocketAddrV4;
    use tokio::time::timeout;

    #[derive(Debug)]
    struct Refuse;

    impl SocketProtector for Refuse {
        fn exclude(&self, _socket: &Socket) -> bool {
            false
        }
    }

    fn key_for(server: SocketAddrV4) -> FlowKey {
        FlowKey::new("10.0.0.2:5353".parse().unwrap(), server, Transport::Udp)
    }

    fn tracker_for(key: FlowKey) -> SharedTracker {
        Arc::new(Mutex::new(ConnectionTracker::new(key, 1024)))
    }

    async fn next_reply(handle: &mut InterfaceHandle) -> Vec<u8> {
        let frame = timeout(Duration::from_secs(5), handle.next_frame()).await.unwrap().unwrap();
        let ip = parse_ipv4(&frame).unwrap();
        parse_udp(ip.payload).unwrap().payload.to_vec()
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(server) = echo.local_addr().unwrap() else {
            panic!("ipv4 expected");
        };
        let (iface, mut handle) = device::channel(8);
        let key = key_for(server);
        let tracker = tracker_for(key);

        let flow = UdpFlow::open(key, &NoExclusion, iface.writer(), tracker.clone(), Arc::new(FlowManager::new())).unwrap();
        assert!(flow.send(b"ping"));

        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(5), echo.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"ping");
        echo.send_to(b"pong!", from).await.unwrap();

        let frame = timeout(Duration::from_secs(5), handle.next_frame()).await.unwrap().unwrap();
        let ip = parse_ipv4(&frame).unwrap();
        assert_eq!(ip.header.source, *server.ip());
        assert_eq!(ip.header.destination, *key.client().ip());
        let udp = parse_udp(ip.payload).unwrap();
        assert_eq!(udp.header.source_port, server.port());
        assert_eq!(udp.header.destination_port, 5353);
        assert_eq!(udp.payload, b"pong!");
        assert_eq!(tracker.lock().bytes_received, 5);
    }

    #[tokio::test]
    async fn test_datagrams_sent_right_after_open_all_arrive() {
        let server_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(server) = server_socket.local_addr().unwrap() else {
            panic!("ipv4 expected");
        };
        let (iface, _handle) = device::channel(8);
        let key = key_for(server);

        let flow = UdpFlow::open(key, &NoExclusion, iface.writer(), tracker_for(key), Arc::new(FlowManager::new())).unwrap();
        let sent: Vec<bool> = [&b"one"[..], b"two", b"three"].iter().map(|p| flow.send(p)).collect();
        assert_eq!(sent, vec![true, true, true]);

        let mut buf = [0u8; 16];
        for expected in [&b"one"[..], b"two", b"three"] {
            let n = timeout(Duration::from_secs(5), server_socket.recv(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf[..n], expected);
        }
    }

    #[tokio::test]
    async fn test_reply_after_refused_datagram_still_arrives() {
        let placeholder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let SocketAddr::V4(server) = placeholder.local_addr().unwrap() else {
            panic!("ipv4 expected");
        };
        drop(placeholder);

        let (iface, mut handle) = device::channel(8);
        let key = key_for(server);
        let tracker = tracker_for(key);
        let flows = Arc::new(FlowManager::new());
        let flow = Arc::new(UdpFlow::open(key, &NoExclusion, iface.writer(), tracker.clone(), flows.clone()).unwrap());
        flows.insert_udp(flow.clone(), tracker);

        // Nobody listens yet: the port-unreachable lands on the reader.
        assert!(flow.send(b"lost"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let server_socket = tokio::net::UdpSocket::bind(SocketAddr::V4(server)).await.unwrap();
        assert!(flow.send(b"retry"));
        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(5), server_socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"retry");
        server_socket.send_to(b"answer", from).await.unwrap();

        assert_eq!(next_reply(&mut handle).await, b"answer");
        assert_eq!(flows.udp_count(), 1);
    }

    #[tokio::test]
    async fn test_stopped_reader_removes_its_flow() {
        let server_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(server) = server_socket.local_addr().unwrap() else {
            panic!("ipv4 expected");
        };
        let (iface, handle) = device::channel(8);
        let key = key_for(server);
        let tracker = tracker_for(key);
        let flows = Arc::new(FlowManager::new());
        let flow = Arc::new(UdpFlow::open(key, &NoExclusion, iface.writer(), tracker.clone(), flows.clone()).unwrap());
        flows.insert_udp(flow.clone(), tracker);
        drop(flow);

        // With the interface gone the reader cannot deliver and gives up.
        drop(handle);
        drop(iface);
        assert!(flows.udp_flow(&key).unwrap().send(b"hello"));
        let mut buf = [0u8; 16];
        let (_, from) = timeout(Duration::from_secs(5), server_socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        server_socket.send_to(b"late", from).await.unwrap();

        for _ in 0..100 {
            if flows.udp_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(flows.udp_count(), 0);
        assert_eq!(flows.tracker_count(), 0);
    }

    #[tokio::test]
    async fn test_exclusion_failure_abandons_flow() {
        let (iface, _handle) = device::channel(1);
        let key = key_for("127.0.0.1:9".parse().unwrap());

        let err = UdpFlow::open(key, &Refuse, iface.writer(), tracker_for(key), Arc::new(FlowManager::new())).unwrap_err();
        assert!(matches!(err, Error::Exclusion(_)));
    }
}
