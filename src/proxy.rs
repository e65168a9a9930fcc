// src/proxy.rs - loopback relay: blind tunnels and TLS interception
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use metrics::counter;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::ca::{LeafIssuer, HTTP1_ALPN};
use crate::error::{Error, Result};
use crate::event::EventPipeline;
use crate::graceful::GracefulShutdown;
use crate::protect::{protected_tcp_socket, SocketProtector};
use crate::sniff::Direction;
use crate::state::{FlowManager, RelayMode, RelayTarget};
use crate::tcp::FlowKey;

const BUFFER_SIZE: usize = 16 * 1024;

/// Client config for the re-encrypted upstream leg: Mozilla roots plus any
/// extra PEM bundles.
pub fn upstream_client_config(extra_root_pems: &[PathBuf]) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for path in extra_root_pems {
        let certs = CertificateDer::pem_file_iter(path)
            .map_err(|e| Error::tls(format!("reading {}: {}", path.display(), e)))?;
        for cert in certs {
            let cert = cert.map_err(|e| Error::tls(format!("parsing {}: {}", path.display(), e)))?;
            roots.add(cert)?;
        }
    }

    let mut config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];
    Ok(Arc::new(config))
}

struct RelayContext {
    flows: Arc<FlowManager>,
    events: Arc<EventPipeline>,
    protector: Arc<dyn SocketProtector>,
    issuer: Arc<LeafIssuer>,
    connector: TlsConnector,
}

impl RelayContext {
    fn observe_decrypted(&self, key: &FlowKey, direction: Direction, data: &[u8]) {
        let Some(tracker) = self.flows.tracker(key) else {
            return;
        };
        let mut tracker = tracker.lock();
        tracker.observe_decrypted(direction, data);
        if tracker.ready_to_emit() {
            self.events.flow(&mut tracker);
        }
    }

    async fn connect_upstream(&self, destination: SocketAddrV4) -> Result<TcpStream> {
        let socket = protected_tcp_socket(self.protector.as_ref(), None)?;
        socket
            .connect(SocketAddr::V4(destination))
            .await
            .map_err(|e| Error::connect(format!("{}: {}", destination, e)))
    }
}

/// Accepts the engine's loopback connections and serves each according to
/// the `RelayTarget` registered under its source port.
pub struct InterceptionRelay {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
}

impl InterceptionRelay {
    pub async fn bind(
        addr: SocketAddr,
        flows: Arc<FlowManager>,
        events: Arc<EventPipeline>,
        protector: Arc<dyn SocketProtector>,
        issuer: Arc<LeafIssuer>,
        upstream: Arc<ClientConfig>,
    ) -> Result<Self> {
        if !addr.is_ipv4() {
            return Err(Error::Config(format!("relay must listen on IPv4, got {}", addr)));
        }
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            ctx: Arc::new(RelayContext {
                flows,
                events,
                protector,
                issuer,
                connector: TlsConnector::from(upstream),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        match self.listener.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(addr) => Err(Error::Config(format!("relay bound to IPv6 {}", addr))),
        }
    }

    pub async fn run(self, shutdown: GracefulShutdown) {
        info!("Relay listening on {:?}", self.listener.local_addr());
        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => warn!("Relay accept failed: {}", e),
                },
            }
        }
        info!("Relay stopped");
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(target) = self.ctx.flows.relay_target(peer.port()) else {
            debug!("Relay connection from unknown port {}, dropping", peer.port());
            return;
        };

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(handle_connection(ctx, stream, target)).abort_handle();
        self.ctx.flows.register_relay_task(target.key, handle);

        // The flow may have closed between accept and registration.
        if self.ctx.flows.tcp_session(&target.key).is_none() {
            self.ctx.flows.abort_relay(&target.key);
        }
    }
}

async fn handle_connection(ctx: Arc<RelayContext>, client: TcpStream, target: RelayTarget) {
    let result = match target.mode {
        RelayMode::Tunnel => tunnel(&ctx, client, &target).await,
        RelayMode::Intercept => intercept(&ctx, client, &target).await,
    };
    if let Err(e) = result {
        warn!("{} relay failed: {}", target.key, e);
    }
}

async fn tunnel(ctx: &RelayContext, mut client: TcpStream, target: &RelayTarget) -> Result<()> {
    let mut server = ctx.connect_upstream(target.destination).await?;
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    debug!("{} tunnel closed ({} up, {} down)", target.key, up, down);
    Ok(())
}

async fn intercept(ctx: &Arc<RelayContext>, client: TcpStream, target: &RelayTarget) -> Result<()> {
    let key = target.key;
    let start = LazyConfigAcceptor::new(Acceptor::default(), client).await.map_err(|e| {
        counter!("tunscope_relay_handshake_failures_total", "side" => "client").increment(1);
        Error::tls(format!("reading ClientHello: {}", e))
    })?;

    let sni = start.client_hello().server_name().map(|s| s.to_ascii_lowercase());
    let tracker = ctx.flows.tracker(&key);
    let sniffed = tracker.as_ref().and_then(|t| t.lock().tls_server_name.clone());
    if let (Some(tracker), Some(name)) = (&tracker, &sni) {
        tracker.lock().note_server_name(name);
    }
    let host = sni
        .or(sniffed)
        .unwrap_or_else(|| target.destination.ip().to_string());

    let issuer = ctx.issuer.clone();
    let leaf_host = host.clone();
    let leaf = tokio::task::spawn_blocking(move || issuer.issue(&leaf_host))
        .await
        .map_err(|e| Error::certificate(format!("leaf issuance aborted: {}", e)))??;

    // No fallback once the ClientHello is consumed: fail closed.
    let downstream = start.into_stream(leaf.server_config.clone()).await.map_err(|e| {
        counter!("tunscope_relay_handshake_failures_total", "side" => "client").increment(1);
        Error::tls(format!("client handshake for {}: {}", host, e))
    })?;

    let server = ctx.connect_upstream(target.destination).await?;
    let server_name = ServerName::try_from(host.as_str())
        .map_err(|e| Error::tls(format!("invalid server name {}: {}", host, e)))?
        .to_owned();
    let upstream = ctx.connector.connect(server_name, server).await.map_err(|e| {
        counter!("tunscope_relay_handshake_failures_total", "side" => "upstream").increment(1);
        Error::tls(format!("upstream handshake with {}: {}", host, e))
    })?;

    info!("{} decrypting {}", key, host);
    let (client_read, client_write) = tokio::io::split(downstream);
    let (server_read, server_write) = tokio::io::split(upstream);

    let mut relays = JoinSet::new();
    relays.spawn(forward(ctx.clone(), key, Direction::Outgoing, client_read, server_write));
    relays.spawn(forward(ctx.clone(), key, Direction::Incoming, server_read, client_write));
    while let Some(joined) = relays.join_next().await {
        match joined {
            Ok(Ok(bytes)) => debug!("{} relay direction done after {} bytes", key, bytes),
            Ok(Err(e)) => debug!("{} relay direction failed: {}", key, e),
            Err(e) => debug!("{} relay task ended: {}", key, e),
        }
    }
    Ok(())
}

/// One direction of a decrypted connection. Bytes are forwarded first and
/// sniffed after.
async fn forward<R, W>(ctx: Arc<RelayContext>, key: FlowKey, direction: Direction, mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            // Peers that skip close_notify.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        ctx.observe_decrypted(&key, direction, &buf[..n]);
    }
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::event::{AppProtocol, NoAttribution, TrafficEvent};
    use crate::protect::NoExclusion;
    use crate::tcp::Transport;
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, RsaKeySize, PKCS_RSA_SHA256,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio_rustls::rustls::ServerConfig;
    use tokio_rustls::TlsAcceptor;

    struct Fixture {
        _dir: tempfile::TempDir,
        ca: Arc<CertificateAuthority>,
        issuer: Arc<LeafIssuer>,
        flows: Arc<FlowManager>,
        events: mpsc::UnboundedReceiver<TrafficEvent>,
        relay_addr: SocketAddrV4,
        shutdown: GracefulShutdown,
    }

    /// A CA and a `localhost` server identity for the fake upstream.
    fn upstream_identity() -> (String, Arc<ServerConfig>) {
        let ca_key = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048).unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "Upstream Test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let ca_pem = ca_cert.pem();
        let issuer = Issuer::from_ca_cert_pem(&ca_pem, ca_key).unwrap();

        let leaf_key = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048).unwrap();
        let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.der().clone()], key)
            .unwrap();
        (ca_pem, Arc::new(config))
    }

    async fn fixture(extra_roots: Vec<PathBuf>, dir: tempfile::TempDir) -> Fixture {
        let ca = Arc::new(CertificateAuthority::load_or_create(&dir.path().join("ca")).unwrap());
        let issuer = Arc::new(LeafIssuer::new(ca.clone()).unwrap());
        let flows = Arc::new(FlowManager::new());
        let (tx, events) = mpsc::unbounded_channel();
        let pipeline = Arc::new(EventPipeline::new(Arc::new(tx), Arc::new(NoAttribution)));

        let relay = InterceptionRelay::bind(
            "127.0.0.1:0".parse().unwrap(),
            flows.clone(),
            pipeline,
            Arc::new(NoExclusion),
            issuer.clone(),
            upstream_client_config(&extra_roots).unwrap(),
        )
        .await
        .unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let shutdown = GracefulShutdown::new();
        tokio::spawn(relay.run(shutdown.clone()));

        Fixture {
            _dir: dir,
            ca,
            issuer,
            flows,
            events,
            relay_addr,
            shutdown,
        }
    }

    /// Opens the engine-side loopback connection for `key`, routed as `mode`.
    async fn loopback(f: &Fixture, key: FlowKey, mode: RelayMode) -> TcpStream {
        let session = crate::tcp::TcpSession::new(key, crate::tcp::SequenceState::from_syn(1), 65535);
        f.flows.insert_tcp(Arc::new(session));
        f.flows.tracker_or_insert(key, 1 << 20);

        let socket = protected_tcp_socket(&NoExclusion, Some("127.0.0.1:0".parse().unwrap())).unwrap();
        let port = socket.local_addr().unwrap().port();
        f.flows.register_relay_target(
            port,
            RelayTarget {
                key,
                destination: key.server(),
                mode,
            },
        );
        socket.connect(SocketAddr::V4(f.relay_addr)).await.unwrap()
    }

    #[tokio::test]
    async fn test_intercepted_request_is_decrypted_and_reported() {
        let (upstream_ca, upstream_config) = upstream_identity();
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(upstream_addr) = upstream.local_addr().unwrap() else {
            panic!("ipv4 expected");
        };
        let acceptor = TlsAcceptor::from(upstream_config);
        let server = tokio::spawn(async move {
            let (tcp, _) = upstream.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = tls.read(&mut buf).await.unwrap();
                assert!(n > 0);
                request.extend_from_slice(&buf[..n]);
            }
            tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await.unwrap();
            tls.shutdown().await.unwrap();
            String::from_utf8(request).unwrap()
        });

        let dir = tempfile::tempdir().unwrap();
        let pem_path = dir.path().join("upstream.pem");
        std::fs::write(&pem_path, upstream_ca).unwrap();
        let mut f = fixture(vec![pem_path], dir).await;

        let key = FlowKey::new("10.0.0.2:40443".parse().unwrap(), upstream_addr, Transport::Tcp);
        let stream = loopback(&f, key, RelayMode::Intercept).await;

        let mut roots = RootCertStore::empty();
        roots.add(f.ca.cert_der().clone()).unwrap();
        let client_config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));
        let mut tls = connector
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .unwrap();

        tls.write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        timeout(Duration::from_secs(10), tls.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.ends_with(b"\r\n\r\nok"));
        assert!(server.await.unwrap().starts_with("GET /hello HTTP/1.1"));

        let event = timeout(Duration::from_secs(5), f.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.protocol, AppProtocol::Https);
        assert_eq!(event.url, "https://localhost/hello");
        assert_eq!(event.tls_server_name.as_deref(), Some("localhost"));
        assert_eq!(event.response_body.as_deref(), Some("ok"));
        assert!(event.is_decrypted);
        assert_eq!(f.issuer.generated_count(), 1);
        f.shutdown.initiate_shutdown();
    }

    #[tokio::test]
    async fn test_failed_client_handshake_closes_without_fallback() {
        let f = fixture(Vec::new(), tempfile::tempdir().unwrap()).await;
        let key = FlowKey::new("10.0.0.2:40444".parse().unwrap(), "127.0.0.1:9".parse().unwrap(), Transport::Tcp);
        let mut stream = loopback(&f, key, RelayMode::Intercept).await;

        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        // At most a TLS alert comes back before the close.
        let mut received = Vec::new();
        let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut received)).await.unwrap();
        assert!(received.is_empty() || received[0] == 0x15);
        assert_eq!(f.issuer.generated_count(), 0);
        f.shutdown.initiate_shutdown();
    }

    #[tokio::test]
    async fn test_tunnel_copies_bytes_unchanged() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(upstream_addr) = upstream.local_addr().unwrap() else {
            panic!("ipv4 expected");
        };
        tokio::spawn(async move {
            let (mut tcp, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            tcp.read_exact(&mut buf).await.unwrap();
            tcp.write_all(&buf).await.unwrap();
        });

        let f = fixture(Vec::new(), tempfile::tempdir().unwrap()).await;
        let key = FlowKey::new("10.0.0.2:40080".parse().unwrap(), upstream_addr, Transport::Tcp);
        let mut stream = loopback(&f, key, RelayMode::Tunnel).await;

        stream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"hello");
        f.shutdown.initiate_shutdown();
    }

    #[tokio::test]
    async fn test_unregistered_port_is_dropped() {
        let f = fixture(Vec::new(), tempfile::tempdir().unwrap()).await;
        let mut stream = TcpStream::connect(SocketAddr::V4(f.relay_addr)).await.unwrap();
        let mut buf = [0u8; 8];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[test]
    fn test_missing_extra_root_is_an_error() {
        let err = upstream_client_config(&[PathBuf::from("/nonexistent/roots.pem")]).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }
}
