//! End-to-end proxy engine tests
//!
//! Every test runs a real accept loop on an ephemeral loopback port. The
//! destination resolver and the upstream connector are replaced so the
//! tests need neither iptables nor root: the resolver reports a fixed
//! "original destination" and the connector records the address it was
//! asked for while actually connecting to a local upstream listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use zmesh_dataplane::config::{ConnectionConfig, DialPolicy, ListenerConfig, Mode};
use zmesh_dataplane::error::{DataplaneError, DialError, ResolutionError};
use zmesh_dataplane::proxy::{
    Action, ConnectionContext, ConnectionState, DestinationResolver, Direction, Event,
    ProxyEngine, ProxyListener, UpstreamConnector, UpstreamState,
};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test doubles
// ============================================================================

/// Reports a fixed original destination and counts lookups
struct FixedResolver {
    reported: SocketAddr,
    calls: AtomicUsize,
}

impl FixedResolver {
    fn new(reported: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            reported,
            calls: AtomicUsize::new(0),
        })
    }
}

impl DestinationResolver for FixedResolver {
    fn resolve(&self, _stream: &TcpStream) -> Result<SocketAddr, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reported)
    }
}

/// Records dial targets and connects to `actual` instead
struct RecordingConnector {
    actual: SocketAddr,
    dials: Mutex<Vec<SocketAddr>>,
    delay: Duration,
}

impl RecordingConnector {
    fn new(actual: SocketAddr) -> Arc<Self> {
        Self::with_delay(actual, Duration::ZERO)
    }

    fn with_delay(actual: SocketAddr, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            actual,
            dials: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn dials(&self) -> Vec<SocketAddr> {
        self.dials.lock().clone()
    }
}

#[async_trait]
impl UpstreamConnector for RecordingConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        _connect_timeout: Duration,
    ) -> Result<TcpStream, DialError> {
        self.dials.lock().push(addr);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        TcpStream::connect(self.actual)
            .await
            .map_err(|e| DialError::connection_failed(addr, e.to_string()))
    }
}

/// Every dial times out
struct TimeoutConnector;

#[async_trait]
impl UpstreamConnector for TimeoutConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<TcpStream, DialError> {
        Err(DialError::Timeout {
            addr,
            timeout: connect_timeout,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn listener_config(mode: Mode, policy: DialPolicy) -> ListenerConfig {
    let mut config = ListenerConfig::new("127.0.0.1", 18090, mode);
    config.dial_policy = policy;
    config
}

fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        drain_timeout_secs: 5,
        reuse_port: false,
        ..ConnectionConfig::default()
    }
}

struct Running {
    engine: Arc<ProxyEngine>,
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<(), DataplaneError>>,
}

/// Serve `engine` on an ephemeral loopback port
fn serve(engine: ProxyEngine, connection: &ConnectionConfig) -> Running {
    let listener = ProxyListener::bind("127.0.0.1:0".parse().unwrap(), connection).unwrap();
    let addr = listener.local_addr();
    let engine = Arc::new(engine);
    let (shutdown, rx) = broadcast::channel(1);
    let task = tokio::spawn(Arc::clone(&engine).serve(listener, rx));
    Running {
        engine,
        addr,
        shutdown,
        task,
    }
}

async fn accept_upstream(upstream: &TcpListener) -> TcpStream {
    let (stream, _) = timeout(IO_TIMEOUT, upstream.accept())
        .await
        .expect("upstream accept timed out")
        .unwrap();
    stream
}

async fn client_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    (client, server, peer)
}

// ============================================================================
// Relaying
// ============================================================================

#[tokio::test]
async fn test_sidecar_forwards_to_original_destination() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let reported: SocketAddr = "203.0.113.5:9000".parse().unwrap();
    let resolver = FixedResolver::new(reported);
    let connector = RecordingConnector::new(upstream.local_addr().unwrap());

    let connection = connection_config();
    let engine = ProxyEngine::new(
        Direction::Outbound,
        listener_config(Mode::Sidecar, DialPolicy::OnOpen),
        &connection,
    )
    .with_resolver(resolver.clone())
    .with_connector(connector.clone());
    let running = serve(engine, &connection);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut up = accept_upstream(&upstream).await;

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(IO_TIMEOUT, up.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    up.write_all(b"pong").await.unwrap();
    timeout(IO_TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");

    assert_eq!(connector.dials(), vec![reported]);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

    drop(up);
    drop(client);
    let _ = running.shutdown.send(());
    timeout(IO_TIMEOUT, running.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let stats = running.engine.stats();
    assert_eq!(stats.total_accepted, 1);
    assert_eq!(stats.bytes_up, 4);
    assert_eq!(stats.bytes_down, 4);
}

#[tokio::test]
async fn test_proxy_mode_dials_static_target() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let resolver = FixedResolver::new("203.0.113.5:9000".parse().unwrap());
    let connector = RecordingConnector::new(upstream.local_addr().unwrap());

    let connection = connection_config();
    let engine = ProxyEngine::new(
        Direction::Inbound,
        listener_config(Mode::Proxy, DialPolicy::OnOpen),
        &connection,
    )
    .with_resolver(resolver.clone())
    .with_connector(connector.clone());
    let running = serve(engine, &connection);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut up = accept_upstream(&upstream).await;

    client.write_all(b"hello").await.unwrap();
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(IO_TIMEOUT, up.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"hello");

    let target: SocketAddr = "127.0.0.1:8888".parse().unwrap();
    assert_eq!(connector.dials(), vec![target]);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);

    let _ = running.shutdown.send(());
}

#[tokio::test]
async fn test_upstream_close_reaches_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connection = connection_config();
    let engine = ProxyEngine::new(
        Direction::Outbound,
        listener_config(Mode::Proxy, DialPolicy::OnOpen),
        &connection,
    )
    .with_connector(RecordingConnector::new(upstream.local_addr().unwrap()));
    let running = serve(engine, &connection);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut up = accept_upstream(&upstream).await;

    up.write_all(b"banner").await.unwrap();
    up.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(IO_TIMEOUT, client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"banner");

    let _ = running.shutdown.send(());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_dial_failure_closes_client() {
    let connection = connection_config();
    let engine = ProxyEngine::new(
        Direction::Outbound,
        listener_config(Mode::Sidecar, DialPolicy::OnOpen),
        &connection,
    )
    .with_resolver(FixedResolver::new("203.0.113.5:9000".parse().unwrap()))
    .with_connector(Arc::new(TimeoutConnector));

    let (mut client, server, peer) = client_pair().await;
    let ctx = timeout(IO_TIMEOUT, engine.drive(server, peer))
        .await
        .unwrap();

    assert_eq!(ctx.state(), ConnectionState::Closed);
    assert_ne!(ctx.upstream_state().await, UpstreamState::Present);

    let stats = engine.stats();
    assert_eq!(stats.dial_failures, 1);
    assert_eq!(stats.errored, 1);

    drop(ctx);
    let mut buf = Vec::new();
    let n = timeout(IO_TIMEOUT, client.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_unresponsive_upstream_closes_within_dial_timeout() {
    // Zero backlog and no accept: the second SYN is dropped
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&bind.into()).unwrap();
    listener.listen(0).unwrap();
    let target = listener.local_addr().unwrap().as_socket().unwrap();
    let _queued = TcpStream::connect(target).await.unwrap();

    let mut config = listener_config(Mode::Proxy, DialPolicy::OnOpen);
    config.target = target;
    config.dial_timeout_ms = Some(200);
    let engine = ProxyEngine::new(Direction::Outbound, config, &connection_config());

    let (_client, server, peer) = client_pair().await;
    let start = Instant::now();
    let ctx = timeout(Duration::from_secs(2), engine.drive(server, peer))
        .await
        .expect("connection not closed within the dial timeout");

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(ctx.state(), ConnectionState::Closed);
    assert_ne!(ctx.upstream_state().await, UpstreamState::Present);
    assert_eq!(engine.stats().dial_failures, 1);
}

#[tokio::test]
async fn test_admission_limit_rejects_excess() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connection = ConnectionConfig {
        max_connections: 1,
        ..connection_config()
    };
    let engine = ProxyEngine::new(
        Direction::Outbound,
        listener_config(Mode::Proxy, DialPolicy::OnOpen),
        &connection,
    )
    .with_connector(RecordingConnector::new(upstream.local_addr().unwrap()));
    let running = serve(engine, &connection);

    let _first = TcpStream::connect(running.addr).await.unwrap();
    let _up = accept_upstream(&upstream).await;

    let mut second = TcpStream::connect(running.addr).await.unwrap();
    let mut buf = Vec::new();
    let n = timeout(IO_TIMEOUT, second.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(running.engine.stats().rejected, 1);

    let _ = running.shutdown.send(());
}

#[tokio::test]
async fn test_upstream_reset_releases_idle_client() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connection = connection_config();
    let engine = ProxyEngine::new(
        Direction::Outbound,
        listener_config(Mode::Proxy, DialPolicy::OnOpen),
        &connection,
    )
    .with_connector(RecordingConnector::new(upstream.local_addr().unwrap()));
    let running = serve(engine, &connection);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut up = accept_upstream(&upstream).await;

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(IO_TIMEOUT, up.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // Abortive close of the upstream (RST)
    socket2::SockRef::from(&up)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(up);

    // The client stays connected and silent; the proxy has to let go anyway
    let mut rest = Vec::new();
    let n = timeout(IO_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    let deadline = Instant::now() + IO_TIMEOUT;
    while running.engine.stats().active > 0
        || running.engine.connections().active_connections() > 0
    {
        assert!(Instant::now() < deadline, "connection still held after upstream reset");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = running.engine.stats();
    assert_eq!(stats.errored, 1);
    assert_eq!(stats.completed, 0);

    drop(client);
    let _ = running.shutdown.send(());
}

// ============================================================================
// On-demand dialing
// ============================================================================

#[tokio::test]
async fn test_concurrent_traffic_dials_once() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination: SocketAddr = "203.0.113.7:443".parse().unwrap();
    let connector =
        RecordingConnector::with_delay(upstream.local_addr().unwrap(), Duration::from_millis(50));

    let engine = Arc::new(
        ProxyEngine::new(
            Direction::Outbound,
            listener_config(Mode::Sidecar, DialPolicy::OnFirstData),
            &connection_config(),
        )
        .with_connector(connector.clone()),
    );

    let (_client, server, peer) = client_pair().await;
    let (_read, write) = server.into_split();
    let ctx = Arc::new(ConnectionContext::new(peer, write));
    assert!(ctx.set_destination(destination));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        let ctx = Arc::clone(&ctx);
        tasks.push(tokio::spawn(async move {
            engine.dispatch(&ctx, Event::Traffic(b"x")).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), Action::None);
    }

    assert_eq!(connector.dials(), vec![destination]);
    assert_eq!(ctx.upstream_state().await, UpstreamState::Present);

    let mut up = accept_upstream(&upstream).await;
    let mut buf = [0u8; 8];
    timeout(IO_TIMEOUT, up.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"xxxxxxxx");

    ctx.close_upstream().await;
    assert_eq!(ctx.upstream_state().await, UpstreamState::Closed);
}

#[tokio::test]
async fn test_first_data_policy_defers_dial() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connector = RecordingConnector::new(upstream.local_addr().unwrap());
    let connection = connection_config();
    let engine = ProxyEngine::new(
        Direction::Outbound,
        listener_config(Mode::Proxy, DialPolicy::OnFirstData),
        &connection,
    )
    .with_connector(connector.clone());
    let running = serve(engine, &connection);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connector.dials().is_empty());

    client.write_all(b"GET /").await.unwrap();
    let mut up = accept_upstream(&upstream).await;
    let mut buf = [0u8; 5];
    timeout(IO_TIMEOUT, up.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"GET /");
    assert_eq!(connector.dials().len(), 1);

    let _ = running.shutdown.send(());
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_connections() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connection = connection_config();
    let engine = ProxyEngine::new(
        Direction::Inbound,
        listener_config(Mode::Proxy, DialPolicy::OnOpen),
        &connection,
    )
    .with_connector(RecordingConnector::new(upstream.local_addr().unwrap()));
    let mut running = serve(engine, &connection);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    let mut up = accept_upstream(&upstream).await;
    client.write_all(b"a").await.unwrap();
    let mut buf = [0u8; 1];
    up.read_exact(&mut buf).await.unwrap();

    let _ = running.shutdown.send(());

    // Still draining while the connection is open
    let pending = timeout(Duration::from_millis(300), &mut running.task).await;
    assert!(pending.is_err());
    assert!(running.engine.connections().is_shutting_down());

    // New connections are no longer accepted
    assert!(TcpStream::connect(running.addr).await.is_err());

    drop(client);
    drop(up);
    timeout(IO_TIMEOUT, running.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let stats = running.engine.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total_accepted, 1);
}
