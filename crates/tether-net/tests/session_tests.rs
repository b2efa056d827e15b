//! Integration tests for the session managers and their slicers.

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use tether_core::ticks;
use tether_net::session::{
    ServerHandler, ServerSession, SliceTarget, SlicerConfig, TcpClientManager, TcpServerManager,
    TransactionProgress,
};
use tether_net::{NetworkError, TcpConnection, TcpServerConfig};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn fast_slicer() -> SlicerConfig {
    SlicerConfig::default()
        .first_tick(Duration::from_millis(10))
        .interval(Duration::from_millis(5))
}

/// Block until `cond` holds, failing after two seconds.
fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct EchoHandler;

impl ServerHandler for EchoHandler {
    fn on_tcp_request(&self, conn: &Arc<TcpConnection>, data: &[u8]) -> usize {
        let _ = conn.send_data(Bytes::copy_from_slice(data));
        data.len()
    }
}

/// Greets once on connect and then goes quiet.
struct GreetOnce;

impl ServerHandler for GreetOnce {
    fn on_connect(&self, conn: &Arc<TcpConnection>) {
        let _ = conn.send_data(&b"hi"[..]);
    }
}

#[test]
fn test_client_connects_to_server() {
    let server = TcpServerManager::new(0).slicer_config(fast_slicer());
    let addr = server.start("127.0.0.1").unwrap();
    assert!(server.is_started());
    assert_eq!(server.url(), Some(addr.to_string()));

    let client = TcpClientManager::new().slicer_config(fast_slicer());
    client.start("127.0.0.1", addr.port(), Some(Duration::from_secs(2))).unwrap();

    wait_for("client connected", || client.connected());
    wait_for("server registered", || server.connection_count() == 1);
    assert!(server.ip_is_connected(LOCALHOST));
    assert_eq!(client.result(), None);

    client.stop();
    wait_for("server-side close", || server.connection_count() == 0);
    server.stop();
    assert!(!server.is_started());
}

#[test]
fn test_xmit_transaction_echo() {
    let server = TcpServerManager::new(0)
        .with_handler(|| EchoHandler)
        .slicer_config(fast_slicer());
    let addr = server.start("127.0.0.1").unwrap();

    let client = TcpClientManager::new().slicer_config(fast_slicer());
    client
        .xmit_transaction("127.0.0.1", addr.port(), &b"status?"[..], Duration::from_secs(2))
        .unwrap();
    assert!(client.total_read_bytes() > 0);
    assert!(!client.is_started());

    // The manager is reusable.
    client
        .xmit_transaction("127.0.0.1", addr.port(), &b"again"[..], Duration::from_secs(2))
        .unwrap();
    assert!(client.total_read_bytes() > 0);
    assert_eq!(client.result(), None);
}

#[derive(Default)]
struct Stages(Mutex<Vec<String>>);

impl TransactionProgress for &Stages {
    fn set_message(&mut self, message: &str) {
        self.0.lock().push(message.to_string());
    }
}

#[test]
fn test_xmit_transaction_without_reply_times_out() {
    let server = TcpServerManager::new(0).slicer_config(fast_slicer());
    let addr = server.start("127.0.0.1").unwrap();

    let stages = Stages::default();
    let client = TcpClientManager::new().slicer_config(fast_slicer());
    let started = Instant::now();
    let result = client.xmit_transaction_with_progress(
        "127.0.0.1",
        addr.port(),
        &b"anyone?"[..],
        Duration::from_millis(300),
        &mut &stages,
    );

    assert_eq!(result, Err(NetworkError::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(
        *stages.0.lock(),
        vec!["Connect to 127.0.0.1".to_string(), "In processing command".to_string()]
    );
}

#[test]
fn test_xmit_transaction_to_dead_port() {
    let client = TcpClientManager::new().slicer_config(fast_slicer());
    let result = client.xmit_transaction("127.0.0.1", closed_port(), &b"x"[..], Duration::from_secs(2));
    assert_eq!(result, Err(NetworkError::ConnectionRefused));
    assert!(!client.is_started());
}

#[test]
fn test_client_read_deadline_expires() {
    let server = TcpServerManager::new(0)
        .with_handler(|| GreetOnce)
        .slicer_config(fast_slicer());
    let addr = server.start("127.0.0.1").unwrap();

    let client = TcpClientManager::new().slicer_config(fast_slicer());
    client.start("127.0.0.1", addr.port(), Some(Duration::from_millis(150))).unwrap();

    wait_for("greeting", || client.total_read_bytes() == 2);
    wait_for("deadline", || client.result().is_some());
    assert_eq!(client.result(), Some(NetworkError::Timeout));
    wait_for("disconnect", || !client.connected());
}

#[test]
fn test_send_data_ex_from_foreign_thread() {
    let server = TcpServerManager::new(0).slicer_config(fast_slicer());
    let addr = server.start("127.0.0.1").unwrap();

    let mut peer = std::net::TcpStream::connect(addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    wait_for("registration", || server.ip_is_connected(LOCALHOST));

    assert_eq!(server.send_data_ex(LOCALHOST, &b"hello"[..]), Ok(5));
    let mut buf = [0u8; 5];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    // No connection from this address; the payload is dropped on the next tick.
    let stranger = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(server.send_data_ex(stranger, &b"lost"[..]), Ok(4));
    peer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let err = peer.read(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    assert_eq!(server.send_data_ex(LOCALHOST, &b""[..]), Err(NetworkError::EmptyPayload));
}

#[test]
fn test_server_keepalive_disconnects_idle_peer() {
    let server = TcpServerManager::new(0)
        .keepalive(Duration::from_millis(100))
        .slicer_config(fast_slicer());
    let addr = server.start("127.0.0.1").unwrap();

    let mut peer = std::net::TcpStream::connect(addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    wait_for("registration", || server.connection_count() == 1);
    wait_for("keepalive", || server.connection_count() == 0);

    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

/// Records close reasons.
#[derive(Clone, Default)]
struct CloseLog(Arc<Mutex<Vec<NetworkError>>>);

impl ServerHandler for CloseLog {
    fn on_close(&self, _conn: &Arc<TcpConnection>, reason: &NetworkError) {
        self.0.lock().push(reason.clone());
    }
}

async fn open_session(log: CloseLog) -> Arc<ServerSession> {
    // Slow first tick so the test drives every slice itself.
    let slicer = SlicerConfig::default().first_tick(Duration::from_secs(60));
    ServerSession::open(TcpServerConfig::new("127.0.0.1", 0), Box::new(log), None, slicer)
        .await
        .unwrap()
}

async fn settle(session: &ServerSession, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while session.server().connection_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_slice_closes_one_expired_connection_per_tick() {
    let log = CloseLog::default();
    let session = open_session(log.clone()).await;
    let addr = session.server().local_addr();
    let _a = tokio::net::TcpStream::connect(addr).await.unwrap();
    let _b = tokio::net::TcpStream::connect(addr).await.unwrap();
    settle(&session, 2).await;

    let expired = ticks::now();
    for conn in session.server().connections() {
        conn.set_keepalive_deadline(expired);
    }

    session.slice(ticks::now());
    assert_eq!(session.server().connection_count(), 1);
    session.slice(ticks::now());
    assert_eq!(session.server().connection_count(), 0);
    assert_eq!(*log.0.lock(), vec![NetworkError::Timeout, NetworkError::Timeout]);
    assert!(!session.keep_running());
}

#[tokio::test]
async fn test_slice_waits_for_closes_before_draining() {
    let session = open_session(CloseLog::default()).await;
    let addr = session.server().local_addr();
    let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
    let _idle = tokio::net::TcpStream::connect(addr).await.unwrap();
    settle(&session, 2).await;

    let local = peer.local_addr().unwrap();
    let idle = session
        .server()
        .find_first(|conn| conn.peer_addr() != local)
        .unwrap();
    idle.set_keepalive_deadline(ticks::now());

    session.queue(local.ip(), Bytes::from_static(b"queued"));
    session.slice(ticks::now());
    assert_eq!(session.pending_len(), 1, "a forced close ends the tick");

    session.slice(ticks::now());
    assert_eq!(session.pending_len(), 0);

    let mut buf = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"queued");
    assert!(session.keep_running());
    session.shutdown();
}
