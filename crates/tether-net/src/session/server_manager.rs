//! Server session manager.
//!
//! [`TcpServerManager`] owns an I/O thread and, while started, one
//! [`ServerSession`]: a listener, the application's [`ServerHandler`], a
//! queue of payloads handed over by other threads, and the slicer that
//! enforces keepalives and drains that queue.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{IoThread, IoThreadConfig, PerfSpan, Tick};

use super::slicer::{SliceTarget, Slicer, SlicerConfig};
use crate::error::{NetworkError, Result};
use crate::tcp::{ConnectionId, PendingQueue, ServerDelegate, TcpConnection, TcpServer, TcpServerConfig};

/// Application hooks for a server session.
///
/// Built on the I/O thread by the manager's factory and only ever called
/// there.
pub trait ServerHandler: Send + Sync + 'static {
    fn on_connect(&self, conn: &Arc<TcpConnection>) {
        let _ = conn;
    }

    /// Returns the number of bytes consumed. Defaults to all of them.
    fn on_tcp_request(&self, conn: &Arc<TcpConnection>, data: &[u8]) -> usize {
        let _ = conn;
        data.len()
    }

    fn on_close(&self, conn: &Arc<TcpConnection>, reason: &NetworkError) {
        let _ = (conn, reason);
    }
}

/// Handler that consumes and discards everything.
#[derive(Debug, Default)]
pub struct DefaultServerHandler;

impl ServerHandler for DefaultServerHandler {}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn ServerHandler> + Send + Sync>;

/// Listener events routed into the session that owns the listener.
#[derive(Default)]
struct SessionDelegate {
    session: OnceLock<Weak<ServerSession>>,
}

impl SessionDelegate {
    fn session(&self) -> Option<Arc<ServerSession>> {
        self.session.get().and_then(Weak::upgrade)
    }
}

impl ServerDelegate for SessionDelegate {
    fn on_connect(&self, conn: &Arc<TcpConnection>) {
        let Some(session) = self.session() else {
            return;
        };
        if let Some(keepalive) = session.keepalive {
            conn.refresh_keepalive(keepalive);
        }
        session.handler.on_connect(conn);
        if !session.slicer.is_running() {
            Slicer::start(&session);
        }
    }

    fn on_tcp_request(&self, conn: &Arc<TcpConnection>, data: &[u8]) -> usize {
        let Some(session) = self.session() else {
            return data.len();
        };
        if let Some(keepalive) = session.keepalive {
            conn.refresh_keepalive(keepalive);
        }
        session.handler.on_tcp_request(conn, data)
    }

    fn on_close(&self, conn: &Arc<TcpConnection>, reason: &NetworkError) {
        if let Some(session) = self.session() {
            session.handler.on_close(conn, reason);
        }
    }
}

/// A listener plus the state its slicer works on.
pub struct ServerSession {
    server: TcpServer,
    handler: Box<dyn ServerHandler>,
    pending: PendingQueue<(IpAddr, Bytes)>,
    keepalive: Option<Duration>,
    slicer: Slicer,
}

impl ServerSession {
    /// Bind a listener on the current runtime and wire it to `handler`.
    pub async fn open(
        config: TcpServerConfig,
        handler: Box<dyn ServerHandler>,
        keepalive: Option<Duration>,
        slicer: SlicerConfig,
    ) -> Result<Arc<Self>> {
        let delegate = Arc::new(SessionDelegate::default());
        let server = TcpServer::bind(config, delegate.clone()).await?;
        let session = Arc::new(Self {
            server,
            handler,
            pending: PendingQueue::new(),
            keepalive,
            slicer: Slicer::new(slicer),
        });
        // Nothing is accepted before the next await, so no event can miss this link.
        let _ = delegate.session.set(Arc::downgrade(&session));
        Ok(session)
    }

    pub fn server(&self) -> &TcpServer {
        &self.server
    }

    /// Park a payload for the connection whose peer is `peer_ip`.
    pub fn queue(&self, peer_ip: IpAddr, data: Bytes) {
        self.pending.push((peer_ip, data));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stop the listener and close every connection.
    pub fn shutdown(&self) {
        self.server.shutdown();
        let dropped = self.pending.drain().len();
        if dropped > 0 {
            tracing::debug!(target: "tether_net::session", dropped, "discarded undelivered payloads");
        }
    }
}

impl SliceTarget for ServerSession {
    fn slicer(&self) -> &Slicer {
        &self.slicer
    }

    fn slice(&self, now: Tick) {
        // One forced close per tick; the queue waits for the next one.
        if let Some(conn) = self
            .server
            .find_first(|conn| !conn.is_closing() && conn.should_disconnect(now))
        {
            tracing::info!(
                target: "tether_net::slicer",
                id = %conn.id(),
                peer = %conn.peer_addr(),
                "keepalive expired; disconnecting"
            );
            self.server.close(conn.id(), NetworkError::Timeout);
            return;
        }

        for (peer_ip, data) in self.pending.drain() {
            let target = self
                .server
                .find_first(|conn| !conn.is_closing() && conn.peer_ip() == peer_ip);
            match target {
                Some(conn) => {
                    if let Err(e) = conn.send_data(data) {
                        tracing::warn!(target: "tether_net::slicer", id = %conn.id(), error = %e, "queued send failed");
                    }
                }
                None => {
                    tracing::debug!(target: "tether_net::slicer", %peer_ip, len = data.len(), "no connection for queued payload; dropping it");
                }
            }
        }
    }

    fn keep_running(&self) -> bool {
        self.server.connection_count() != 0
    }
}

struct Running {
    io: IoThread,
    session: Arc<ServerSession>,
}

/// Runs a listener on its own I/O thread.
///
/// ```ignore
/// use tether_net::session::TcpServerManager;
///
/// let manager = TcpServerManager::new(9000);
/// let addr = manager.start("127.0.0.1")?;
/// manager.send_data_ex(peer_ip, &b"hello"[..])?;
/// manager.stop();
/// ```
pub struct TcpServerManager {
    config: TcpServerConfig,
    factory: HandlerFactory,
    keepalive: Option<Duration>,
    slicer: SlicerConfig,
    thread_name: String,
    running: Mutex<Option<Running>>,
}

impl TcpServerManager {
    /// A manager that will listen on `port` with the default handler.
    pub fn new(port: u16) -> Self {
        Self::with_config(TcpServerConfig::new("0.0.0.0", port))
    }

    /// A manager using `config`; its bind address is replaced on `start`.
    pub fn with_config(config: TcpServerConfig) -> Self {
        Self {
            config,
            factory: Arc::new(|| Box::new(DefaultServerHandler) as Box<dyn ServerHandler>),
            keepalive: None,
            slicer: SlicerConfig::default(),
            thread_name: "tether-tcpd".to_string(),
            running: Mutex::new(None),
        }
    }

    /// Build a fresh handler with `factory` on every `start`.
    pub fn with_handler<H, F>(mut self, factory: F) -> Self
    where
        H: ServerHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factory = Arc::new(move || Box::new(factory()) as Box<dyn ServerHandler>);
        self
    }

    /// Disconnect connections idle for longer than `timeout`.
    pub fn keepalive(mut self, timeout: Duration) -> Self {
        self.keepalive = Some(timeout);
        self
    }

    pub fn slicer_config(mut self, config: SlicerConfig) -> Self {
        self.slicer = config;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Spawn the I/O thread and listen on `ip`.
    ///
    /// Blocks until the listener is bound and returns its address.
    pub fn start(&self, ip: &str) -> Result<SocketAddr> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(NetworkError::AlreadyStarted);
        }
        let _perf = PerfSpan::new("server_session_start");

        let io = IoThread::spawn(IoThreadConfig::default().with_thread_name(self.thread_name.clone()))?;
        let mut config = self.config.clone();
        config.bind_address = ip.to_string();
        let factory = self.factory.clone();
        let keepalive = self.keepalive;
        let slicer = self.slicer;
        let session = io.run_blocking(async move {
            ServerSession::open(config, factory(), keepalive, slicer).await
        })??;

        let local_addr = session.server().local_addr();
        tracing::info!(target: "tether_net::session", addr = %local_addr, "server session started");
        *running = Some(Running { io, session });
        Ok(local_addr)
    }

    /// Close every connection and stop the I/O thread. No-op when stopped.
    pub fn stop(&self) {
        let Some(Running { io, session }) = self.running.lock().take() else {
            return;
        };
        let _perf = PerfSpan::new("server_session_stop");
        let teardown = io.run_blocking(async move {
            session.shutdown();
            drop(session);
        });
        if let Err(e) = teardown {
            tracing::warn!(target: "tether_net::session", error = %e, "server teardown did not run on the I/O thread");
        }
        io.shutdown();
        tracing::info!(target: "tether_net::session", "server session stopped");
    }

    pub fn is_started(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Hand `data` to the connection whose peer is `peer_ip`.
    ///
    /// Must be called from a thread other than the I/O thread. The payload is
    /// delivered on a later slicer tick; with no connection at all it is
    /// dropped and still reported as accepted.
    pub fn send_data_ex(&self, peer_ip: IpAddr, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return Err(NetworkError::NotStarted);
        };
        if running.io.is_current() {
            return Err(NetworkError::WrongThread);
        }
        if data.is_empty() {
            return Err(NetworkError::EmptyPayload);
        }

        let len = data.len();
        if running.session.server().connection_count() == 0 {
            tracing::debug!(target: "tether_net::session", %peer_ip, len, "no connections; dropping payload");
            return Ok(len);
        }
        running.session.queue(peer_ip, data);
        Ok(len)
    }

    pub fn ip_is_connected(&self, ip: IpAddr) -> bool {
        self.with_server(|server| server.ip_is_connected(ip)).unwrap_or(false)
    }

    pub fn sessionid_is_valid(&self, id: ConnectionId) -> bool {
        self.with_server(|server| server.sessionid_is_valid(id)).unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.with_server(TcpServer::connection_count).unwrap_or(0)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.with_server(TcpServer::local_addr)
    }

    /// The bound `ip:port`, while started.
    pub fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| addr.to_string())
    }

    fn with_server<T>(&self, f: impl FnOnce(&TcpServer) -> T) -> Option<T> {
        self.running.lock().as_ref().map(|running| f(running.session.server()))
    }
}

impl Drop for TcpServerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TcpServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServerManager")
            .field("port", &self.config.port)
            .field("started", &self.is_started())
            .finish()
    }
}

static_assertions::assert_impl_all!(TcpServerManager: Send, Sync);
