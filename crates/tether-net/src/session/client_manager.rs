//! Client session manager.
//!
//! [`TcpClientManager`] runs one outbound connection on its own I/O thread
//! and publishes a small [`ClientStatus`] that other threads can poll or
//! wait on. [`xmit_transaction`](TcpClientManager::xmit_transaction) builds a
//! one-shot request/response exchange on top of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tether_core::{IoThread, IoThreadConfig, PerfSpan, Tick, ticks};

use super::slicer::{SliceTarget, Slicer, SlicerConfig};
use crate::error::{NetworkError, Result};
use crate::tcp::{ClientDelegate, TcpClient, TcpClientConfig};

/// How long a transaction wait sleeps between progress slices.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Application hooks for a client session.
pub trait ClientHandler: Send + Sync + 'static {
    fn on_connect(&self, client: &Arc<TcpClient>) {
        let _ = client;
    }

    /// Returns the number of bytes consumed. Defaults to all of them.
    fn on_tcp_request(&self, client: &Arc<TcpClient>, data: &[u8]) -> usize {
        let _ = client;
        data.len()
    }

    fn on_result(&self, result: &NetworkError) {
        let _ = result;
    }

    fn on_close(&self, client: &Arc<TcpClient>) {
        let _ = client;
    }
}

/// Handler that consumes and discards everything.
#[derive(Debug, Default)]
pub struct DefaultClientHandler;

impl ClientHandler for DefaultClientHandler {}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn ClientHandler> + Send + Sync>;

/// Receives transaction progress while [`TcpClientManager::xmit_transaction_with_progress`] waits.
pub trait TransactionProgress {
    /// A new stage began.
    fn set_message(&mut self, message: &str) {
        let _ = message;
    }

    /// Called once per wait slice.
    fn show_slice(&mut self) {}
}

impl TransactionProgress for () {}

/// A point-in-time copy of a client session's status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// The transport is connected.
    pub connected: bool,
    /// The terminal reason, once the connection ended.
    pub result: Option<NetworkError>,
    /// Bytes offered to the handler so far.
    pub total_read_bytes: u64,
}

/// Status written on the I/O thread and read anywhere.
#[derive(Debug, Default)]
pub struct ClientStatus {
    inner: Mutex<StatusSnapshot>,
    changed: Condvar,
}

impl ClientStatus {
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().clone()
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn result(&self) -> Option<NetworkError> {
        self.inner.lock().result.clone()
    }

    pub fn total_read_bytes(&self) -> u64 {
        self.inner.lock().total_read_bytes
    }

    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        f(&mut self.inner.lock());
        self.changed.notify_all();
    }

    fn reset(&self) {
        self.update(|status| *status = StatusSnapshot::default());
    }

    /// Block until `done` holds or `deadline` passes.
    ///
    /// `progress.show_slice()` runs between waits without the lock held.
    /// Returns whether `done` held.
    pub fn wait_until(
        &self,
        deadline: Instant,
        progress: &mut dyn TransactionProgress,
        done: impl Fn(&StatusSnapshot) -> bool,
    ) -> bool {
        let mut status = self.inner.lock();
        loop {
            if done(&status) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            MutexGuard::unlocked(&mut status, || progress.show_slice());
            if done(&status) {
                return true;
            }
            let wait = (deadline - now).min(WAIT_SLICE);
            self.changed.wait_for(&mut status, wait);
        }
    }
}

/// Client events routed into the owning session.
struct SessionDelegate {
    session: Weak<ClientSession>,
}

impl ClientDelegate for SessionDelegate {
    fn on_result(&self, result: &NetworkError) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        // A teardown close is not the connection's outcome.
        if !session.torn_down.load(Ordering::Acquire) {
            session.status.update(|status| status.result = Some(result.clone()));
        }
        session.handler.on_result(result);
    }

    fn on_connect(&self, client: &Arc<TcpClient>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        client.set_keepalive_deadline(ticks::UNSET);
        session.status.update(|status| status.connected = true);
        session.handler.on_connect(client);
    }

    fn on_tcp_request(&self, client: &Arc<TcpClient>, data: &[u8]) -> usize {
        let Some(session) = self.session.upgrade() else {
            return data.len();
        };
        if let Some(timeout) = session.timeout {
            client.refresh_keepalive(timeout);
        }
        let consumed = session.handler.on_tcp_request(client, data);
        session
            .status
            .update(|status| status.total_read_bytes += data.len() as u64);
        consumed
    }

    fn on_close(&self, client: &Arc<TcpClient>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.status.update(|status| status.connected = false);
        session.handler.on_close(client);
    }
}

/// One outbound connection plus the state its slicer works on.
pub struct ClientSession {
    client: Arc<TcpClient>,
    handler: Box<dyn ClientHandler>,
    status: Arc<ClientStatus>,
    timeout: Option<Duration>,
    torn_down: AtomicBool,
    slicer: Slicer,
}

impl ClientSession {
    /// Start connecting on the current runtime and start the slicer.
    ///
    /// With a `timeout`, the connection must complete within it and every
    /// later read must follow the previous one within it.
    pub fn open(
        config: TcpClientConfig,
        handler: Box<dyn ClientHandler>,
        status: Arc<ClientStatus>,
        timeout: Option<Duration>,
        slicer: SlicerConfig,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|weak: &Weak<ClientSession>| {
            let delegate = Arc::new(SessionDelegate {
                session: weak.clone(),
            });
            let client = TcpClient::connect(config, delegate);
            if let Some(timeout) = timeout {
                client.refresh_keepalive(timeout);
            }
            Self {
                client,
                handler,
                status,
                timeout,
                torn_down: AtomicBool::new(false),
                slicer: Slicer::new(slicer),
            }
        });
        Slicer::start(&session);
        session
    }

    pub fn client(&self) -> &Arc<TcpClient> {
        &self.client
    }

    pub fn status(&self) -> &ClientStatus {
        &self.status
    }

    /// Stop the slicer and close the connection.
    pub fn teardown(&self) {
        self.torn_down.store(true, Ordering::Release);
        self.client.close(NetworkError::Cancelled);
    }
}

impl SliceTarget for ClientSession {
    fn slicer(&self) -> &Slicer {
        &self.slicer
    }

    fn slice(&self, now: Tick) {
        if self.client.is_closed() {
            return;
        }
        if self.client.should_disconnect(now) {
            tracing::info!(
                target: "tether_net::slicer",
                addr = %self.client.config().address(),
                "client deadline expired; disconnecting"
            );
            self.client.close(NetworkError::Timeout);
            return;
        }
        if let Err(e) = self.client.drain_pending() {
            tracing::warn!(target: "tether_net::slicer", error = %e, "queued send failed");
        }
    }

    fn keep_running(&self) -> bool {
        !self.torn_down.load(Ordering::Acquire)
    }
}

struct Running {
    io: IoThread,
    session: Arc<ClientSession>,
}

/// Runs one outbound connection on its own I/O thread.
///
/// ```ignore
/// use std::time::Duration;
/// use tether_net::session::TcpClientManager;
///
/// let manager = TcpClientManager::new();
/// manager.xmit_transaction("127.0.0.1", 9000, &b"status"[..], Duration::from_secs(5))?;
/// ```
pub struct TcpClientManager {
    template: Option<TcpClientConfig>,
    factory: HandlerFactory,
    slicer: SlicerConfig,
    thread_name: String,
    status: Arc<ClientStatus>,
    running: Mutex<Option<Running>>,
}

impl TcpClientManager {
    pub fn new() -> Self {
        Self {
            template: None,
            factory: Arc::new(|| Box::new(DefaultClientHandler) as Box<dyn ClientHandler>),
            slicer: SlicerConfig::default(),
            thread_name: "tether-tcpc".to_string(),
            status: Arc::new(ClientStatus::default()),
            running: Mutex::new(None),
        }
    }

    /// Build a fresh handler with `factory` on every `start`.
    pub fn with_handler<H, F>(mut self, factory: F) -> Self
    where
        H: ClientHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factory = Arc::new(move || Box::new(factory()) as Box<dyn ClientHandler>);
        self
    }

    /// Use `config` for socket, TLS and DNS settings; host and port are
    /// replaced on `start`.
    pub fn config_template(mut self, config: TcpClientConfig) -> Self {
        self.template = Some(config);
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

    /// Spawn the I/O thread and start connecting to `host:port`.
    ///
    /// Returns once the connection attempt is under way; watch
    /// [`status`](Self::status) for the outcome.
    pub fn start(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(NetworkError::AlreadyStarted);
        }
        let _perf = PerfSpan::new("client_session_start");

        let io = IoThread::spawn(IoThreadConfig::default().with_thread_name(self.thread_name.clone()))?;
        let config = match &self.template {
            Some(template) => TcpClientConfig {
                host: host.to_string(),
                port,
                ..template.clone()
            },
            None => TcpClientConfig::new(host, port),
        };
        self.status.reset();
        let status = self.status.clone();
        let factory = self.factory.clone();
        let slicer = self.slicer;
        let session = io.run_blocking(async move {
            ClientSession::open(config, factory(), status, timeout, slicer)
        })?;

        tracing::info!(target: "tether_net::session", host, port, "client session started");
        *running = Some(Running { io, session });
        Ok(())
    }

    /// Close the connection and stop the I/O thread. No-op when stopped.
    pub fn stop(&self) {
        let Some(Running { io, session }) = self.running.lock().take() else {
            return;
        };
        let _perf = PerfSpan::new("client_session_stop");
        let teardown = io.run_blocking(async move {
            session.teardown();
            drop(session);
        });
        if let Err(e) = teardown {
            tracing::warn!(target: "tether_net::session", error = %e, "client teardown did not run on the I/O thread");
        }
        io.shutdown();
        tracing::info!(target: "tether_net::session", "client session stopped");
    }

    pub fn is_started(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn status(&self) -> &ClientStatus {
        &self.status
    }

    pub fn connected(&self) -> bool {
        self.status.connected()
    }

    /// The terminal reason of the last connection, if it ended.
    pub fn result(&self) -> Option<NetworkError> {
        self.status.result()
    }

    pub fn total_read_bytes(&self) -> u64 {
        self.status.total_read_bytes()
    }

    /// Send from any thread; see [`TcpClient::write_layer`].
    pub fn send(&self, data: impl Into<Bytes>) -> Result<usize> {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return Err(NetworkError::NotStarted);
        };
        running.session.client().write_layer(data)
    }

    /// Connect, send `payload`, wait for a reply, and stop.
    ///
    /// Succeeds once at least one byte has been received. Fails with the
    /// connection's terminal reason, or [`NetworkError::Timeout`] when
    /// `timeout` elapses first.
    pub fn xmit_transaction(
        &self,
        host: &str,
        port: u16,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<()> {
        self.xmit_transaction_with_progress(host, port, payload, timeout, &mut ())
    }

    /// [`xmit_transaction`](Self::xmit_transaction) reporting to `progress`.
    pub fn xmit_transaction_with_progress(
        &self,
        host: &str,
        port: u16,
        payload: impl Into<Bytes>,
        timeout: Duration,
        progress: &mut dyn TransactionProgress,
    ) -> Result<()> {
        let payload = payload.into();
        if host.is_empty() {
            return Err(NetworkError::InvalidArgument("empty host".to_string()));
        }
        if port == 0 {
            return Err(NetworkError::InvalidArgument("port 0".to_string()));
        }
        if payload.is_empty() {
            return Err(NetworkError::EmptyPayload);
        }

        progress.set_message(&format!("Connect to {host}"));
        let deadline = deadline_in(timeout);
        self.start(host, port, Some(timeout))?;
        let outcome = self.exchange(payload, deadline, progress);
        self.stop();

        if let Err(e) = &outcome {
            tracing::debug!(target: "tether_net::session", host, port, message = %e.user_message(), "transaction failed");
        }
        outcome
    }

    fn exchange(
        &self,
        payload: Bytes,
        deadline: Instant,
        progress: &mut dyn TransactionProgress,
    ) -> Result<()> {
        self.status.wait_until(deadline, progress, |status| {
            status.connected || status.result.is_some()
        });
        let status = self.status.snapshot();
        if !status.connected {
            return Err(status.result.unwrap_or(NetworkError::Timeout));
        }

        progress.set_message("In processing command");
        self.send(payload)?;
        self.status.wait_until(deadline, progress, |status| {
            status.total_read_bytes > 0 || status.result.is_some()
        });

        let status = self.status.snapshot();
        if status.total_read_bytes > 0 {
            return Ok(());
        }
        Err(status.result.unwrap_or(NetworkError::Timeout))
    }
}

/// `timeout` from now, clamped to a far-future instant when it overflows.
fn deadline_in(timeout: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl Default for TcpClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpClientManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TcpClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClientManager")
            .field("started", &self.is_started())
            .field("status", &self.status.snapshot())
            .finish()
    }
}

static_assertions::assert_impl_all!(TcpClientManager: Send, Sync);
