//! The dialer.
//!
//! A [`TcpClient`] resolves its host, connects to the first address that
//! answers, optionally wraps the socket in TLS and then reads frames until
//! it is closed. Every outcome, success or not, ends in exactly one
//! [`ClientDelegate::on_result`] / [`ClientDelegate::on_close`] pair.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{CancellationToken, ThreadAffinity, Tick, ticks};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use super::config::TcpClientConfig;
use super::connection::{pump_writes, read_some};
use super::delegate::ClientDelegate;
use super::layer::{ReadLayer, ReadLayerGate};
use super::pending::PendingQueue;
use super::state::{AtomicState, ClientConnectionState};
use super::stream::MaybeTlsStream;
use crate::buffer::{QueuedWriteBuffer, ReadBuffer};
use crate::dns::DnsResolver;
use crate::error::{NetworkError, Result};

/// An outbound connection.
pub struct TcpClient {
    config: TcpClientConfig,
    delegate: Arc<dyn ClientDelegate>,
    state: AtomicState<ClientConnectionState>,
    closed: AtomicBool,
    write_buf: Mutex<QueuedWriteBuffer>,
    write_ready: Notify,
    pending: PendingQueue<Bytes>,
    cancel: CancellationToken,
    create_tick: Tick,
    handshake_tick: AtomicU64,
    keepalive_deadline: AtomicU64,
    peer_addr: Mutex<Option<SocketAddr>>,
    affinity: ThreadAffinity,
    read_layer: ReadLayerGate,
}

impl TcpClient {
    fn new(config: TcpClientConfig, delegate: Arc<dyn ClientDelegate>) -> Arc<Self> {
        let write_max = config.socket.write_buffer_max;
        Arc::new(Self {
            config,
            delegate,
            state: AtomicState::new(ClientConnectionState::ResolveHost),
            closed: AtomicBool::new(false),
            write_buf: Mutex::new(QueuedWriteBuffer::new(write_max)),
            write_ready: Notify::new(),
            pending: PendingQueue::new(),
            cancel: CancellationToken::new(),
            create_tick: ticks::now(),
            handshake_tick: AtomicU64::new(ticks::UNSET),
            keepalive_deadline: AtomicU64::new(ticks::UNSET),
            peer_addr: Mutex::new(None),
            affinity: ThreadAffinity::current(),
            read_layer: ReadLayerGate::default(),
        })
    }

    /// Start connecting on the current runtime.
    ///
    /// Returns immediately; progress and failure are reported through
    /// `delegate`. The calling thread becomes the client's I/O thread.
    pub fn connect(config: TcpClientConfig, delegate: Arc<dyn ClientDelegate>) -> Arc<Self> {
        let client = Self::new(config, delegate);
        tracing::debug!(target: "tether_net::client", addr = %client.config.address(), "connecting");
        tokio::spawn(drive(client.clone()));
        client
    }

    pub fn config(&self) -> &TcpClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientConnectionState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The address the transport connected to, once connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    pub fn create_tick(&self) -> Tick {
        self.create_tick
    }

    pub fn handshake_tick(&self) -> Tick {
        self.handshake_tick.load(Ordering::Acquire)
    }

    pub fn handshaked(&self) -> bool {
        self.handshake_tick() != ticks::UNSET
    }

    pub fn keepalive_deadline(&self) -> Tick {
        self.keepalive_deadline.load(Ordering::Acquire)
    }

    pub fn set_keepalive_deadline(&self, deadline: Tick) {
        self.keepalive_deadline.store(deadline, Ordering::Release);
    }

    pub fn refresh_keepalive(&self, timeout: Duration) {
        self.set_keepalive_deadline(ticks::deadline_after(timeout));
    }

    pub fn should_disconnect(&self, now: Tick) -> bool {
        ticks::is_expired(self.keepalive_deadline(), now)
    }

    pub fn queued_write_bytes(&self) -> usize {
        self.write_buf.lock().total_size()
    }

    /// Payloads handed over by foreign threads and not yet queued.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue `data` for writing. Must be called on the I/O thread.
    ///
    /// A payload sent while the transport connect is in flight is reported
    /// as accepted but never written.
    pub fn send_data(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        if !self.affinity.is_same_thread() {
            return Err(NetworkError::WrongThread);
        }
        if data.is_empty() {
            return Err(NetworkError::EmptyPayload);
        }
        if self.is_closed() {
            return Err(NetworkError::Cancelled);
        }

        let len = data.len();
        if self.state() == ClientConnectionState::TransportConnectComplete {
            tracing::warn!(
                target: "tether_net::client",
                len,
                "payload sent before the transport connected; dropping it"
            );
            return Ok(len);
        }

        self.write_buf.lock().append(data)?;
        self.write_ready.notify_one();
        Ok(len)
    }

    /// Send from any thread.
    ///
    /// On the I/O thread this is [`send_data`](Self::send_data). Elsewhere
    /// the payload is parked until [`drain_pending`](Self::drain_pending)
    /// runs on the I/O thread.
    pub fn write_layer(&self, data: impl Into<Bytes>) -> Result<usize> {
        if self.affinity.is_same_thread() {
            return self.send_data(data);
        }
        let data = data.into();
        if data.is_empty() {
            return Err(NetworkError::EmptyPayload);
        }
        let len = data.len();
        self.pending.push(data);
        Ok(len)
    }

    /// Move parked payloads into the write queue, in arrival order.
    ///
    /// A payload that cannot be queued is logged and skipped; the rest are
    /// still queued. Returns the bytes queued, or the first failure.
    pub fn drain_pending(&self) -> Result<usize> {
        let mut queued = 0;
        let mut first_err = None;
        for data in self.pending.drain() {
            let len = data.len();
            match self.send_data(data) {
                Ok(n) => queued += n,
                Err(e) => {
                    tracing::warn!(
                        target: "tether_net::client",
                        len,
                        error = %e,
                        "parked payload not queued"
                    );
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(queued),
        }
    }

    /// Bind `data` as this client's read source for one drain.
    ///
    /// Fails with [`NetworkError::ReadLayerBusy`] while another binding lives.
    pub fn read_layer(&self, data: &[u8]) -> Result<ReadLayer<'_>> {
        self.read_layer.bind(data)
    }

    /// Read from the bound read layer into `out`, advancing its cursor.
    ///
    /// Returns `None` when no [`ReadLayer`] is bound on this client.
    pub fn did_read_layer(&self, out: &mut [u8]) -> Option<usize> {
        self.read_layer.read_bound(out)
    }

    /// End the connection with `reason`.
    ///
    /// Runs `on_result` then `on_close` on the calling thread and cancels any
    /// in-flight work. Returns `false` if the client was already closed.
    pub fn close(self: &Arc<Self>, reason: NetworkError) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.set(ClientConnectionState::Closed);
        tracing::debug!(
            target: "tether_net::client",
            addr = %self.config.address(),
            code = reason.code(),
            %reason,
            "client closed"
        );
        self.delegate.on_result(&reason);
        self.delegate.on_close(self);
        self.cancel.cancel();
        true
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let port = self.config.port;
        if let Some(addresses) = self.config.addresses.as_ref().filter(|a| !a.is_empty()) {
            return Ok(addresses.clone());
        }
        let host = self.config.host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        if host.is_empty() {
            return Err(NetworkError::InvalidArgument("empty host".to_string()));
        }
        DnsResolver::new(self.config.dns.clone())?
            .resolve_socket_addrs(host, port)
            .await
    }

    async fn connect_any(&self, addresses: &[SocketAddr]) -> Result<TcpStream> {
        let mut last_err = NetworkError::ConnectionRefused;
        for &addr in addresses {
            let attempt = TcpStream::connect(addr);
            let result = match self.config.socket.connect_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result.map_err(NetworkError::from),
                    Err(_) => Err(NetworkError::Timeout),
                },
                None => attempt.await.map_err(NetworkError::from),
            };
            match result {
                Ok(stream) => {
                    *self.peer_addr.lock() = Some(addr);
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(target: "tether_net::client", %addr, error = %e, "connect attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn run(self: &Arc<Self>) -> Result<NetworkError> {
        self.state.set(ClientConnectionState::ResolveHost);
        self.state.set(ClientConnectionState::ResolveHostComplete);
        let addresses = self.until_cancelled(self.resolve()).await?;

        self.state.set(ClientConnectionState::TransportConnect);
        self.state.set(ClientConnectionState::TransportConnectComplete);
        let stream = self.until_cancelled(self.connect_any(&addresses)).await?;
        if let Err(e) = stream.set_nodelay(self.config.socket.no_delay) {
            tracing::warn!(target: "tether_net::client", error = %e, "failed to set TCP_NODELAY");
        }

        self.state.set(ClientConnectionState::Handshake);
        self.delegate.on_connect(self);
        if self.is_closed() {
            return Err(NetworkError::Cancelled);
        }

        self.state.set(ClientConnectionState::HandshakeComplete);
        let stream = match &self.config.tls {
            Some(tls) => {
                let connector = tls.connector()?;
                let name = tls.server_name_for(&self.config.host)?;
                let tls_stream = self
                    .until_cancelled(async {
                        connector
                            .connect(name, stream)
                            .await
                            .map_err(|e| NetworkError::Tls(e.to_string()))
                    })
                    .await?;
                MaybeTlsStream::ClientTls(Box::new(tls_stream))
            }
            None => MaybeTlsStream::Plain(stream),
        };
        self.handshake_tick.store(ticks::now(), Ordering::Release);
        tracing::debug!(
            target: "tether_net::client",
            addr = %self.config.address(),
            tls = stream.is_tls(),
            "handshake complete"
        );

        let socket = &self.config.socket;
        let mut read_buf = ReadBuffer::new(socket.read_buffer_initial, socket.read_buffer_max);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let read_frames = async {
            loop {
                if self.is_closed() {
                    return NetworkError::Cancelled;
                }
                self.state.set(ClientConnectionState::ReadFrame);
                self.state.set(ClientConnectionState::ReadFrameComplete);
                if let Err(reason) = read_some(&mut reader, &mut read_buf).await {
                    return reason;
                }
                if let Err(reason) = read_buf.deliver(|data| self.delegate.on_tcp_request(self, data)) {
                    return reason;
                }
            }
        };
        let reason = tokio::select! {
            _ = self.cancel.cancelled() => NetworkError::Cancelled,
            reason = read_frames => reason,
            reason = pump_writes(&self.write_buf, &self.write_ready, &mut writer) => reason,
        };
        Ok(reason)
    }

    async fn until_cancelled<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.cancel
            .run_until_cancelled(fut)
            .await
            .ok_or(NetworkError::Cancelled)?
    }
}

async fn drive(client: Arc<TcpClient>) {
    let reason = match client.run().await {
        Ok(reason) | Err(reason) => reason,
    };
    client.close(reason);
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("addr", &self.config.address())
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

static_assertions::assert_impl_all!(TcpClient: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpSocketConfig;

    #[derive(Default)]
    struct Recorder {
        results: Mutex<Vec<NetworkError>>,
        closes: std::sync::atomic::AtomicUsize,
    }

    impl ClientDelegate for Recorder {
        fn on_result(&self, result: &NetworkError) {
            self.results.lock().push(result.clone());
        }

        fn on_tcp_request(&self, _client: &Arc<TcpClient>, data: &[u8]) -> usize {
            data.len()
        }

        fn on_close(&self, _client: &Arc<TcpClient>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client(delegate: Arc<Recorder>) -> Arc<TcpClient> {
        TcpClient::new(TcpClientConfig::new("127.0.0.1", 9), delegate)
    }

    #[test]
    fn test_send_during_transport_connect_is_dropped() {
        let client = client(Arc::default());
        client.state.set(ClientConnectionState::TransportConnectComplete);
        assert_eq!(client.send_data(vec![7u8; 10]), Ok(10));
        assert_eq!(client.queued_write_bytes(), 0);
    }

    #[test]
    fn test_send_before_connect_is_queued() {
        let client = client(Arc::default());
        assert_eq!(client.send_data(&b"early"[..]), Ok(5));
        assert_eq!(client.queued_write_bytes(), 5);
    }

    #[test]
    fn test_close_runs_callbacks_once() {
        let recorder = Arc::new(Recorder::default());
        let client = client(recorder.clone());
        assert!(client.close(NetworkError::Timeout));
        assert!(!client.close(NetworkError::ConnectionReset));

        assert_eq!(*recorder.results.lock(), vec![NetworkError::Timeout]);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), ClientConnectionState::Closed);
        assert_eq!(client.send_data(&b"late"[..]), Err(NetworkError::Cancelled));
    }

    #[test]
    fn test_write_layer_from_foreign_thread_parks_payload() {
        let client = client(Arc::default());
        let remote = client.clone();
        let queued = std::thread::spawn(move || {
            remote.write_layer(&b"one"[..]).unwrap();
            remote.write_layer(&b"two"[..]).unwrap();
            remote.send_data(&b"x"[..])
        })
        .join()
        .unwrap();
        assert_eq!(queued, Err(NetworkError::WrongThread));
        assert_eq!(client.pending_len(), 2);

        assert_eq!(client.drain_pending(), Ok(6));
        assert_eq!(client.pending_len(), 0);
        assert_eq!(client.queued_write_bytes(), 6);
    }

    #[test]
    fn test_drain_pending_keeps_queuing_after_a_rejected_payload() {
        let config = TcpClientConfig::new("127.0.0.1", 9)
            .socket_config(TcpSocketConfig::default().write_buffer_max(8));
        let client = TcpClient::new(config, Arc::new(Recorder::default()));
        let remote = client.clone();
        std::thread::spawn(move || {
            remote.write_layer(vec![0u8; 16]).unwrap();
            remote.write_layer(&b"two"[..]).unwrap();
            remote.write_layer(&b"three"[..]).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(client.pending_len(), 3);

        assert_eq!(
            client.drain_pending(),
            Err(NetworkError::WriteBufferFull {
                requested: 16,
                pending: 0,
                max: 8
            })
        );
        assert_eq!(client.pending_len(), 0);
        assert_eq!(client.queued_write_bytes(), 8);
    }

    #[test]
    fn test_did_read_layer_follows_the_binding() {
        let client = client(Arc::default());
        let mut out = [0u8; 4];
        assert_eq!(client.did_read_layer(&mut out), None);

        let mut layer = client.read_layer(b"frame").unwrap();
        assert_eq!(layer.read(&mut out[..1]), 1);
        assert_eq!(client.did_read_layer(&mut out), Some(4));
        assert_eq!(&out, b"rame");
        assert_eq!(layer.remaining(), 0);

        drop(layer);
        assert_eq!(client.did_read_layer(&mut out), None);
    }

    #[tokio::test]
    async fn test_refused_connect_reports_result() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let recorder = Arc::new(Recorder::default());
        let client = TcpClient::connect(TcpClientConfig::new("127.0.0.1", port), recorder.clone());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*recorder.results.lock(), vec![NetworkError::ConnectionRefused]);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_host_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let client = TcpClient::connect(TcpClientConfig::new("", 80), recorder.clone());
        while !client.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            recorder.results.lock()[0],
            NetworkError::InvalidArgument(_)
        ));
    }
}
