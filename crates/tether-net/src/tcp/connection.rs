//! Server-side connections.
//!
//! A [`TcpConnection`] is created by the listener for every accepted socket
//! and driven by a task on the I/O thread through preamble, handshake and
//! frame reading. Outbound data is queued with
//! [`send_data`](TcpConnection::send_data) and written by a loop running
//! alongside the reader, so queuing never waits on the socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{CancellationToken, ThreadAffinity, Tick, ticks};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use super::delegate::ServerDelegate;
use super::layer::{ReadLayer, ReadLayerGate};
use super::registry::ConnectionId;
use super::server::ServerShared;
use super::state::{AtomicState, ServerConnectionState};
use super::stream::MaybeTlsStream;
use crate::buffer::{QueuedWriteBuffer, ReadBuffer};
use crate::error::{NetworkError, Result};

/// An accepted connection.
pub struct TcpConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: AtomicState<ServerConnectionState>,
    closing: AtomicBool,
    write_buf: Mutex<QueuedWriteBuffer>,
    write_ready: Notify,
    preamble_reply: Mutex<Option<Bytes>>,
    cancel: CancellationToken,
    create_tick: Tick,
    handshake_tick: AtomicU64,
    keepalive_deadline: AtomicU64,
    affinity: ThreadAffinity,
    read_layer: ReadLayerGate,
}

impl TcpConnection {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        write_buffer_max: usize,
    ) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            state: AtomicState::new(ServerConnectionState::ReadPreamble),
            closing: AtomicBool::new(false),
            write_buf: Mutex::new(QueuedWriteBuffer::new(write_buffer_max)),
            write_ready: Notify::new(),
            preamble_reply: Mutex::new(None),
            cancel: CancellationToken::new(),
            create_tick: ticks::now(),
            handshake_tick: AtomicU64::new(ticks::UNSET),
            keepalive_deadline: AtomicU64::new(ticks::UNSET),
            affinity: ThreadAffinity::current(),
            read_layer: ReadLayerGate::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerConnectionState {
        self.state.get()
    }

    /// Whether a close has started. Closing connections accept no more data.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub(crate) fn set_state(&self, state: ServerConnectionState) {
        self.state.set(state);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Tick at which the connection was accepted.
    pub fn create_tick(&self) -> Tick {
        self.create_tick
    }

    /// Tick at which the handshake finished, or [`ticks::UNSET`].
    pub fn handshake_tick(&self) -> Tick {
        self.handshake_tick.load(Ordering::Acquire)
    }

    pub fn handshaked(&self) -> bool {
        self.handshake_tick() != ticks::UNSET
    }

    /// The keepalive deadline, or [`ticks::UNSET`] when none is armed.
    pub fn keepalive_deadline(&self) -> Tick {
        self.keepalive_deadline.load(Ordering::Acquire)
    }

    pub fn set_keepalive_deadline(&self, deadline: Tick) {
        self.keepalive_deadline.store(deadline, Ordering::Release);
    }

    /// Arm the keepalive to expire `timeout` from now.
    pub fn refresh_keepalive(&self, timeout: Duration) {
        self.set_keepalive_deadline(ticks::deadline_after(timeout));
    }

    /// Whether the keepalive deadline is armed and has passed at `now`.
    pub fn should_disconnect(&self, now: Tick) -> bool {
        ticks::is_expired(self.keepalive_deadline(), now)
    }

    /// Bytes queued and not yet written.
    pub fn queued_write_bytes(&self) -> usize {
        self.write_buf.lock().total_size()
    }

    /// Queue `data` for writing.
    ///
    /// Must be called on the I/O thread. While the preamble is being read the
    /// payload becomes the preamble reply instead of entering the queue.
    /// Returns the number of bytes accepted.
    pub fn send_data(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        if !self.affinity.is_same_thread() {
            return Err(NetworkError::WrongThread);
        }
        if data.is_empty() {
            return Err(NetworkError::EmptyPayload);
        }
        if self.is_closing() {
            return Err(NetworkError::Cancelled);
        }

        let len = data.len();
        if self.state() == ServerConnectionState::ReadPreambleComplete {
            let mut reply = self.preamble_reply.lock();
            *reply = Some(match reply.take() {
                Some(prev) => Bytes::from([prev, data].concat()),
                None => data,
            });
            return Ok(len);
        }

        self.write_buf.lock().append(data)?;
        self.write_ready.notify_one();
        Ok(len)
    }

    /// Entry point for an upper layer writing through this connection.
    pub fn write_layer(&self, data: impl Into<Bytes>) -> Result<usize> {
        self.send_data(data)
    }

    /// Bind `data` as this connection's read source for one drain.
    ///
    /// Fails with [`NetworkError::ReadLayerBusy`] while another binding lives.
    pub fn read_layer(&self, data: &[u8]) -> Result<ReadLayer<'_>> {
        self.read_layer.bind(data)
    }

    /// Read from the bound read layer into `out`, advancing its cursor.
    ///
    /// Returns `None` when no [`ReadLayer`] is bound on this connection.
    pub fn did_read_layer(&self, out: &mut [u8]) -> Option<usize> {
        self.read_layer.read_bound(out)
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("closing", &self.is_closing())
            .finish()
    }
}

static_assertions::assert_impl_all!(TcpConnection: Send, Sync);

/// Read once into `buf`, growing it if needed.
///
/// EOF is reported as [`NetworkError::ConnectionClosed`].
pub(crate) async fn read_some<R>(reader: &mut R, buf: &mut ReadBuffer) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    if !buf.ensure_writable() {
        return Err(NetworkError::ReadBufferExhausted {
            max: buf.max_capacity(),
        });
    }
    match reader.read(buf.spare_mut()).await {
        Ok(0) => Err(NetworkError::ConnectionClosed),
        Ok(n) => {
            buf.did_read(n);
            Ok(n)
        }
        Err(e) => Err(e.into()),
    }
}

/// Write queued chunks until an error occurs.
///
/// Parks on `ready` whenever the queue is empty. Only returns on failure.
pub(crate) async fn pump_writes<W>(
    queue: &Mutex<QueuedWriteBuffer>,
    ready: &Notify,
    writer: &mut W,
) -> NetworkError
where
    W: AsyncWrite + Unpin,
{
    loop {
        let front = queue.lock().front();
        match front {
            Some(chunk) => match writer.write(&chunk).await {
                Ok(0) => return NetworkError::ConnectionClosed,
                Ok(n) => queue.lock().did_consume(n),
                Err(e) => return e.into(),
            },
            None => {
                if let Err(e) = writer.flush().await {
                    return e.into();
                }
                ready.notified().await;
            }
        }
    }
}

enum Failure {
    Read(NetworkError),
    Write(NetworkError),
}

/// Drive an accepted connection until it closes.
pub(crate) async fn drive<S>(conn: Arc<TcpConnection>, stream: S, server: Arc<ServerShared>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let socket = &server.config().socket;
    let mut read_buf = ReadBuffer::new(socket.read_buffer_initial, socket.read_buffer_max);
    let delegate = server.delegate();

    delegate.on_connect(&conn);
    if conn.is_closing() {
        return;
    }

    let stream = match establish(&conn, stream, &mut read_buf, &server).await {
        Ok(stream) => stream,
        Err(reason) => {
            server.close(conn.id(), reason);
            return;
        }
    };

    let (mut reader, mut writer) = tokio::io::split(stream);
    let failure = tokio::select! {
        _ = conn.cancel.cancelled() => return,
        reason = read_frames(&conn, &mut reader, &mut read_buf, delegate.as_ref()) => Failure::Read(reason),
        reason = pump_writes(&conn.write_buf, &conn.write_ready, &mut writer) => Failure::Write(reason),
    };

    match failure {
        Failure::Read(reason) => {
            server.close(conn.id(), reason);
        }
        // Writers defer the close so it never runs inside a write completion.
        Failure::Write(reason) => server.post_close(&conn, reason),
    }
}

/// Run the optional preamble and the handshake.
async fn establish<S>(
    conn: &Arc<TcpConnection>,
    mut stream: S,
    read_buf: &mut ReadBuffer,
    server: &ServerShared,
) -> Result<MaybeTlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if server.config().preamble {
        exchange_preamble(conn, &mut stream, read_buf, server.delegate().as_ref()).await?;
    }

    conn.set_state(ServerConnectionState::Handshake);
    conn.set_state(ServerConnectionState::HandshakeComplete);
    let stream = match server.acceptor() {
        Some(acceptor) => {
            let tls = conn
                .cancel
                .run_until_cancelled(acceptor.accept(stream))
                .await
                .ok_or(NetworkError::Cancelled)?
                .map_err(|e| NetworkError::Tls(e.to_string()))?;
            MaybeTlsStream::ServerTls(Box::new(tls))
        }
        None => MaybeTlsStream::Plain(stream),
    };
    conn.handshake_tick.store(ticks::now(), Ordering::Release);
    tracing::debug!(
        target: "tether_net::connection",
        id = %conn.id,
        peer = %conn.peer_addr,
        tls = stream.is_tls(),
        "handshake complete"
    );
    Ok(stream)
}

/// Deliver inbound bytes until the delegate stashes a reply, then write it.
async fn exchange_preamble<S>(
    conn: &Arc<TcpConnection>,
    stream: &mut S,
    read_buf: &mut ReadBuffer,
    delegate: &dyn ServerDelegate,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        conn.set_state(ServerConnectionState::ReadPreamble);
        conn.set_state(ServerConnectionState::ReadPreambleComplete);
        conn.cancel
            .run_until_cancelled(read_some(stream, read_buf))
            .await
            .ok_or(NetworkError::Cancelled)??;
        read_buf.deliver(|data| delegate.on_tcp_request(conn, data))?;
        if conn.is_closing() {
            return Err(NetworkError::Cancelled);
        }

        let reply = conn.preamble_reply.lock().take();
        if let Some(reply) = reply {
            conn.set_state(ServerConnectionState::WritePreambleReply);
            conn.set_state(ServerConnectionState::WritePreambleReplyComplete);
            conn.cancel
                .run_until_cancelled(stream.write_all(&reply))
                .await
                .ok_or(NetworkError::Cancelled)??;
            return Ok(());
        }
    }
}

async fn read_frames<R>(
    conn: &Arc<TcpConnection>,
    reader: &mut R,
    read_buf: &mut ReadBuffer,
    delegate: &dyn ServerDelegate,
) -> NetworkError
where
    R: AsyncRead + Unpin,
{
    loop {
        if conn.is_closing() {
            return NetworkError::Cancelled;
        }
        conn.set_state(ServerConnectionState::ReadFrame);
        conn.set_state(ServerConnectionState::ReadFrameComplete);
        if let Err(reason) = read_some(reader, read_buf).await {
            return reason;
        }
        if let Err(reason) = read_buf.deliver(|data| delegate.on_tcp_request(conn, data)) {
            return reason;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> TcpConnection {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        TcpConnection::new(ConnectionId::new(1), addr, addr, 16)
    }

    #[test]
    fn test_send_data_queues() {
        let conn = connection();
        conn.set_state(ServerConnectionState::ReadFrameComplete);
        assert_eq!(conn.send_data(&b"hello"[..]), Ok(5));
        assert_eq!(conn.queued_write_bytes(), 5);
    }

    #[test]
    fn test_send_data_rejects_empty_and_closing() {
        let conn = connection();
        assert_eq!(conn.send_data(Bytes::new()), Err(NetworkError::EmptyPayload));
        conn.mark_closing();
        assert_eq!(conn.send_data(&b"x"[..]), Err(NetworkError::Cancelled));
    }

    #[test]
    fn test_send_data_over_limit() {
        let conn = connection();
        conn.set_state(ServerConnectionState::ReadFrameComplete);
        let err = conn.send_data(vec![0u8; 17]).unwrap_err();
        assert!(matches!(err, NetworkError::WriteBufferFull { .. }));
        assert_eq!(conn.queued_write_bytes(), 0);
    }

    #[test]
    fn test_send_data_off_thread_is_rejected() {
        let conn = Arc::new(connection());
        let remote = conn.clone();
        let result = std::thread::spawn(move || remote.send_data(&b"x"[..]))
            .join()
            .unwrap();
        assert_eq!(result, Err(NetworkError::WrongThread));
    }

    #[test]
    fn test_preamble_reply_is_stashed() {
        let conn = connection();
        conn.set_state(ServerConnectionState::ReadPreambleComplete);
        assert_eq!(conn.send_data(&b"he"[..]), Ok(2));
        assert_eq!(conn.send_data(&b"llo"[..]), Ok(3));
        assert_eq!(conn.queued_write_bytes(), 0);
        assert_eq!(
            conn.preamble_reply.lock().as_deref(),
            Some(&b"hello"[..])
        );
    }

    #[test]
    fn test_did_read_layer_pulls_from_bound_source() {
        let conn = connection();
        let mut out = [0u8; 3];
        assert_eq!(conn.did_read_layer(&mut out), None);

        let layer = conn.read_layer(b"abcde").unwrap();
        assert_eq!(conn.did_read_layer(&mut out), Some(3));
        assert_eq!(&out, b"abc");
        assert_eq!(layer.consumed(), 3);
        assert_eq!(layer.remaining(), 2);
        assert_eq!(conn.read_layer(b"x").unwrap_err(), NetworkError::ReadLayerBusy);

        drop(layer);
        assert_eq!(conn.did_read_layer(&mut out), None);
        assert!(conn.read_layer(b"x").is_ok());
    }

    #[test]
    fn test_keepalive() {
        let conn = connection();
        let now = ticks::now();
        assert!(!conn.should_disconnect(now));

        conn.set_keepalive_deadline(now);
        assert!(conn.should_disconnect(now + 1));

        conn.refresh_keepalive(Duration::from_secs(60));
        assert!(!conn.should_disconnect(ticks::now()));
    }

    #[test]
    fn test_not_handshaked_until_tick_set() {
        let conn = connection();
        assert!(!conn.handshaked());
        assert_eq!(conn.state(), ServerConnectionState::ReadPreamble);
        assert!(conn.create_tick() >= 1);
    }

    #[tokio::test]
    async fn test_pump_writes_drains_in_order() {
        let queue = Mutex::new(QueuedWriteBuffer::new(64));
        let ready = Notify::new();
        queue.lock().append(Bytes::from_static(b"abc")).unwrap();
        queue.lock().append(Bytes::from_static(b"def")).unwrap();

        let (mut client, mut server) = tokio::io::duplex(64);
        let pump = pump_writes(&queue, &ready, &mut server);
        let read = async {
            let mut out = [0u8; 6];
            client.read_exact(&mut out).await.unwrap();
            out
        };
        let out = tokio::select! {
            _ = pump => unreachable!("pump only returns on failure"),
            out = read => out,
        };
        assert_eq!(&out, b"abcdef");
        assert!(queue.lock().is_empty());
    }

    #[tokio::test]
    async fn test_read_some_reports_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let mut buf = ReadBuffer::new(8, 8);
        assert_eq!(
            read_some(&mut server, &mut buf).await,
            Err(NetworkError::ConnectionClosed)
        );
    }
}
