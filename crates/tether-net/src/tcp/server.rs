//! The listener.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_net::tcp::{ServerDelegate, TcpConnection, TcpServer, TcpServerConfig};
//!
//! struct Echo;
//!
//! impl ServerDelegate for Echo {
//!     fn on_tcp_request(&self, conn: &Arc<TcpConnection>, data: &[u8]) -> usize {
//!         let _ = conn.send_data(data.to_vec());
//!         data.len()
//!     }
//! }
//!
//! let server = TcpServer::bind(TcpServerConfig::new("127.0.0.1", 0), Arc::new(Echo)).await?;
//! println!("listening on {}", server.local_addr());
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::CancellationToken;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket};
use tokio_rustls::TlsAcceptor;

use super::config::TcpServerConfig;
use super::connection::{self, TcpConnection};
use super::delegate::ServerDelegate;
use super::registry::{ConnectionId, ConnectionRegistry};
use super::state::{ServerConnectionState, TcpServerState};
use crate::error::{NetworkError, Result};

/// State shared between the listener handle, its accept loop and every
/// connection driver.
pub(crate) struct ServerShared {
    config: TcpServerConfig,
    delegate: Arc<dyn ServerDelegate>,
    acceptor: Option<TlsAcceptor>,
    registry: ConnectionRegistry,
    state: Mutex<TcpServerState>,
    local_addr: SocketAddr,
    stop: CancellationToken,
}

impl ServerShared {
    pub(crate) fn config(&self) -> &TcpServerConfig {
        &self.config
    }

    pub(crate) fn delegate(&self) -> &Arc<dyn ServerDelegate> {
        &self.delegate
    }

    pub(crate) fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }

    /// Register `stream` as a new connection and spawn its driver.
    fn adopt<S>(self: &Arc<Self>, stream: S, peer_addr: SocketAddr, local_addr: SocketAddr) -> Result<Arc<TcpConnection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.registry.next_id();
        let conn = Arc::new(TcpConnection::new(
            id,
            peer_addr,
            local_addr,
            self.config.socket.write_buffer_max,
        ));
        self.registry.insert(conn.clone())?;
        tracing::debug!(target: "tether_net::server", %id, peer = %peer_addr, "connection accepted");

        tokio::spawn(connection::drive(conn.clone(), stream, self.clone()));
        Ok(conn)
    }

    /// Close one connection. Returns `false` if it was already gone.
    pub(crate) fn close(&self, id: ConnectionId, reason: NetworkError) -> bool {
        let Some(conn) = self.registry.take(id) else {
            return false;
        };
        conn.set_state(ServerConnectionState::Closed);
        tracing::debug!(
            target: "tether_net::server",
            %id,
            peer = %conn.peer_addr(),
            code = reason.code(),
            %reason,
            "connection closed"
        );
        self.delegate.on_close(&conn, &reason);
        conn.cancel_token().cancel();
        true
    }

    /// Mark the connection closing now and close it on a later turn.
    pub(crate) fn post_close(self: &Arc<Self>, conn: &Arc<TcpConnection>, reason: NetworkError) {
        conn.mark_closing();
        let shared = self.clone();
        let id = conn.id();
        tokio::spawn(async move {
            shared.close(id, reason);
        });
    }

    fn close_all(&self) -> usize {
        let drained = self.registry.drain();
        let count = drained.len();
        for conn in drained {
            conn.set_state(ServerConnectionState::Closed);
            self.delegate.on_close(&conn, &NetworkError::Cancelled);
            conn.cancel_token().cancel();
        }
        if count > 0 {
            tracing::debug!(target: "tether_net::server", count, "closed all connections");
        }
        count
    }

    fn shutdown(&self) {
        if !self.stop.cancel() {
            return;
        }
        *self.state.lock() = TcpServerState::Stopping;
        self.close_all();
        *self.state.lock() = TcpServerState::Stopped;
        tracing::info!(target: "tether_net::server", addr = %self.local_addr, "listener stopped");
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(shared.config.socket.no_delay) {
                    tracing::warn!(target: "tether_net::server", peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                }
                let local_addr = stream.local_addr().unwrap_or(shared.local_addr);
                if let Err(e) = shared.adopt(stream, peer_addr, local_addr) {
                    tracing::warn!(target: "tether_net::server", peer = %peer_addr, error = %e, "failed to register connection");
                }
            }
            Err(e) => {
                // Transient failures (fd exhaustion, aborted handshakes) must not stop the listener.
                tracing::warn!(target: "tether_net::server", error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// A listening socket and its live connections.
///
/// Dropping the server stops accepting and closes every connection.
pub struct TcpServer {
    shared: Arc<ServerShared>,
}

impl TcpServer {
    /// Bind, listen, and start accepting on the current runtime.
    pub async fn bind(config: TcpServerConfig, delegate: Arc<dyn ServerDelegate>) -> Result<Self> {
        let bind_addr = config.bind_addr();
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| NetworkError::AddressInvalid(format!("{bind_addr}: {e}")))?;
        let acceptor = config.tls.as_ref().map(|tls| tls.acceptor()).transpose()?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(not(windows))]
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            config,
            delegate,
            acceptor,
            registry: ConnectionRegistry::new(),
            state: Mutex::new(TcpServerState::Listening),
            local_addr,
            stop: CancellationToken::new(),
        });
        tokio::spawn(accept_loop(shared.clone(), listener));

        tracing::info!(
            target: "tether_net::server",
            addr = %local_addr,
            tls = shared.acceptor.is_some(),
            "listening"
        );
        Ok(Self { shared })
    }

    /// Drive an already-connected stream as if it had been accepted.
    pub fn adopt<S>(&self, stream: S, peer_addr: SocketAddr) -> Result<Arc<TcpConnection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.shared.stop.is_cancelled() {
            return Err(NetworkError::NotStarted);
        }
        self.shared.adopt(stream, peer_addr, self.shared.local_addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn state(&self) -> TcpServerState {
        *self.shared.state.lock()
    }

    pub fn config(&self) -> &TcpServerConfig {
        &self.shared.config
    }

    /// Close a connection, invoking `on_close` once. Returns `false` if the
    /// id is unknown or already closed.
    pub fn close(&self, id: ConnectionId, reason: NetworkError) -> bool {
        self.shared.close(id, reason)
    }

    /// Close every connection and keep listening.
    pub fn close_all(&self) -> usize {
        self.shared.close_all()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Registered connections, including those already closing.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Registered connections that are not closing.
    pub fn normal_connection_count(&self) -> usize {
        self.shared.registry.normal_count()
    }

    pub fn find(&self, id: ConnectionId) -> Option<Arc<TcpConnection>> {
        self.shared.registry.find(id)
    }

    /// First connection in id order matching `pred`.
    pub fn find_first(&self, pred: impl FnMut(&TcpConnection) -> bool) -> Option<Arc<TcpConnection>> {
        self.shared.registry.find_first(pred)
    }

    /// First connection that is not closing.
    pub fn find_first_normal(&self) -> Option<Arc<TcpConnection>> {
        self.find_first(|conn| !conn.is_closing())
    }

    /// First connection that finished its handshake and is not closing.
    pub fn find_first_handshaked(&self) -> Option<Arc<TcpConnection>> {
        self.find_first(|conn| conn.handshaked() && !conn.is_closing())
    }

    /// Whether any registered connection comes from `ip`.
    ///
    /// A connection counts until it leaves the registry, including while its
    /// close is pending.
    pub fn ip_is_connected(&self, ip: IpAddr) -> bool {
        self.find_first(|conn| conn.peer_ip() == ip).is_some()
    }

    /// Whether `id` names a registered connection.
    pub fn sessionid_is_valid(&self, id: ConnectionId) -> bool {
        self.shared.registry.contains(id)
    }

    /// Every registered connection, in id order.
    pub fn connections(&self) -> Vec<Arc<TcpConnection>> {
        self.shared.registry.snapshot()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.shared.local_addr)
            .field("state", &self.state())
            .field("connections", &self.shared.registry)
            .finish()
    }
}
