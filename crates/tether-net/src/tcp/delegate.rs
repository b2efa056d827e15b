//! Callback contracts between connections and the code that owns them.
//!
//! All callbacks run on the I/O thread. `on_tcp_request` returns how many of
//! the offered bytes it consumed; the rest stay in the read buffer and are
//! offered again, extended by whatever arrives next.

use std::sync::Arc;

use super::client::TcpClient;
use super::connection::TcpConnection;
use crate::error::NetworkError;

/// Receives events for connections accepted by a [`TcpServer`](super::TcpServer).
pub trait ServerDelegate: Send + Sync + 'static {
    /// A connection was accepted and registered.
    fn on_connect(&self, conn: &Arc<TcpConnection>) {
        let _ = conn;
    }

    /// Bytes are available. Returns the number consumed, at most `data.len()`.
    fn on_tcp_request(&self, conn: &Arc<TcpConnection>, data: &[u8]) -> usize;

    /// The connection was removed from the registry. Runs once per connection.
    fn on_close(&self, conn: &Arc<TcpConnection>, reason: &NetworkError) {
        let _ = (conn, reason);
    }
}

/// Receives events for a [`TcpClient`].
pub trait ClientDelegate: Send + Sync + 'static {
    /// The connection ended; `result` is the terminal reason.
    ///
    /// Called immediately before [`on_close`](Self::on_close).
    fn on_result(&self, result: &NetworkError) {
        let _ = result;
    }

    /// The transport connected.
    fn on_connect(&self, client: &Arc<TcpClient>) {
        let _ = client;
    }

    /// Bytes are available. Returns the number consumed, at most `data.len()`.
    fn on_tcp_request(&self, client: &Arc<TcpClient>, data: &[u8]) -> usize;

    /// The client closed. Runs once.
    fn on_close(&self, client: &Arc<TcpClient>) {
        let _ = client;
    }
}
