//! TCP connections, listeners and dialers.
//!
//! This module provides the connection engine:
//! - **TcpServer**: binds, accepts, and owns a [`ConnectionRegistry`] of live
//!   [`TcpConnection`]s
//! - **TcpConnection**: an accepted socket driven through preamble,
//!   handshake and frame reading
//! - **TcpClient**: resolves, connects and reads frames from a remote host
//!
//! Events flow to the owner through [`ServerDelegate`] and
//! [`ClientDelegate`]. All connection work happens on the runtime thread that
//! created the connection; `send_data` refuses calls from anywhere else.
//!
//! # Client Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_net::tcp::{ClientDelegate, TcpClient, TcpClientConfig};
//!
//! struct Printer;
//!
//! impl ClientDelegate for Printer {
//!     fn on_connect(&self, client: &Arc<TcpClient>) {
//!         let _ = client.send_data(&b"hello"[..]);
//!     }
//!
//!     fn on_tcp_request(&self, _client: &Arc<TcpClient>, data: &[u8]) -> usize {
//!         println!("received {} bytes", data.len());
//!         data.len()
//!     }
//! }
//!
//! let client = TcpClient::connect(TcpClientConfig::new("127.0.0.1", 8080), Arc::new(Printer));
//! ```

mod client;
mod config;
mod connection;
mod delegate;
mod layer;
mod pending;
mod registry;
mod server;
mod state;
mod stream;

pub use client::TcpClient;
pub use config::{
    CLIENT_READ_BUFFER_INITIAL, CLIENT_READ_BUFFER_MAX, CLIENT_WRITE_BUFFER_MAX,
    DEFAULT_READ_BUFFER_INITIAL, DEFAULT_READ_BUFFER_MAX, DEFAULT_WRITE_BUFFER_MAX,
    SERVER_WRITE_BUFFER_MAX, TcpClientConfig, TcpServerConfig, TcpSocketConfig,
};
pub use connection::TcpConnection;
pub use delegate::{ClientDelegate, ServerDelegate};
pub use layer::ReadLayer;
pub use pending::PendingQueue;
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::TcpServer;
pub use state::{ClientConnectionState, ServerConnectionState, TcpServerState};
