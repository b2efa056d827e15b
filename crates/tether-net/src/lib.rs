//! TCP connection engine for Tether.
//!
//! This crate provides:
//!
//! - **Connections**: server and client connections driven through an
//!   explicit state machine (preamble, handshake, frame reading) with
//!   bounded read and write buffers
//! - **Listener and dialer**: [`tcp::TcpServer`] with its connection
//!   registry, and [`tcp::TcpClient`] with DNS resolution and optional TLS
//! - **Session managers**: [`session::TcpServerManager`] and
//!   [`session::TcpClientManager`], which run a listener or a connection on
//!   a dedicated I/O thread and accept work from any other thread
//!
//! # Server
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_net::session::{ServerHandler, TcpServerManager};
//! use tether_net::tcp::TcpConnection;
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_tcp_request(&self, conn: &Arc<TcpConnection>, data: &[u8]) -> usize {
//!         let _ = conn.send_data(data.to_vec());
//!         data.len()
//!     }
//! }
//!
//! let manager = TcpServerManager::new(9000).with_handler(|| Echo);
//! let addr = manager.start("127.0.0.1")?;
//! println!("listening on {addr}");
//! ```
//!
//! # One-shot transaction
//!
//! ```ignore
//! use std::time::Duration;
//! use tether_net::session::TcpClientManager;
//!
//! let manager = TcpClientManager::new();
//! match manager.xmit_transaction("127.0.0.1", 9000, &b"status"[..], Duration::from_secs(5)) {
//!     Ok(()) => println!("{} bytes back", manager.total_read_bytes()),
//!     Err(e) => eprintln!("{}", e.user_message()),
//! }
//! ```
//!
//! # Threading
//!
//! Connection entry points that touch buffers (`send_data`) must be called
//! on the thread that runs the connection and return
//! [`NetworkError::WrongThread`] elsewhere. Cross-thread entry points
//! (`send_data_ex`, `TcpClientManager::send`, `TcpClient::write_layer`) park
//! payloads in a queue that the I/O thread drains.

pub mod buffer;
pub mod dns;
mod error;
pub mod session;
pub mod tcp;
pub mod tls;

pub use error::{NetworkError, Result, codes};

pub use buffer::{QueuedWriteBuffer, ReadBuffer};
pub use dns::{DnsConfig, DnsResolver, IpStrategy};
pub use session::{
    ClientHandler, ServerHandler, SlicerConfig, TcpClientManager, TcpServerManager,
    TransactionProgress,
};
pub use tcp::{
    ClientDelegate, ConnectionId, ServerDelegate, TcpClient, TcpClientConfig, TcpConnection,
    TcpServer, TcpServerConfig, TcpSocketConfig,
};
pub use tls::{AlpnProtocol, Certificate, Identity, ServerTlsConfig, TlsConfig, TlsVersion};
