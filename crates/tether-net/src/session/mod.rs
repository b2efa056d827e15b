//! Session managers.
//!
//! A session manager owns a dedicated I/O thread and runs either a listener
//! ([`TcpServerManager`]) or one outbound connection ([`TcpClientManager`])
//! on it. Callers on other threads start and stop the session, query it, and
//! hand over payloads; everything else happens on the I/O thread, including
//! the periodic [`Slicer`] ticks that enforce keepalives and deliver those
//! payloads.

mod client_manager;
mod server_manager;
mod slicer;

pub use client_manager::{
    ClientHandler, ClientSession, ClientStatus, DefaultClientHandler, StatusSnapshot,
    TcpClientManager, TransactionProgress,
};
pub use server_manager::{DefaultServerHandler, ServerHandler, ServerSession, TcpServerManager};
pub use slicer::{SliceTarget, Slicer, SlicerConfig};
