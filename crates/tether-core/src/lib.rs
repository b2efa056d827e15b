//! Runtime plumbing for Tether.
//!
//! This crate provides the pieces the TCP engine in `tether-net` is built on:
//!
//! - **I/O thread**: a dedicated OS thread running a single-threaded Tokio
//!   runtime, with blocking hand-off from foreign threads
//! - **Cancellation**: tokens that invalidate in-flight work on close
//! - **Ticks**: a millisecond clock with a reserved "unset" value
//! - **Scope guards**: [`Defer`] for work that must run however a scope exits
//! - **Thread checks**: [`ThreadAffinity`] for "I/O thread only" entry points
//! - **Logging**: `tracing` targets and a timing span guard
//!
//! # Example
//!
//! ```no_run
//! use tether_core::{IoThread, IoThreadConfig, ticks};
//!
//! let io = IoThread::spawn(IoThreadConfig::default())?;
//! let tick = io.run_blocking(async { ticks::now() })?;
//! assert!(tick > ticks::UNSET);
//! # Ok::<(), tether_core::IoThreadError>(())
//! ```

pub mod cancel;
mod defer;
mod error;
pub mod io_thread;
pub mod logging;
pub mod thread_check;
pub mod ticks;

pub use cancel::CancellationToken;
pub use defer::Defer;
pub use error::{IoThreadError, Result};
pub use io_thread::{IoThread, IoThreadConfig};
pub use logging::PerfSpan;
pub use thread_check::ThreadAffinity;
pub use ticks::Tick;
