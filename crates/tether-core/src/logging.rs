//! Logging facilities for Tether.
//!
//! Tether instruments itself with the `tracing` crate and never installs a
//! subscriber. Applications pick one:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("tether_net=debug")
//!     .init();
//! ```

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "tether_core";
    /// Dedicated I/O thread lifecycle.
    pub const IO_THREAD: &str = "tether_core::io_thread";
    /// Listener and registry.
    pub const SERVER: &str = "tether_net::server";
    /// Server-side connection driver.
    pub const CONNECTION: &str = "tether_net::connection";
    /// Dialer and client connection driver.
    pub const CLIENT: &str = "tether_net::client";
    /// Periodic slicer ticks.
    pub const SLICER: &str = "tether_net::slicer";
    /// Session managers.
    pub const SESSION: &str = "tether_net::session";
    /// Performance spans.
    pub const PERF: &str = "tether::perf";
}

/// A guard that keeps a tracing span entered until dropped.
///
/// Useful for timing a blocking bring-up or teardown.
#[derive(Debug)]
pub struct PerfSpan {
    #[allow(dead_code)]
    span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Enter a new performance span named `name`.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "tether::perf", "perf", operation = name);
        Self {
            span: span.entered(),
        }
    }
}
