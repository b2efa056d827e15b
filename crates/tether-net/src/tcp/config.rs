//! Configuration types for TCP clients and servers.

use std::net::SocketAddr;
use std::time::Duration;

use crate::dns::DnsConfig;
use crate::tls::{ServerTlsConfig, TlsConfig};

/// Default maximum read buffer size.
pub const DEFAULT_READ_BUFFER_MAX: usize = 1024 * 1024;
/// Default initial read buffer capacity.
pub const DEFAULT_READ_BUFFER_INITIAL: usize = 4 * 1024;
/// Default maximum queued write size.
pub const DEFAULT_WRITE_BUFFER_MAX: usize = 1024 * 1024;

/// Queued write limit for server connections.
pub const SERVER_WRITE_BUFFER_MAX: usize = 3 * 1024 * 1024;

/// Initial read capacity for client connections.
pub const CLIENT_READ_BUFFER_INITIAL: usize = 256 * 1024;
/// Read buffer limit for client connections.
pub const CLIENT_READ_BUFFER_MAX: usize = 512 * 1024;
/// Queued write limit for client connections.
pub const CLIENT_WRITE_BUFFER_MAX: usize = 512 * 1024;

/// Socket-level and buffer options shared by both roles.
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Initial read buffer capacity in bytes.
    pub read_buffer_initial: usize,
    /// Maximum read buffer size; reaching it closes the connection.
    pub read_buffer_max: usize,
    /// Maximum bytes queued for writing; exceeding it rejects the send.
    pub write_buffer_max: usize,
    /// Connect timeout per address. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            read_buffer_initial: DEFAULT_READ_BUFFER_INITIAL,
            read_buffer_max: DEFAULT_READ_BUFFER_MAX,
            write_buffer_max: DEFAULT_WRITE_BUFFER_MAX,
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TcpSocketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Set the initial and maximum read buffer sizes.
    pub fn read_buffer(mut self, initial: usize, max: usize) -> Self {
        self.read_buffer_initial = initial;
        self.read_buffer_max = max;
        self
    }

    pub fn write_buffer_max(mut self, max: usize) -> Self {
        self.write_buffer_max = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn no_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }
}

/// Configuration for a client connection.
#[derive(Clone, Debug)]
pub struct TcpClientConfig {
    /// Host name or IP literal to dial.
    pub host: String,
    /// Port to dial.
    pub port: u16,
    /// Socket options.
    pub socket: TcpSocketConfig,
    /// Wrap the connection in TLS after connecting.
    pub tls: Option<TlsConfig>,
    /// Resolver settings for non-literal hosts.
    pub dns: DnsConfig,
    /// Already-resolved addresses; when set, resolution is skipped.
    pub addresses: Option<Vec<SocketAddr>>,
}

impl TcpClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socket: TcpSocketConfig {
                read_buffer_initial: CLIENT_READ_BUFFER_INITIAL,
                read_buffer_max: CLIENT_READ_BUFFER_MAX,
                write_buffer_max: CLIENT_WRITE_BUFFER_MAX,
                ..TcpSocketConfig::default()
            },
            tls: None,
            dns: DnsConfig::default(),
            addresses: None,
        }
    }

    pub fn socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.socket = config;
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.socket.connect_timeout = Some(timeout);
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn dns(mut self, dns: DnsConfig) -> Self {
        self.dns = dns;
        self
    }

    /// Reuse a previous resolution instead of resolving again.
    pub fn resolved(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    /// The `host:port` string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for a listener.
#[derive(Clone, Debug)]
pub struct TcpServerConfig {
    /// Address to bind.
    pub bind_address: String,
    /// Port to bind; 0 picks a free one.
    pub port: u16,
    /// Socket options for accepted connections.
    pub socket: TcpSocketConfig,
    /// Listen backlog.
    pub backlog: u32,
    /// Wrap accepted connections in TLS.
    pub tls: Option<ServerTlsConfig>,
    /// Exchange an application preamble before the handshake.
    pub preamble: bool,
}

impl TcpServerConfig {
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            socket: TcpSocketConfig {
                write_buffer_max: SERVER_WRITE_BUFFER_MAX,
                ..TcpSocketConfig::default()
            },
            backlog: 128,
            tls: None,
            preamble: false,
        }
    }

    pub fn socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.socket = config;
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    pub fn backlog(mut self, size: u32) -> Self {
        self.backlog = size;
        self
    }

    pub fn tls(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Expect a preamble from each client before the handshake.
    pub fn preamble(mut self, enabled: bool) -> Self {
        self.preamble = enabled;
        self
    }

    /// The `address:port` string.
    pub fn bind_addr(&self) -> String {
        match self.bind_address.parse::<std::net::Ipv6Addr>() {
            Ok(_) => format!("[{}]:{}", self.bind_address, self.port),
            Err(_) => format!("{}:{}", self.bind_address, self.port),
        }
    }
}
