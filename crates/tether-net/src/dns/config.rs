//! DNS configuration types.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for host resolution.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Read the system resolver configuration (`/etc/resolv.conf` on Unix).
    /// When false, `nameservers` is used.
    pub use_system_config: bool,
    /// Nameservers used when `use_system_config` is false.
    pub nameservers: Vec<SocketAddr>,
    /// Maximum number of cached entries.
    pub cache_size: usize,
    /// Consult the hosts file before querying nameservers.
    pub use_hosts_file: bool,
    /// IP version preference.
    pub ip_strategy: IpStrategy,
    /// Attempts per query.
    pub attempts: usize,
    /// Timeout per attempt.
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            use_system_config: true,
            nameservers: Vec::new(),
            cache_size: 32,
            use_hosts_file: true,
            ip_strategy: IpStrategy::default(),
            attempts: 2,
            timeout: Duration::from_secs(5),
        }
    }
}

impl DnsConfig {
    /// System resolver settings.
    pub fn system() -> Self {
        Self::default()
    }

    /// Query only the given nameservers.
    pub fn with_nameservers(nameservers: Vec<SocketAddr>) -> Self {
        Self {
            use_system_config: false,
            nameservers,
            ..Default::default()
        }
    }

    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn use_hosts_file(mut self, use_hosts: bool) -> Self {
        self.use_hosts_file = use_hosts;
        self
    }

    pub fn ip_strategy(mut self, strategy: IpStrategy) -> Self {
        self.ip_strategy = strategy;
        self
    }

    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// IP version lookup strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpStrategy {
    /// IPv4 only.
    Ipv4Only,
    /// IPv6 only.
    Ipv6Only,
    /// Both, IPv4 first.
    #[default]
    Ipv4ThenIpv6,
    /// Both, IPv6 first.
    Ipv6ThenIpv4,
}
