//! Host resolution for the dialer.
//!
//! Clients skip this step entirely when the host is an IP literal or when
//! pre-resolved addresses are supplied in the client configuration.
//!
//! ```ignore
//! use tether_net::dns::{DnsConfig, DnsResolver, IpStrategy};
//!
//! let resolver = DnsResolver::new(DnsConfig::system().ip_strategy(IpStrategy::Ipv4Only))?;
//! let addrs = resolver.resolve_socket_addrs("gateway.local", 3389).await?;
//! ```

mod config;
mod resolver;

pub use config::{DnsConfig, IpStrategy};
pub use resolver::DnsResolver;
