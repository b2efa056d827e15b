//! DNS resolver backed by hickory.

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, ResolveHosts, ResolverConfig, ResolverOpts,
};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};

use crate::dns::config::{DnsConfig, IpStrategy};
use crate::error::{NetworkError, Result};

/// Asynchronous host resolver.
///
/// Must be created and used inside a Tokio runtime.
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    /// Create a resolver from `config`.
    ///
    /// If the system configuration cannot be read, falls back to the
    /// resolver library's default upstreams.
    pub fn new(config: DnsConfig) -> Result<Self> {
        let mut builder = if config.use_system_config {
            match Resolver::builder_tokio() {
                Ok(builder) => builder,
                Err(e) => {
                    tracing::warn!(
                        target: "tether_net::client",
                        error = %e,
                        "system resolver configuration unavailable; using defaults"
                    );
                    Resolver::builder_with_config(
                        ResolverConfig::default(),
                        TokioConnectionProvider::default(),
                    )
                }
            }
        } else {
            Resolver::builder_with_config(
                custom_resolver_config(&config)?,
                TokioConnectionProvider::default(),
            )
        };

        apply_options(&config, builder.options_mut());

        Ok(Self {
            resolver: builder.build(),
        })
    }

    /// A resolver with system settings.
    pub fn system() -> Result<Self> {
        Self::new(DnsConfig::system())
    }

    /// Resolve `hostname` to its addresses, in strategy order.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let response = self
            .resolver
            .lookup_ip(hostname)
            .await
            .map_err(|e| NetworkError::NameNotResolved(format!("{hostname}: {e}")))?;

        let addresses: Vec<IpAddr> = response.iter().collect();
        if addresses.is_empty() {
            return Err(NetworkError::NameNotResolved(format!(
                "{hostname}: no addresses"
            )));
        }
        Ok(addresses)
    }

    /// Resolve `hostname` and pair every address with `port`.
    pub async fn resolve_socket_addrs(&self, hostname: &str, port: u16) -> Result<Vec<SocketAddr>> {
        Ok(self
            .resolve(hostname)
            .await?
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect())
    }

    /// Drop every cached entry.
    pub fn clear_cache(&self) {
        self.resolver.clear_cache();
    }
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver").finish_non_exhaustive()
    }
}

fn custom_resolver_config(config: &DnsConfig) -> Result<ResolverConfig> {
    if config.nameservers.is_empty() {
        return Err(NetworkError::InvalidArgument(
            "no nameservers configured".to_string(),
        ));
    }
    let mut resolver_config = ResolverConfig::new();
    for addr in &config.nameservers {
        resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
        resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Tcp));
    }
    Ok(resolver_config)
}

fn apply_options(config: &DnsConfig, opts: &mut ResolverOpts) {
    opts.cache_size = config.cache_size;
    opts.use_hosts_file = if config.use_hosts_file {
        ResolveHosts::Auto
    } else {
        ResolveHosts::Never
    };
    opts.attempts = config.attempts;
    opts.timeout = config.timeout;
    opts.ip_strategy = match config.ip_strategy {
        IpStrategy::Ipv4Only => LookupIpStrategy::Ipv4Only,
        IpStrategy::Ipv6Only => LookupIpStrategy::Ipv6Only,
        IpStrategy::Ipv4ThenIpv6 => LookupIpStrategy::Ipv4thenIpv6,
        IpStrategy::Ipv6ThenIpv4 => LookupIpStrategy::Ipv6thenIpv4,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_config_requires_nameservers() {
        let err = custom_resolver_config(&DnsConfig::with_nameservers(Vec::new())).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidArgument(_)));
    }

    #[test]
    fn test_options_follow_config() {
        let config = DnsConfig::system()
            .cache_size(8)
            .use_hosts_file(false)
            .ip_strategy(IpStrategy::Ipv4Only)
            .attempts(1);
        let mut opts = ResolverOpts::default();
        apply_options(&config, &mut opts);

        assert_eq!(opts.cache_size, 8);
        assert_eq!(opts.attempts, 1);
        assert_eq!(opts.ip_strategy, LookupIpStrategy::Ipv4Only);
        assert!(matches!(opts.use_hosts_file, ResolveHosts::Never));
    }
}
