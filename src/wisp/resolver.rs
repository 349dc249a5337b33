//! DNS resolution
//!
//! One process-wide resolver, built once from the configured `dns_server`.
//! With no server configured the system configuration is loaded into
//! hickory; if that fails, lookups fall back to the runtime's getaddrinfo
//! path.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::warn;

// None = no usable hickory config, use getaddrinfo lookups
static RESOLVER: OnceLock<Option<TokioResolver>> = OnceLock::new();

/// Build the process resolver. `dns_server` is an optional `ip` or
/// `ip:port` address. Later calls (and [`resolve_host`] before any call)
/// keep whichever resolver was built first.
pub fn init_resolver(dns_server: Option<&str>) {
    RESOLVER.get_or_init(|| build_resolver(dns_server));
}

/// Resolve a hostname to IP addresses.
pub async fn resolve_host(host: &str) -> Result<Vec<IpAddr>> {
    let resolver = RESOLVER.get_or_init(|| build_resolver(None));

    match resolver {
        Some(resolver) => {
            let lookup = resolver
                .lookup_ip(host)
                .await
                .with_context(|| format!("failed to resolve hostname {}", host))?;
            Ok(lookup.into_iter().collect())
        }
        None => {
            let addrs = tokio::net::lookup_host((host, 0))
                .await
                .with_context(|| format!("failed to resolve hostname {}", host))?
                .map(|addr| addr.ip())
                .collect();
            Ok(addrs)
        }
    }
}

fn build_resolver(dns_server: Option<&str>) -> Option<TokioResolver> {
    if let Some(addr) = dns_server {
        let (ip, port) = match addr.parse::<SocketAddr>() {
            Ok(sock) => (sock.ip(), sock.port()),
            Err(_) => match addr.parse::<IpAddr>() {
                Ok(ip) => (ip, 53),
                Err(_) => {
                    warn!("invalid dns_server address {:?}, using system lookups", addr);
                    return None;
                }
            },
        };

        let config = ResolverConfig::from_parts(
            None,
            Vec::new(),
            NameServerConfigGroup::from_ips_clear(&[ip], port, true),
        );
        return Some(
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build(),
        );
    }

    match hickory_resolver::system_conf::read_system_conf() {
        Ok((config, opts)) => Some(
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(opts)
                .build(),
        ),
        Err(_) => {
            warn!("unable to read system DNS config, using system lookups");
            None
        }
    }
}
