//! Reverse hostname lookups for sampled peers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::system_conf::read_system_conf;
use trust_dns_resolver::Resolver;

pub const DEFAULT_RDNS_TIMEOUT: Duration = Duration::from_secs(1);

pub trait HostnameLookup: Send {
    fn lookup(&mut self, ip: IpAddr) -> Option<String>;
}

/// Never resolves anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLookup;

impl HostnameLookup for NoLookup {
    fn lookup(&mut self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Blocking PTR lookups with a per-address cache. Must not be driven from
/// inside a tokio runtime; the sampler thread owns it.
pub struct ReverseDns {
    resolver: Option<Resolver>,
    cache: HashMap<IpAddr, Option<String>>,
}

impl ReverseDns {
    pub fn new(lookup_timeout: Duration) -> Self {
        let (config, mut opts) = read_system_conf().unwrap_or_else(|e| {
            debug!(error = %e, "no system resolver configuration, using defaults");
            (ResolverConfig::default(), ResolverOpts::default())
        });
        opts.timeout = lookup_timeout;
        opts.attempts = 1;
        let resolver = Resolver::new(config, opts)
            .map_err(|e| debug!(error = %e, "reverse resolver unavailable"))
            .ok();
        ReverseDns { resolver, cache: HashMap::new() }
    }
}

impl HostnameLookup for ReverseDns {
    fn lookup(&mut self, ip: IpAddr) -> Option<String> {
        if ip.is_loopback() || ip.is_unspecified() {
            return None;
        }
        if let Some(hit) = self.cache.get(&ip) {
            return hit.clone();
        }
        let name = self.resolver.as_ref().and_then(|r| match r.reverse_lookup(ip) {
            Ok(answers) => answers.iter().next().map(|n| n.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!(%ip, error = %e, "reverse lookup failed");
                None
            }
        });
        self.cache.insert(ip, name.clone());
        name
    }
}
