//! Address and mail-exchange resolution with timing.

use mailpath_core::elapsed_ms;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsResult {
    pub hostname: String,
    pub ip_addresses: Vec<IpAddr>,
    /// (preference, exchange) pairs in resolver order.
    pub mx_records: Vec<(u16, String)>,
    pub response_time_ms: f64,
    /// True iff at least one address resolved. Not a DNSSEC check.
    pub authoritative: bool,
    pub dnssec_valid: bool,
}

impl DnsResult {
    fn empty(hostname: &str, response_time_ms: f64) -> Self {
        DnsResult {
            hostname: hostname.to_string(),
            ip_addresses: Vec::new(),
            mx_records: Vec::new(),
            response_time_ms,
            authoritative: false,
            dnssec_valid: false,
        }
    }
}

pub struct DnsResolver {
    resolver: Option<TokioAsyncResolver>,
    lookup_timeout: Duration,
    cache: HashMap<String, DnsResult>,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_TIMEOUT)
    }
}

impl DnsResolver {
    pub fn new(lookup_timeout: Duration) -> Self {
        DnsResolver { resolver: None, lookup_timeout, cache: HashMap::new() }
    }

    /// Resolve address and MX records independently. Never fails: an
    /// unresolvable host yields empty lists and `authoritative = false`.
    pub async fn resolve(&mut self, hostname: &str) -> DnsResult {
        let started = Instant::now();
        let limit = self.lookup_timeout;
        let resolver = self.resolver();

        let ip_addresses = match timeout(limit, resolver.lookup_ip(hostname)).await {
            Ok(Ok(answers)) => answers.iter().collect(),
            Ok(Err(e)) => {
                debug!(host = hostname, error = %e, "address lookup failed");
                Vec::new()
            }
            Err(_) => {
                debug!(host = hostname, "address lookup timed out");
                Vec::new()
            }
        };

        let mx_records = if hostname.parse::<IpAddr>().is_ok() {
            Vec::new()
        } else {
            match timeout(limit, resolver.mx_lookup(hostname)).await {
                Ok(Ok(answers)) => answers
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_string()))
                    .collect(),
                Ok(Err(e)) => {
                    debug!(host = hostname, error = %e, "mx lookup failed");
                    Vec::new()
                }
                Err(_) => {
                    debug!(host = hostname, "mx lookup timed out");
                    Vec::new()
                }
            }
        };

        let mut result = DnsResult::empty(hostname, elapsed_ms(started));
        result.authoritative = !ip_addresses.is_empty();
        result.ip_addresses = ip_addresses;
        result.mx_records = mx_records;
        self.cache.insert(hostname.to_string(), result.clone());
        result
    }

    /// Last result for `hostname`, if any. Entries are never expired.
    pub fn cached(&self, hostname: &str) -> Option<&DnsResult> {
        self.cache.get(hostname)
    }

    fn resolver(&mut self) -> &TokioAsyncResolver {
        let limit = self.lookup_timeout;
        self.resolver.get_or_insert_with(|| match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "system resolver config unavailable, using defaults");
                let mut opts = ResolverOpts::default();
                opts.timeout = limit;
                opts.attempts = 1;
                TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
            }
        })
    }
}
