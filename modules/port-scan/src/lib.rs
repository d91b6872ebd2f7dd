//! Sequential TCP connect probes against mail submission ports.

use anyhow::{anyhow, Result};
use mailpath_core::{connect_latency, resolve_first, smtp_service_name, SMTP_PORTS};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortProbeResult {
    pub port: u16,
    pub is_open: bool,
    pub rtt_ms: Option<f64>,
    pub service: String,
}

/// Parse a comma-separated list of ports/ranges (e.g., "25,587", "2525-2530,465").
/// Request order is kept; repeated ports are dropped after their first mention.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse()?;
            let e: u16 = end.trim().parse()?;
            if s == 0 || e == 0 || s > e {
                return Err(anyhow!("invalid port range: {}", part));
            }
            ports.extend(s..=e);
        } else {
            let p: u16 = part.parse()?;
            if p == 0 {
                return Err(anyhow!("invalid port: {}", part));
            }
            ports.push(p);
        }
    }
    let mut seen = std::collections::HashSet::new();
    ports.retain(|p| seen.insert(*p));
    Ok(ports)
}

/// Probe the fixed SMTP port set `[25, 465, 587, 2525]`.
pub async fn scan(host: &str) -> Vec<PortProbeResult> {
    scan_ports(host, &SMTP_PORTS, DEFAULT_PROBE_TIMEOUT).await
}

/// Probe each port in order, one at a time. Exactly one result per port.
pub async fn scan_ports(host: &str, ports: &[u16], timeout_per_port: Duration) -> Vec<PortProbeResult> {
    let mut results = Vec::with_capacity(ports.len());
    for &port in ports {
        let rtt_ms = match resolve_first(host, port, timeout_per_port).await {
            Some(addr) => connect_latency(addr, timeout_per_port).await,
            None => None,
        };
        debug!(host, port, open = rtt_ms.is_some(), "port probe");
        results.push(PortProbeResult { port, is_open: rtt_ms.is_some(), rtt_ms, service: smtp_service_name(port) });
    }
    results
}

/// Ports from `results` that did not accept a connection, in scan order.
pub fn closed_ports(results: &[PortProbeResult]) -> Vec<u16> {
    results.iter().filter(|r| !r.is_open).map(|r| r.port).collect()
}
