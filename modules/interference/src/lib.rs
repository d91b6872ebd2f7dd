//! Heuristic interference classification: combines a fresh port scan and
//! path trace with a response-latency probe into a verdict.

pub mod dpi;
pub mod stability;

pub use stability::{test_connection_stability, StabilityReport};

use path_trace::{NetworkPath, PathTracer, DEFAULT_MAX_HOPS};
use port_scan::{closed_ports, scan_ports, PortProbeResult, DEFAULT_PROBE_TIMEOUT};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const PORT25_NOTE: &str = "Port 25 blocked (common ISP block on port 25)";
pub const ALT_PORT_ADVICE: &str = "Use port 587 or 465 instead of port 25";
pub const ALT_TRANSPORT_ADVICE: &str = "Consider using VPN or alternative SMTP relay";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterferenceReport {
    pub isp_name: Option<String>,
    pub suspicious_behavior: Vec<String>,
    pub blocked_ports: Vec<u16>,
    pub throttling_detected: bool,
    pub dpi_detected: bool,
    /// Filled from a stability run; `analyze` alone leaves it at zero.
    pub connection_resets: u32,
    pub recommendations: Vec<String>,
}

impl InterferenceReport {
    pub fn record_stability(&mut self, s: &StabilityReport) {
        self.connection_resets = s.resets;
    }
}

#[derive(Debug, Clone)]
pub struct Rules {
    pub high_loss_pct: f64,
    pub high_latency_ms: f64,
    pub throttle_loss_pct: f64,
    /// Carriers known for restricting outbound mail (matched case-insensitively).
    pub carrier_watch: Vec<String>,
    pub dpi_slow: Duration,
    pub dpi_limit: Duration,
}

impl Default for Rules {
    fn default() -> Self {
        Rules {
            high_loss_pct: 5.0,
            high_latency_ms: 200.0,
            throttle_loss_pct: 2.0,
            carrier_watch: vec!["comcast".into()],
            dpi_slow: Duration::from_secs(5),
            dpi_limit: Duration::from_secs(10),
        }
    }
}

/// Apply the rule set to already-collected evidence. Notes and
/// recommendations are appended in rule order.
pub fn classify(scan: &[PortProbeResult], path: &NetworkPath, dpi_detected: bool, rules: &Rules) -> InterferenceReport {
    let mut report = InterferenceReport {
        isp_name: path.detected_isp.clone(),
        blocked_ports: closed_ports(scan),
        dpi_detected,
        ..InterferenceReport::default()
    };

    if report.blocked_ports.contains(&25) {
        report.suspicious_behavior.push(PORT25_NOTE.into());
        report.recommendations.push(ALT_PORT_ADVICE.into());
    }
    if path.packet_loss_pct > rules.high_loss_pct {
        report.suspicious_behavior.push(format!("High packet loss: {:.1}%", path.packet_loss_pct));
    }
    if path.avg_rtt_ms > rules.high_latency_ms {
        report.suspicious_behavior.push(format!("High latency: {:.1}ms", path.avg_rtt_ms));
    }
    if let Some(isp) = &path.detected_isp {
        let lower = isp.to_lowercase();
        if rules.carrier_watch.iter().any(|c| lower.contains(&c.to_lowercase())) {
            report.suspicious_behavior.push(format!("{} detected - known for email restrictions", isp));
            report.recommendations.push(ALT_TRANSPORT_ADVICE.into());
        }
    }
    report.throttling_detected = report.blocked_ports.len() > 1 || path.packet_loss_pct > rules.throttle_loss_pct;
    report
}

pub struct InterferenceClassifier {
    tracer: PathTracer,
    rules: Rules,
    scan_ports: Vec<u16>,
    scan_timeout: Duration,
    max_hops: u8,
}

impl Default for InterferenceClassifier {
    fn default() -> Self {
        Self::new(PathTracer::default(), Rules::default())
    }
}

impl InterferenceClassifier {
    pub fn new(tracer: PathTracer, rules: Rules) -> Self {
        InterferenceClassifier {
            tracer,
            rules,
            scan_ports: mailpath_core::SMTP_PORTS.to_vec(),
            scan_timeout: DEFAULT_PROBE_TIMEOUT,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    pub fn with_scan(mut self, ports: Vec<u16>, timeout: Duration) -> Self {
        self.scan_ports = ports;
        self.scan_timeout = timeout;
        self
    }

    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Scan, trace and probe `host` afresh, then classify.
    pub async fn analyze(&self, host: &str, port: u16) -> InterferenceReport {
        let scan = scan_ports(host, &self.scan_ports, self.scan_timeout).await;
        let path = self.tracer.trace(host, self.max_hops).await;
        let dpi = dpi::probe(host, port, self.rules.dpi_slow, self.rules.dpi_limit).await;
        debug!(host, port, hops = path.total_hops, dpi, "interference evidence collected");
        classify(&scan, &path, dpi, &self.rules)
    }
}
