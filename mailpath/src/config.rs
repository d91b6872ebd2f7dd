use anyhow::{Context, Result};
use conn_sampler::{Classifier, SamplerConfig};
use interference::Rules;
use mailpath_core::PatternTable;
use path_trace::TraceOptions;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "mailpath.yaml";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct DnsConfig {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct TraceConfig {
    pub tool: Option<String>,
    pub max_hops: Option<u8>,
    pub timeout_ms: Option<u64>,
    pub hop_wait_secs: Option<u32>,
    pub fallback_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ScanConfig {
    pub ports: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct AnalyzeConfig {
    pub port: Option<u16>,
    pub high_loss_pct: Option<f64>,
    pub high_latency_ms: Option<f64>,
    pub throttle_loss_pct: Option<f64>,
    pub carrier_watch: Option<Vec<String>>,
    pub dpi_slow_ms: Option<u64>,
    pub dpi_limit_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct MonitorConfig {
    pub interval_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub log_dir: Option<PathBuf>,
    pub traffic_log: Option<bool>,
    pub reverse_dns: Option<bool>,
    pub watch_patterns: Option<Vec<String>>,
    pub high_port_threshold: Option<u16>,
    pub allowed_high_ports: Option<Vec<u16>>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub format: Option<String>,
    pub dns: Option<DnsConfig>,
    pub trace: Option<TraceConfig>,
    pub scan: Option<ScanConfig>,
    pub analyze: Option<AnalyzeConfig>,
    pub monitor: Option<MonitorConfig>,
    /// Replaces the built-in carrier table when present.
    pub isp: Option<PatternTable>,
}

/// Read `path`, or `./mailpath.yaml` if it exists. A missing default file
/// yields the built-in defaults; an unreadable explicit file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parsing config {}", path.display()))
}

pub fn parse_config(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}

fn ms(v: Option<u64>) -> Option<Duration> {
    v.map(Duration::from_millis)
}

impl Config {
    pub fn dns_timeout(&self) -> Duration {
        ms(self.dns.as_ref().and_then(|d| d.timeout_ms)).unwrap_or(dns_probe::DEFAULT_LOOKUP_TIMEOUT)
    }

    pub fn max_hops(&self) -> u8 {
        self.trace.as_ref().and_then(|t| t.max_hops).unwrap_or(path_trace::DEFAULT_MAX_HOPS)
    }

    pub fn trace_options(&self) -> TraceOptions {
        let mut opts = TraceOptions::default();
        if let Some(t) = &self.trace {
            if let Some(tool) = &t.tool { opts.tool = tool.clone(); }
            if let Some(d) = ms(t.timeout_ms) { opts.overall_timeout = d; }
            if let Some(w) = t.hop_wait_secs { opts.hop_wait_secs = w; }
            if let Some(p) = t.fallback_port { opts.fallback_port = p; }
        }
        if let Some(isps) = &self.isp {
            opts.isps = isps.clone();
        }
        opts
    }

    pub fn scan_ports(&self) -> Option<&str> {
        self.scan.as_ref().and_then(|s| s.ports.as_deref())
    }

    pub fn scan_timeout(&self) -> Duration {
        ms(self.scan.as_ref().and_then(|s| s.timeout_ms)).unwrap_or(port_scan::DEFAULT_PROBE_TIMEOUT)
    }

    pub fn analyze_port(&self) -> Option<u16> {
        self.analyze.as_ref().and_then(|a| a.port)
    }

    pub fn rules(&self) -> Rules {
        let mut rules = Rules::default();
        if let Some(a) = &self.analyze {
            if let Some(v) = a.high_loss_pct { rules.high_loss_pct = v; }
            if let Some(v) = a.high_latency_ms { rules.high_latency_ms = v; }
            if let Some(v) = a.throttle_loss_pct { rules.throttle_loss_pct = v; }
            if let Some(v) = &a.carrier_watch { rules.carrier_watch = v.clone(); }
            if let Some(d) = ms(a.dpi_slow_ms) { rules.dpi_slow = d; }
            if let Some(d) = ms(a.dpi_limit_ms) { rules.dpi_limit = d; }
        }
        rules
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        let mut cfg = SamplerConfig::default();
        let Some(m) = &self.monitor else {
            return cfg;
        };
        if let Some(d) = ms(m.interval_ms) { cfg.interval = d; }
        if let Some(d) = ms(m.error_backoff_ms) { cfg.error_backoff = d; }
        if let Some(d) = ms(m.stop_timeout_ms) { cfg.stop_timeout = d; }
        if let Some(dir) = &m.log_dir { cfg.log_dir = Some(dir.clone()); }
        if m.traffic_log == Some(false) { cfg.log_dir = None; }
        if let Some(r) = m.reverse_dns { cfg.reverse_dns = r; }
        if m.watch_patterns.is_some() || m.high_port_threshold.is_some() || m.allowed_high_ports.is_some() {
            cfg.classifier = Classifier::new(
                m.watch_patterns
                    .clone()
                    .unwrap_or_else(|| conn_sampler::classify::DEFAULT_WATCH_PATTERNS.iter().map(|s| s.to_string()).collect()),
                m.high_port_threshold.unwrap_or(conn_sampler::classify::DEFAULT_HIGH_PORT_THRESHOLD),
                m.allowed_high_ports
                    .clone()
                    .unwrap_or_else(|| conn_sampler::classify::DEFAULT_ALLOWED_HIGH_PORTS.to_vec()),
            );
        }
        cfg
    }
}
