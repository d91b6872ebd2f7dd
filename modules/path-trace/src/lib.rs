//! Hop-by-hop path tracing through the system trace utility, with a single
//! connect probe as fallback when the utility is missing or yields nothing.

pub mod parser;

use mailpath_core::{connect_latency, resolve_first, PatternTable};
use parser::{LineOutcome, TraceParser};
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

pub const DEFAULT_MAX_HOPS: u8 = 15;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopRecord {
    pub hop_number: u32,
    pub ip_address: String,
    pub hostname: Option<String>,
    pub rtt_ms: f64,
    pub is_timeout: bool,
}

impl HopRecord {
    pub fn timeout(hop_number: u32) -> Self {
        HopRecord { hop_number, ip_address: "*".into(), hostname: None, rtt_ms: 0.0, is_timeout: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkPath {
    pub target_host: String,
    pub target_ip: String,
    pub hops: Vec<HopRecord>,
    pub total_hops: usize,
    pub packet_loss_pct: f64,
    pub avg_rtt_ms: f64,
    pub detected_isp: Option<String>,
}

impl NetworkPath {
    /// Build a path and derive its statistics from the hop sequence.
    pub fn from_hops(target_host: &str, target_ip: Option<String>, hops: Vec<HopRecord>, isps: &PatternTable) -> Self {
        let (packet_loss_pct, avg_rtt_ms) = path_stats(&hops);
        let detected_isp = detect_isp(&hops, isps);
        let target_ip = target_ip
            .or_else(|| hops.iter().rev().find(|h| !h.is_timeout).map(|h| h.ip_address.clone()))
            .unwrap_or_default();
        NetworkPath {
            target_host: target_host.to_string(),
            target_ip,
            total_hops: hops.len(),
            hops,
            packet_loss_pct,
            avg_rtt_ms,
            detected_isp,
        }
    }
}

/// (packet loss %, mean RTT over answering hops).
pub fn path_stats(hops: &[HopRecord]) -> (f64, f64) {
    if hops.is_empty() {
        return (0.0, 0.0);
    }
    let answered: Vec<f64> = hops.iter().filter(|h| !h.is_timeout).map(|h| h.rtt_ms).collect();
    let lost = hops.len() - answered.len();
    let loss = lost as f64 / hops.len() as f64 * 100.0;
    let avg = if answered.is_empty() { 0.0 } else { answered.iter().sum::<f64>() / answered.len() as f64 };
    (loss, avg)
}

/// First hop hostname matching the carrier table, in path order.
pub fn detect_isp(hops: &[HopRecord], isps: &PatternTable) -> Option<String> {
    hops.iter()
        .filter_map(|h| h.hostname.as_deref())
        .find_map(|name| isps.lookup(name))
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct TraceOptions {
    pub tool: String,
    /// Wall-clock bound for the whole utility run.
    pub overall_timeout: Duration,
    /// Passed to the utility as `-w`, in whole seconds.
    pub hop_wait_secs: u32,
    pub fallback_port: u16,
    pub fallback_timeout: Duration,
    pub isps: PatternTable,
}

impl Default for TraceOptions {
    fn default() -> Self {
        TraceOptions {
            tool: "traceroute".into(),
            overall_timeout: Duration::from_secs(10),
            hop_wait_secs: 1,
            fallback_port: 80,
            fallback_timeout: Duration::from_secs(5),
            isps: PatternTable::default_isps(),
        }
    }
}

pub struct PathTracer {
    opts: TraceOptions,
}

impl Default for PathTracer {
    fn default() -> Self {
        Self::new(TraceOptions::default())
    }
}

impl PathTracer {
    pub fn new(opts: TraceOptions) -> Self {
        PathTracer { opts }
    }

    pub fn options(&self) -> &TraceOptions {
        &self.opts
    }

    /// Trace the route to `target`. Never fails; an unreachable target
    /// produces an empty hop list.
    pub async fn trace(&self, target: &str, max_hops: u8) -> NetworkPath {
        let resolved = resolve_first(target, self.opts.fallback_port, self.opts.fallback_timeout).await;
        let mut hops = self.run_tool(target, max_hops).await;

        if hops.is_empty() {
            debug!(host = target, "no hops from trace utility, probing port {}", self.opts.fallback_port);
            if let Some(addr) = resolved {
                if let Some(ms) = connect_latency(addr, self.opts.fallback_timeout).await {
                    hops.push(HopRecord {
                        hop_number: 1,
                        ip_address: addr.ip().to_string(),
                        hostname: Some(target.to_string()),
                        rtt_ms: ms,
                        is_timeout: false,
                    });
                }
            }
        }
        NetworkPath::from_hops(target, resolved.map(|a| a.ip().to_string()), hops, &self.opts.isps)
    }

    async fn run_tool(&self, target: &str, max_hops: u8) -> Vec<HopRecord> {
        let deadline = Instant::now() + self.opts.overall_timeout;
        let mut child = match Command::new(&self.opts.tool)
            .arg("-n")
            .arg("-m")
            .arg(max_hops.to_string())
            .arg("-w")
            .arg(self.opts.hop_wait_secs.to_string())
            .arg(target)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                debug!(tool = %self.opts.tool, error = %e, "trace utility unavailable");
                return Vec::new();
            }
        };
        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => return Vec::new(),
        };

        let mut lines = BufReader::new(stdout).lines();
        let mut parser = TraceParser::new();
        let mut hops = Vec::new();
        loop {
            match timeout_at(deadline, lines.next_line()).await {
                Ok(Ok(Some(line))) => match parser.parse_line(&line) {
                    LineOutcome::Hop(h) => hops.push(h),
                    LineOutcome::Stop(h) => {
                        hops.push(h);
                        break;
                    }
                    LineOutcome::Skip => {}
                },
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    debug!(error = %e, "trace output read failed");
                    break;
                }
                Err(_) => {
                    debug!(host = target, "trace utility exceeded {:?}", self.opts.overall_timeout);
                    break;
                }
            }
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
        hops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(n: u32, ip: &str, host: Option<&str>, rtt: f64) -> HopRecord {
        HopRecord { hop_number: n, ip_address: ip.into(), hostname: host.map(Into::into), rtt_ms: rtt, is_timeout: false }
    }

    #[test]
    fn average_ignores_timeouts() {
        let hops = vec![hop(1, "10.0.0.1", None, 10.0), HopRecord::timeout(2), hop(3, "10.0.0.3", None, 30.0)];
        let (loss, avg) = path_stats(&hops);
        assert_eq!(avg, 20.0);
        assert!((loss - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn all_timeouts_average_zero() {
        let hops = vec![HopRecord::timeout(1), HopRecord::timeout(2)];
        assert_eq!(path_stats(&hops), (100.0, 0.0));
    }

    #[test]
    fn empty_path_has_no_loss() {
        let p = NetworkPath::from_hops("example.com", None, Vec::new(), &PatternTable::default_isps());
        assert_eq!(p.total_hops, 0);
        assert_eq!(p.packet_loss_pct, 0.0);
        assert_eq!(p.avg_rtt_ms, 0.0);
        assert_eq!(p.target_ip, "");
    }

    #[test]
    fn isp_first_match_in_path_order() {
        let hops = vec![
            hop(1, "10.0.0.1", Some("router.lan"), 1.0),
            hop(2, "68.1.1.1", Some("ip68-1.cox.net"), 5.0),
            hop(3, "96.1.1.1", Some("be-1.comcast.net"), 9.0),
        ];
        let p = NetworkPath::from_hops("mx", None, hops, &PatternTable::default_isps());
        assert_eq!(p.detected_isp.as_deref(), Some("COX"));
        assert_eq!(p.target_ip, "96.1.1.1");
    }

    #[test]
    fn injected_isp_table() {
        let hops = vec![hop(1, "1.1.1.1", Some("ae3.telia.net"), 1.0)];
        let table = PatternTable::new().with("telia", "TELIA");
        assert_eq!(detect_isp(&hops, &table).as_deref(), Some("TELIA"));
        assert_eq!(detect_isp(&hops, &PatternTable::default_isps()), None);
    }

    #[tokio::test]
    async fn missing_tool_falls_back_to_connect_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tracer = PathTracer::new(TraceOptions {
            tool: "definitely-not-a-trace-tool".into(),
            fallback_port: port,
            ..TraceOptions::default()
        });
        let path = tracer.trace("127.0.0.1", DEFAULT_MAX_HOPS).await;
        assert_eq!(path.total_hops, 1);
        assert_eq!(path.hops[0].hop_number, 1);
        assert_eq!(path.hops[0].ip_address, "127.0.0.1");
        assert!(!path.hops[0].is_timeout);
        assert_eq!(path.target_ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn failed_fallback_yields_empty_path() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let tracer = PathTracer::new(TraceOptions {
            tool: "definitely-not-a-trace-tool".into(),
            fallback_port: port,
            ..TraceOptions::default()
        });
        let path = tracer.trace("127.0.0.1", 5).await;
        assert!(path.hops.is_empty());
        assert_eq!(path.packet_loss_pct, 0.0);
        assert_eq!(path.avg_rtt_ms, 0.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_tool_stops_after_three_silent_hops() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-trace");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo 'traceroute to 127.0.0.1 (127.0.0.1), 15 hops max, 60 byte packets'\n\
             echo ' 1  gw1 (93.184.216.34)  12.3 ms'\n\
             echo ' 2  * * *'\n\
             echo ' 3  * * *'\n\
             echo ' 4  * * *'\n\
             exec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tracer = PathTracer::new(TraceOptions {
            tool: script.to_string_lossy().into_owned(),
            overall_timeout: Duration::from_secs(10),
            ..TraceOptions::default()
        });
        let started = std::time::Instant::now();
        let path = tracer.trace("127.0.0.1", DEFAULT_MAX_HOPS).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(path.total_hops, 4);
        assert_eq!(path.hops[0].ip_address, "93.184.216.34");
        assert_eq!(path.hops[0].hostname.as_deref(), Some("gw1"));
        assert!(path.hops[1..].iter().all(|h| h.is_timeout));
        assert_eq!(path.packet_loss_pct, 75.0);
        assert!((path.avg_rtt_ms - 12.3).abs() < 1e-9);
    }
}
