//! Line parser for hop-tracing utility output.
//!
//! Output formats differ between implementations (Linux `traceroute`, BSD and
//! macOS `traceroute`, `tracepath`-style tools). The parser only relies on a
//! few shapes: a leading hop number, a parenthesized or bare dotted quad, and
//! `<number> ms` timings. Lines are parsed one at a time; the only state
//! carried between lines is the consecutive-timeout counter.

use crate::HopRecord;
use lazy_static::lazy_static;
use regex::Regex;

/// Consecutive timeout lines after which the path is treated as exhausted.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

lazy_static! {
    static ref PAREN_IP: Regex =
        Regex::new(r"(?:(\S+)\s+)?\((\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\)").unwrap();
    static ref BARE_IP: Regex =
        Regex::new(r"(?:^|\s)(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})(?:\s|$)").unwrap();
    // `<1 ms` reads as its upper bound, 1.0.
    static ref RTT: Regex = Regex::new(r"<?(\d+(?:\.\d+)?)\s*ms").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Hop(HopRecord),
    /// Nothing usable on this line.
    Skip,
    /// The line completed the run of timeouts; stop reading.
    Stop(HopRecord),
}

#[derive(Debug, Default)]
pub struct TraceParser {
    consecutive_timeouts: u32,
    emitted: u32,
    stopped: bool,
}

impl TraceParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn parse_line(&mut self, line: &str) -> LineOutcome {
        if self.stopped {
            return LineOutcome::Skip;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || is_header(trimmed) {
            return LineOutcome::Skip;
        }
        let leading = leading_hop_number(trimmed);

        if trimmed.matches('*').count() >= 3 {
            self.consecutive_timeouts += 1;
            let hop = HopRecord::timeout(self.next_number(leading));
            self.emitted += 1;
            if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                self.stopped = true;
                return LineOutcome::Stop(hop);
            }
            return LineOutcome::Hop(hop);
        }
        self.consecutive_timeouts = 0;

        let (ip, hostname) = match extract_address(trimmed) {
            Some(v) => v,
            None => return LineOutcome::Skip,
        };
        let rtt_ms = RTT
            .captures(trimmed)
            .and_then(|c| c[1].parse::<f64>().ok())
            .unwrap_or(0.0);
        let hop = HopRecord {
            hop_number: self.next_number(leading),
            hostname: Some(hostname.unwrap_or_else(|| ip.clone())),
            ip_address: ip,
            rtt_ms,
            is_timeout: false,
        };
        self.emitted += 1;
        LineOutcome::Hop(hop)
    }

    fn next_number(&self, leading: Option<u32>) -> u32 {
        leading.unwrap_or(self.emitted + 1)
    }
}

/// Parse a whole captured output, honouring the early stop.
pub fn parse_output(text: &str) -> Vec<HopRecord> {
    let mut parser = TraceParser::new();
    let mut hops = Vec::new();
    for line in text.lines() {
        match parser.parse_line(line) {
            LineOutcome::Hop(h) => hops.push(h),
            LineOutcome::Stop(h) => {
                hops.push(h);
                break;
            }
            LineOutcome::Skip => {}
        }
    }
    hops
}

fn is_header(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("traceroute") || lower.starts_with("tracing route") || lower.starts_with("over a maximum")
}

fn leading_hop_number(line: &str) -> Option<u32> {
    line.split_whitespace().next()?.parse().ok()
}

/// Prefer `host (a.b.c.d)`; fall back to a bare dotted quad.
fn extract_address(line: &str) -> Option<(String, Option<String>)> {
    if let Some(c) = PAREN_IP.captures(line) {
        let ip = c[2].to_string();
        let hostname = c
            .get(1)
            .map(|m| m.as_str())
            .filter(|h| h.parse::<u32>().is_err())
            .map(str::to_string);
        return Some((ip, hostname));
    }
    BARE_IP.captures(line).map(|c| (c[1].to_string(), None))
}
