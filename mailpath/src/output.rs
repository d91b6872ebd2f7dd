//! Human-readable renderings of probe results.

use dns_probe::DnsResult;
use interference::{InterferenceReport, StabilityReport};
use path_trace::NetworkPath;
use port_scan::PortProbeResult;

pub fn dns_text(r: &DnsResult) -> String {
    let mut out = format!("{}: {:.1} ms", r.hostname, r.response_time_ms);
    if r.ip_addresses.is_empty() {
        out.push_str(", no addresses");
    } else {
        let ips: Vec<String> = r.ip_addresses.iter().map(|ip| ip.to_string()).collect();
        out.push_str(&format!("\n  A/AAAA: {}", ips.join(", ")));
    }
    for (pref, exchange) in &r.mx_records {
        out.push_str(&format!("\n  MX {} {}", pref, exchange));
    }
    out
}

pub fn path_text(p: &NetworkPath) -> String {
    let mut out = format!(
        "{} ({}): {} hops, {:.1}% loss, avg {:.1} ms",
        p.target_host,
        if p.target_ip.is_empty() { "unresolved" } else { p.target_ip.as_str() },
        p.total_hops,
        p.packet_loss_pct,
        p.avg_rtt_ms
    );
    if let Some(isp) = &p.detected_isp {
        out.push_str(&format!(", ISP {}", isp));
    }
    for hop in &p.hops {
        if hop.is_timeout {
            out.push_str(&format!("\n  {:>2}  *", hop.hop_number));
        } else {
            let name = hop.hostname.as_deref().unwrap_or(&hop.ip_address);
            out.push_str(&format!("\n  {:>2}  {} ({})  {:.1} ms", hop.hop_number, name, hop.ip_address, hop.rtt_ms));
        }
    }
    out
}

pub fn scan_text(host: &str, results: &[PortProbeResult]) -> String {
    let mut out = format!("{}: {} ports scanned", host, results.len());
    for r in results {
        match (r.is_open, r.rtt_ms) {
            (true, Some(rtt)) => out.push_str(&format!("\n  {:>5}  open    {}  {:.1} ms", r.port, r.service, rtt)),
            _ => out.push_str(&format!("\n  {:>5}  closed  {}", r.port, r.service)),
        }
    }
    out
}

pub fn interference_text(host: &str, r: &InterferenceReport) -> String {
    let mut out = format!("{}: ISP {}", host, r.isp_name.as_deref().unwrap_or("unknown"));
    let blocked: Vec<String> = r.blocked_ports.iter().map(|p| p.to_string()).collect();
    out.push_str(&format!(
        "\n  blocked ports: {}",
        if blocked.is_empty() { "none".to_string() } else { blocked.join(",") }
    ));
    out.push_str(&format!("\n  throttling: {}", yes_no(r.throttling_detected)));
    out.push_str(&format!("\n  DPI: {}", yes_no(r.dpi_detected)));
    if r.connection_resets > 0 {
        out.push_str(&format!("\n  connection resets: {}", r.connection_resets));
    }
    for note in &r.suspicious_behavior {
        out.push_str(&format!("\n  ! {}", note));
    }
    for rec in &r.recommendations {
        out.push_str(&format!("\n  > {}", rec));
    }
    out
}

pub fn stability_text(host: &str, port: u16, r: &StabilityReport) -> String {
    format!(
        "{}:{}: {} ok, {} failed, avg {:.1} ms, resets {}",
        host,
        port,
        r.successful_connections,
        r.failed_connections,
        r.avg_connection_ms,
        if r.reset_detected { r.resets.to_string() } else { "none".into() }
    )
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}
