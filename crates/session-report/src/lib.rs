//! Plain-text export of a sampler session.

use anyhow::{Context, Result};
use conn_sampler::{ConnectionRecord, SamplerSnapshot};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::info;

pub const DEFAULT_REPORT_DIR: &str = "logs";

/// Write the report for `snapshot` to `location`, or to
/// `logs/network_report_<unix-seconds>.txt` when none is given.
pub fn export(snapshot: &SamplerSnapshot, location: Option<&Path>) -> Result<PathBuf> {
    let generated = OffsetDateTime::now_utc();
    let path = match location {
        Some(p) => p.to_path_buf(),
        None => Path::new(DEFAULT_REPORT_DIR).join(format!("network_report_{}.txt", generated.unix_timestamp())),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating report directory {}", parent.display()))?;
    }
    fs::write(&path, render(snapshot, generated)).with_context(|| format!("writing report {}", path.display()))?;
    info!(path = %path.display(), records = snapshot.records.len(), "session report written");
    Ok(path)
}

pub fn render(snapshot: &SamplerSnapshot, generated: OffsetDateTime) -> String {
    let stamp = generated
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_default();
    let log = snapshot.log_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "none".into());
    let s = &snapshot.stats;

    let mut out = String::new();
    let _ = writeln!(out, "=== MAILPATH - NETWORK MONITORING REPORT ===");
    let _ = writeln!(out, "Generated: {}", stamp);
    let _ = writeln!(out, "Process PID: {}", snapshot.pid);
    let _ = writeln!(out, "Process name: {}", snapshot.process_name);
    let _ = writeln!(out, "Log File: {}", log);
    out.push('\n');

    let _ = writeln!(out, "=== STATISTICS ===");
    let _ = writeln!(out, "Total connections: {}", s.total);
    let _ = writeln!(out, "SMTP connections: {}", s.smtp);
    let _ = writeln!(out, "IMAP connections: {}", s.imap);
    let _ = writeln!(out, "DNS queries: {}", s.dns);
    let _ = writeln!(out, "Other connections: {}", s.other);
    let _ = writeln!(out, "Suspicious connections: {}", s.suspicious);
    out.push('\n');

    section(&mut out, "EMAIL SERVER CONNECTIONS", &snapshot.email(), "No email server connections detected.");
    out.push('\n');
    section(&mut out, "SUSPICIOUS CONNECTIONS", &snapshot.suspicious(), "No suspicious connections detected.");
    out.push('\n');
    section(&mut out, "ALL CONNECTIONS", &snapshot.records, "No connections detected.");
    out
}

fn section(out: &mut String, title: &str, records: &[ConnectionRecord], placeholder: &str) {
    let _ = writeln!(out, "=== {} ===", title);
    if records.is_empty() {
        let _ = writeln!(out, "{}", placeholder);
    }
    for rec in records {
        let _ = writeln!(out, "{}", rec);
    }
}
