//! Core utilities and shared types for the mailpath diagnostics engine.

pub mod patterns;

pub use patterns::PatternTable;

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Ports a mail transport client may submit on.
pub const SMTP_PORTS: [u16; 4] = [25, 465, 587, 2525];

/// Ports a mail store client may read from.
pub const IMAP_PORTS: [u16; 2] = [993, 143];

pub const DNS_PORT: u16 = 53;

/// Label for a port in the SMTP submission set.
pub fn smtp_service_name(port: u16) -> String {
    match port {
        25 => "SMTP".into(),
        465 => "SMTPS".into(),
        587 => "SMTP+STARTTLS".into(),
        2525 => "SMTP-alt".into(),
        p => format!("Port {}", p),
    }
}

/// Label for a remote port observed on a sampled connection.
pub fn expected_service(port: u16) -> Option<&'static str> {
    match port {
        25 => Some("SMTP"),
        587 => Some("SMTP-STARTTLS"),
        465 => Some("SMTPS"),
        993 => Some("IMAPS"),
        143 => Some("IMAP"),
        53 => Some("DNS"),
        80 => Some("HTTP"),
        443 => Some("HTTPS"),
        _ => None,
    }
}

pub fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// TCP connect bounded by `limit`. Returns the connect latency in milliseconds,
/// or `None` when the connection failed or timed out.
pub async fn connect_latency(addr: SocketAddr, limit: Duration) -> Option<f64> {
    let started = Instant::now();
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Some(elapsed_ms(started)),
        _ => None,
    }
}

/// Resolve `host:port` to the first socket address, bounded by `limit`.
pub async fn resolve_first(host: &str, port: u16, limit: Duration) -> Option<SocketAddr> {
    match timeout(limit, tokio::net::lookup_host((host, port))).await {
        Ok(Ok(mut it)) => it.next(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn smtp_labels() {
        assert_eq!(smtp_service_name(25), "SMTP");
        assert_eq!(smtp_service_name(465), "SMTPS");
        assert_eq!(smtp_service_name(587), "SMTP+STARTTLS");
        assert_eq!(smtp_service_name(2525), "SMTP-alt");
        assert_eq!(smtp_service_name(26), "Port 26");
    }

    #[tokio::test]
    async fn connect_latency_open_and_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(connect_latency(addr, Duration::from_secs(2)).await.is_some());
        drop(listener);
        assert!(connect_latency(addr, Duration::from_secs(2)).await.is_none());
    }

    #[tokio::test]
    async fn resolve_literal() {
        let sa = resolve_first("127.0.0.1", 80, Duration::from_secs(1)).await.unwrap();
        assert_eq!(sa.port(), 80);
        assert!(sa.ip().is_loopback());
    }
}
