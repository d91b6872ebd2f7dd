use crate::model::Category;
use mailpath_core::{DNS_PORT, IMAP_PORTS, SMTP_PORTS};
use std::net::SocketAddr;

pub const DEFAULT_WATCH_PATTERNS: &[&str] =
    &["telemetry", "analytics", "tracking", "metrics", "stats", "api.github.com", "pypi.org"];
pub const DEFAULT_HIGH_PORT_THRESHOLD: u16 = 8000;
pub const DEFAULT_ALLOWED_HIGH_PORTS: &[u16] = &[8080, 8443];

#[derive(Debug, Clone)]
pub struct Classifier {
    watch_patterns: Vec<String>,
    high_port_threshold: u16,
    allowed_high_ports: Vec<u16>,
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier::new(
            DEFAULT_WATCH_PATTERNS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_HIGH_PORT_THRESHOLD,
            DEFAULT_ALLOWED_HIGH_PORTS.to_vec(),
        )
    }
}

impl Classifier {
    pub fn new(watch_patterns: Vec<String>, high_port_threshold: u16, allowed_high_ports: Vec<u16>) -> Self {
        Classifier {
            watch_patterns: watch_patterns.into_iter().map(|p| p.to_lowercase()).collect(),
            high_port_threshold,
            allowed_high_ports,
        }
    }

    pub fn category(remote_port: u16) -> Category {
        if SMTP_PORTS.contains(&remote_port) {
            Category::Smtp
        } else if IMAP_PORTS.contains(&remote_port) {
            Category::Imap
        } else if remote_port == DNS_PORT {
            Category::Dns
        } else {
            Category::Other
        }
    }

    /// Watch-listed remote name or address, or an unexpected high port.
    pub fn is_suspicious(&self, remote: Option<SocketAddr>, remote_host: Option<&str>) -> bool {
        let Some(remote) = remote else {
            return false;
        };
        let addr = remote.ip().to_string();
        let host = remote_host.map(str::to_lowercase);
        let watched = self
            .watch_patterns
            .iter()
            .any(|p| addr.contains(p.as_str()) || host.as_deref().map_or(false, |h| h.contains(p.as_str())));
        if watched {
            return true;
        }
        let port = remote.port();
        port > self.high_port_threshold && !self.allowed_high_ports.contains(&port)
    }
}
