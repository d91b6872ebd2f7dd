use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        })
    }
}

/// Socket state as the kernel reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnStatus {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
}

impl ConnStatus {
    /// Decode the `st` column of `/proc/net/tcp`.
    pub fn from_tcp_state(hex: &str) -> Option<Self> {
        let code = u8::from_str_radix(hex, 16).ok()?;
        Some(match code {
            0x01 => ConnStatus::Established,
            0x02 => ConnStatus::SynSent,
            0x03 => ConnStatus::SynRecv,
            0x04 => ConnStatus::FinWait1,
            0x05 => ConnStatus::FinWait2,
            0x06 => ConnStatus::TimeWait,
            0x07 => ConnStatus::Close,
            0x08 => ConnStatus::CloseWait,
            0x09 => ConnStatus::LastAck,
            0x0A => ConnStatus::Listen,
            0x0B => ConnStatus::Closing,
            _ => return None,
        })
    }

    /// UDP sockets only carry a status once connected to a peer.
    pub fn from_udp_state(hex: &str) -> Option<Self> {
        match u8::from_str_radix(hex, 16).ok()? {
            0x01 => Some(ConnStatus::Established),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnStatus::Established => "ESTABLISHED",
            ConnStatus::SynSent => "SYN_SENT",
            ConnStatus::SynRecv => "SYN_RECV",
            ConnStatus::FinWait1 => "FIN_WAIT1",
            ConnStatus::FinWait2 => "FIN_WAIT2",
            ConnStatus::TimeWait => "TIME_WAIT",
            ConnStatus::Close => "CLOSE",
            ConnStatus::CloseWait => "CLOSE_WAIT",
            ConnStatus::LastAck => "LAST_ACK",
            ConnStatus::Listen => "LISTEN",
            ConnStatus::Closing => "CLOSING",
        }
    }
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One socket as enumerated, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConnection {
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub protocol: Protocol,
    pub status: Option<ConnStatus>,
}

/// Session identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub status: ConnStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category {
    Smtp,
    Imap,
    Dns,
    Other,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::Smtp => "SMTP",
            Category::Imap => "IMAP",
            Category::Dns => "DNS",
            Category::Other => "OTHER",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub protocol: Protocol,
    pub status: ConnStatus,
    pub process_name: String,
    pub category: Category,
    pub suspicious: bool,
    pub remote_host: Option<String>,
}

impl ConnectionRecord {
    pub fn remote_port(&self) -> u16 {
        self.remote.map(|r| r.port()).unwrap_or(0)
    }
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clock = self
            .timestamp
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_default();
        write!(f, "{} {} {} -> ", clock, self.protocol, self.local)?;
        match self.remote {
            Some(r) => write!(f, "{}", r)?,
            None => f.write_str("unknown:0")?,
        }
        write!(f, " [{}]", self.status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub total: u64,
    pub smtp: u64,
    pub imap: u64,
    pub dns: u64,
    pub other: u64,
    pub suspicious: u64,
}

/// Immutable copy of a session handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplerSnapshot {
    pub pid: u32,
    pub process_name: String,
    pub log_path: Option<PathBuf>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub stats: MonitorStats,
    pub records: Vec<ConnectionRecord>,
}

impl SamplerSnapshot {
    pub fn empty(pid: u32, process_name: String, log_path: Option<PathBuf>) -> Self {
        SamplerSnapshot { pid, process_name, log_path, started_at: None, stats: MonitorStats::default(), records: Vec::new() }
    }

    /// The last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ConnectionRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records[skip..].to_vec()
    }

    pub fn by_category(&self, category: Category) -> Vec<ConnectionRecord> {
        self.records.iter().filter(|r| r.category == category).cloned().collect()
    }

    /// SMTP records followed by IMAP records.
    pub fn email(&self) -> Vec<ConnectionRecord> {
        let mut out = self.by_category(Category::Smtp);
        out.extend(self.by_category(Category::Imap));
        out
    }

    pub fn suspicious(&self) -> Vec<ConnectionRecord> {
        self.records.iter().filter(|r| r.suspicious).cloned().collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "Network Monitor: {} total, {} SMTP, {} IMAP, {} suspicious",
            self.stats.total, self.stats.smtp, self.stats.imap, self.stats.suspicious
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_states_decode() {
        assert_eq!(ConnStatus::from_tcp_state("01"), Some(ConnStatus::Established));
        assert_eq!(ConnStatus::from_tcp_state("0A"), Some(ConnStatus::Listen));
        assert_eq!(ConnStatus::from_tcp_state("0C"), None);
        assert_eq!(ConnStatus::from_tcp_state("zz"), None);
    }

    #[test]
    fn udp_only_connected_has_status() {
        assert_eq!(ConnStatus::from_udp_state("01"), Some(ConnStatus::Established));
        assert_eq!(ConnStatus::from_udp_state("07"), None);
    }

    #[test]
    fn record_display() {
        let rec = ConnectionRecord {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            local: "10.0.0.2:50000".parse().unwrap(),
            remote: Some("192.0.2.10:587".parse().unwrap()),
            protocol: Protocol::Tcp,
            status: ConnStatus::Established,
            process_name: "mailpath".into(),
            category: Category::Smtp,
            suspicious: false,
            remote_host: None,
        };
        assert_eq!(rec.to_string(), "00:00:00 TCP 10.0.0.2:50000 -> 192.0.2.10:587 [ESTABLISHED]");
        assert_eq!(rec.remote_port(), 587);
    }

    #[test]
    fn recent_takes_tail() {
        let mut snap = SamplerSnapshot::empty(1, "p".into(), None);
        assert!(snap.recent(5).is_empty());
        for port in [1000u16, 1001, 1002] {
            snap.records.push(ConnectionRecord {
                timestamp: OffsetDateTime::UNIX_EPOCH,
                local: "127.0.0.1:1".parse().unwrap(),
                remote: Some(SocketAddr::from(([127, 0, 0, 1], port))),
                protocol: Protocol::Tcp,
                status: ConnStatus::Established,
                process_name: "p".into(),
                category: Category::Other,
                suspicious: false,
                remote_host: None,
            });
        }
        let ports: Vec<u16> = snap.recent(2).iter().map(|r| r.remote_port()).collect();
        assert_eq!(ports, vec![1001, 1002]);
        assert_eq!(snap.recent(10).len(), 3);
    }
}
