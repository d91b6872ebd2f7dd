//! Enumeration of a process's inet sockets.
//!
//! The Linux implementation maps the socket inodes found under
//! `/proc/<pid>/fd` onto the rows of `/proc/<pid>/net/{tcp,tcp6,udp,udp6}`.

use crate::model::{ConnStatus, Protocol, RawConnection};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient enumeration failure: {0}")]
    Transient(String),
    #[error("process {0} no longer exists")]
    ProcessGone(u32),
    #[error("access denied to process {0}")]
    AccessDenied(u32),
    #[error("connection enumeration unsupported: {0}")]
    Unsupported(String),
}

impl SourceError {
    /// Errors after which sampling cannot usefully continue.
    pub fn ends_session(&self) -> bool {
        !matches!(self, SourceError::Transient(_))
    }
}

pub trait ConnectionSource: Send + Sync {
    fn pid(&self) -> u32;
    fn process_name(&self) -> String;
    fn connections(&self) -> Result<Vec<RawConnection>, SourceError>;
}

/// Reads socket tables from a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcNetSource {
    root: PathBuf,
    pid: u32,
}

impl ProcNetSource {
    /// The calling process, via `/proc`.
    pub fn current() -> Self {
        Self::new("/proc", std::process::id())
    }

    pub fn new(root: impl Into<PathBuf>, pid: u32) -> Self {
        ProcNetSource { root: root.into(), pid }
    }

    fn proc_dir(&self) -> PathBuf {
        self.root.join(self.pid.to_string())
    }

    fn socket_inodes(&self) -> Result<HashSet<u64>, SourceError> {
        if !self.root.exists() {
            return Err(SourceError::Unsupported(format!("{} not mounted", self.root.display())));
        }
        let entries = fs::read_dir(self.proc_dir().join("fd")).map_err(|e| match e.kind() {
            ErrorKind::NotFound => SourceError::ProcessGone(self.pid),
            ErrorKind::PermissionDenied => SourceError::AccessDenied(self.pid),
            _ => SourceError::Transient(e.to_string()),
        })?;
        let mut inodes = HashSet::new();
        for entry in entries.flatten() {
            if let Ok(link) = fs::read_link(entry.path()) {
                if let Some(inode) = parse_socket_inode(&link.to_string_lossy()) {
                    inodes.insert(inode);
                }
            }
        }
        Ok(inodes)
    }
}

impl ConnectionSource for ProcNetSource {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn process_name(&self) -> String {
        fs::read_to_string(self.proc_dir().join("comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn connections(&self) -> Result<Vec<RawConnection>, SourceError> {
        let inodes = self.socket_inodes()?;
        if inodes.is_empty() {
            return Ok(Vec::new());
        }
        let net = self.proc_dir().join("net");
        let mut out = Vec::new();
        for (file, protocol, ipv6) in [
            ("tcp", Protocol::Tcp, false),
            ("tcp6", Protocol::Tcp, true),
            ("udp", Protocol::Udp, false),
            ("udp6", Protocol::Udp, true),
        ] {
            let content = match fs::read_to_string(net.join(file)) {
                Ok(c) => c,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) if e.kind() == ErrorKind::PermissionDenied => return Err(SourceError::AccessDenied(self.pid)),
                Err(e) => return Err(SourceError::Transient(format!("{}: {}", file, e))),
            };
            out.extend(
                parse_net_table(&content, protocol, ipv6)
                    .into_iter()
                    .filter(|(inode, _)| inodes.contains(inode))
                    .map(|(_, conn)| conn),
            );
        }
        Ok(out)
    }
}

/// Parse a `/proc/net/{tcp,udp}[6]` table into (inode, connection) rows.
pub fn parse_net_table(content: &str, protocol: Protocol, ipv6: bool) -> Vec<(u64, RawConnection)> {
    let mut rows = Vec::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }
        let (local, remote) = match (parse_addr_port(parts[1], ipv6), parse_addr_port(parts[2], ipv6)) {
            (Some(l), Some(r)) => (l, r),
            _ => continue,
        };
        let inode = match parts[9].parse::<u64>() {
            Ok(i) => i,
            Err(_) => continue,
        };
        let status = match protocol {
            Protocol::Tcp => ConnStatus::from_tcp_state(parts[3]),
            Protocol::Udp => ConnStatus::from_udp_state(parts[3]),
        };
        let remote = if remote.ip().is_unspecified() && remote.port() == 0 { None } else { Some(remote) };
        rows.push((inode, RawConnection { local, remote, protocol, status }));
    }
    rows
}

fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

fn parse_addr_port(s: &str, ipv6: bool) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = if ipv6 { IpAddr::V6(parse_ipv6(addr_hex)?) } else { IpAddr::V4(parse_ipv4(addr_hex)?) };
    Some(SocketAddr::new(ip, port))
}

fn parse_ipv4(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(raw.to_le_bytes()))
}

fn parse_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for i in 0..4 {
        let word = u32::from_str_radix(&hex[i * 8..(i + 1) * 8], 16).ok()?;
        bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    Some(Ipv6Addr::from(bytes))
}
