//! Per-session state owned by the sampling loop.

use crate::classify::Classifier;
use crate::model::{Category, ConnKey, ConnectionRecord, MonitorStats, RawConnection, SamplerSnapshot};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use time::OffsetDateTime;

pub struct Session {
    pid: u32,
    process_name: String,
    log_path: Option<PathBuf>,
    started_at: OffsetDateTime,
    seen: HashSet<ConnKey>,
    records: Vec<ConnectionRecord>,
    stats: MonitorStats,
}

impl Session {
    pub fn new(pid: u32, process_name: String, log_path: Option<PathBuf>, started_at: OffsetDateTime) -> Self {
        Session {
            pid,
            process_name,
            log_path,
            started_at,
            seen: HashSet::new(),
            records: Vec::new(),
            stats: MonitorStats::default(),
        }
    }

    /// Record `raw` if its (local, remote, status) key is new this session.
    /// `resolve` is only called for new keys with a remote peer.
    pub fn observe<F>(
        &mut self,
        raw: &RawConnection,
        classifier: &Classifier,
        now: OffsetDateTime,
        resolve: F,
    ) -> Option<&ConnectionRecord>
    where
        F: FnOnce(IpAddr) -> Option<String>,
    {
        let status = raw.status?;
        if !self.seen.insert(ConnKey { local: raw.local, remote: raw.remote, status }) {
            return None;
        }
        let remote_host = raw.remote.and_then(|r| resolve(r.ip()));
        let category = Classifier::category(raw.remote.map(|r| r.port()).unwrap_or(0));
        let suspicious = category == Category::Other && classifier.is_suspicious(raw.remote, remote_host.as_deref());

        self.stats.total += 1;
        match category {
            Category::Smtp => self.stats.smtp += 1,
            Category::Imap => self.stats.imap += 1,
            Category::Dns => self.stats.dns += 1,
            Category::Other => self.stats.other += 1,
        }
        if suspicious {
            self.stats.suspicious += 1;
        }
        self.records.push(ConnectionRecord {
            timestamp: now,
            local: raw.local,
            remote: raw.remote,
            protocol: raw.protocol,
            status,
            process_name: self.process_name.clone(),
            category,
            suspicious,
            remote_host,
        });
        self.records.last()
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    pub fn snapshot(&self) -> SamplerSnapshot {
        SamplerSnapshot {
            pid: self.pid,
            process_name: self.process_name.clone(),
            log_path: self.log_path.clone(),
            started_at: Some(self.started_at),
            stats: self.stats,
            records: self.records.clone(),
        }
    }

    pub fn into_snapshot(self) -> SamplerSnapshot {
        SamplerSnapshot {
            pid: self.pid,
            process_name: self.process_name,
            log_path: self.log_path,
            started_at: Some(self.started_at),
            stats: self.stats,
            records: self.records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnStatus, Protocol};

    fn raw(remote: &str, status: Option<ConnStatus>) -> RawConnection {
        RawConnection {
            local: "10.0.0.2:40000".parse().unwrap(),
            remote: Some(remote.parse().unwrap()),
            protocol: Protocol::Tcp,
            status,
        }
    }

    fn session() -> Session {
        Session::new(1, "mailpath".into(), None, OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn duplicate_triple_logged_once() {
        let mut s = session();
        let c = Classifier::default();
        let conn = raw("192.0.2.10:587", Some(ConnStatus::Established));
        assert!(s.observe(&conn, &c, OffsetDateTime::UNIX_EPOCH, |_| None).is_some());
        assert!(s.observe(&conn, &c, OffsetDateTime::UNIX_EPOCH, |_| None).is_none());
        let snap = s.snapshot();
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.stats.total, 1);
        assert_eq!(snap.stats.smtp, 1);
    }

    #[test]
    fn status_change_is_a_new_observation() {
        let mut s = session();
        let c = Classifier::default();
        s.observe(&raw("192.0.2.10:993", Some(ConnStatus::Established)), &c, OffsetDateTime::UNIX_EPOCH, |_| None);
        s.observe(&raw("192.0.2.10:993", Some(ConnStatus::TimeWait)), &c, OffsetDateTime::UNIX_EPOCH, |_| None);
        assert_eq!(s.stats().total, 2);
        assert_eq!(s.stats().imap, 2);
    }

    #[test]
    fn statusless_entries_are_discarded() {
        let mut s = session();
        assert!(s.observe(&raw("8.8.8.8:53", None), &Classifier::default(), OffsetDateTime::UNIX_EPOCH, |_| None).is_none());
        assert_eq!(s.stats(), MonitorStats::default());
    }

    #[test]
    fn high_port_flagged_and_smtp_not() {
        let mut s = session();
        let c = Classifier::default();
        let odd = s.observe(&raw("203.0.113.9:9999", Some(ConnStatus::Established)), &c, OffsetDateTime::UNIX_EPOCH, |_| None).cloned().unwrap();
        assert_eq!(odd.category, Category::Other);
        assert!(odd.suspicious);
        let smtp = s.observe(&raw("203.0.113.9:587", Some(ConnStatus::Established)), &c, OffsetDateTime::UNIX_EPOCH, |_| None).cloned().unwrap();
        assert_eq!(smtp.category, Category::Smtp);
        assert!(!smtp.suspicious);
        let st = s.stats();
        assert_eq!((st.total, st.other, st.smtp, st.suspicious), (2, 1, 1, 1));
    }

    #[test]
    fn watched_smtp_name_is_not_flagged() {
        let mut s = session();
        let rec = s
            .observe(&raw("198.51.100.3:25", Some(ConnStatus::Established)), &Classifier::default(), OffsetDateTime::UNIX_EPOCH, |_| Some("stats.example.com".into()))
            .cloned()
            .unwrap();
        assert!(!rec.suspicious);
        assert_eq!(rec.remote_host.as_deref(), Some("stats.example.com"));
    }

    #[test]
    fn resolver_only_called_for_new_keys() {
        let mut s = session();
        let c = Classifier::default();
        let conn = raw("198.51.100.3:443", Some(ConnStatus::Established));
        let mut calls = 0;
        s.observe(&conn, &c, OffsetDateTime::UNIX_EPOCH, |_| { calls += 1; None });
        s.observe(&conn, &c, OffsetDateTime::UNIX_EPOCH, |_| { calls += 1; None });
        assert_eq!(calls, 1);
    }

    #[test]
    fn dns_class_counted() {
        let mut s = session();
        s.observe(&raw("8.8.8.8:53", Some(ConnStatus::Established)), &Classifier::default(), OffsetDateTime::UNIX_EPOCH, |_| None);
        assert_eq!(s.stats().dns, 1);
        assert_eq!(s.snapshot().by_category(Category::Dns).len(), 1);
    }
}
