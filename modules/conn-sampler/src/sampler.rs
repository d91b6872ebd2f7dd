//! Background sampling loop and its handle.
//!
//! The loop runs on its own thread and owns the session outright. After
//! every tick that records something it publishes an immutable snapshot,
//! and it publishes the final one before exiting. Readers only ever see
//! published snapshots, so a slow tick delays updates but never hides data
//! the loop has already recorded.

use crate::classify::Classifier;
use crate::model::{Category, ConnectionRecord, MonitorStats, SamplerSnapshot};
use crate::rdns::{HostnameLookup, NoLookup, ReverseDns, DEFAULT_RDNS_TIMEOUT};
use crate::session::Session;
use crate::source::{ConnectionSource, ProcNetSource};
use anyhow::{bail, Context};
use mailpath_core::expected_service;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{error, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
    pub error_backoff: Duration,
    /// Upper bound on how long `stop()` waits for the loop to exit.
    pub stop_timeout: Duration,
    /// Directory for the per-session traffic log; `None` disables it.
    pub log_dir: Option<PathBuf>,
    pub reverse_dns: bool,
    pub classifier: Classifier,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            interval: DEFAULT_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            reverse_dns: true,
            classifier: Classifier::default(),
        }
    }
}

struct Worker {
    stop: Sender<()>,
    /// Signalled once the final snapshot has been published.
    finished: Receiver<()>,
    published: Arc<Mutex<SamplerSnapshot>>,
    handle: JoinHandle<()>,
    /// Stop was requested but the loop has not exited yet.
    stopping: bool,
}

struct State {
    worker: Option<Worker>,
    /// Final snapshot of the most recently collected session.
    last: SamplerSnapshot,
}

pub struct ConnectionSampler {
    source: Arc<dyn ConnectionSource>,
    config: SamplerConfig,
    state: Mutex<State>,
}

impl ConnectionSampler {
    /// Samples the calling process.
    pub fn new(config: SamplerConfig) -> Self {
        Self::with_source(Arc::new(ProcNetSource::current()), config)
    }

    pub fn with_source(source: Arc<dyn ConnectionSource>, config: SamplerConfig) -> Self {
        let last = SamplerSnapshot::empty(source.pid(), source.process_name(), None);
        ConnectionSampler { source, config, state: Mutex::new(State { worker: None, last }) }
    }

    /// Begin a fresh session. A no-op while a session is running; an error
    /// while the previous loop is still shutting down.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        reap(&mut state);
        if let Some(worker) = &state.worker {
            if worker.stopping {
                bail!("previous sampling session is still shutting down");
            }
            return Ok(());
        }

        let started_at = OffsetDateTime::now_utc();
        let log = match &self.config.log_dir {
            Some(dir) => Some(TrafficLog::create(dir, started_at)?),
            None => None,
        };
        let session = Session::new(
            self.source.pid(),
            self.source.process_name(),
            log.as_ref().map(|l| l.path.clone()),
            started_at,
        );
        let published = Arc::new(Mutex::new(session.snapshot()));

        let (stop, stop_rx) = mpsc::channel();
        let (finished_tx, finished) = mpsc::channel();
        let sampling = Loop {
            source: Arc::clone(&self.source),
            classifier: self.config.classifier.clone(),
            interval: self.config.interval,
            error_backoff: self.config.error_backoff,
            reverse_dns: self.config.reverse_dns,
            log,
            published: Arc::clone(&published),
        };
        let handle = thread::Builder::new()
            .name("conn-sampler".into())
            .spawn(move || {
                sampling.run(session, stop_rx);
                let _ = finished_tx.send(());
            })
            .context("spawning sampler thread")?;

        info!(pid = self.source.pid(), "connection sampler started");
        state.worker = Some(Worker { stop, finished, published, handle, stopping: false });
        Ok(())
    }

    /// Signal the loop and wait up to `stop_timeout` for it. A no-op when
    /// idle. A loop that overruns the wait keeps running until its current
    /// tick ends; its final snapshot is collected then.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let Some(worker) = state.worker.as_mut() else {
            return;
        };
        let _ = worker.stop.send(());
        worker.stopping = true;
        match worker.finished.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => collect(&mut state),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.config.stop_timeout.as_millis() as u64,
                    "sampler did not stop in time, collecting its session when it exits"
                );
            }
        }
    }

    /// True while a loop thread is alive, including one still shutting down.
    pub fn is_running(&self) -> bool {
        let mut state = self.state.lock();
        reap(&mut state);
        state.worker.is_some()
    }

    /// Latest snapshot of the live session, or the final one of the last
    /// session when idle.
    pub fn snapshot(&self) -> SamplerSnapshot {
        let mut state = self.state.lock();
        reap(&mut state);
        match &state.worker {
            Some(worker) => worker.published.lock().clone(),
            None => state.last.clone(),
        }
    }

    pub fn recent(&self, n: usize) -> Vec<ConnectionRecord> {
        self.snapshot().recent(n)
    }

    pub fn by_category(&self, category: Category) -> Vec<ConnectionRecord> {
        self.snapshot().by_category(category)
    }

    pub fn email(&self) -> Vec<ConnectionRecord> {
        self.snapshot().email()
    }

    pub fn suspicious(&self) -> Vec<ConnectionRecord> {
        self.snapshot().suspicious()
    }

    pub fn stats(&self) -> MonitorStats {
        self.snapshot().stats
    }

    pub fn summary(&self) -> String {
        self.snapshot().summary()
    }
}

impl Drop for ConnectionSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collect a loop that has exited since the last look.
fn reap(state: &mut State) {
    let exited = match &state.worker {
        Some(w) => !matches!(w.finished.try_recv(), Err(TryRecvError::Empty)),
        None => false,
    };
    if exited {
        collect(state);
    }
}

fn collect(state: &mut State) {
    let Some(worker) = state.worker.take() else {
        return;
    };
    if worker.handle.join().is_err() {
        warn!("sampler thread panicked");
    }
    let snapshot = worker.published.lock().clone();
    info!(summary = %snapshot.summary(), "connection sampler stopped");
    state.last = snapshot;
}

struct Loop {
    source: Arc<dyn ConnectionSource>,
    classifier: Classifier,
    interval: Duration,
    error_backoff: Duration,
    reverse_dns: bool,
    log: Option<TrafficLog>,
    published: Arc<Mutex<SamplerSnapshot>>,
}

impl Loop {
    fn run(mut self, mut session: Session, stop: Receiver<()>) {
        // Built here so a blocking resolver never lives on a runtime thread.
        let mut lookup: Box<dyn HostnameLookup> =
            if self.reverse_dns { Box::new(ReverseDns::new(DEFAULT_RDNS_TIMEOUT)) } else { Box::new(NoLookup) };
        let mut next_tick = Instant::now();
        loop {
            match stop.recv_timeout(next_tick.saturating_duration_since(Instant::now())) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            match self.source.connections() {
                Ok(conns) => {
                    let mut recorded = false;
                    for raw in &conns {
                        let now = OffsetDateTime::now_utc();
                        if let Some(rec) = session.observe(raw, &self.classifier, now, |ip| lookup.lookup(ip)) {
                            recorded = true;
                            announce(rec);
                            if let Some(log) = self.log.as_mut() {
                                log.append(rec);
                            }
                        }
                    }
                    if recorded {
                        *self.published.lock() = session.snapshot();
                    }
                    next_tick = Instant::now() + self.interval;
                }
                Err(e) if e.ends_session() => {
                    warn!(error = %e, "connection sampling ended");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "connection enumeration failed");
                    next_tick = Instant::now() + self.error_backoff;
                }
            }
        }
        *self.published.lock() = session.into_snapshot();
    }
}

fn announce(rec: &ConnectionRecord) {
    let service = expected_service(rec.remote_port()).unwrap_or("unknown");
    if rec.suspicious {
        warn!(connection = %rec, service, host = rec.remote_host.as_deref(), "suspicious connection");
    } else {
        info!(connection = %rec, category = %rec.category, service, "new connection");
    }
}

/// Append-only, line-per-connection session log.
struct TrafficLog {
    path: PathBuf,
    out: BufWriter<File>,
}

impl TrafficLog {
    fn create(dir: &Path, started_at: OffsetDateTime) -> anyhow::Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
        let path = dir.join(format!("network_traffic_{}.log", started_at.unix_timestamp()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening traffic log {}", path.display()))?;
        Ok(TrafficLog { path, out: BufWriter::new(file) })
    }

    fn append(&mut self, rec: &ConnectionRecord) {
        let line = traffic_line(rec);
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!(path = %self.path.display(), error = %e, "traffic log write failed");
        }
    }
}

fn traffic_line(rec: &ConnectionRecord) -> String {
    let mut line = format!(
        "{} {} {}",
        rec,
        rec.category,
        expected_service(rec.remote_port()).unwrap_or("unknown")
    );
    if let Some(host) = &rec.remote_host {
        line.push_str(&format!(" host={}", host));
    }
    if rec.suspicious {
        line.push_str(" SUSPICIOUS");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnStatus, Protocol, RawConnection};
    use crate::source::SourceError;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::ThreadId;

    struct Scripted {
        steps: std::sync::Mutex<VecDeque<Result<Vec<RawConnection>, SourceError>>>,
        calls: AtomicUsize,
        threads: std::sync::Mutex<HashSet<ThreadId>>,
        /// (call index, delay) for one deliberately slow enumeration.
        slow: Option<(usize, Duration)>,
    }

    impl Scripted {
        fn new(steps: Vec<Result<Vec<RawConnection>, SourceError>>) -> Arc<Self> {
            Self::build(steps, None)
        }

        fn slow(steps: Vec<Result<Vec<RawConnection>, SourceError>>, call: usize, delay: Duration) -> Arc<Self> {
            Self::build(steps, Some((call, delay)))
        }

        fn build(steps: Vec<Result<Vec<RawConnection>, SourceError>>, slow: Option<(usize, Duration)>) -> Arc<Self> {
            Arc::new(Scripted {
                steps: std::sync::Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
                threads: std::sync::Mutex::new(HashSet::new()),
                slow,
            })
        }

        fn wait_for_calls(&self, n: usize) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.calls.load(Ordering::SeqCst) < n && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            assert!(self.calls.load(Ordering::SeqCst) >= n, "source polled too few times");
        }
    }

    impl ConnectionSource for Scripted {
        fn pid(&self) -> u32 {
            4242
        }

        fn process_name(&self) -> String {
            "mailpath-test".into()
        }

        fn connections(&self) -> Result<Vec<RawConnection>, SourceError> {
            self.threads.lock().unwrap().insert(thread::current().id());
            let step = self.steps.lock().unwrap().pop_front();
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((slow_call, delay)) = self.slow {
                if call == slow_call {
                    thread::sleep(delay);
                }
            }
            step.unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn conn(remote: &str) -> RawConnection {
        RawConnection {
            local: "10.0.0.2:40000".parse().unwrap(),
            remote: Some(remote.parse().unwrap()),
            protocol: Protocol::Tcp,
            status: Some(ConnStatus::Established),
        }
    }

    fn quiet() -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            log_dir: None,
            reverse_dns: false,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn same_triple_twice_is_one_record() {
        let src = Scripted::new(vec![Ok(vec![conn("192.0.2.1:587")]), Ok(vec![conn("192.0.2.1:587")])]);
        let sampler = ConnectionSampler::with_source(src.clone(), quiet());
        sampler.start().unwrap();
        src.wait_for_calls(3);
        assert_eq!(sampler.stats().total, 1);
        assert_eq!(sampler.email().len(), 1);
        sampler.stop();
        assert!(!sampler.is_running());
        assert_eq!(sampler.snapshot().records.len(), 1);
    }

    #[test]
    fn double_start_runs_one_loop() {
        let src = Scripted::new(Vec::new());
        let sampler = ConnectionSampler::with_source(src.clone(), quiet());
        sampler.start().unwrap();
        sampler.start().unwrap();
        src.wait_for_calls(3);
        sampler.stop();
        assert_eq!(src.threads.lock().unwrap().len(), 1);
    }

    #[test]
    fn slow_tick_keeps_session_through_overrun_stop() {
        let src = Scripted::slow(vec![Ok(vec![conn("192.0.2.1:587")])], 1, Duration::from_millis(1500));
        let sampler = ConnectionSampler::with_source(
            src.clone(),
            SamplerConfig { stop_timeout: Duration::from_millis(100), ..quiet() },
        );
        sampler.start().unwrap();
        // The second enumeration is now blocked inside the source.
        src.wait_for_calls(2);
        assert_eq!(sampler.stats().total, 1);

        sampler.stop();
        assert!(sampler.is_running());
        assert!(sampler.start().is_err());
        assert_eq!(sampler.stats().total, 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while sampler.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!sampler.is_running());
        let snap = sampler.snapshot();
        assert_eq!(snap.stats.total, 1);
        assert_eq!(snap.email().len(), 1);
        assert!(snap.started_at.is_some());

        sampler.start().unwrap();
        assert_eq!(sampler.stats().total, 0);
        sampler.stop();
    }

    #[test]
    fn stop_before_start_is_noop() {
        let sampler = ConnectionSampler::with_source(Scripted::new(Vec::new()), quiet());
        sampler.stop();
        assert!(!sampler.is_running());
        let snap = sampler.snapshot();
        assert_eq!(snap.stats, MonitorStats::default());
        assert_eq!(snap.pid, 4242);
        assert!(snap.started_at.is_none());
    }

    #[test]
    fn process_gone_ends_session() {
        let src = Scripted::new(vec![Ok(vec![conn("203.0.113.4:9999")]), Err(SourceError::ProcessGone(4242))]);
        let sampler = ConnectionSampler::with_source(src.clone(), quiet());
        sampler.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sampler.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!sampler.is_running());
        let snap = sampler.snapshot();
        assert_eq!(snap.stats.total, 1);
        assert_eq!(snap.stats.suspicious, 1);
        assert_eq!(sampler.suspicious().len(), 1);
    }

    #[test]
    fn transient_error_recovers() {
        let src = Scripted::new(vec![
            Err(SourceError::Transient("table busy".into())),
            Ok(vec![conn("8.8.8.8:53"), conn("192.0.2.1:993")]),
        ]);
        let sampler = ConnectionSampler::with_source(src.clone(), quiet());
        sampler.start().unwrap();
        src.wait_for_calls(3);
        assert!(sampler.is_running());
        let stats = sampler.stats();
        assert_eq!((stats.total, stats.dns, stats.imap), (2, 1, 1));
        sampler.stop();
    }

    #[test]
    fn restart_resets_counters() {
        let src = Scripted::new(vec![Ok(vec![conn("192.0.2.1:25")])]);
        let sampler = ConnectionSampler::with_source(src.clone(), quiet());
        sampler.start().unwrap();
        src.wait_for_calls(2);
        sampler.stop();
        assert_eq!(sampler.stats().total, 1);
        sampler.start().unwrap();
        src.wait_for_calls(4);
        assert_eq!(sampler.stats().total, 0);
        sampler.stop();
    }

    #[test]
    fn traffic_log_gets_one_line_per_connection() {
        let dir = tempfile::tempdir().unwrap();
        let src = Scripted::new(vec![
            Ok(vec![conn("192.0.2.1:587"), conn("203.0.113.4:9999")]),
            Ok(vec![conn("192.0.2.1:587")]),
        ]);
        let sampler = ConnectionSampler::with_source(
            src.clone(),
            SamplerConfig { log_dir: Some(dir.path().to_path_buf()), ..quiet() },
        );
        sampler.start().unwrap();
        src.wait_for_calls(3);
        sampler.stop();
        let path = sampler.snapshot().log_path.expect("log path recorded");
        assert!(path.starts_with(dir.path()));
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("192.0.2.1:587 [ESTABLISHED] SMTP SMTP-STARTTLS"));
        assert!(lines[1].ends_with("SUSPICIOUS"));
    }

    #[test]
    fn summary_line() {
        let src = Scripted::new(vec![Ok(vec![conn("192.0.2.1:465"), conn("192.0.2.1:143")])]);
        let sampler = ConnectionSampler::with_source(src.clone(), quiet());
        sampler.start().unwrap();
        src.wait_for_calls(2);
        sampler.stop();
        assert_eq!(sampler.summary(), "Network Monitor: 2 total, 1 SMTP, 1 IMAP, 0 suspicious");
    }
}
