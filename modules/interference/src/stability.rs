//! Repeated connect measurements against one endpoint. Each attempt is an
//! independent sample; a failure is counted, never retried.

use mailpath_core::elapsed_ms;
use serde::Serialize;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StabilityReport {
    pub successful_connections: u32,
    pub failed_connections: u32,
    pub connection_times_ms: Vec<f64>,
    pub resets: u32,
    pub reset_detected: bool,
    pub avg_connection_ms: f64,
}

pub async fn test_connection_stability(
    host: &str,
    port: u16,
    attempts: u32,
    interval: Duration,
    connect_timeout: Duration,
) -> StabilityReport {
    let mut report = StabilityReport::default();
    for i in 0..attempts {
        let started = Instant::now();
        match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                report.successful_connections += 1;
                report.connection_times_ms.push(elapsed_ms(started));
            }
            Ok(Err(e)) => {
                report.failed_connections += 1;
                if is_reset(&e) {
                    report.resets += 1;
                }
                debug!(host, port, attempt = i, error = %e, "stability attempt failed");
            }
            Err(_) => {
                report.failed_connections += 1;
                debug!(host, port, attempt = i, "stability attempt timed out");
            }
        }
        if i + 1 < attempts {
            sleep(interval).await;
        }
    }
    report.reset_detected = report.resets > 0;
    if !report.connection_times_ms.is_empty() {
        report.avg_connection_ms =
            report.connection_times_ms.iter().sum::<f64>() / report.connection_times_ms.len() as f64;
    }
    report
}

fn is_reset(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted)
        || e.to_string().to_lowercase().contains("reset")
}
