//! Response-latency probe standing in for inspection detection. No packet
//! content is examined; a greeting that takes too long to answer is the only
//! signal.

use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const GREETING: &[u8] = b"EHLO test.example.com\r\n";

/// Connect to `(host, port)`, send a greeting and wait for any reply. True
/// only when a reply arrived but took longer than `slow`. Every failure,
/// including exceeding `limit`, is a negative result.
pub async fn probe(host: &str, port: u16, slow: Duration, limit: Duration) -> bool {
    let started = Instant::now();
    let exchange = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_all(GREETING).await?;
        let mut buf = [0u8; 1024];
        stream.read(&mut buf).await
    };
    match timeout(limit, exchange).await {
        Ok(Ok(n)) => {
            let elapsed = started.elapsed();
            debug!(host, port, bytes = n, ?elapsed, "greeting answered");
            elapsed > slow
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "greeting probe failed");
            false
        }
        Err(_) => {
            debug!(host, port, "greeting probe timed out");
            false
        }
    }
}
