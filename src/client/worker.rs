//! A single load-generating client worker.
//!
//! Each worker drives one session: connect, handshake, settle, then a fixed
//! number of paced `GET` round trips whose latencies feed a `LatencyStats`.
//! Workers share nothing; every one owns its transport, buffers and stats.

use crate::client::session::{Session, CRLF};
use crate::client::stats::{LatencyStats, LatencySummary, StatsWindow};
use crate::config::ClientConfig;
use crate::error::BenchError;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Receive buffer used per `read()` call.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

const REQUEST_LINE: &[u8] = b"GET /data/file.txt\r\n";

/// How a response read finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEnd {
    /// A receive call ended with the delimiter.
    Delimiter,
    /// The peer closed the stream.
    Eof,
}

/// Read one response from `reader`.
///
/// The response is considered complete only when a single receive call ends
/// with `\r\n`. A delimiter that straddles two receives, or one that sits in
/// the middle of a receive, does not end the response; the read keeps going
/// until a later receive ends with it or the stream closes.
///
/// Returns how the response ended and the number of bytes consumed.
pub async fn read_response<R>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<(ResponseEnd, usize)>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok((ResponseEnd::Eof, total));
        }
        total += n;
        if n >= CRLF.len() && &buf[n - CRLF.len()..n] == CRLF {
            return Ok((ResponseEnd::Delimiter, total));
        }
    }
}

/// Final per-worker result.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: u64,
    pub session_id: String,
    pub latency: LatencySummary,
    /// Requests actually issued.
    pub iterations: u64,
    /// Connect + handshake + settle + measured loop.
    pub total_time: Duration,
}

/// One concurrent client.
pub struct Worker {
    session: Session,
    stats: LatencyStats,
    settle: Duration,
    jitter_ms: u64,
    buf: Vec<u8>,
}

impl Worker {
    pub fn new(
        worker_id: u64,
        hostname: impl Into<String>,
        port: u16,
        max_iterations: u64,
        delay_ms: u64,
    ) -> Self {
        Self {
            session: Session::new(worker_id, hostname, port, max_iterations, delay_ms),
            stats: LatencyStats::new(StatsWindow::for_delay(delay_ms)),
            settle: Duration::from_millis(1000),
            jitter_ms: 500,
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    pub fn from_config(worker_id: u64, config: &ClientConfig) -> Self {
        Self::new(
            worker_id,
            config.hostname.clone(),
            config.port,
            config.iterations,
            config.delay_ms,
        )
        .with_window(config.window)
        .with_settle(config.settle, config.jitter_ms)
    }

    pub fn with_window(mut self, window: StatsWindow) -> Self {
        self.stats = LatencyStats::new(window);
        self
    }

    /// Fixed pause after the handshake plus a uniform jitter in
    /// `[0, jitter_ms)`.
    pub fn with_settle(mut self, settle: Duration, jitter_ms: u64) -> Self {
        self.settle = settle;
        self.jitter_ms = jitter_ms;
        self
    }

    /// Run the worker to completion.
    ///
    /// The transport is closed on every exit path, including when connect
    /// itself failed.
    pub async fn run(mut self) -> Result<WorkerReport, BenchError> {
        let worker_id = self.session.worker_id();
        let started = Instant::now();

        let result = self.drive().await;
        let result = result.map(|(latency, iterations)| {
            let total_time = started.elapsed();
            info!(
                worker = worker_id,
                total_ms = total_time.as_millis() as u64,
                "Total running time"
            );
            WorkerReport {
                worker_id,
                session_id: self.session.session_id().unwrap_or_default().to_string(),
                latency,
                iterations,
                total_time,
            }
        });

        if let Err(e) = &result {
            error!(worker = worker_id, error = %e, "Worker failed");
        }

        info!(
            worker = worker_id,
            terminated_at = chrono::Utc::now().timestamp_millis(),
            "Worker terminated"
        );
        if let Err(e) = self.session.close().await {
            warn!(worker = worker_id, error = %e, "Failed to close transport");
        }

        result
    }

    async fn drive(&mut self) -> Result<(LatencySummary, u64), BenchError> {
        self.session.connect().await?;
        self.session.handshake().await?;
        self.settle().await;
        let iterations = self.measure().await?;

        let summary = self.stats.finish();
        info!(
            worker = self.session.worker_id(),
            max_ms = summary.max_ms,
            min_ms = summary.min_ms,
            avg_ms = summary.avg_ms,
            samples = summary.samples,
            "{}",
            summary
        );
        Ok((summary, iterations))
    }

    /// Stagger workers that all started at nearly the same instant.
    async fn settle(&self) {
        let jitter = if self.jitter_ms > 0 {
            rand::rng().random_range(0..self.jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(self.settle + Duration::from_millis(jitter)).await;
    }

    /// The measured request loop. Returns the number of requests issued.
    async fn measure(&mut self) -> Result<u64, BenchError> {
        let worker_id = self.session.worker_id();
        let delay = Duration::from_millis(self.session.delay_ms());
        let mut index = 0u64;

        debug!(
            worker = worker_id,
            iterations = self.session.remaining(),
            warmup = self.stats.window().warmup(),
            cool_down = self.stats.window().cool_down(),
            "Starting measured loop"
        );

        while self.session.take_iteration() {
            tokio::time::sleep(delay).await;

            let stream = self.session.transport().stream()?;
            let start = Instant::now();
            stream.write_all(REQUEST_LINE).await?;
            let (end, bytes) = read_response(stream, &mut self.buf).await?;
            let elapsed = start.elapsed();

            self.stats.record(index, elapsed);
            index += 1;

            if end == ResponseEnd::Eof {
                warn!(
                    worker = worker_id,
                    iteration = index,
                    bytes,
                    "Server closed the connection"
                );
                break;
            }
        }

        Ok(index)
    }
}
