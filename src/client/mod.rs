//! Concurrent load generator.
//!
//! Spawns one task per worker, then waits for every one of them. Workers do
//! not coordinate during the run; each reports its own statistics.

pub mod session;
pub mod stats;
pub mod worker;

use crate::config::ClientConfig;
use crate::error::BenchError;
use tracing::{error, info};
use worker::{Worker, WorkerReport};

/// Run `config.connections` workers to completion.
///
/// Returns one result per worker, in worker order. A failed or panicked
/// worker never affects its siblings.
pub async fn run_load(config: &ClientConfig) -> Vec<Result<WorkerReport, BenchError>> {
    info!(
        host = %config.hostname,
        port = config.port,
        n = config.connections,
        delay_ms = config.delay_ms,
        iterations = config.iterations,
        "Running test"
    );

    let mut handles = Vec::with_capacity(config.connections);
    for i in 0..config.connections {
        let worker = Worker::from_config(i as u64 + 1, config);
        handles.push(tokio::spawn(worker.run()));
    }

    // Wait for all workers
    let mut results = Vec::with_capacity(handles.len());
    for (i, handle) in handles.into_iter().enumerate() {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(worker = i + 1, error = %e, "Worker task aborted");
                Err(BenchError::Io(std::io::Error::other(e.to_string())))
            }
        };
        results.push(result);
    }

    let ok = results.iter().filter(|r| r.is_ok()).count();
    info!(
        completed = ok,
        failed = results.len() - ok,
        "All workers finished"
    );
    results
}
