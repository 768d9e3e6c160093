//! file-bench: a request/response latency harness
//!
//! Two halves share one binary:
//! - `server`: accepts connections and streams a payload file back for every
//!   request, framed across 8 KiB buffers and terminated by `\r\n`
//! - `client`: opens n concurrent sessions, issues paced `GET` requests and
//!   reports per-session min/max/average round-trip time
//!
//! Configuration comes from CLI arguments or a TOML file.

mod client;
mod config;
mod error;
mod server;

use config::{Config, Mode};
use server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Server(server_config) => {
            info!(
                listen = %server_config.listen,
                file = %server_config.file.display(),
                max_connections = server_config.max_connections,
                "Starting file-bench server"
            );
            Server::from_config(&server_config)
                .run(&server_config.listen)
                .await?;
        }
        Mode::Client(client_config) => {
            let results = client::run_load(&client_config).await;
            for report in results.iter().flatten() {
                info!(
                    worker = report.worker_id,
                    session = %report.session_id,
                    iterations = report.iterations,
                    total_ms = report.total_time.as_millis() as u64,
                    "{}",
                    report.latency
                );
            }
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                warn!(failed, "Some workers did not complete");
            }
        }
    }

    Ok(())
}
