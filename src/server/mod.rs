//! File-streaming test server.
//!
//! Accepts connections and runs one `Connection` task per socket. Every
//! request is answered with the payload followed by `\r\n`, except session
//! requests, which get a `jSessionId: <id>` line.

pub mod connection;
pub mod framer;
pub mod payload;

use crate::config::ServerConfig;
use connection::Connection;
use payload::{FilePayload, PayloadSource};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    timeout: Duration,
    payload: Arc<dyn PayloadSource>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    pub fn new(timeout: Duration, max_connections: usize, payload: Arc<dyn PayloadSource>) -> Self {
        Server {
            timeout,
            payload,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.timeout,
            config.max_connections,
            Arc::new(FilePayload::new(&config.file)),
        )
    }

    /// Bind `listen` and serve until the listener fails.
    pub async fn run(&self, listen: &str) -> std::io::Result<()> {
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(
            address = %addr,
            payload = %self.payload.describe(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Server listening"
        );
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut next_conn_id: u64 = 0;

        loop {
            // Wait for a connection slot
            let permit = self
                .connection_limit
                .clone()
                .acquire_owned()
                .await
                .map_err(std::io::Error::other)?;

            match listener.accept().await {
                Ok((stream, peer)) => {
                    next_conn_id += 1;
                    let conn = Connection::new(next_conn_id, self.timeout, Arc::clone(&self.payload));
                    debug!(peer = %peer, session = %conn.session_id(), "New connection");

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    tokio::spawn(async move {
                        conn.run(stream).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Create a non-blocking listener with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
