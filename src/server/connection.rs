//! Per-connection read/respond state machine.
//!
//! One task per accepted socket alternates between awaiting a request and
//! queueing its response. Responses are handed to a writer task, so the next
//! read is armed without waiting for the previous write to finish, while the
//! writer still sends responses in order and completes partial writes.
//!
//! ```text
//! AwaitingRead --(n > 0)--> SendingResponse --> AwaitingRead
//!      |
//!      +--(EOF, error, timeout, writer failure, queue full)--> Closed
//! ```

use crate::error::BenchError;
use crate::server::framer::{build_response, write_frame, ReadyFrame, CHUNK_SIZE};
use crate::server::payload::PayloadSource;
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Capacity of the per-connection request buffer.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Capacity of the per-connection scratch buffer for short replies.
pub const WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// Responses that may wait behind the one being written before the
/// connection is dropped as a slow reader.
pub const MAX_QUEUED_RESPONSES: usize = 16;

const SESSION_REQUEST_PREFIX: &[u8] = b"POST /session";

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Exactly one read is outstanding.
    AwaitingRead,
    /// A request of `len` bytes sits in the read buffer.
    SendingResponse { len: usize },
    /// Socket is being torn down; nothing else is issued.
    Closed,
}

/// What a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `POST /session-<id>`: reply with the session id line.
    Session,
    /// Anything else: reply with the payload.
    Fetch,
}

impl Request {
    pub fn classify(bytes: &[u8]) -> Self {
        if bytes.trim_ascii_start().starts_with(SESSION_REQUEST_PREFIX) {
            Request::Session
        } else {
            Request::Fetch
        }
    }
}

/// Derive the session id handed to a client from its connection number.
pub fn session_id(conn_id: u64) -> String {
    format!("{conn_id:016X}")
}

/// State owned by a single connection.
pub struct Connection {
    session_id: String,
    state: ConnState,
    read_buf: Box<[u8]>,
    write_buf: BytesMut,
    timeout: Duration,
    payload: Arc<dyn PayloadSource>,
}

impl Connection {
    pub fn new(conn_id: u64, timeout: Duration, payload: Arc<dyn PayloadSource>) -> Self {
        Self {
            session_id: session_id(conn_id),
            state: ConnState::AwaitingRead,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            write_buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            timeout,
            payload,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Drive the connection until it closes.
    pub async fn run(self, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        self.run_split(reader, writer).await;
    }

    /// Drive the connection over separate read and write halves.
    pub async fn run_split<R, W>(mut self, mut reader: R, writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(MAX_QUEUED_RESPONSES);
        let (failed_tx, mut failed_rx) = oneshot::channel();
        let write_task = tokio::spawn(write_loop(
            self.session_id.clone(),
            writer,
            rx,
            self.timeout,
            failed_tx,
        ));

        let mut graceful = false;
        let mut writer_alive = true;
        loop {
            match self.state {
                ConnState::AwaitingRead => {
                    let read = tokio::select! {
                        read = tokio::time::timeout(self.timeout, reader.read(&mut self.read_buf)) => read,
                        failure = &mut failed_rx, if writer_alive => {
                            writer_alive = false;
                            match failure {
                                Ok(e) => warn!(session = %self.session_id, error = %e, "Write failed"),
                                Err(_) => warn!(session = %self.session_id, "Writer stopped"),
                            }
                            self.state = ConnState::Closed;
                            continue;
                        }
                    };

                    self.state = match read {
                        Ok(Ok(0)) => {
                            debug!(session = %self.session_id, "Connection closed by client");
                            graceful = true;
                            ConnState::Closed
                        }
                        Ok(Ok(n)) => ConnState::SendingResponse { len: n },
                        Ok(Err(e)) => {
                            warn!(session = %self.session_id, error = %e, "Read failed");
                            ConnState::Closed
                        }
                        Err(_) => {
                            let e = BenchError::Timeout {
                                op: "read",
                                millis: self.timeout.as_millis(),
                            };
                            warn!(session = %self.session_id, error = %e, "Read failed");
                            ConnState::Closed
                        }
                    };
                }
                ConnState::SendingResponse { len } => {
                    // The read is re-armed regardless of how the response went.
                    if let Some(frame) = self.respond(len).await {
                        match tx.try_send(frame) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(
                                    session = %self.session_id,
                                    queued = MAX_QUEUED_RESPONSES,
                                    "Client is not reading responses"
                                );
                                self.state = ConnState::Closed;
                                continue;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                self.state = ConnState::Closed;
                                continue;
                            }
                        }
                    }
                    self.state = ConnState::AwaitingRead;
                }
                ConnState::Closed => break,
            }
        }

        info!(session = %self.session_id, "Closing remote connection");
        drop(tx);
        if graceful {
            // Let already queued responses drain; the writer is bounded by
            // its own timeout.
            if let Err(e) = write_task.await {
                warn!(session = %self.session_id, error = %e, "Writer task failed");
            }
        } else {
            write_task.abort();
        }
    }

    /// Build the reply for the request held in the read buffer.
    async fn respond(&mut self, len: usize) -> Option<ReadyFrame> {
        let request = &self.read_buf[..len];
        let text = String::from_utf8_lossy(request);
        info!(session = %self.session_id, request = %text.trim(), "Request received");

        match Request::classify(request) {
            Request::Session => {
                self.write_buf.clear();
                self.write_buf.put_slice(b"jSessionId: ");
                self.write_buf.put_slice(self.session_id.as_bytes());
                self.write_buf.put_slice(b"\r\n");
                Some(ReadyFrame::from_line(self.write_buf.split().freeze()))
            }
            Request::Fetch => {
                let payload = Arc::clone(&self.payload);
                let built =
                    tokio::task::spawn_blocking(move || build_response(&*payload, CHUNK_SIZE))
                        .await;
                match built {
                    Ok(Ok(frame)) => Some(frame),
                    Ok(Err(e)) => {
                        error!(
                            session = %self.session_id,
                            source = %self.payload.describe(),
                            error = %e,
                            "Failed to build response"
                        );
                        None
                    }
                    Err(e) => {
                        error!(session = %self.session_id, error = %e, "Response task failed");
                        None
                    }
                }
            }
        }
    }
}

/// Send queued responses in order, one write in flight at a time.
///
/// The first failed or timed-out write is reported through `failed` and
/// ends the loop.
async fn write_loop<W>(
    session_id: String,
    mut writer: W,
    mut rx: mpsc::Receiver<ReadyFrame>,
    timeout: Duration,
    failed: oneshot::Sender<BenchError>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let err = match tokio::time::timeout(timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(n)) => {
                debug!(session = %session_id, bytes = n, chunks = frame.chunk_count(), "Response sent");
                continue;
            }
            Ok(Err(e)) => BenchError::Io(e),
            Err(_) => BenchError::Timeout {
                op: "write",
                millis: timeout.as_millis(),
            },
        };
        let _ = failed.send(err);
        return;
    }
}
