//! Client transport and session handshake.
//!
//! A `Session` owns exactly one `Transport` for its whole lifetime. The
//! handshake exchanges a single line with the server:
//!
//! ```text
//! Request:  POST /session-<workerId>\r\n
//! Response: <anything> <sessionId>\r\n
//! ```

use crate::error::BenchError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const CRLF: &[u8] = b"\r\n";

/// Longest handshake line accepted from the server.
const MAX_LINE_LENGTH: usize = 1024;

/// A full-duplex byte stream that may or may not be open.
///
/// `close()` is idempotent: closing a transport that never connected, or
/// one that is already closed, is a no-op.
#[derive(Debug, Default)]
pub struct Transport {
    stream: Option<TcpStream>,
}

impl Transport {
    pub fn new() -> Self {
        Self { stream: None }
    }

    pub async fn connect(&mut self, hostname: &str, port: u16) -> Result<(), BenchError> {
        let addr = format!("{hostname}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| BenchError::Connection {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// The open stream, or `NotConnected` if there is none.
    pub fn stream(&mut self) -> std::io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "transport is not open")
        })
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        match stream.shutdown().await {
            Ok(()) => Ok(()),
            // The peer already went away; the socket is closed on drop.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// One logical client/server interaction.
#[derive(Debug)]
pub struct Session {
    worker_id: u64,
    session_id: Option<String>,
    hostname: String,
    port: u16,
    iteration_budget: u64,
    delay_ms: u64,
    transport: Transport,
}

impl Session {
    pub fn new(
        worker_id: u64,
        hostname: impl Into<String>,
        port: u16,
        iteration_budget: u64,
        delay_ms: u64,
    ) -> Self {
        Self {
            worker_id,
            session_id: None,
            hostname: hostname.into(),
            port,
            iteration_budget,
            delay_ms,
            transport: Transport::new(),
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn remaining(&self) -> u64 {
        self.iteration_budget
    }

    /// Consume one unit of the iteration budget.
    ///
    /// Returns `false` once the budget is exhausted.
    pub fn take_iteration(&mut self) -> bool {
        if self.iteration_budget == 0 {
            return false;
        }
        self.iteration_budget -= 1;
        true
    }

    pub fn transport(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub async fn connect(&mut self) -> Result<(), BenchError> {
        info!(
            worker = self.worker_id,
            host = %self.hostname,
            port = self.port,
            "Connecting to server"
        );
        self.transport.connect(&self.hostname, self.port).await?;
        debug!(worker = self.worker_id, "Connection to server established");
        Ok(())
    }

    /// Run the session-initiation exchange and store the assigned id.
    pub async fn handshake(&mut self) -> Result<&str, BenchError> {
        let worker_id = self.worker_id;
        let stream = self.transport.stream()?;
        let session_id = handshake(stream, worker_id).await?;
        info!(worker = worker_id, session = %session_id, "Communication initialized");
        Ok(self.session_id.insert(session_id).as_str())
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        self.transport.close().await
    }
}

/// Send the session request on `stream` and parse the reply.
pub async fn handshake<S>(stream: &mut S, worker_id: u64) -> Result<String, BenchError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("POST /session-{worker_id}\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let line = read_line(stream).await?;
    parse_session_id(&line)
}

/// Read one `\n`-terminated line without consuming anything after it.
async fn read_line<R>(reader: &mut R) -> Result<String, BenchError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if line.is_empty() {
                    return Err(BenchError::Protocol("no handshake response".to_string()));
                }
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_LENGTH {
            return Err(BenchError::Protocol(format!(
                "handshake response exceeds {MAX_LINE_LENGTH} bytes"
            )));
        }
        line.push(byte);
    }

    String::from_utf8(line)
        .map_err(|_| BenchError::Protocol("handshake response is not UTF-8".to_string()))
}

/// Extract the session id: the second whitespace-delimited token.
pub fn parse_session_id(line: &str) -> Result<String, BenchError> {
    line.split_whitespace()
        .nth(1)
        .map(str::to_string)
        .ok_or_else(|| {
            BenchError::Protocol(format!("malformed handshake response: {:?}", line.trim()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_parse_session_id() {
        assert_eq!(parse_session_id("200 abc123\r\n").unwrap(), "abc123");
        assert_eq!(parse_session_id("jSessionId:   XYZ extra").unwrap(), "XYZ");
    }

    #[test]
    fn test_parse_session_id_short() {
        assert!(matches!(
            parse_session_id("200\r\n"),
            Err(BenchError::Protocol(_))
        ));
        assert!(matches!(parse_session_id(""), Err(BenchError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_handshake_exchange() {
        let mut mock = Builder::new()
            .write(b"POST /session-7\r\n")
            .read(b"200 abc123\r\n")
            .build();

        let id = handshake(&mut mock, 7).await.unwrap();
        assert_eq!(id, "abc123");
    }

    #[tokio::test]
    async fn test_handshake_split_line() {
        let mut mock = Builder::new()
            .write(b"POST /session-1\r\n")
            .read(b"jSession")
            .read(b"Id: 00")
            .read(b"2A\r\n")
            .build();

        assert_eq!(handshake(&mut mock, 1).await.unwrap(), "002A");
    }

    #[tokio::test]
    async fn test_handshake_no_response() {
        let mut mock = Builder::new().write(b"POST /session-3\r\n").build();

        let err = handshake(&mut mock, 3).await.unwrap_err();
        assert!(matches!(err, BenchError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_handshake_single_token() {
        let mut mock = Builder::new()
            .write(b"POST /session-4\r\n")
            .read(b"OK\r\n")
            .build();

        let err = handshake(&mut mock, 4).await.unwrap_err();
        assert!(matches!(err, BenchError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_close_never_opened() {
        let mut transport = Transport::new();
        assert!(!transport.is_open());
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = Transport::new();
        transport.connect("127.0.0.1", port).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();
        assert!(transport.is_open());

        transport.close().await.unwrap();
        assert!(!transport.is_open());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then release it so nothing is listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session = Session::new(1, "127.0.0.1", port, 1, 1);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, BenchError::Connection { .. }));
        session.close().await.unwrap();
    }

    #[test]
    fn test_iteration_budget() {
        let mut session = Session::new(1, "localhost", 1, 2, 10);
        assert!(session.take_iteration());
        assert!(session.take_iteration());
        assert!(!session.take_iteration());
        assert_eq!(session.remaining(), 0);
    }
}
