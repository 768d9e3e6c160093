//! Error types shared by the client and server halves.

use std::path::PathBuf;
use thiserror::Error;

/// Failures that end a single worker or connection.
///
/// None of these cross a worker/connection boundary: the owner logs the
/// error, closes its transport and stops, while siblings keep running.
#[derive(Debug, Error)]
pub enum BenchError {
    /// The transport could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The session handshake response was missing, malformed or short.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A read or write failed mid-session.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write did not complete within its bound.
    #[error("{op} timed out after {millis}ms")]
    Timeout { op: &'static str, millis: u128 },
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BenchError::Protocol("short handshake response".to_string());
        assert_eq!(err.to_string(), "protocol error: short handshake response");

        let err = BenchError::Timeout {
            op: "read",
            millis: 250,
        };
        assert_eq!(err.to_string(), "read timed out after 250ms");

        let err = ConfigError::Invalid("delay must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: delay must be at least 1"
        );
    }

    #[test]
    fn test_config_file_error_messages() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = ConfigError::FileRead(PathBuf::from("bench.toml"), io);
        assert_eq!(
            err.to_string(),
            "Failed to read config file 'bench.toml': no such file"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: BenchError = io.into();
        assert!(matches!(err, BenchError::Io(_)));
    }
}
