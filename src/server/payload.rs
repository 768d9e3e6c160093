//! Payload sources streamed back as responses.
//!
//! A source is re-opened for every response, so edits to a payload file are
//! picked up by the next request.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// An opened payload: its declared length and a reader over its bytes.
pub struct OpenPayload {
    len: u64,
    reader: Box<dyn Read + Send>,
}

impl OpenPayload {
    pub fn new(len: u64, reader: impl Read + Send + 'static) -> Self {
        Self {
            len,
            reader: Box::new(reader),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn reader(&mut self) -> &mut (dyn Read + Send + 'static) {
        &mut *self.reader
    }
}

/// Something that can be opened as a finite byte source of known length.
pub trait PayloadSource: Send + Sync {
    fn open(&self) -> io::Result<OpenPayload>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// Payload read from a file on disk.
#[derive(Debug, Clone)]
pub struct FilePayload {
    path: PathBuf,
}

impl FilePayload {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PayloadSource for FilePayload {
    fn open(&self) -> io::Result<OpenPayload> {
        let file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        Ok(OpenPayload::new(len, file))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Payload held in memory.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct StaticPayload {
    data: bytes::Bytes,
}

#[cfg(test)]
impl StaticPayload {
    pub fn new(data: impl Into<bytes::Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[cfg(test)]
impl PayloadSource for StaticPayload {
    fn open(&self) -> io::Result<OpenPayload> {
        Ok(OpenPayload::new(
            self.data.len() as u64,
            io::Cursor::new(self.data.clone()),
        ))
    }

    fn describe(&self) -> String {
        format!("<{} bytes in memory>", self.data.len())
    }
}
