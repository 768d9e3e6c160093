//! Response framing over chained fixed-size buffers.
//!
//! A response is the whole payload split across `CHUNK_SIZE` buffers plus one
//! small trailing buffer holding the `\r\n` end-of-response delimiter. There
//! is no length header; the client recognises the end of a response by the
//! delimiter.
//!
//! ## Lifecycle
//!
//! ```ignore
//! let plan = FramePlan::new(payload.len(), CHUNK_SIZE);
//! let mut frame = ResponseFrame::allocate(plan);
//! frame.fill(payload.reader())?;      // vectored reads into the chunks
//! let ready = frame.flip();           // chunks become read-only `Bytes`
//! write_frame(&mut socket, &ready).await?;
//! ```

use crate::server::payload::PayloadSource;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, IoSlice, IoSliceMut, Read};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Size of each payload buffer.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Capacity of the trailing delimiter buffer.
pub const DELIMITER_CHUNK_SIZE: usize = 16;

/// End-of-response marker.
pub const DELIMITER: &[u8] = b"\r\n";

/// Buffer layout for a payload of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlan {
    payload_len: u64,
    chunk_size: usize,
}

impl FramePlan {
    pub fn new(payload_len: u64, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            payload_len,
            chunk_size,
        }
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Buffers needed to cover the payload: `ceil(len / chunk_size)`.
    ///
    /// An exact multiple of the chunk size needs no partial buffer.
    pub fn payload_chunks(&self) -> usize {
        self.payload_len.div_ceil(self.chunk_size as u64) as usize
    }

    /// Payload buffers plus the delimiter buffer.
    #[cfg(test)]
    pub fn total_chunks(&self) -> usize {
        self.payload_chunks() + 1
    }

    /// Capacity of payload buffer `idx`; only the last one may be short.
    fn chunk_len(&self, idx: usize) -> usize {
        let start = idx as u64 * self.chunk_size as u64;
        (self.payload_len - start).min(self.chunk_size as u64) as usize
    }
}

/// A response being filled from its payload source.
#[derive(Debug)]
pub struct ResponseFrame {
    chunks: Vec<BytesMut>,
    delimiter: BytesMut,
    /// Payload bytes written so far, across all chunks.
    filled: usize,
}

impl ResponseFrame {
    pub fn allocate(plan: FramePlan) -> Self {
        let chunks = (0..plan.payload_chunks())
            .map(|idx| BytesMut::zeroed(plan.chunk_len(idx)))
            .collect();

        Self {
            chunks,
            delimiter: BytesMut::with_capacity(DELIMITER_CHUNK_SIZE),
            filled: 0,
        }
    }

    #[cfg(test)]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len() + 1
    }

    /// Read the payload into the chunks with vectored reads, then append the
    /// delimiter.
    ///
    /// Stops when every chunk is full or the reader reports end of stream.
    /// Returns the number of payload bytes read.
    pub fn fill<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        loop {
            let n = {
                let mut slices = self.unfilled_slices();
                if slices.is_empty() {
                    break;
                }
                match reader.read_vectored(&mut slices) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };
            self.filled += n;
        }

        if self.delimiter.is_empty() {
            self.delimiter.put_slice(DELIMITER);
        }
        Ok(self.filled)
    }

    fn unfilled_slices(&mut self) -> Vec<IoSliceMut<'_>> {
        let mut skip = self.filled;
        self.chunks
            .iter_mut()
            .filter_map(|chunk| {
                if skip >= chunk.len() {
                    skip -= chunk.len();
                    None
                } else {
                    let slice = IoSliceMut::new(&mut chunk[skip..]);
                    skip = 0;
                    Some(slice)
                }
            })
            .collect()
    }

    /// Switch every chunk to read mode for transmission.
    ///
    /// Chunks past the filled length are trimmed, so a source that came up
    /// short never leaks zeroed padding onto the wire.
    pub fn flip(self) -> ReadyFrame {
        let mut remaining = self.filled;
        let mut chunks: Vec<Bytes> = self
            .chunks
            .into_iter()
            .map(|mut chunk| {
                let keep = remaining.min(chunk.len());
                chunk.truncate(keep);
                remaining -= keep;
                chunk.freeze()
            })
            .collect();
        chunks.push(self.delimiter.freeze());

        ReadyFrame::new(chunks)
    }
}

/// A response ready to be written with scatter/gather I/O.
#[derive(Debug, Clone)]
pub struct ReadyFrame {
    chunks: Vec<Bytes>,
    len: usize,
}

impl ReadyFrame {
    fn new(chunks: Vec<Bytes>) -> Self {
        let len = chunks.iter().map(Bytes::len).sum();
        Self { chunks, len }
    }

    /// A single-buffer frame, used for short line replies.
    pub fn from_line(line: Bytes) -> Self {
        Self::new(vec![line])
    }

    /// Total bytes across all chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[cfg(test)]
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// IoSlice views starting at byte `start_offset`, for resuming a partial
    /// write.
    pub fn io_slices(&self, start_offset: usize) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(self.chunks.len());
        let mut skip = start_offset;

        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            slices.push(IoSlice::new(&chunk[skip..]));
            skip = 0;
        }

        slices
    }

    #[cfg(test)]
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Write every byte of `frame`, resuming after partial vectored writes.
pub async fn write_frame<W>(writer: &mut W, frame: &ReadyFrame) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < frame.len() {
        let slices = frame.io_slices(written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        written += n;
    }
    writer.flush().await?;
    Ok(written)
}

/// Open `source` and frame its full contents.
pub fn build_response(source: &dyn PayloadSource, chunk_size: usize) -> io::Result<ReadyFrame> {
    let mut payload = source.open()?;
    let plan = FramePlan::new(payload.len(), chunk_size);
    let mut frame = ResponseFrame::allocate(plan);
    let filled = frame.fill(payload.reader())?;

    if (filled as u64) < plan.payload_len() {
        warn!(
            source = %source.describe(),
            expected = plan.payload_len(),
            read = filled,
            "Payload ended early"
        );
    }

    Ok(frame.flip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::payload::StaticPayload;
    use std::io::Cursor;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_plan_partial_chunk() {
        let plan = FramePlan::new(8192 * 2 + 100, CHUNK_SIZE);
        assert_eq!(plan.payload_chunks(), 3);
        assert_eq!(plan.total_chunks(), 4);
        assert_eq!(plan.chunk_len(0), 8192);
        assert_eq!(plan.chunk_len(2), 100);
    }

    #[test]
    fn test_plan_exact_multiple() {
        let plan = FramePlan::new(8192 * 2, CHUNK_SIZE);
        assert_eq!(plan.payload_chunks(), 2);
        assert_eq!(plan.total_chunks(), 3);
        assert_eq!(plan.chunk_len(1), 8192);
    }

    #[test]
    fn test_plan_empty_payload() {
        let plan = FramePlan::new(0, CHUNK_SIZE);
        assert_eq!(plan.payload_chunks(), 0);
        assert_eq!(plan.total_chunks(), 1);
    }

    #[test]
    fn test_fill_and_flip() {
        let data = payload(8192 * 2 + 100);
        let plan = FramePlan::new(data.len() as u64, CHUNK_SIZE);
        let mut frame = ResponseFrame::allocate(plan);
        assert_eq!(frame.chunk_count(), 4);

        let n = frame.fill(&mut Cursor::new(&data)).unwrap();
        assert_eq!(n, data.len());

        let ready = frame.flip();
        assert_eq!(ready.chunk_count(), 4);
        assert_eq!(ready.len(), data.len() + 2);
        assert_eq!(ready.chunks()[0].len(), 8192);
        assert_eq!(ready.chunks()[2].len(), 100);
        assert_eq!(&ready.chunks()[3][..], DELIMITER);

        let bytes = ready.assemble();
        assert_eq!(&bytes[..data.len()], &data[..]);
        assert!(bytes.ends_with(b"\r\n"));
    }

    /// Hands out at most `step` bytes per call to exercise repeated reads.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_fill_across_short_reads() {
        let data = payload(8192 + 3000);
        let mut frame = ResponseFrame::allocate(FramePlan::new(data.len() as u64, CHUNK_SIZE));
        let mut reader = Trickle {
            data: &data,
            step: 1000,
        };

        assert_eq!(frame.fill(&mut reader).unwrap(), data.len());
        let bytes = frame.flip().assemble();
        assert_eq!(&bytes[..data.len()], &data[..]);
        assert_eq!(&bytes[data.len()..], DELIMITER);
    }

    #[test]
    fn test_short_source_trimmed() {
        // Declared 10 KiB but only 5000 bytes available.
        let data = payload(5000);
        let mut frame = ResponseFrame::allocate(FramePlan::new(10 * 1024, CHUNK_SIZE));
        assert_eq!(frame.fill(&mut Cursor::new(&data)).unwrap(), 5000);

        let ready = frame.flip();
        assert_eq!(ready.len(), 5002);
        assert_eq!(ready.chunks()[1].len(), 0);
        assert!(ready.assemble().ends_with(DELIMITER));
    }

    #[test]
    fn test_fill_twice_single_delimiter() {
        let mut frame = ResponseFrame::allocate(FramePlan::new(3, CHUNK_SIZE));
        frame.fill(&mut Cursor::new(b"abc")).unwrap();
        frame.fill(&mut Cursor::new(b"")).unwrap();
        assert_eq!(frame.flip().assemble(), b"abc\r\n");
    }

    #[test]
    fn test_io_slices_offsets() {
        let ready = ReadyFrame::new(vec![
            Bytes::from_static(b"0123"),
            Bytes::new(),
            Bytes::from_static(b"4567"),
            Bytes::from_static(b"\r\n"),
        ]);
        assert_eq!(ready.len(), 10);

        let slices = ready.io_slices(0);
        assert_eq!(slices.len(), 3);

        let slices = ready.io_slices(6);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"67");
        assert_eq!(&*slices[1], b"\r\n");

        assert!(ready.io_slices(10).is_empty());
    }

    #[tokio::test]
    async fn test_write_frame() {
        let data = payload(8192 * 2 + 100);
        let ready = build_response(&StaticPayload::new(data.clone()), CHUNK_SIZE).unwrap();

        let mut out: Vec<u8> = Vec::new();
        let n = write_frame(&mut out, &ready).await.unwrap();
        assert_eq!(n, data.len() + 2);
        assert_eq!(&out[..data.len()], &data[..]);
        assert!(out.ends_with(b"\r\n"));
    }

    #[tokio::test]
    async fn test_write_frame_resumes_partial_writes() {
        // The mock accepts the response in uneven pieces.
        let ready = ReadyFrame::new(vec![
            Bytes::from_static(b"hello "),
            Bytes::from_static(b"world"),
            Bytes::from_static(b"\r\n"),
        ]);
        let mut mock = tokio_test::io::Builder::new()
            .write(b"hel")
            .write(b"lo ")
            .write(b"world\r\n")
            .build();

        assert_eq!(write_frame(&mut mock, &ready).await.unwrap(), 13);
    }

    #[test]
    fn test_build_response_empty_payload() {
        let ready = build_response(&StaticPayload::new(Vec::<u8>::new()), CHUNK_SIZE).unwrap();
        assert_eq!(ready.chunk_count(), 1);
        assert_eq!(ready.assemble(), b"\r\n");
    }
}
