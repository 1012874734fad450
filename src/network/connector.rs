use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::{AppError, AppResult};

/// Per-peer I/O counters.
///
/// `reads_in_flight` is raised while a read operation is pending and
/// `max_reads_in_flight` remembers its peak, which must stay at 1.
#[derive(Debug, Default)]
pub struct IoStats {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub frames_read: AtomicU64,
    pub frames_written: AtomicU64,
    pub reads_issued: AtomicU64,
    pub reads_in_flight: AtomicUsize,
    pub max_reads_in_flight: AtomicUsize,
}

impl IoStats {
    fn begin_read(self: &Arc<Self>) -> ReadOp {
        self.reads_issued.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.reads_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_reads_in_flight
            .fetch_max(in_flight, Ordering::AcqRel);
        ReadOp {
            stats: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            reads_issued: self.reads_issued.load(Ordering::Relaxed),
            max_reads_in_flight: self.max_reads_in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub frames_read: u64,
    pub frames_written: u64,
    pub reads_issued: u64,
    pub max_reads_in_flight: usize,
}

// released when the read completes or its future is dropped
struct ReadOp {
    stats: Arc<IoStats>,
}

impl Drop for ReadOp {
    fn drop(&mut self) {
        self.stats.reads_in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn connection_reset() -> AppError {
    io::Error::new(ErrorKind::UnexpectedEof, "connection reset by peer").into()
}

/// Read side of a peer's socket.
///
/// Bytes are accumulated in an owned buffer until the requested amount
/// (or delimiter) is available, so callers never see short reads. Each
/// operation takes `&mut self`, one read is pending at a time.
#[derive(Debug)]
pub struct Connector<R> {
    reader: R,
    buffer: BytesMut,
    stats: Arc<IoStats>,
}

impl<R: AsyncRead + Unpin> Connector<R> {
    pub fn new(reader: R, read_buffer_size: usize, stats: Arc<IoStats>) -> Connector<R> {
        Connector {
            reader,
            buffer: BytesMut::with_capacity(read_buffer_size),
            stats,
        }
    }

    /// Reads until the buffer holds at least `len` bytes.
    ///
    /// Returns `Ok(false)` when the remote closed cleanly with nothing
    /// buffered and `at_boundary` is set; a close in any other position is
    /// an error.
    async fn fill(&mut self, len: usize, at_boundary: bool) -> AppResult<bool> {
        while self.buffer.len() < len {
            self.buffer.reserve(len - self.buffer.len());
            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return if at_boundary && self.buffer.is_empty() {
                    Ok(false)
                } else {
                    Err(connection_reset())
                };
            }
            self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok(true)
    }

    /// Reads exactly `head_size` bytes. `None` means the remote closed
    /// between frames.
    pub async fn read_head(&mut self, head_size: usize) -> AppResult<Option<BytesMut>> {
        let _op = self.stats.begin_read();
        if !self.fill(head_size, true).await? {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(head_size)))
    }

    /// Appends exactly `body_size` bytes to `frame`, which already holds the head.
    pub async fn read_data(&mut self, mut frame: BytesMut, body_size: usize) -> AppResult<BytesMut> {
        let _op = self.stats.begin_read();
        self.fill(body_size, false).await?;
        frame.reserve(body_size);
        frame.extend_from_slice(&self.buffer.split_to(body_size));
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Ok(frame)
    }

    /// Reads up to and including `delimiter`, failing once `max_size`
    /// bytes were buffered without it. Bytes after the delimiter stay
    /// buffered for the next read.
    pub async fn read_until(
        &mut self,
        delimiter: &[u8],
        max_size: usize,
    ) -> AppResult<Option<BytesMut>> {
        let _op = self.stats.begin_read();
        if delimiter.is_empty() {
            return Err(AppError::InvalidValue("empty read delimiter".to_string()));
        }
        let mut searched = 0;
        loop {
            if let Some(pos) = self.buffer[searched..]
                .windows(delimiter.len())
                .position(|window| window == delimiter)
            {
                let end = searched + pos + delimiter.len();
                if end > max_size {
                    break;
                }
                return Ok(Some(self.buffer.split_to(end)));
            }
            if self.buffer.len() >= max_size {
                break;
            }
            // the delimiter may straddle the next chunk
            searched = self.buffer.len().saturating_sub(delimiter.len() - 1);
            if !self.fill(self.buffer.len() + 1, true).await? {
                return Ok(None);
            }
        }
        Err(AppError::MessageTooLarge(format!(
            "no delimiter within {} bytes",
            max_size
        )))
    }

    /// Bytes already received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Write side of a peer's socket. Every write is flushed before it
/// reports completion.
#[derive(Debug)]
pub struct ConnectorWriter<W: AsyncWrite> {
    writer: BufWriter<W>,
    stats: Arc<IoStats>,
}

impl<W: AsyncWrite + Unpin> ConnectorWriter<W> {
    pub fn new(writer: W, stats: Arc<IoStats>) -> ConnectorWriter<W> {
        ConnectorWriter {
            writer: BufWriter::new(writer),
            stats,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| AppError::DetailedIoError(format!("write error: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| AppError::DetailedIoError(format!("flush error: {}", e)))?;
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(data.len())
    }

    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
