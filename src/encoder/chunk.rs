use std::io::{self, Write};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// Accumulates encoder output and cuts it into chunks
pub struct ChunkBuffer {
    buffer: BytesMut,
    timeslice: Duration,
    last_cut: Instant,
}

impl ChunkBuffer {
    pub fn new(timeslice: Duration) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            timeslice,
            last_cut: Instant::now(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffered data is older than one timeslice
    pub fn is_due(&self) -> bool {
        !self.buffer.is_empty() && self.last_cut.elapsed() >= self.timeslice
    }

    /// Cut everything buffered so far. Never yields an empty chunk.
    pub fn take(&mut self) -> Option<Bytes> {
        self.last_cut = Instant::now();
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.buffer.split().freeze())
    }
}

/// Blocking `Write` sink handing timeslice chunks to the recording session.
///
/// Must be driven from a blocking thread, never from inside the runtime.
pub struct ChunkWriter {
    buffer: ChunkBuffer,
    tx: mpsc::Sender<Bytes>,
}

impl ChunkWriter {
    pub fn new(tx: mpsc::Sender<Bytes>, timeslice: Duration) -> Self {
        Self {
            buffer: ChunkBuffer::new(timeslice),
            tx,
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        if let Some(chunk) = self.buffer.take() {
            self.tx.blocking_send(chunk).map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "recording session dropped")
            })?;
        }
        Ok(())
    }

    /// Emit whatever is left and close the channel
    pub fn finish(mut self) -> io::Result<()> {
        self.emit()
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.push(buf);
        if self.buffer.is_due() {
            self.emit()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
