//! Splits the guest's serial output into chunks.
//!
//! A chunk ends at a newline, at the first newline-less prompt, or when the
//! buffer is full, whichever comes first.
use crate::markers;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Default chunk buffer capacity in bytes.
pub const CHUNK_CAPACITY: usize = 512;

pub struct ChunkReader<R> {
    reader: BufReader<R>,
    capacity: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reader: BufReader::new(reader),
            capacity,
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Read the next chunk.
    ///
    /// Returns `Ok(None)` at end of stream. A partial chunk pending at end of
    /// stream is returned first.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        loop {
            let byte = match self.reader.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            self.buf.push(byte);
            if byte == b'\n'
                || markers::ends_with_prompt(&self.buf)
                || self.buf.len() >= self.capacity
            {
                break;
            }
        }

        if self.buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}
