//! Send and receive buffers of a stream socket.

use std::collections::VecDeque;
use std::io;

/// Result of a flush attempt.
#[derive(Debug)]
pub enum Flush {
    /// Every queued byte was written.
    Drained,

    /// The transport stopped accepting bytes; the remainder stays queued.
    Blocked,

    /// The transport failed. The queue is left as it was before the
    /// failing write.
    Failed(io::Error),
}

/// FIFO of pending outbound chunks.
///
/// Chunks are written in insertion order. A chunk is only removed once
/// all of its bytes were accepted; a partial write trims the front chunk
/// to its unwritten remainder.
#[derive(Debug, Default)]
pub struct SendQueue {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }

        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Total number of queued bytes.
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Number of queued chunks.
    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Drops every queued chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }

    /// Writes queued chunks through `write` until the queue is empty or
    /// the writer stops making progress.
    ///
    /// A fully written chunk is popped and the next one is tried right
    /// away. A partial write keeps the unwritten tail at the front and
    /// stops. `WouldBlock` and zero-length writes count as blocked and
    /// `Interrupted` is retried.
    pub fn flush_with<W>(&mut self, mut write: W) -> Flush
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        while let Some(front) = self.chunks.front_mut() {
            match write(front) {
                Ok(0) => return Flush::Blocked,
                Ok(n) if n >= front.len() => {
                    self.bytes -= front.len();
                    self.chunks.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                    self.bytes -= n;
                    return Flush::Blocked;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Blocked,
                Err(e) => return Flush::Failed(e),
            }
        }

        Flush::Drained
    }
}

/// Accumulated inbound bytes.
#[derive(Debug, Default)]
pub struct RecvQueue {
    buffer: Vec<u8>,
}

impl RecvQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Removes and returns everything buffered.
    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Removes the first `delim`-terminated segment and returns it
    /// without the delimiter.
    ///
    /// Returns `None`, leaving the buffer untouched, when no delimiter
    /// has arrived yet.
    pub fn next_line(&mut self, delim: u8) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == delim)?;

        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();

        Some(line)
    }
}
