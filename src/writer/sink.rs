//! Output sinks and the chunked text buffer.

use std::io::{self, Write};

/// Where a writer's output goes. `end` is called exactly once per response.
pub trait OutputSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.write_bytes(text.as_bytes())
    }

    fn end(&mut self) -> io::Result<()>;
}

impl OutputSink for Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn end(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Adapts any [`Write`]; `end` flushes it.
pub struct WriteSink<W: Write> {
    inner: W,
    ended: bool,
}

impl<W: Write> WriteSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, ended: false }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> OutputSink for WriteSink<W> {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.ended {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink already ended"));
        }
        self.inner.write_all(bytes)
    }

    fn end(&mut self) -> io::Result<()> {
        self.ended = true;
        self.inner.flush()
    }
}

// ============================================================================
// Chunked text buffer
// ============================================================================

/// Default chunk size for [`BufferedText`].
pub const DEFAULT_CHUNK_CAPACITY: usize = 512 * 1024;

/// Append-only text buffer built from fixed-size chunks, so very large
/// documents reach the sink in a few big writes instead of one per token.
#[derive(Debug)]
pub struct BufferedText {
    chunk_capacity: usize,
    current: String,
    chunks: Vec<String>,
}

impl BufferedText {
    pub fn new(chunk_capacity: usize) -> Self {
        let chunk_capacity = chunk_capacity.max(1);
        Self {
            chunk_capacity,
            current: String::with_capacity(chunk_capacity),
            chunks: Vec::new(),
        }
    }

    pub fn write(&mut self, text: &str) {
        let mut rest = text;
        while !rest.is_empty() {
            let room = self.chunk_capacity - self.current.len();
            if rest.len() <= room {
                self.current.push_str(rest);
                rest = "";
            } else {
                let split = floor_char_boundary(rest, room);
                if split > 0 {
                    self.current.push_str(&rest[..split]);
                    rest = &rest[split..];
                } else if self.current.is_empty() {
                    // A single character wider than the chunk: take it whole.
                    let first = rest.chars().next().map_or(rest.len(), char::len_utf8);
                    self.current.push_str(&rest[..first]);
                    rest = &rest[first..];
                } else {
                    // Next character does not fit in what is left.
                    self.flush_chunk();
                    continue;
                }
            }
            if self.current.len() >= self.chunk_capacity {
                self.flush_chunk();
            }
        }
    }

    /// Write `text` right-aligned in a field of `width` characters.
    pub fn write_padded_left(&mut self, text: &str, width: usize) {
        let pad = width.saturating_sub(text.chars().count());
        self.write_spaces(pad);
        self.write(text);
    }

    /// Write `text` left-aligned in a field of `width` characters.
    pub fn write_padded_right(&mut self, text: &str, width: usize) {
        let pad = width.saturating_sub(text.chars().count());
        self.write(text);
        self.write_spaces(pad);
    }

    fn write_spaces(&mut self, count: usize) {
        const SPACES: &str = "                                ";
        let mut left = count;
        while left > 0 {
            let n = left.min(SPACES.len());
            self.write(&SPACES[..n]);
            left -= n;
        }
    }

    /// Move any partial chunk into the accumulated list.
    pub fn finalize(&mut self) {
        if !self.current.is_empty() {
            self.flush_chunk();
        }
    }

    /// Finalize, then stream every chunk to the sink in order.
    pub fn write_to(&mut self, sink: &mut dyn OutputSink) -> io::Result<()> {
        self.finalize();
        for chunk in &self.chunks {
            sink.write_str(chunk)?;
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(String::len).sum::<usize>() + self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush_chunk(&mut self) {
        let full = std::mem::replace(&mut self.current, String::with_capacity(self.chunk_capacity));
        self.chunks.push(full);
    }
}

impl Default for BufferedText {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_CAPACITY)
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
