//! Line codec for child process output

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest line kept in one piece; longer runs are emitted in chunks
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits a byte stream into text lines.
///
/// Lines end at `\n`, `\r\n` or a bare `\r`, which is how rsync redraws its
/// progress display. Bytes that are not valid UTF-8 are replaced with
/// U+FFFD, and each line is trimmed of surrounding whitespace.
pub struct LineCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum line length before a forced split
    max_line_length: usize,
    /// The previous line ended in `\r`; a leading `\n` belongs to it
    skip_lf: bool,
    /// The reader reported end of stream
    eof: bool,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Create a new line codec with default settings
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_LENGTH)
    }

    /// Create a new line codec with a custom maximum line length
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_line_length: max_line_length.max(1),
            skip_lf: false,
            eof: false,
        }
    }

    /// Append raw bytes to the buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Read the next line from an async reader.
    ///
    /// Returns `Ok(None)` once the reader is exhausted and every buffered
    /// byte has been emitted.
    pub async fn read_line<R>(&mut self, reader: &mut R) -> std::io::Result<Option<String>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(line) = self.try_decode_line() {
                return Ok(Some(line));
            }

            if self.eof {
                return Ok(self.take_remainder());
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;
            if n == 0 {
                self.eof = true;
                continue;
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode one complete line from the internal buffer
    pub fn try_decode_line(&mut self) -> Option<String> {
        if self.skip_lf && !self.read_buf.is_empty() {
            if self.read_buf[0] == b'\n' {
                self.read_buf.advance(1);
            }
            self.skip_lf = false;
        }

        if let Some(pos) = self.read_buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line = self.read_buf.split_to(pos);
            let terminator = self.read_buf[0];
            self.read_buf.advance(1);
            self.skip_lf = terminator == b'\r';
            return Some(decode(&line));
        }

        if self.read_buf.len() >= self.max_line_length {
            let line = self.read_buf.split_to(self.max_line_length);
            return Some(decode(&line));
        }

        None
    }

    /// Emit whatever is left after end of stream as a final line
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.read_buf.is_empty() {
            return None;
        }
        let line = self.read_buf.split();
        Some(decode(&line))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
