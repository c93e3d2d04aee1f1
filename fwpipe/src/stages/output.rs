//! Bounded capture of interleaved stdout/stderr.

/// Marker prepended to output whose head was discarded.
pub const TRUNCATION_MARKER: &str = "[... output truncated ...]\n";

/// Keeps the most recent `limit` bytes of a stage's output.
///
/// The tail is kept because build and test failures report at the end.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    buf: String,
    limit: usize,
    dropped: usize,
}

impl OutputBuffer {
    /// Creates a buffer retaining at most `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    /// Appends a chunk of output.
    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        // Compact lazily so long outputs do not shift the buffer on every line.
        if self.buf.len() > self.limit.saturating_mul(2) {
            self.compact();
        }
    }

    /// Appends raw bytes, replacing invalid UTF-8.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push(&String::from_utf8_lossy(bytes));
    }

    /// Number of bytes discarded so far.
    #[must_use]
    pub fn dropped_bytes(&self) -> usize {
        self.dropped + self.buf.len().saturating_sub(self.limit)
    }

    /// Returns true if any output was discarded.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.dropped_bytes() > 0
    }

    /// Consumes the buffer, returning the retained tail.
    #[must_use]
    pub fn into_string(mut self) -> String {
        self.compact();
        if self.dropped > 0 {
            let mut out = String::with_capacity(TRUNCATION_MARKER.len() + self.buf.len());
            out.push_str(TRUNCATION_MARKER);
            out.push_str(&self.buf);
            out
        } else {
            self.buf
        }
    }

    fn compact(&mut self) {
        if self.buf.len() <= self.limit {
            return;
        }
        let mut cut = self.buf.len() - self.limit;
        while !self.buf.is_char_boundary(cut) {
            cut += 1;
        }
        self.buf.drain(..cut);
        self.dropped += cut;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_output_untouched() {
        let mut buffer = OutputBuffer::new(64);
        buffer.push("hello\n");
        buffer.push("world\n");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.into_string(), "hello\nworld\n");
    }

    #[test]
    fn test_keeps_tail() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push("0123456789");
        buffer.push("abcdef");

        assert!(buffer.is_truncated());
        assert_eq!(buffer.dropped_bytes(), 8);
        assert_eq!(buffer.into_string(), format!("{TRUNCATION_MARKER}89abcdef"));
    }

    #[test]
    fn test_respects_char_boundaries() {
        let mut buffer = OutputBuffer::new(3);
        buffer.push("aé€");
        let out = buffer.into_string();
        assert!(out.starts_with(TRUNCATION_MARKER));
        assert!(out.ends_with('€'));
    }

    #[test]
    fn test_push_bytes_lossy() {
        let mut buffer = OutputBuffer::new(16);
        buffer.push_bytes(&[b'o', b'k', 0xff, b'\n']);
        assert_eq!(buffer.into_string(), "ok\u{fffd}\n");
    }
}
