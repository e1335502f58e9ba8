use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read};

/// A growable, contiguous byte store with separate read and write cursors.
///
/// Bytes are appended at the write cursor (the end of the buffer) and taken
/// from the read cursor (the front). Taking bytes out hands back a frozen
/// `Bytes` without copying, so a completed read can give its payload to a
/// delegate while the buffer keeps whatever was over-read.
///
/// # Use Cases
///
/// - The per-socket carry-over buffer that holds kernel bytes the current
///   read did not need
/// - The accumulation buffer of a single in-flight read operation
#[derive(Debug, Default)]
pub struct ByteBuffer {
    buf: BytesMut,
}

impl ByteBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Number of readable bytes between the read and write cursors.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The readable region.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Append bytes at the write cursor.
    #[inline]
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Hand up to `max` bytes of writable space to `fill` and commit however
    /// many it reports as written.
    ///
    /// Nothing is committed when `fill` fails.
    pub fn fill_with<F>(&mut self, max: usize, fill: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let start = self.buf.len();
        self.buf.resize(start + max, 0);
        match fill(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n.min(max));
                Ok(n.min(max))
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    /// Read at most `max` bytes from `reader` into the buffer.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        self.fill_with(max, |dst| reader.read(dst))
    }

    /// Take exactly `n` bytes from the read cursor.
    ///
    /// Returns `None` if fewer than `n` bytes are buffered.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if n > self.buf.len() {
            return None;
        }
        Some(self.buf.split_to(n).freeze())
    }

    /// Take everything that is buffered.
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Move up to `n` bytes from the front of `self` to the back of `dst`.
    ///
    /// Returns how many bytes moved.
    pub fn transfer_to(&mut self, dst: &mut ByteBuffer, n: usize) -> usize {
        let n = n.min(self.buf.len());
        dst.buf.extend_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }

    /// Drop `n` bytes from the read cursor.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.buf.len());
        self.buf.advance(n);
    }

    /// Split off everything after `at`, leaving `[0, at)` in place.
    pub fn split_off(&mut self, at: usize) -> ByteBuffer {
        ByteBuffer {
            buf: self.buf.split_off(at.min(self.buf.len())),
        }
    }

    /// Put `data` back in front of the read cursor.
    ///
    /// Used to return bytes an operation had consumed but could not deliver,
    /// so the next operation sees them first.
    pub fn prepend(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut joined = BytesMut::with_capacity(data.len() + self.buf.len());
        joined.extend_from_slice(data);
        joined.extend_from_slice(&self.buf);
        self.buf = joined;
    }

    /// Find `needle` in the readable region starting at offset `from`.
    ///
    /// Returns the absolute offset of the first match.
    #[must_use]
    pub fn find(&self, needle: &[u8], from: usize) -> Option<usize> {
        if from > self.buf.len() {
            return None;
        }
        find_subsequence(&self.buf[from..], needle).map(|pos| pos + from)
    }

    /// Release all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
        }
    }
}

/// Position of the first occurrence of `needle` in `haystack`.
#[must_use]
pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_and_carry_over() {
        let mut buf = ByteBuffer::from(&b"AB\r\nCD"[..]);
        let head = buf.take(4).unwrap();
        assert_eq!(&head[..], b"AB\r\n");
        assert_eq!(buf.as_slice(), b"CD");
        assert!(buf.take(3).is_none());
    }

    #[test]
    fn test_fill_with_commits_only_written() {
        let mut buf = ByteBuffer::new();
        let n = buf
            .fill_with(16, |dst| {
                dst[..3].copy_from_slice(b"xyz");
                Ok(3)
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf.as_slice(), b"xyz");

        let err = buf.fill_with(16, |_| Err(io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(err.is_err());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_prepend_and_split_off() {
        let mut buf = ByteBuffer::from(&b"world"[..]);
        buf.prepend(b"hello ");
        assert_eq!(buf.as_slice(), b"hello world");

        let tail = buf.split_off(5);
        assert_eq!(buf.as_slice(), b"hello");
        assert_eq!(tail.as_slice(), b" world");
    }

    #[test]
    fn test_find() {
        let buf = ByteBuffer::from(&b"a\r\nb\r\n"[..]);
        assert_eq!(buf.find(b"\r\n", 0), Some(1));
        assert_eq!(buf.find(b"\r\n", 2), Some(4));
        assert_eq!(buf.find(b"\r\n", 5), None);
        assert_eq!(find_subsequence(b"abc", b""), None);
    }

    #[test]
    fn test_transfer() {
        let mut src = ByteBuffer::from(&b"0123456789"[..]);
        let mut dst = ByteBuffer::new();
        assert_eq!(src.transfer_to(&mut dst, 4), 4);
        assert_eq!(src.transfer_to(&mut dst, 100), 6);
        assert_eq!(dst.as_slice(), b"0123456789");
        assert!(src.is_empty());
    }
}
