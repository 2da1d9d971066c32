//! Fixed-capacity read buffer.
//!
//! Valid bytes always start at offset 0. Reads append into the free tail with
//! [`ReadBuffer::fill_from`]; processed bytes are dropped from the front with
//! [`ReadBuffer::consume`], which shifts the remainder down.

use bytes::{Buf, BytesMut};
use std::io::{self, Read};

/// Default read buffer capacity (4 KB)
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

pub struct ReadBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl ReadBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Reads once from `reader` into the free tail, returning the number of
    /// bytes appended. A full buffer reads nothing and returns `Ok(0)`
    /// without touching the reader.
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let len = self.buf.len();
        let free = self.capacity - len;
        if free == 0 {
            return Ok(0);
        }

        self.buf.resize(len + free, 0);
        let result = reader.read(&mut self.buf[len..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.buf.truncate(len + n.min(free));
        result
    }

    /// Drops `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("len", &self.buf.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fill_and_consume() {
        let mut buffer = ReadBuffer::new(8);
        let mut source = Cursor::new(b"hello world".to_vec());

        assert_eq!(buffer.fill_from(&mut source).unwrap(), 8);
        assert_eq!(buffer.as_slice(), b"hello wo");
        assert!(buffer.is_full());

        buffer.consume(6);
        assert_eq!(buffer.as_slice(), b"wo");
        assert_eq!(buffer.remaining_capacity(), 6);

        assert_eq!(buffer.fill_from(&mut source).unwrap(), 3);
        assert_eq!(buffer.as_slice(), b"world");
    }

    #[test]
    fn test_full_buffer_reads_nothing() {
        let mut buffer = ReadBuffer::new(2);
        let mut source = Cursor::new(b"abc".to_vec());

        buffer.fill_from(&mut source).unwrap();
        assert_eq!(buffer.fill_from(&mut source).unwrap(), 0);
        assert_eq!(source.position(), 2);
    }

    #[test]
    fn test_read_error_leaves_contents() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
        }

        let mut buffer = ReadBuffer::new(8);
        buffer.fill_from(&mut Cursor::new(b"ab".to_vec())).unwrap();

        let err = buffer.fill_from(&mut Failing).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.as_slice(), b"ab");
    }

    #[test]
    fn test_consume_everything() {
        let mut buffer = ReadBuffer::new(4);
        buffer.fill_from(&mut Cursor::new(b"abcd".to_vec())).unwrap();
        buffer.consume(10);
        assert!(buffer.is_empty());
        assert_eq!(buffer.remaining_capacity(), 4);
    }
}
