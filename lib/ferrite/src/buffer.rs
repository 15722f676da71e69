use crate::error::{ErrorKind, ProtoError, ProtoResult};

/// Fixed-capacity contiguous byte FIFO. Bus bytes are appended at the tail
/// as they arrive; the frame parser reads from the head and consumes
/// complete frames. Storage compacts lazily so the readable region is
/// always a single slice.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    capacity: usize,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Discards `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        if count > self.len() {
            panic!("Consumed {} bytes out of {} available", count, self.len());
        }

        self.head += count;

        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        }
    }

    /// Appends bytes at the tail, compacting first when the dead prefix is
    /// in the way. Fails with `Overrun` when the bytes cannot fit.
    pub fn push(&mut self, bytes: &[u8]) -> ProtoResult<()> {
        if bytes.len() > self.free_capacity() {
            return Err(ProtoError::Fatal(ErrorKind::Overrun));
        }

        if self.data.len() + bytes.len() > self.capacity {
            self.compact();
        }

        self.data.extend_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    fn compact(&mut self) {
        self.data.copy_within(self.head.., 0);
        self.data.truncate(self.len());
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_read_consume_roundtrip() {
        let mut buffer = Buffer::new(16);

        buffer.push(&[1, 2, 3, 4]).unwrap();

        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.read_slice(), &[1, 2, 3, 4]);

        buffer.consume(2);

        assert_eq!(buffer.read_slice(), &[3, 4]);
        assert_eq!(buffer.free_capacity(), 14);

        buffer.consume(2);

        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 16);
    }

    #[test]
    fn test_push_compacts_around_dead_prefix() {
        let mut buffer = Buffer::new(8);

        buffer.push(&[1, 2, 3, 4, 5, 6]).unwrap();
        buffer.consume(4);

        // Fits only once the consumed prefix is reclaimed
        buffer.push(&[7, 8, 9, 10, 11]).unwrap();

        assert_eq!(buffer.read_slice(), &[5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_push_overrun() {
        let mut buffer = Buffer::new(4);

        buffer.push(&[1, 2, 3]).unwrap();

        let result = buffer.push(&[4, 5]);

        assert_eq!(result, Err(ProtoError::Fatal(ErrorKind::Overrun)));
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "Consumed 4 bytes out of 2 available")]
    fn test_consume_past_end_panics() {
        let mut buffer = Buffer::new(8);

        buffer.push(&[1, 2]).unwrap();
        buffer.consume(4);
    }
}
