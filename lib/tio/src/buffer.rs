use std::io;

// Read in chunks of at most this size so a fast peer cannot monopolise an
// ingress call.
const READ_CHUNK: usize = 4096;

/// A bounded FIFO byte queue. Data is appended at the tail and consumed
/// from the head; the storage is compacted opportunistically so the
/// content always forms one contiguous slice.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(size.min(READ_CHUNK * 2)),
            head: 0,
            size,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Discards `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head >= READ_CHUNK {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    /// Appends `bytes` at the tail. Returns false, leaving the buffer
    /// untouched, when the bytes do not fit.
    #[inline]
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_capacity() {
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Reads from `reader` until the buffer is full or the reader has no
    /// more data, returning the number of bytes taken in. `Ok(0)` means
    /// nothing was available; end-of-stream is reported as
    /// `ErrorKind::UnexpectedEof` (bytes read before it are retained).
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut total = 0;
        while self.len() < self.size {
            let want = (self.size - self.len()).min(READ_CHUNK);
            let start = self.data.len();
            self.data.resize(start + want, 0);
            match reader.read(&mut self.data[start..]) {
                Ok(0) => {
                    self.data.truncate(start);
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(count) => {
                    self.data.truncate(start + count);
                    total += count;
                }
                Err(err) => {
                    self.data.truncate(start);
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    if crate::link::is_wouldblock(&err) {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }
        Ok(total)
    }

    /// Writes the buffered data to `writer`, advancing the head past what
    /// was accepted. Stops without error when the writer would block.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while self.head < self.data.len() {
            match writer.write(&self.data[self.head..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    if crate::link::is_wouldblock(&err) {
                        return Ok(total);
                    }
                    return Err(err);
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
        eof: bool,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
                eof: false,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..1000).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(4096);

        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let mock_data = vec![7u8; 300];
        let mut channel = MockChannel::new(mock_data, 100, 0);

        let mut buffer = Buffer::new(128);
        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 128);
        assert_eq!(buffer.free_capacity(), 0);

        // a second ingress has no room and reads nothing
        assert_eq!(buffer.ingress(&mut channel).unwrap(), 0);
    }

    #[test]
    fn test_ingress_eof() {
        let mut channel = MockChannel::new(vec![1, 2, 3], 10, 0);
        channel.eof = true;

        let mut buffer = Buffer::new(4096);
        let err = buffer.ingress(&mut channel).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        // data read before the EOF is retained
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_nothing_available() {
        let mut channel = MockChannel::new(vec![], 10, 0);
        let mut buffer = Buffer::new(4096);
        assert_eq!(buffer.ingress(&mut channel).unwrap(), 0);
    }

    #[test]
    fn test_egress_partial_on_wouldblock() {
        let mut buffer = Buffer::new(4096);
        assert!(buffer.push(&[9u8; 100]));

        let mut channel = MockChannel::new(vec![], 32, 50);
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, 50);
        assert_eq!(buffer.len(), 50);
        assert_eq!(channel.data.len(), 50);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroWriter;
        impl io::Write for ZeroWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new(4096);
        assert!(buffer.push(&[1]));

        let err = buffer.egress(&mut ZeroWriter).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_push_capacity_refused() {
        let mut buffer = Buffer::new(8);
        assert!(buffer.push(&[0; 8]));
        assert!(!buffer.push(&[0]));
        assert_eq!(buffer.len(), 8);

        buffer.consume(4);
        assert!(buffer.push(&[1, 2, 3, 4]));
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_consume_compacts() {
        let mut buffer = Buffer::new(1 << 20);
        let payload: Vec<u8> = (0..READ_CHUNK * 2).map(|i| i as u8).collect();
        assert!(buffer.push(&payload));

        buffer.consume(READ_CHUNK + 1);
        assert_eq!(buffer.read_slice(), &payload[READ_CHUNK + 1..]);
        assert_eq!(buffer.head, 0);
    }
}
