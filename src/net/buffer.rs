use std::io;

// Sizing increment for buffer growth and the transfer chunk used by ingress.
const CHUNK_SIZE: usize = 65536;

/// A growable FIFO byte buffer. Data is appended at the tail and consumed from
/// the head; the backing storage is compacted opportunistically so the
/// writable region stays contiguous. Growth is capped at `max` bytes of live
/// data, which callers size to hold one maximal frame plus its header.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    max: usize,
}

impl Buffer {
    #[inline]
    pub fn new(initial: usize, max: usize) -> Buffer {
        if initial == 0 || initial > max {
            panic!("Buffer initial size must be in 1..={}, got {}", max, initial);
        }

        Buffer {
            data: vec![0; initial],
            head: 0,
            tail: 0,
            max,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining capacity before the buffer hits its hard cap.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.max - self.len()
    }

    /// Advance the head, consuming data.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        debug_assert!(self.head + count <= self.tail);
        self.head += count;

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Advance the tail, committing previously written bytes.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        debug_assert!(self.tail + count <= self.data.len());
        self.tail += count;
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Ensures at least `count` contiguous writable bytes at the tail (up to
    /// the hard cap) and returns the writable slice.
    #[inline]
    pub fn write_slice(&mut self, count: usize) -> &mut [u8] {
        self.ensure_space(count);
        &mut self.data[self.tail..]
    }

    fn ensure_space(&mut self, count: usize) {
        let wanted = count.min(self.free_capacity());

        if self.data.len() - self.tail >= wanted {
            return;
        }

        // Reclaim the consumed prefix before considering reallocation.
        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }

        if self.data.len() - self.tail < wanted {
            let target = (self.tail + wanted).max(self.data.len() * 2).min(self.max);
            self.data.resize(target, 0);
        }
    }

    /// Write the contents of the buffer to the supplied writer, advancing the
    /// head. Stops at `WouldBlock` and reports the bytes moved so far; a zero
    /// write is an error.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.len();

        while !self.is_empty() {
            match writer.write(&self.data[self.head..self.tail]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => self.move_head(count),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(orig_len - self.len())
    }

    /// Read data from the supplied reader into the buffer, advancing the
    /// tail. Stops at `WouldBlock` or when the hard cap is reached and
    /// reports the bytes moved; a zero read means the peer closed the stream
    /// and surfaces as `UnexpectedEof`.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total = 0;

        while self.free_capacity() > 0 {
            let slice = self.write_slice(CHUNK_SIZE);

            match reader.read(slice) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => {
                    self.move_tail(count);
                    total += count;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Mutable slice containing data.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.head..self.tail]
    }
}
