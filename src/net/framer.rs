use crate::net::buffer::Buffer;
use crate::net::codec::{self, Frame, FrameHeader, HEADER_SIZE};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};

/// Incremental frame extractor. Bytes from the transport accumulate in the
/// internal buffer; once a full header and payload are present, a frame is
/// consumed and emitted. Header violations and oversized frames are fatal to
/// the connection.
pub struct Framer {
    buffer: Buffer,
    header: Option<FrameHeader>,
    max_size: usize,
}

impl Framer {
    #[inline]
    pub fn new(initial: usize, max_size: usize) -> Framer {
        let cap = max_size + HEADER_SIZE;

        Framer {
            buffer: Buffer::new(initial.min(cap), cap),
            header: None,
            max_size,
        }
    }

    /// Buffer the transport reads into.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Append raw bytes. The caller must not exceed the buffer cap; the
    /// transport path reads directly into `buffer_mut` and is bounded by it.
    pub fn feed(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.buffer.free_capacity());

        let slice = self.buffer.write_slice(bytes.len());
        slice[..bytes.len()].copy_from_slice(bytes);
        self.buffer.move_tail(bytes.len());
    }

    /// Extract the next complete frame, if any. `Ok(None)` means more bytes
    /// are needed.
    pub fn next(&mut self) -> NetworkResult<Option<Frame>> {
        if self.header.is_none() {
            if self.buffer.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header = codec::decode_header(self.buffer.read_slice())?;

            if header.length as usize > self.max_size {
                return Err(NetworkError::Fatal(ErrorType::FrameTooLarge(header.length as usize)));
            }

            self.buffer.move_head(HEADER_SIZE);
            self.header = Some(header);
        }

        let length = self.header.as_ref().map(|h| h.length as usize).unwrap_or(0);

        if self.buffer.len() < length {
            return Ok(None);
        }

        let header = self.header.take().expect("Framer header must be present");
        let frame = codec::decode_payload(&header, &self.buffer.read_slice()[..length], self.max_size)?;
        self.buffer.move_head(length);

        Ok(Some(frame))
    }

    /// Bytes currently buffered but not yet emitted.
    #[allow(dead_code)]
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len() + if self.header.is_some() { HEADER_SIZE } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::{encode, FrameKind};
    use crate::payload::map;
    use rmpv::Value;

    fn frame_with_payload(text: &str) -> Frame {
        let value = map(vec![("type", Value::String(text.into()))]);
        Frame::new(FrameKind::Message, 3, &value).unwrap()
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let frame = frame_with_payload("chat");
        let wire = encode(&frame, false).unwrap();

        let mut framer = Framer::new(1024, 4096);
        framer.feed(&wire);

        assert_eq!(framer.next().unwrap(), Some(frame));
        assert_eq!(framer.next().unwrap(), None);
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = frame_with_payload("drip");
        let wire = encode(&frame, false).unwrap();

        let mut framer = Framer::new(1024, 4096);

        for byte in &wire[..wire.len() - 1] {
            framer.feed(std::slice::from_ref(byte));
            assert_eq!(framer.next().unwrap(), None);
        }

        framer.feed(&wire[wire.len() - 1..]);
        assert_eq!(framer.next().unwrap(), Some(frame));
    }

    #[test]
    fn test_multiple_frames_in_one_feed() {
        let first = frame_with_payload("one");
        let second = frame_with_payload("two");
        let third = Frame::control(FrameKind::Ping, 9);

        let mut wire = encode(&first, false).unwrap();
        wire.extend(encode(&second, false).unwrap());
        wire.extend(encode(&third, false).unwrap());

        let mut framer = Framer::new(1024, 4096);
        framer.feed(&wire);

        assert_eq!(framer.next().unwrap(), Some(first));
        assert_eq!(framer.next().unwrap(), Some(second));
        assert_eq!(framer.next().unwrap(), Some(third));
        assert_eq!(framer.next().unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = frame_with_payload("big");
        let wire = encode(&frame, false).unwrap();

        // Cap below the actual payload size; the header alone is enough to
        // trip the guard.
        let mut framer = Framer::new(1024, 8);
        framer.feed(&wire[..HEADER_SIZE]);

        match framer.next().unwrap_err() {
            NetworkError::Fatal(ErrorType::FrameTooLarge(_)) => (),
            err => panic!("Unexpected error {:?}", err),
        }
    }

    #[test]
    fn test_frame_at_exact_cap_accepted() {
        let mut frame = Frame::control(FrameKind::Message, 1);
        frame.payload = vec![7u8; 64];

        let wire = encode(&frame, false).unwrap();

        let mut framer = Framer::new(1024, 64);
        framer.feed(&wire);

        assert_eq!(framer.next().unwrap(), Some(frame));
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let frame = frame_with_payload("bad");
        let mut wire = encode(&frame, false).unwrap();
        wire[1] = 0;

        let mut framer = Framer::new(1024, 4096);
        framer.feed(&wire);

        assert_eq!(framer.next().unwrap_err(), NetworkError::Fatal(ErrorType::BadMagic));
    }

    #[test]
    fn test_header_consumed_once() {
        let frame = frame_with_payload("split");
        let wire = encode(&frame, false).unwrap();

        let mut framer = Framer::new(1024, 4096);

        // Header plus half the payload.
        let cut = HEADER_SIZE + (wire.len() - HEADER_SIZE) / 2;
        framer.feed(&wire[..cut]);
        assert_eq!(framer.next().unwrap(), None);
        assert_eq!(framer.next().unwrap(), None);

        framer.feed(&wire[cut..]);
        assert_eq!(framer.next().unwrap(), Some(frame));
    }
}
