use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::payload;
use crate::time::timestamp_millis;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rmpv::Value;
use std::io::{Cursor, Read, Write};

/// Leading bytes of every frame on the wire.
pub const MAGIC: [u8; 4] = *b"CNDT";
/// Protocol version emitted and accepted.
pub const PROTOCOL_VERSION: u8 = 1;
/// Fixed header size preceding the payload.
pub const HEADER_SIZE: usize = 32;
/// Hard cap on a single frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Payloads at or below this size are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 100;

pub const FLAG_COMPRESSED: u16 = 0x0001;
pub const FLAG_ENCRYPTED: u16 = 0x0002;
// Priority/ack hints; tolerated on receive, never interpreted.
pub const FLAG_HINT_MASK: u16 = 0x001C;

const FLAG_KNOWN_MASK: u16 = FLAG_COMPRESSED | FLAG_ENCRYPTED | FLAG_HINT_MASK;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FrameKind {
    Message = 0x01,
    RpcRequest = 0x02,
    RpcResponse = 0x03,
    RpcError = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Pause = 0x07,
    Resume = 0x08,
    AuthRequest = 0x10,
    AuthSuccess = 0x11,
    AuthFailure = 0x12,
    Disconnect = 0x20,
    Error = 0xFF,
}

impl FrameKind {
    pub fn from_u8(tag: u8) -> NetworkResult<FrameKind> {
        Ok(match tag {
            0x01 => FrameKind::Message,
            0x02 => FrameKind::RpcRequest,
            0x03 => FrameKind::RpcResponse,
            0x04 => FrameKind::RpcError,
            0x05 => FrameKind::Ping,
            0x06 => FrameKind::Pong,
            0x07 => FrameKind::Pause,
            0x08 => FrameKind::Resume,
            0x10 => FrameKind::AuthRequest,
            0x11 => FrameKind::AuthSuccess,
            0x12 => FrameKind::AuthFailure,
            0x20 => FrameKind::Disconnect,
            0xFF => FrameKind::Error,
            tag => return Err(NetworkError::Fatal(ErrorType::UnknownFrameKind(tag))),
        })
    }

    /// Auth frames belong to the handshake window only.
    #[inline]
    pub fn is_auth(self) -> bool {
        match self {
            FrameKind::AuthRequest | FrameKind::AuthSuccess | FrameKind::AuthFailure => true,
            _ => false,
        }
    }

    /// Control frames pass the send pipeline even while the remote peer has
    /// paused the connection.
    #[inline]
    pub fn passes_remote_pause(self) -> bool {
        match self {
            FrameKind::Message | FrameKind::RpcRequest | FrameKind::RpcResponse | FrameKind::RpcError => false,
            _ => true,
        }
    }
}

impl From<FrameKind> for u8 {
    #[inline]
    fn from(kind: FrameKind) -> Self {
        kind as u8
    }
}

/// One fully-formed protocol unit. The payload is held uncompressed; the
/// compression decision is made at encode time and undone at decode time.
/// Frames are immutable once constructed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u16,
    pub correlation: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame around a payload object.
    pub fn new(kind: FrameKind, correlation: u64, value: &Value) -> NetworkResult<Frame> {
        Ok(Frame {
            kind,
            flags: 0,
            correlation,
            timestamp: timestamp_millis(),
            payload: payload::to_bytes(value)?,
        })
    }

    /// Build a payload-less control frame.
    pub fn control(kind: FrameKind, correlation: u64) -> Frame {
        Frame {
            kind,
            flags: 0,
            correlation,
            timestamp: timestamp_millis(),
            payload: Vec::new(),
        }
    }

    /// Decode the payload bytes into a payload object.
    #[inline]
    pub fn value(&self) -> NetworkResult<Value> {
        payload::from_bytes(&self.payload)
    }
}

/// The fixed header parsed off the wire. `length` counts the payload bytes
/// that follow, post-compression.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub flags: u16,
    pub length: u32,
    pub correlation: u64,
    pub timestamp: u64,
}

/// Parse and validate a fixed header. The caller guarantees at least
/// `HEADER_SIZE` bytes.
pub fn decode_header(buffer: &[u8]) -> NetworkResult<FrameHeader> {
    debug_assert!(buffer.len() >= HEADER_SIZE);

    let mut stream = Cursor::new(buffer);

    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(NetworkError::Fatal(ErrorType::BadMagic));
    }

    let version = stream.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(NetworkError::Fatal(ErrorType::UnsupportedVersion(version)));
    }

    let kind = FrameKind::from_u8(stream.read_u8()?)?;
    let flags = stream.read_u16::<BigEndian>()?;

    if flags & !FLAG_KNOWN_MASK != 0 {
        return Err(NetworkError::Fatal(ErrorType::ReservedBits));
    }
    if flags & FLAG_ENCRYPTED != 0 {
        return Err(NetworkError::Fatal(ErrorType::EncryptedUnsupported));
    }

    let length = stream.read_u32::<BigEndian>()?;
    let correlation = stream.read_u64::<BigEndian>()?;
    let timestamp = stream.read_u64::<BigEndian>()?;

    let reserved = stream.read_u32::<BigEndian>()?;
    if reserved != 0 {
        return Err(NetworkError::Fatal(ErrorType::ReservedBits));
    }

    Ok(FrameHeader {
        kind,
        flags,
        length,
        correlation,
        timestamp,
    })
}

/// Encode a frame into a contiguous buffer of exactly `HEADER_SIZE + length`
/// bytes. Compression applies only when requested, when the payload exceeds
/// the threshold, and when deflate actually shrinks it; otherwise the frame
/// goes out unchanged with the flag clear.
pub fn encode(frame: &Frame, compress: bool) -> NetworkResult<Vec<u8>> {
    let mut flags = frame.flags & FLAG_HINT_MASK;
    let mut body: &[u8] = &frame.payload;

    let deflated;
    if compress && frame.payload.len() > COMPRESSION_THRESHOLD {
        deflated = deflate(&frame.payload)?;
        if deflated.len() < frame.payload.len() {
            flags |= FLAG_COMPRESSED;
            body = &deflated;
        }
    }

    let mut buffer = Vec::with_capacity(HEADER_SIZE + body.len());

    buffer.write_all(&MAGIC)?;
    buffer.write_u8(PROTOCOL_VERSION)?;
    buffer.write_u8(frame.kind.into())?;
    buffer.write_u16::<BigEndian>(flags)?;
    buffer.write_u32::<BigEndian>(body.len() as u32)?;
    buffer.write_u64::<BigEndian>(frame.correlation)?;
    buffer.write_u64::<BigEndian>(frame.timestamp)?;
    buffer.write_u32::<BigEndian>(0)?;
    buffer.write_all(body)?;

    Ok(buffer)
}

/// Reassemble a frame from a validated header and its payload bytes,
/// inflating if the compressed flag is set. `max_size` bounds the inflated
/// payload.
pub fn decode_payload(header: &FrameHeader, body: &[u8], max_size: usize) -> NetworkResult<Frame> {
    debug_assert_eq!(body.len(), header.length as usize);

    let payload = if header.flags & FLAG_COMPRESSED != 0 {
        inflate(body, max_size)?
    } else {
        body.to_vec()
    };

    Ok(Frame {
        kind: header.kind,
        flags: header.flags & FLAG_HINT_MASK,
        correlation: header.correlation,
        timestamp: header.timestamp,
        payload,
    })
}

fn deflate(data: &[u8]) -> NetworkResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(6));
    encoder.write_all(data)?;
    encoder.finish().map_err(Into::into)
}

fn inflate(data: &[u8], max_size: usize) -> NetworkResult<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data).take(max_size as u64 + 1);
    let mut out = Vec::with_capacity(data.len() * 2);

    decoder
        .read_to_end(&mut out)
        .map_err(|_| NetworkError::Fatal(ErrorType::Corrupt))?;

    if out.len() > max_size {
        return Err(NetworkError::Fatal(ErrorType::InflateOverflow));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::map;

    fn sample_frame(kind: FrameKind, payload: Vec<u8>) -> Frame {
        Frame {
            kind,
            flags: 0,
            correlation: 7,
            timestamp: 1_700_000_000_000,
            payload,
        }
    }

    fn decode_wire(wire: &[u8]) -> NetworkResult<Frame> {
        let header = decode_header(&wire[..HEADER_SIZE])?;
        decode_payload(&header, &wire[HEADER_SIZE..], DEFAULT_MAX_FRAME_SIZE)
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let value = map(vec![("type", rmpv::Value::String("chat".into()))]);
        let frame = Frame::new(FrameKind::Message, 42, &value).unwrap();

        let wire = encode(&frame, false).unwrap();
        assert_eq!(wire.len(), HEADER_SIZE + frame.payload.len());

        let decoded = decode_wire(&wire).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.value().unwrap(), value);
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        for kind in &[FrameKind::Ping, FrameKind::Pause, FrameKind::Message] {
            let frame = sample_frame(*kind, Vec::new());
            let wire = encode(&frame, true).unwrap();

            assert_eq!(wire.len(), HEADER_SIZE);
            assert_eq!(decode_wire(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn test_compression_applied_above_threshold() {
        // Highly repetitive payload so deflate is guaranteed to shrink it.
        let frame = sample_frame(FrameKind::Message, vec![b'a'; 4096]);

        let wire = encode(&frame, true).unwrap();
        assert!(wire.len() < HEADER_SIZE + frame.payload.len());

        let header = decode_header(&wire[..HEADER_SIZE]).unwrap();
        assert_ne!(header.flags & FLAG_COMPRESSED, 0);

        let decoded = decode_wire(&wire).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_compression_skipped_below_threshold() {
        let frame = sample_frame(FrameKind::Message, vec![b'a'; COMPRESSION_THRESHOLD]);

        let wire = encode(&frame, true).unwrap();

        let header = decode_header(&wire[..HEADER_SIZE]).unwrap();
        assert_eq!(header.flags & FLAG_COMPRESSED, 0);
        assert_eq!(header.length as usize, frame.payload.len());
    }

    #[test]
    fn test_compression_dropped_when_not_smaller() {
        // Random bytes do not deflate; the flag must come out clear.
        use rand::RngCore;

        let mut payload = vec![0u8; 512];
        rand::thread_rng().fill_bytes(&mut payload);
        let frame = sample_frame(FrameKind::Message, payload);

        let wire = encode(&frame, true).unwrap();
        let header = decode_header(&wire[..HEADER_SIZE]).unwrap();

        if header.flags & FLAG_COMPRESSED == 0 {
            assert_eq!(header.length as usize, frame.payload.len());
        }
        assert_eq!(decode_wire(&wire).unwrap(), frame);
    }

    #[test]
    fn test_reject_bad_magic() {
        let frame = sample_frame(FrameKind::Ping, Vec::new());
        let mut wire = encode(&frame, false).unwrap();
        wire[0] = b'X';

        assert_eq!(
            decode_header(&wire).unwrap_err(),
            NetworkError::Fatal(ErrorType::BadMagic)
        );
    }

    #[test]
    fn test_reject_bad_version() {
        let frame = sample_frame(FrameKind::Ping, Vec::new());
        let mut wire = encode(&frame, false).unwrap();
        wire[4] = 99;

        assert_eq!(
            decode_header(&wire).unwrap_err(),
            NetworkError::Fatal(ErrorType::UnsupportedVersion(99))
        );
    }

    #[test]
    fn test_reject_unknown_kind() {
        let frame = sample_frame(FrameKind::Ping, Vec::new());
        let mut wire = encode(&frame, false).unwrap();
        wire[5] = 0x7E;

        assert_eq!(
            decode_header(&wire).unwrap_err(),
            NetworkError::Fatal(ErrorType::UnknownFrameKind(0x7E))
        );
    }

    #[test]
    fn test_reject_reserved_flag_bits() {
        let frame = sample_frame(FrameKind::Ping, Vec::new());
        let mut wire = encode(&frame, false).unwrap();
        wire[7] |= 0x80;

        assert_eq!(
            decode_header(&wire).unwrap_err(),
            NetworkError::Fatal(ErrorType::ReservedBits)
        );
    }

    #[test]
    fn test_reject_encrypted_flag() {
        let frame = sample_frame(FrameKind::Ping, Vec::new());
        let mut wire = encode(&frame, false).unwrap();
        wire[7] |= FLAG_ENCRYPTED as u8;

        assert_eq!(
            decode_header(&wire).unwrap_err(),
            NetworkError::Fatal(ErrorType::EncryptedUnsupported)
        );
    }

    #[test]
    fn test_reject_nonzero_reserved_field() {
        let frame = sample_frame(FrameKind::Ping, Vec::new());
        let mut wire = encode(&frame, false).unwrap();
        wire[31] = 1;

        assert_eq!(
            decode_header(&wire).unwrap_err(),
            NetworkError::Fatal(ErrorType::ReservedBits)
        );
    }

    #[test]
    fn test_hint_flags_tolerated() {
        let mut frame = sample_frame(FrameKind::Message, vec![1, 2, 3]);
        frame.flags = 0x0008;

        let wire = encode(&frame, false).unwrap();
        let decoded = decode_wire(&wire).unwrap();

        assert_eq!(decoded.flags, 0x0008);
    }

    #[test]
    fn test_inflate_overflow_rejected() {
        // 1 MiB of zeroes deflates to well under the 4 KiB cap used here.
        let frame = sample_frame(FrameKind::Message, vec![0u8; 1024 * 1024]);
        let wire = encode(&frame, true).unwrap();

        let header = decode_header(&wire[..HEADER_SIZE]).unwrap();
        assert_ne!(header.flags & FLAG_COMPRESSED, 0);

        let result = decode_payload(&header, &wire[HEADER_SIZE..], 4096);
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::InflateOverflow));
    }

    #[test]
    fn test_remote_pause_classification() {
        assert!(!FrameKind::Message.passes_remote_pause());
        assert!(!FrameKind::RpcRequest.passes_remote_pause());
        assert!(FrameKind::Ping.passes_remote_pause());
        assert!(FrameKind::Pause.passes_remote_pause());
        assert!(FrameKind::Disconnect.passes_remote_pause());
        assert!(FrameKind::AuthRequest.passes_remote_pause());
    }
}
