//! Wire frames and the stateless frame codec.
//!
//! ```text
//!  0        1                9            13       14             18
//!  +--------+----------------+------------+--------+--------------+----------
//!  | opcode | correlation id | partition  | flags  | payload len  | payload..
//!  |   u8   |    u64 BE      |   i32 BE   |   u8   |    u32 BE    |
//!  +--------+----------------+------------+--------+--------------+----------
//! ```
//!
//! The payload length is always explicit. A frame is dispatched only once it
//! is fully buffered; messages larger than the fragment threshold travel as a
//! run of `FRAGMENT` frames closed by one carrying `FINAL`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, RemoteError, TpcError};
use crate::partition::PartitionId;

pub const HEADER_LEN: usize = 18;

/// Frame flag bits.
pub mod flags {
    pub const RESPONSE: u8 = 1 << 0;
    /// Part of a fragmented message.
    pub const FRAGMENT: u8 = 1 << 1;
    /// Last frame of a fragmented message.
    pub const FINAL: u8 = 1 << 2;
    /// Response payload is an error record.
    pub const ERROR: u8 = 1 << 3;

    pub const KNOWN: u8 = RESPONSE | FRAGMENT | FINAL | ERROR;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("payload length {len} exceeds limit {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),

    #[error("final-fragment flag on an unfragmented frame")]
    FinalWithoutFragment,

    #[error("fragment stream {0} changed opcode or partition")]
    FragmentMismatch(u64),

    #[error("reassembled message {correlation_id} exceeds {max} bytes")]
    MessageTooLarge { correlation_id: u64, max: usize },

    #[error("more than {0} fragment streams open")]
    TooManyStreams(usize),

    #[error("malformed error record")]
    MalformedErrorRecord,
}

impl FrameError {
    /// True when the channel must be closed: byte boundaries can no longer
    /// be trusted, or the peer holds too many fragment streams open.
    /// Everything else drops a single frame.
    pub fn corrupts_stream(&self) -> bool {
        matches!(self, Self::PayloadTooLarge { .. } | Self::TooManyStreams(_))
    }
}

/// Fixed 18-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u8,
    pub correlation_id: u64,
    pub partition_id: PartitionId,
    pub flags: u8,
    pub payload_len: u32,
}

impl FrameHeader {
    /// Parse a header from the first `HEADER_LEN` bytes of `buf`.
    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            opcode: buf.get_u8(),
            correlation_id: buf.get_u64(),
            partition_id: buf.get_i32(),
            flags: buf.get_u8(),
            payload_len: buf.get_u32(),
        })
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u8(self.opcode);
        dst.put_u64(self.correlation_id);
        dst.put_i32(self.partition_id);
        dst.put_u8(self.flags);
        dst.put_u32(self.payload_len);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub correlation_id: u64,
    pub partition_id: PartitionId,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(opcode: u8, correlation_id: u64, partition_id: PartitionId, payload: Bytes) -> Self {
        Self {
            opcode,
            correlation_id,
            partition_id,
            flags: 0,
            payload,
        }
    }

    /// Response frame for `request`, carrying either the result payload or
    /// an encoded error record.
    pub fn response(
        opcode: u8,
        correlation_id: u64,
        partition_id: PartitionId,
        result: std::result::Result<Bytes, RemoteError>,
    ) -> Self {
        let (flags, payload) = match result {
            Ok(payload) => (flags::RESPONSE, payload),
            Err(err) => (flags::RESPONSE | flags::ERROR, encode_error(&err)),
        };
        Self {
            opcode,
            correlation_id,
            partition_id,
            flags,
            payload,
        }
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.flags & flags::RESPONSE != 0
    }

    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.flags & flags::FRAGMENT != 0
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.flags & flags::FINAL != 0
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.flags & flags::ERROR != 0
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Reject frames with reserved flag bits.
    pub fn validate(&self) -> std::result::Result<(), FrameError> {
        let reserved = self.flags & !flags::KNOWN;
        if reserved != 0 {
            return Err(FrameError::ReservedFlags(reserved));
        }
        Ok(())
    }

    /// Convert a response frame into the caller-visible outcome.
    pub fn into_result(self) -> std::result::Result<Bytes, TpcError> {
        if !self.is_error() {
            return Ok(self.payload);
        }
        match decode_error(&self.payload) {
            Ok(err) => Err(err.into()),
            Err(e) => Err(e.into()),
        }
    }

    fn header(&self, flags: u8, payload_len: usize) -> FrameHeader {
        FrameHeader {
            opcode: self.opcode,
            correlation_id: self.correlation_id,
            partition_id: self.partition_id,
            flags,
            payload_len: payload_len as u32,
        }
    }
}

/// Error record: `[code u8][utf-8 message]`.
pub fn encode_error(err: &RemoteError) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + err.message.len());
    buf.put_u8(err.code as u8);
    buf.put_slice(err.message.as_bytes());
    buf.freeze()
}

pub fn decode_error(payload: &Bytes) -> std::result::Result<RemoteError, FrameError> {
    let (&code, message) = payload
        .split_first()
        .ok_or(FrameError::MalformedErrorRecord)?;
    let code = ErrorCode::from_u8(code).ok_or(FrameError::MalformedErrorRecord)?;
    Ok(RemoteError::new(code, String::from_utf8_lossy(message)))
}

/// Stateless encoder/decoder. One instance may be shared by every channel of
/// a reactor; the only state it carries is the payload limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub const fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Append one frame, header and payload, to `dst`.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) {
        dst.reserve(frame.encoded_len());
        frame.header(frame.flags, frame.payload.len()).write(dst);
        dst.put_slice(&frame.payload);
    }

    /// Append `frame` as one or more frames.
    ///
    /// Payloads no larger than `fragment_threshold` go out as a single frame.
    /// Larger ones are split into threshold-sized chunks; every chunk carries
    /// `FRAGMENT` and the last also carries `FINAL`. Returns the number of
    /// frames written.
    pub fn encode_message(&self, frame: &Frame, fragment_threshold: usize, dst: &mut BytesMut) -> usize {
        let threshold = fragment_threshold.max(1);
        let len = frame.payload.len();
        if len <= threshold {
            self.encode(frame, dst);
            return 1;
        }

        let count = len.div_ceil(threshold);
        dst.reserve(len + count * HEADER_LEN);
        for i in 0..count {
            let start = i * threshold;
            let end = (start + threshold).min(len);
            let mut f = frame.flags | flags::FRAGMENT;
            if i + 1 == count {
                f |= flags::FINAL;
            }
            frame.header(f, end - start).write(dst);
            dst.put_slice(&frame.payload[start..end]);
        }
        count
    }

    /// Extract one complete frame from the head of `src`.
    ///
    /// The frame is split off without copying: its payload shares the read
    /// buffer's allocation. On a partial frame `src` is left untouched apart
    /// from reserving room for the missing bytes.
    pub fn decode(&self, src: &mut BytesMut) -> std::result::Result<Option<Frame>, FrameError> {
        let header = match FrameHeader::parse(&src[..]) {
            Some(h) => h,
            None => return Ok(None),
        };
        let len = header.payload_len as usize;
        if len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(total);
        raw.advance(HEADER_LEN);
        Ok(Some(Frame {
            opcode: header.opcode,
            correlation_id: header.correlation_id,
            partition_id: header.partition_id,
            flags: header.flags,
            payload: raw.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(1 << 20)
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::request(1, 501, 3, Bytes::from_static(b"hello")),
            Frame::request(2, 502, -1, Bytes::new()),
            Frame::response(1, 501, 3, Ok(Bytes::from(vec![7u8; 300]))),
            Frame::response(9, 503, 7, Err(RemoteError::new(ErrorCode::UnknownOpcode, "opcode 9"))),
            Frame::request(3, u64::MAX, i32::MAX, Bytes::from(vec![0xAB; 4096])),
        ]
    }

    fn encode_all(frames: &[Frame]) -> BytesMut {
        let mut buf = BytesMut::new();
        for f in frames {
            codec().encode(f, &mut buf);
        }
        buf
    }

    /// Feed `stream` through a read buffer in `chunk`-sized appends.
    fn decode_chunked(stream: &[u8], chunk: usize) -> Vec<Frame> {
        let codec = codec();
        let mut read_buf = BytesMut::new();
        let mut out = Vec::new();
        for piece in stream.chunks(chunk) {
            read_buf.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut read_buf).unwrap() {
                out.push(frame);
            }
        }
        assert!(read_buf.is_empty(), "trailing bytes left in buffer");
        out
    }

    #[test]
    fn test_header_layout_is_bit_exact() {
        let frame = Frame {
            opcode: 0x42,
            correlation_id: 0x0102_0304_0506_0708,
            partition_id: -2,
            flags: flags::RESPONSE | flags::FRAGMENT,
            payload: Bytes::from_static(b"xy"),
        };
        let mut buf = BytesMut::new();
        codec().encode(&frame, &mut buf);
        assert_eq!(
            &buf[..],
            &[
                0x42, // opcode
                1, 2, 3, 4, 5, 6, 7, 8, // correlation id
                0xFF, 0xFF, 0xFF, 0xFE, // partition -2
                0b011, // flags
                0, 0, 0, 2, // payload length
                b'x', b'y',
            ]
        );
    }

    #[test]
    fn test_decode_partial_header_and_payload() {
        let mut full = BytesMut::new();
        codec().encode(&Frame::request(1, 7, 0, Bytes::from_static(b"abcdef")), &mut full);

        let mut buf = BytesMut::from(&full[..10]);
        assert_eq!(codec().decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 10);

        let mut buf = BytesMut::from(&full[..HEADER_LEN + 3]);
        assert_eq!(codec().decode(&mut buf).unwrap(), None);
        assert!(buf.capacity() >= HEADER_LEN + 6);

        buf.extend_from_slice(&full[HEADER_LEN + 3..]);
        let frame = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abcdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let small = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        codec().encode(&Frame::request(1, 1, 1, Bytes::from(vec![0; 17])), &mut buf);
        let err = small.decode(&mut buf).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge { len: 17, max: 16 });
        assert!(err.corrupts_stream());
    }

    #[test]
    fn test_decode_fixed_chunk_sizes() {
        let frames = sample_frames();
        let stream = encode_all(&frames);
        for chunk in [1, 7, 18, 19, 64, stream.len()] {
            assert_eq!(decode_chunked(&stream, chunk), frames, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_encode_message_fragments() {
        let payload = Bytes::from((0..10_000u32).map(|i| i as u8).collect::<Vec<_>>());
        let frame = Frame::request(1, 900, 5, payload.clone());
        let mut buf = BytesMut::new();
        let n = codec().encode_message(&frame, 4096, &mut buf);
        assert_eq!(n, 3);

        let decoded = decode_chunked(&buf, 1000);
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(|f| f.is_fragment()));
        assert!(!decoded[0].is_final() && !decoded[1].is_final());
        assert!(decoded[2].is_final());
        assert_eq!(decoded[2].payload.len(), 10_000 - 2 * 4096);

        let joined: Vec<u8> = decoded.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, payload.to_vec());
    }

    #[test]
    fn test_encode_message_small_is_single_frame() {
        let frame = Frame::request(1, 1, 1, Bytes::from_static(b"tiny"));
        let mut buf = BytesMut::new();
        assert_eq!(codec().encode_message(&frame, 4, &mut buf), 1);
        let decoded = decode_chunked(&buf, 3);
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn test_error_record() {
        let frame = Frame::response(200, 9, 1, Err(RemoteError::new(ErrorCode::UnknownOpcode, "opcode 200")));
        assert!(frame.is_response() && frame.is_error());
        match frame.into_result() {
            Err(TpcError::Remote { code, message }) => {
                assert_eq!(code, ErrorCode::UnknownOpcode);
                assert_eq!(message, "opcode 200");
            }
            other => panic!("unexpected {other:?}"),
        }

        let bad = Frame {
            flags: flags::RESPONSE | flags::ERROR,
            ..Frame::request(1, 1, 1, Bytes::new())
        };
        assert!(matches!(bad.into_result(), Err(TpcError::Protocol(_))));
    }

    #[test]
    fn test_validate_reserved_flags() {
        let mut frame = Frame::request(1, 1, 1, Bytes::new());
        assert!(frame.validate().is_ok());
        frame.flags = 0x80 | flags::RESPONSE;
        assert_eq!(frame.validate(), Err(FrameError::ReservedFlags(0x80)));
    }

    proptest! {
        #[test]
        fn prop_arbitrary_chunking_preserves_frames(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..600), 1..12),
            chunk in 1usize..256,
        ) {
            let frames: Vec<Frame> = payloads
                .into_iter()
                .enumerate()
                .map(|(i, p)| Frame::request((i % 5) as u8, 500 + i as u64, i as i32 - 3, Bytes::from(p)))
                .collect();
            let stream = encode_all(&frames);
            prop_assert_eq!(decode_chunked(&stream, chunk), frames);
        }
    }
}
