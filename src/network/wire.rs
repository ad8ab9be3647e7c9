//! Length-prefixed wire framing for P2P communication.
//!
//! Frame format: [1-4 byte length prefix (7-bit varint, LE groups)][payload]
//! Maximum frame size: 4MB (prevents memory exhaustion attacks)
//!
//! The reader is resumable: bytes may arrive in arbitrarily small pieces and
//! both the prefix and the body are tracked across calls.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Maximum allowed frame size (4MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Longest permitted length prefix
pub const MAX_PREFIX_LEN: usize = 4;

/// Largest length a 4-byte prefix can carry
pub const MAX_ENCODABLE_LEN: usize = (1 << (7 * MAX_PREFIX_LEN)) - 1;

/// Number of prefix bytes needed for a payload of `len` bytes.
pub fn prefix_len(len: usize) -> usize {
    match len {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        _ => 4,
    }
}

/// Append the adaptive length prefix for `len` to `dst`.
pub fn encode_prefix(len: usize, dst: &mut BytesMut) -> Result<(), WireError> {
    if len > MAX_ENCODABLE_LEN {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_ENCODABLE_LEN,
        });
    }
    let mut remaining = len;
    loop {
        let group = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining == 0 {
            dst.put_u8(group);
            return Ok(());
        }
        dst.put_u8(group | 0x80);
    }
}

/// Build a complete frame (prefix + payload) for broadcast or tests.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = BytesMut::with_capacity(prefix_len(payload.len()) + payload.len());
    encode_prefix(payload.len(), &mut frame)?;
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

#[derive(Debug)]
enum ReadPhase {
    /// Collecting prefix bytes; `value` holds the groups seen so far.
    Prefix { value: usize, count: usize },
    /// Filling an exact-size body buffer.
    Body { buf: BytesMut, expected: usize },
}

/// Resumable frame reassembler.
#[derive(Debug)]
pub struct FrameReader {
    phase: ReadPhase,
    max_frame: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            phase: ReadPhase::Prefix { value: 0, count: 0 },
            max_frame,
        }
    }

    /// True while a prefix or body is partially received.
    pub fn is_incomplete(&self) -> bool {
        match &self.phase {
            ReadPhase::Prefix { count, .. } => *count > 0,
            ReadPhase::Body { .. } => true,
        }
    }

    /// Consume bytes from `input` until one frame completes or `input` runs dry.
    ///
    /// Returns `Ok(Some(frame))` for a completed payload; remaining bytes stay
    /// in `input` for the next call.
    pub fn push(&mut self, input: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        loop {
            match &mut self.phase {
                ReadPhase::Prefix { value, count } => {
                    if input.is_empty() {
                        return Ok(None);
                    }
                    let byte = input.get_u8();
                    *value |= ((byte & 0x7f) as usize) << (7 * *count);
                    *count += 1;

                    if byte & 0x80 != 0 {
                        if *count >= MAX_PREFIX_LEN {
                            return Err(WireError::PrefixTooLong(MAX_PREFIX_LEN));
                        }
                        continue;
                    }

                    let expected = *value;
                    if expected > self.max_frame {
                        return Err(WireError::FrameTooLarge {
                            len: expected,
                            max: self.max_frame,
                        });
                    }
                    if expected == 0 {
                        self.phase = ReadPhase::Prefix { value: 0, count: 0 };
                        return Ok(Some(Bytes::new()));
                    }
                    self.phase = ReadPhase::Body {
                        buf: BytesMut::with_capacity(expected),
                        expected,
                    };
                }
                ReadPhase::Body { buf, expected } => {
                    if input.is_empty() {
                        return Ok(None);
                    }
                    let take = (*expected - buf.len()).min(input.len());
                    buf.extend_from_slice(&input.split_to(take));
                    if buf.len() == *expected {
                        let done = std::mem::take(buf).freeze();
                        self.phase = ReadPhase::Prefix { value: 0, count: 0 };
                        return Ok(Some(done));
                    }
                }
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn reassemble(wire: &[u8], cuts: &[usize]) -> Vec<Bytes> {
        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        let mut start = 0;
        let mut points: Vec<usize> = cuts.to_vec();
        points.push(wire.len());
        for end in points {
            let mut chunk = BytesMut::from(&wire[start..end]);
            while let Some(frame) = reader.push(&mut chunk).unwrap() {
                frames.push(frame);
            }
            assert!(chunk.is_empty());
            start = end;
        }
        assert!(!reader.is_incomplete());
        frames
    }

    #[test]
    fn test_prefix_sizes() {
        for (len, expected) in [
            (0usize, 1usize),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (MAX_FRAME_SIZE, 4),
        ] {
            let mut buf = BytesMut::new();
            encode_prefix(len, &mut buf).unwrap();
            assert_eq!(buf.len(), expected, "prefix for {}", len);
            assert_eq!(prefix_len(len), expected);
        }
        let mut buf = BytesMut::new();
        assert!(encode_prefix(MAX_ENCODABLE_LEN + 1, &mut buf).is_err());
    }

    #[test]
    fn test_byte_at_a_time() {
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let wire = encode_frame(&payload).unwrap();
        let cuts: Vec<usize> = (1..wire.len()).collect();
        let frames = reassemble(&wire, &cuts);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &payload[..]);
    }

    #[test]
    fn test_random_partitions_preserve_payloads() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let lengths = [0usize, 1, 127, 128, 5000, rng.gen_range(0..70_000)];
            let mut wire = Vec::new();
            let mut payloads = Vec::new();
            for len in lengths {
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                wire.extend_from_slice(&encode_frame(&payload).unwrap());
                payloads.push(payload);
            }
            let mut cuts: Vec<usize> = (0..rng.gen_range(0..20))
                .map(|_| rng.gen_range(0..=wire.len()))
                .collect();
            cuts.sort_unstable();

            let frames = reassemble(&wire, &cuts);
            assert_eq!(frames.len(), payloads.len());
            for (frame, payload) in frames.iter().zip(&payloads) {
                assert_eq!(&frame[..], &payload[..]);
            }
        }
    }

    #[test]
    fn test_partial_prefix_is_incomplete() {
        let wire = encode_frame(&[7u8; 200]).unwrap();
        let mut reader = FrameReader::new();
        let mut first = BytesMut::from(&wire[..1]);
        assert!(reader.push(&mut first).unwrap().is_none());
        assert!(reader.is_incomplete());
    }

    #[test]
    fn test_overlong_prefix_rejected() {
        let mut reader = FrameReader::new();
        let mut input = BytesMut::from(&[0xff, 0xff, 0xff, 0xff, 0x01][..]);
        assert_eq!(
            reader.push(&mut input),
            Err(WireError::PrefixTooLong(MAX_PREFIX_LEN))
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut prefix = BytesMut::new();
        encode_prefix(MAX_FRAME_SIZE + 1, &mut prefix).unwrap();
        let mut reader = FrameReader::new();
        assert!(matches!(
            reader.push(&mut prefix),
            Err(WireError::FrameTooLarge { .. })
        ));
    }
}
