//! Length-prefixed typed frames: the single authority for on-wire bytes
//! after the handshake.
//!
//! Each frame is `<u32 length><u32 type><payload>`, big-endian, where
//! `length` counts the whole frame including both header words, so the
//! payload spans `length - 8` bytes. One codec instance serves one
//! direction and stamps [`FrameInfo::seq`] from its own counter, which is
//! what makes sequence numbers monotonically non-decreasing per direction.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramingError;
use crate::messages::{FrameInfo, FrameType};

/// Session-wide maximum frame size, header included.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Bytes taken by the length and type words.
pub const FRAME_HEADER_LEN: u32 = 8;

#[derive(Debug, Default)]
pub struct FrameCodec {
    next_seq: u64,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec::default()
    }
}

impl Decoder for FrameCodec {
    type Item = FrameInfo;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FrameInfo>, FramingError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if length < FRAME_HEADER_LEN {
            return Err(FramingError::MalformedHeader(format!(
                "frame length {length} is shorter than the header"
            )));
        }
        if length > MAX_FRAME_LEN {
            return Err(FramingError::OversizedFrame {
                length,
                max: MAX_FRAME_LEN,
            });
        }
        let total = length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(4);
        let raw_type = src.get_u32();
        let frame_type = FrameType::from_wire(raw_type)
            .ok_or(FramingError::UnhandledFrameType(raw_type))?;
        let payload = src.split_to(total - FRAME_HEADER_LEN as usize).freeze();
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(Some(FrameInfo {
            frame_type,
            seq,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<FrameInfo>, FramingError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FramingError::ShortRead),
        }
    }
}

impl Encoder<(FrameType, Bytes)> for FrameCodec {
    type Error = FramingError;

    fn encode(
        &mut self,
        (frame_type, payload): (FrameType, Bytes),
        dst: &mut BytesMut,
    ) -> Result<(), FramingError> {
        let length = payload.len() as u64 + FRAME_HEADER_LEN as u64;
        if length > MAX_FRAME_LEN as u64 {
            return Err(FramingError::OversizedFrame {
                length: length.min(u32::MAX as u64) as u32,
                max: MAX_FRAME_LEN,
            });
        }
        dst.reserve(length as usize);
        dst.put_u32(length as u32);
        dst.put_u32(frame_type.to_wire());
        dst.put_slice(&payload);
        self.next_seq += 1;
        Ok(())
    }
}
