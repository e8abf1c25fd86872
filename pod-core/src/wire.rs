//! Bridge framing: length-prefix (4 bytes LE) + one encoded packet.

use crate::message::{Message, MessageError};

const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Encode a packet into a single frame: 4 bytes LE length + packet bytes.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let packet = msg.encode()?;
    encode_raw_frame(&packet)
}

/// Frame arbitrary bytes (the bridge's connection-opening command is not a packet).
pub fn encode_raw_frame(bytes: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = bytes.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + bytes.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] MessageError),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one raw frame from the front of `bytes`. Returns the frame body and bytes consumed.
pub fn decode_raw_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Decode one packet frame from the front of `bytes`.
/// Call with partial buffer; returns NeedMore if not enough bytes yet.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let (body, consumed) = decode_raw_frame(bytes)?;
    let msg = Message::decode(body)?;
    Ok((msg, consumed))
}

/// Validate a length prefix read off a stream.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] MessageError),
}
