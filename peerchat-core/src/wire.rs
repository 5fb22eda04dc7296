//! Discovery datagram layout. One UDP datagram carries exactly one message:
//! a 4-byte LE payload length followed by the bincode payload, nothing after it.

use crate::protocol::Message;

const HEADER_LEN: usize = 4;
/// Discovery datagrams are tiny; anything larger is garbage or hostile.
pub const MAX_FRAME_LEN: u32 = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("payload of {0} bytes exceeds the datagram limit")]
    TooLarge(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("datagram shorter than its declared length")]
    Truncated,
    #[error("declared payload of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error("{0} stray bytes after the payload")]
    TrailingBytes(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Build the datagram for `msg`.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let size = bincode::serialized_size(msg)?;
    if size > u64::from(MAX_FRAME_LEN) {
        return Err(FrameEncodeError::TooLarge(size));
    }
    let mut datagram = Vec::with_capacity(HEADER_LEN + size as usize);
    datagram.extend_from_slice(&(size as u32).to_le_bytes());
    bincode::serialize_into(&mut datagram, msg)?;
    Ok(datagram)
}

/// Parse one received datagram. The payload must fill it exactly.
pub fn decode_frame(datagram: &[u8]) -> Result<Message, FrameDecodeError> {
    if datagram.len() < HEADER_LEN {
        return Err(FrameDecodeError::Truncated);
    }
    let (header, payload) = datagram.split_at(HEADER_LEN);
    let mut len = [0u8; HEADER_LEN];
    len.copy_from_slice(header);
    let declared = u32::from_le_bytes(len) as usize;
    if declared > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge(declared));
    }
    if payload.len() < declared {
        return Err(FrameDecodeError::Truncated);
    }
    if payload.len() > declared {
        return Err(FrameDecodeError::TrailingBytes(payload.len() - declared));
    }
    Ok(bincode::deserialize(payload)?)
}
