//! Framing: 3-byte header (message id, 1-based index, total) + payload chunk.

/// Header length in bytes.
pub const HEADER_LEN: usize = 3;

/// One unit of the wire format: a slice of an encrypted payload plus its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: u8,
    /// 1-based position within the message.
    pub index: u8,
    pub total: u8,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn new(message_id: u8, index: u8, total: u8, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            index,
            total,
            payload,
        }
    }
}

/// Encode a fragment into a single packet: `[message_id, index, total, ..payload]`.
pub fn encode_packet(fragment: &Fragment) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + fragment.payload.len());
    out.push(fragment.message_id);
    out.push(fragment.index);
    out.push(fragment.total);
    out.extend_from_slice(&fragment.payload);
    out
}

/// Decode one packet. Everything after the header is payload (possibly empty).
pub fn decode_packet(bytes: &[u8]) -> Result<Fragment, PacketDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(PacketDecodeError::Malformed { len: bytes.len() });
    }
    Ok(Fragment {
        message_id: bytes[0],
        index: bytes[1],
        total: bytes[2],
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

/// Error decoding a packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("malformed packet: {len} bytes, need at least {HEADER_LEN}")]
    Malformed { len: usize },
}
