//! Fragmenter: split an encrypted payload into wire fragments; rolling message ids.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::wire::Fragment;

/// Chunk size under legacy advertising (31-byte advertisement minus overhead).
pub const LEGACY_FRAGMENT_SIZE: usize = 21;
/// Chunk size under extended advertising (255-byte advertisement minus overhead).
pub const EXTENDED_FRAGMENT_SIZE: usize = 240;
/// `total` is a single byte.
pub const MAX_FRAGMENTS: usize = 255;

/// Split `payload` into fragments of at most `max_fragment_size` bytes, index order 1..=total.
/// An empty payload yields one empty fragment with `total = 1`.
pub fn fragment_payload(
    payload: &[u8],
    message_id: u8,
    max_fragment_size: usize,
) -> Result<Vec<Fragment>, FragmentError> {
    if max_fragment_size == 0 {
        return Err(FragmentError::ZeroFragmentSize);
    }
    let count = payload.len().div_ceil(max_fragment_size).max(1);
    if count > MAX_FRAGMENTS {
        return Err(FragmentError::PayloadTooLarge {
            len: payload.len(),
            fragments: count,
        });
    }
    let total = count as u8;
    if payload.is_empty() {
        return Ok(vec![Fragment::new(message_id, 1, 1, Vec::new())]);
    }
    Ok(payload
        .chunks(max_fragment_size)
        .enumerate()
        .map(|(i, chunk)| Fragment::new(message_id, (i + 1) as u8, total, chunk.to_vec()))
        .collect())
}

/// Error splitting a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("payload too large: {len} bytes needs {fragments} fragments (max {MAX_FRAGMENTS})")]
    PayloadTooLarge { len: usize, fragments: usize },
    #[error("fragment size must be positive")]
    ZeroFragmentSize,
}

/// Per-channel message id counter. Starts at a random value so receivers that still hold
/// history from a previous process do not drop the first messages as duplicates.
#[derive(Debug)]
pub struct MessageIdCounter {
    next: AtomicU8,
}

impl MessageIdCounter {
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(first: u8) -> Self {
        Self {
            next: AtomicU8::new(first),
        }
    }

    /// Take the next id. Wraps at 256.
    pub fn next_id(&self) -> u8 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdCounter {
    fn default() -> Self {
        Self::new()
    }
}
