//! Reassembler: per-sender fragment accumulation and completed-message suppression.
//!
//! Every broadcast cycle replays the full fragment sequence, so a receiver sees each
//! fragment several times. Once a message id completes for a sender it goes into that
//! sender's bounded history and any further fragment carrying it is dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::IpAddr;

use parking_lot::Mutex;

use crate::wire::Fragment;

/// Completed ids remembered per sender.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Who a fragment came from, as far as the transport can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderAddress {
    /// 48-bit radio hardware address.
    Radio(u64),
    Network(IpAddr),
    /// Transport has no sender addressing; all such fragments share one history.
    Unknown,
}

impl fmt::Display for SenderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderAddress::Radio(addr) => {
                let b = addr.to_be_bytes();
                write!(
                    f,
                    "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                    b[2], b[3], b[4], b[5], b[6], b[7]
                )
            }
            SenderAddress::Network(ip) => write!(f, "{ip}"),
            SenderAddress::Unknown => f.write_str("unknown"),
        }
    }
}

/// Bounded FIFO of completed message ids plus a set for O(1) lookup.
/// Invariant: `ids` and `order` hold the same values, at most `capacity` of them.
#[derive(Debug)]
pub struct CompletedHistory {
    order: VecDeque<u8>,
    ids: HashSet<u8>,
    capacity: usize,
}

impl CompletedHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity + 1),
            ids: HashSet::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn contains(&self, message_id: u8) -> bool {
        self.ids.contains(&message_id)
    }

    /// Record a completed id. Returns the id evicted to stay within capacity, if any.
    pub fn record(&mut self, message_id: u8) -> Option<u8> {
        if !self.ids.insert(message_id) {
            return None;
        }
        self.order.push_back(message_id);
        if self.order.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            self.ids.remove(&oldest);
            return Some(oldest);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Fragments held for one (sender, message id) until the count reaches `total`.
#[derive(Debug)]
struct PendingMessage {
    /// Fixed by the first fragment seen; later fragments are judged against it.
    total: u8,
    fragments: HashMap<u8, Vec<u8>>,
}

impl PendingMessage {
    fn new(total: u8) -> Self {
        Self {
            total,
            fragments: HashMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.fragments.len() == self.total as usize
    }

    fn assemble(mut self) -> Vec<u8> {
        let mut indices: Vec<u8> = self.fragments.keys().copied().collect();
        indices.sort_unstable();
        let mut out = Vec::new();
        for index in indices {
            if let Some(chunk) = self.fragments.remove(&index) {
                out.extend_from_slice(&chunk);
            }
        }
        out
    }
}

#[derive(Debug)]
struct SenderState {
    pending: HashMap<u8, PendingMessage>,
    history: CompletedHistory,
}

impl SenderState {
    fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            history: CompletedHistory::new(capacity),
        }
    }
}

/// Result of ingesting one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Last missing fragment arrived; payload is reassembled in index order.
    Complete(Vec<u8>),
    /// Stored; message not yet complete.
    InProgress,
    /// Index already held for this message; first writer wins.
    DuplicateFragment,
    /// Message id is in the sender's completed history.
    AlreadyDelivered,
}

impl Ingest {
    pub fn completed(self) -> Option<Vec<u8>> {
        match self {
            Ingest::Complete(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Thread-safe reassembler. One lock guards every sender table; it is held only for the
/// insert-and-check step, never while the caller decrypts or dispatches.
pub struct Reassembler {
    history_capacity: usize,
    senders: Mutex<HashMap<SenderAddress, SenderState>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            history_capacity,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Ingest a fragment from `sender`.
    pub fn ingest(&self, fragment: Fragment, sender: SenderAddress) -> Ingest {
        let mut senders = self.senders.lock();
        let state = senders
            .entry(sender)
            .or_insert_with(|| SenderState::new(self.history_capacity));

        if state.history.contains(fragment.message_id) {
            return Ingest::AlreadyDelivered;
        }

        let message_id = fragment.message_id;
        let pending = state
            .pending
            .entry(message_id)
            .or_insert_with(|| PendingMessage::new(fragment.total));
        if pending.fragments.contains_key(&fragment.index) {
            return Ingest::DuplicateFragment;
        }
        pending.fragments.insert(fragment.index, fragment.payload);
        if !pending.is_complete() {
            return Ingest::InProgress;
        }

        let Some(done) = state.pending.remove(&message_id) else {
            return Ingest::InProgress;
        };
        if let Some(evicted) = state.history.record(message_id) {
            tracing::trace!(%sender, evicted, "completed history full, evicted oldest id");
        }
        Ingest::Complete(done.assemble())
    }

    /// Whether `message_id` is in `sender`'s completed history.
    pub fn is_delivered(&self, sender: SenderAddress, message_id: u8) -> bool {
        self.senders
            .lock()
            .get(&sender)
            .is_some_and(|s| s.history.contains(message_id))
    }

    /// Number of fragments held for an incomplete message.
    pub fn pending_fragments(&self, sender: SenderAddress, message_id: u8) -> usize {
        self.senders
            .lock()
            .get(&sender)
            .and_then(|s| s.pending.get(&message_id))
            .map_or(0, |p| p.fragments.len())
    }

    /// Number of incomplete messages held for `sender`.
    pub fn pending_messages(&self, sender: SenderAddress) -> usize {
        self.senders
            .lock()
            .get(&sender)
            .map_or(0, |s| s.pending.len())
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
