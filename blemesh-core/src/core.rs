//! Host-driven API: MeshCore takes received frames/datagrams from the host and returns
//! events; it prepares encrypted outbound payloads for the host to broadcast.
//!
//! All methods take `&self`: the radio callback, the network receive loop and the send
//! path may call in concurrently. Locks are internal and never held across decryption.

use parking_lot::Mutex;

use crate::cipher::{self, CipherError, DEFAULT_KEY, KEY_LEN};
use crate::fragment::{fragment_payload, FragmentError, MessageIdCounter};
use crate::identity::{DeviceId, DeviceInfo};
use crate::peers::{PeerRecord, PeerRegistry, Registration};
use crate::protocol::{self, Payload};
use crate::reassembly::{Ingest, Reassembler, SenderAddress};
use crate::wire::{self, Fragment};

/// What an outbound payload carries. Transports may replay discovery harder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    Text,
    Discovery,
}

/// An encrypted payload ready for broadcast, with the message id fragments will share.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message_id: u8,
    pub kind: OutboundKind,
    pub ciphertext: Vec<u8>,
}

impl Outbound {
    /// Split for a transport with the given chunk size.
    pub fn fragments(&self, max_fragment_size: usize) -> Result<Vec<Fragment>, FragmentError> {
        fragment_payload(&self.ciphertext, self.message_id, max_fragment_size)
    }
}

/// Text delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// None when the payload carried no sender prefix.
    pub sender: Option<DeviceId>,
    pub text: String,
}

/// Event for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Message(ReceivedMessage),
    PeerDiscovered(DeviceInfo),
    PeerUpdated(DeviceInfo),
}

/// Main coordinator state. Host passes received bytes; core returns events.
pub struct MeshCore {
    local: DeviceInfo,
    key: [u8; KEY_LEN],
    message_ids: MessageIdCounter,
    reassembler: Reassembler,
    peers: Mutex<PeerRegistry>,
}

impl MeshCore {
    pub fn new(local: DeviceInfo) -> Self {
        Self::with_key(local, DEFAULT_KEY)
    }

    pub fn with_key(local: DeviceInfo, key: [u8; KEY_LEN]) -> Self {
        Self {
            local,
            key,
            message_ids: MessageIdCounter::new(),
            reassembler: Reassembler::new(),
            peers: Mutex::new(PeerRegistry::new()),
        }
    }

    pub fn local_id(&self) -> &DeviceId {
        &self.local.device_id
    }

    pub fn local_info(&self) -> &DeviceInfo {
        &self.local
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Tag `text` with the local id and encrypt it.
    pub fn prepare_text(&self, text: &str) -> Result<Outbound, MeshError> {
        self.prepare(&protocol::text_payload(self.local_id(), text), OutboundKind::Text)
    }

    /// Encrypt the local discovery announcement.
    pub fn prepare_discovery(&self) -> Result<Outbound, MeshError> {
        self.prepare(&self.local.to_compact_string(), OutboundKind::Discovery)
    }

    fn prepare(&self, plaintext: &str, kind: OutboundKind) -> Result<Outbound, MeshError> {
        let ciphertext = cipher::encrypt_payload(plaintext, &self.key)?;
        Ok(Outbound {
            message_id: self.message_ids.next_id(),
            kind,
            ciphertext,
        })
    }

    /// Raw advertisement frame from `sender`. Returns an event once a message completes.
    pub fn on_frame(&self, raw: &[u8], sender: SenderAddress) -> Option<MeshEvent> {
        let fragment = match wire::decode_packet(raw) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(%sender, "dropping frame: {e}");
                return None;
            }
        };
        tracing::trace!(
            %sender,
            message_id = fragment.message_id,
            index = fragment.index,
            total = fragment.total,
            "fragment"
        );
        let message_id = fragment.message_id;
        let ciphertext = match self.reassembler.ingest(fragment, sender) {
            Ingest::Complete(bytes) => bytes,
            Ingest::InProgress => return None,
            Ingest::DuplicateFragment | Ingest::AlreadyDelivered => {
                tracing::trace!(%sender, message_id, "duplicate dropped");
                return None;
            }
        };
        match cipher::decrypt_payload(&ciphertext, &self.key) {
            Ok(plaintext) => self.dispatch(&plaintext, sender),
            Err(e) => {
                // Fragments are already freed; the sender has to resend.
                tracing::warn!(%sender, message_id, "reassembled message lost: {e}");
                None
            }
        }
    }

    /// Whole-message datagram. Anything that fails to decrypt is treated as foreign traffic.
    pub fn on_datagram(&self, bytes: &[u8], from: SenderAddress) -> Option<MeshEvent> {
        match cipher::decrypt_payload(bytes, &self.key) {
            Ok(plaintext) => self.dispatch(&plaintext, from),
            Err(e) => {
                tracing::trace!(%from, len = bytes.len(), "ignoring datagram: {e}");
                None
            }
        }
    }

    fn dispatch(&self, plaintext: &str, from: SenderAddress) -> Option<MeshEvent> {
        let payload = match Payload::parse(plaintext) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(%from, "dropping discovery payload: {e}");
                return None;
            }
        };
        match payload {
            Payload::Discovery(info) => {
                if info.device_id == self.local.device_id {
                    tracing::trace!("ignoring own discovery announcement");
                    return None;
                }
                let registration = self.peers.lock().register(info.clone());
                match registration {
                    Registration::Discovered => {
                        tracing::info!(%from, "peer discovered: {info}");
                        Some(MeshEvent::PeerDiscovered(info))
                    }
                    Registration::Updated => {
                        tracing::debug!(%from, "peer updated: {info}");
                        Some(MeshEvent::PeerUpdated(info))
                    }
                }
            }
            Payload::Text { sender, body } => {
                if sender.as_ref() == Some(&self.local.device_id) {
                    tracing::debug!(%from, "ignoring loopback message");
                    return None;
                }
                Some(MeshEvent::Message(ReceivedMessage { sender, text: body }))
            }
        }
    }

    pub fn peer(&self, device_id: &DeviceId) -> Option<PeerRecord> {
        self.peers.lock().get(device_id).cloned()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().all()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),
}
