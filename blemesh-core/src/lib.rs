//! BLE mesh chat packet transport.
//! Host-driven: no I/O; host passes received frames and broadcasts prepared payloads.

pub mod cipher;
pub mod core;
pub mod fragment;
pub mod identity;
pub mod peers;
pub mod protocol;
pub mod reassembly;
pub mod wire;

pub use cipher::{decrypt_payload, encrypt_payload, CipherError, DEFAULT_KEY};
pub use crate::core::{MeshCore, MeshError, MeshEvent, Outbound, OutboundKind, ReceivedMessage};
pub use fragment::{
    fragment_payload, FragmentError, MessageIdCounter, EXTENDED_FRAGMENT_SIZE,
    LEGACY_FRAGMENT_SIZE,
};
pub use identity::{DeviceId, DeviceInfo, IdentityProvider};
pub use peers::{PeerRecord, PeerRegistry, Registration};
pub use reassembly::{Ingest, Reassembler, SenderAddress};
pub use wire::{decode_packet, encode_packet, Fragment, PacketDecodeError};
