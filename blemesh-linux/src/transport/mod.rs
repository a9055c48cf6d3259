//! Broadcast transports: wireless advertisement and network broadcast.

pub mod advertisement;
pub mod udp;

use std::sync::Arc;

use async_trait::async_trait;
use blemesh_core::{FragmentError, MeshCore, MeshEvent, Outbound, SenderAddress};
use tokio::sync::mpsc;

use crate::radio::RadioError;

pub use advertisement::{AdvertisementConfig, AdvertisementTransport};
pub use udp::{UdpConfig, UdpTransport};

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    /// Begin receiving. Completed messages go to `inbound`.
    async fn start(&self, inbound: Inbound) -> Result<(), TransportError>;
    /// Broadcast one prepared payload. Resolves when the transport is done with it.
    async fn send(&self, outbound: &Outbound) -> Result<(), TransportError>;
    /// Safe while a send or the receive loop is in flight.
    async fn stop(&self);
}

/// Where transports hand received bytes. Decoding runs on the caller's context; only the
/// resulting events cross to the coordinator's dispatcher.
#[derive(Clone)]
pub struct Inbound {
    core: Arc<MeshCore>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl Inbound {
    pub fn new(core: Arc<MeshCore>, events: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self { core, events }
    }

    /// One fragment frame (advertisement data).
    pub fn frame(&self, raw: &[u8], sender: SenderAddress) {
        if let Some(event) = self.core.on_frame(raw, sender) {
            let _ = self.events.send(event);
        }
    }

    /// One whole-message datagram.
    pub fn datagram(&self, bytes: &[u8], from: SenderAddress) {
        if let Some(event) = self.core.on_datagram(bytes, from) {
            let _ = self.events.send(event);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error("radio: {0}")]
    Radio(#[from] RadioError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport not started")]
    NotStarted,
    #[error("transport stopped")]
    Stopped,
}
