//! Advertisement radio boundary. Powering the adapter is the platform's job; the
//! transport only starts/stops one advertisement and consumes scanned frames.

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod simulated;

use async_trait::async_trait;
use tokio::sync::mpsc;

use blemesh_core::{EXTENDED_FRAGMENT_SIZE, LEGACY_FRAGMENT_SIZE};

#[cfg(feature = "bluez")]
pub use bluez::BluezRadio;
pub use simulated::{SharedAir, SimulatedRadio};

/// Manufacturer-specific advertisement data as seen on air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// 48-bit hardware address of the advertiser.
    pub address: u64,
    pub company_id: u16,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait AdvertisingRadio: Send + Sync {
    /// Radio present and powered on. When false the wireless transport is not used.
    async fn is_powered(&self) -> bool;
    /// Occupy the single advertisement slot with `data` under `company_id`.
    async fn start_advertising(&self, company_id: u16, data: &[u8]) -> Result<(), RadioError>;
    /// Withdraw the current advertisement. No-op when idle.
    async fn stop_advertising(&self) -> Result<(), RadioError>;
    /// Begin scanning; every received advertisement is pushed into `sink`.
    async fn start_scan(
        &self,
        sink: mpsc::UnboundedSender<Advertisement>,
    ) -> Result<(), RadioError>;
    async fn stop_scan(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("radio is powered off")]
    PoweredOff,
    #[error("advertisement data too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("radio rejected request: {0}")]
    Rejected(String),
}

/// Largest advertisement payload for the chosen mode (header + chunk).
pub fn max_advertisement_len(extended: bool) -> usize {
    let chunk = if extended {
        EXTENDED_FRAGMENT_SIZE
    } else {
        LEGACY_FRAGMENT_SIZE
    };
    blemesh_core::wire::HEADER_LEN + chunk
}

/// Pack a 6-byte hardware address, most significant byte first.
pub fn address_to_u64(bytes: [u8; 6]) -> u64 {
    let mut wide = [0u8; 8];
    wide[2..].copy_from_slice(&bytes);
    u64::from_be_bytes(wide)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blemesh_core::SenderAddress;

    #[test]
    fn address_packing_matches_display() {
        let packed = address_to_u64([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(packed, 0x0000_AABB_CCDD_EEFF);
        assert_eq!(SenderAddress::Radio(packed).to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn advertisement_limits() {
        assert_eq!(max_advertisement_len(false), 24);
        assert_eq!(max_advertisement_len(true), 243);
    }
}
