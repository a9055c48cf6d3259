//! Device identity: stable device id, local device info, compact discovery format.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Marker that opens every discovery payload.
pub const DISCOVERY_MARKER: &str = "DEV|";
/// Field separator in discovery and text payloads.
pub const FIELD_SEPARATOR: char = '|';

const DEVICE_ID_BYTES: usize = 8;

/// Short uppercase hex identifier, stable across restarts when hardware ids are available.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an id received from a peer. No format check: peers own their ids.
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    /// Derive from hardware identifiers (board serial, BIOS serial, MAC, ...).
    /// Returns None when all identifiers are empty.
    pub fn from_hardware<S: AsRef<str>>(identifiers: &[S]) -> Option<Self> {
        let joined: String = identifiers.iter().map(AsRef::as_ref).collect();
        if joined.is_empty() {
            return None;
        }
        Some(Self::from_seed(&joined))
    }

    /// Hash an arbitrary seed: SHA-256, first 8 bytes as 16 uppercase hex chars.
    pub fn from_seed(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        DeviceId(hex::encode_upper(&digest[..DEVICE_ID_BYTES]))
    }

    /// Last-resort id from a random UUID. Not stable across restarts.
    pub fn random() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        DeviceId(uuid[..DEVICE_ID_BYTES * 2].to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a device. Only the fields in the compact format travel on the wire;
/// `os_version`, `processor_count` and `collected_at` are local-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub machine_name: String,
    pub user_name: String,
    pub platform: String,
    pub mac_address: String,
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub processor_count: usize,
    pub collected_at: SystemTime,
}

impl DeviceInfo {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            machine_name: String::new(),
            user_name: String::new(),
            platform: String::new(),
            mac_address: String::new(),
            ip_addresses: Vec::new(),
            os_version: String::new(),
            processor_count: 0,
            collected_at: SystemTime::now(),
        }
    }

    /// `DEV|id|machine|user|platform|mac|ip1,ip2`
    pub fn to_compact_string(&self) -> String {
        format!(
            "{DISCOVERY_MARKER}{}|{}|{}|{}|{}|{}",
            self.device_id,
            self.machine_name,
            self.user_name,
            self.platform,
            self.mac_address,
            self.ip_addresses.join(",")
        )
    }

    /// Parse the compact format. A missing trailing IP segment means no addresses.
    pub fn from_compact_string(compact: &str) -> Result<Self, IdentityError> {
        let rest = compact
            .strip_prefix(DISCOVERY_MARKER)
            .ok_or(IdentityError::MissingMarker)?;
        let parts: Vec<&str> = rest.split(FIELD_SEPARATOR).collect();
        if parts.len() < 5 {
            return Err(IdentityError::MissingFields(parts.len()));
        }
        let ip_addresses = match parts.get(5) {
            Some(ips) if !ips.is_empty() => ips.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            machine_name: parts[1].to_string(),
            user_name: parts[2].to_string(),
            platform: parts[3].to_string(),
            mac_address: parts[4].to_string(),
            ip_addresses,
            ..Self::new(DeviceId::new(parts[0]))
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({}) - {}",
            self.device_id, self.machine_name, self.user_name, self.platform
        )
    }
}

/// Source of the local device's identity. One adapter per host platform.
pub trait IdentityProvider {
    fn collect(&self) -> DeviceInfo;
}

/// Fixed identity, for hosts that collect it elsewhere and for tests.
impl IdentityProvider for DeviceInfo {
    fn collect(&self) -> DeviceInfo {
        self.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("missing discovery marker")]
    MissingMarker,
    #[error("discovery payload has {0} fields, need at least 5")]
    MissingFields(usize),
}
