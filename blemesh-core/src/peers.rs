//! Peer registry: devices learned from discovery payloads, keyed by device id.

use std::collections::HashMap;
use std::time::Instant;

use crate::identity::{DeviceId, DeviceInfo};

/// Registry entry.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub info: DeviceInfo,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// Outcome of registering an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Discovered,
    Updated,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<DeviceId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Insert a new peer or replace a known peer's info in place and bump `last_seen`.
    pub fn register(&mut self, info: DeviceInfo) -> Registration {
        let now = Instant::now();
        match self.peers.get_mut(&info.device_id) {
            Some(record) => {
                record.info = info;
                record.last_seen = now;
                Registration::Updated
            }
            None => {
                self.peers.insert(
                    info.device_id.clone(),
                    PeerRecord {
                        info,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                Registration::Discovered
            }
        }
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&PeerRecord> {
        self.peers.get(device_id)
    }

    /// All peers, sorted by device id.
    pub fn all(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = self.peers.values().cloned().collect();
        out.sort_by(|a, b| a.info.device_id.cmp(&b.info.device_id));
        out
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
