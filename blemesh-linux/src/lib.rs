//! Linux host for the BLE mesh chat: transports, coordinator, config and identity.

pub mod config;
pub mod host;
pub mod logging;
pub mod mesh;
pub mod radio;
pub mod transport;

pub use config::{Config, RadioKind};
pub use mesh::{CoordinatorError, Mesh, PeerChange, SendReport};
