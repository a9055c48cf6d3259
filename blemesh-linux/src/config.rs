//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Which advertisement radio to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioKind {
    /// No radio; network broadcast only.
    None,
    /// In-process simulated air. The node hears its own advertisements.
    Simulated,
    /// BlueZ adapter over D-Bus (`bluez` feature).
    Bluez,
}

impl std::str::FromStr for RadioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(RadioKind::None),
            "simulated" => Ok(RadioKind::Simulated),
            "bluez" => Ok(RadioKind::Bluez),
            other => Err(format!("unknown radio kind: {other}")),
        }
    }
}

/// Daemon configuration. File: ~/.config/blemesh/config.toml or /etc/blemesh/config.toml.
/// Env overrides: BLEMESH_UDP_PORT, BLEMESH_COMPANY_ID, BLEMESH_RADIO, BLEMESH_ADAPTER,
/// BLEMESH_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_true")]
    pub udp_enabled: bool,
    /// Broadcast port, bound and sent to (default 12345).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
    #[serde(default = "default_radio")]
    pub radio: RadioKind,
    /// BlueZ adapter name, e.g. "hci0". Default adapter when unset.
    #[serde(default)]
    pub adapter: Option<String>,
    /// Manufacturer id carried in every advertisement (default 0x1234).
    #[serde(default = "default_company_id")]
    pub company_id: u16,
    /// 240-byte fragments when true, 21-byte legacy fragments otherwise.
    #[serde(default = "default_true")]
    pub extended_advertising: bool,
    #[serde(default = "default_dwell_ms")]
    pub dwell_ms: u64,
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    #[serde(default = "default_discovery_dwell_ms")]
    pub discovery_dwell_ms: u64,
    #[serde(default = "default_discovery_repetitions")]
    pub discovery_repetitions: u32,
    /// Delay between start and the first identity announcement.
    #[serde(default = "default_discovery_delay_ms")]
    pub discovery_delay_ms: u64,
    /// tracing filter directive, e.g. "blemesh_core=debug".
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_udp_port() -> u16 {
    12345
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_radio() -> RadioKind {
    if cfg!(feature = "bluez") {
        RadioKind::Bluez
    } else {
        RadioKind::None
    }
}
fn default_company_id() -> u16 {
    0x1234
}
fn default_dwell_ms() -> u64 {
    200
}
fn default_repetitions() -> u32 {
    3
}
fn default_discovery_dwell_ms() -> u64 {
    150
}
fn default_discovery_repetitions() -> u32 {
    5
}
fn default_discovery_delay_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_enabled: default_true(),
            udp_port: default_udp_port(),
            broadcast_addr: default_broadcast_addr(),
            radio: default_radio(),
            adapter: None,
            company_id: default_company_id(),
            extended_advertising: default_true(),
            dwell_ms: default_dwell_ms(),
            repetitions: default_repetitions(),
            discovery_dwell_ms: default_discovery_dwell_ms(),
            discovery_repetitions: default_discovery_repetitions(),
            discovery_delay_ms: default_discovery_delay_ms(),
            log_level: None,
        }
    }
}

impl Config {
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn discovery_dwell(&self) -> Duration {
        Duration::from_millis(self.discovery_dwell_ms)
    }

    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_delay_ms)
    }

    /// Apply env overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(p) = get("BLEMESH_UDP_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.udp_port = p;
        }
        if let Some(id) = get("BLEMESH_COMPANY_ID").and_then(|s| parse_u16(&s)) {
            self.company_id = id;
        }
        if let Some(r) = get("BLEMESH_RADIO").and_then(|s| s.parse::<RadioKind>().ok()) {
            self.radio = r;
        }
        if let Some(a) = get("BLEMESH_ADAPTER") {
            self.adapter = Some(a);
        }
        if let Some(l) = get("BLEMESH_LOG") {
            self.log_level = Some(l);
        }
    }
}

/// Decimal or 0x-prefixed hex.
fn parse_u16(s: &str) -> Option<u16> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/blemesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/blemesh/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!("invalid config {}, using defaults: {e}", p.display()),
                },
                Err(e) => tracing::warn!("cannot read config {}, using defaults: {e}", p.display()),
            }
            break;
        }
    }
    None
}
