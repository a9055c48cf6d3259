//! Local identity collection on Linux.

use std::fs;
use std::net::{IpAddr, UdpSocket};
use std::path::Path;
use std::time::SystemTime;

use blemesh_core::{DeviceId, DeviceInfo, IdentityProvider};

/// Reads identity from /etc, /sys and the environment.
pub struct LinuxIdentity;

impl IdentityProvider for LinuxIdentity {
    fn collect(&self) -> DeviceInfo {
        let mac_address = mac_address().unwrap_or_default();
        let machine_name = hostname();
        let device_id = DeviceId::from_hardware(&[
            read_trimmed("/sys/class/dmi/id/board_serial").unwrap_or_default(),
            read_trimmed("/sys/class/dmi/id/product_uuid").unwrap_or_default(),
            mac_address.clone(),
        ])
        .or_else(|| {
            let home = std::env::var("HOME").unwrap_or_default();
            let seed = format!("{machine_name}{home}");
            (!machine_name.is_empty()).then(|| DeviceId::from_seed(&seed))
        })
        .unwrap_or_else(DeviceId::random);

        DeviceInfo {
            device_id,
            machine_name,
            user_name: std::env::var("USER").unwrap_or_default(),
            platform: platform(),
            mac_address,
            ip_addresses: ipv4_addresses(),
            os_version: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
            processor_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            collected_at: SystemTime::now(),
        }
    }
}

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    let s = fs::read_to_string(path).ok()?;
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn hostname() -> String {
    read_trimmed("/proc/sys/kernel/hostname")
        .or_else(|| read_trimmed("/etc/hostname"))
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default()
}

fn platform() -> String {
    read_trimmed("/etc/os-release")
        .and_then(|s| {
            s.lines()
                .find_map(|l| l.strip_prefix("PRETTY_NAME="))
                .map(|v| v.trim_matches('"').to_string())
        })
        .unwrap_or_else(|| "Linux".to_string())
}

/// First non-loopback interface that is up, formatted `AA-BB-CC-DD-EE-FF`.
fn mac_address() -> Option<String> {
    let mut names: Vec<_> = fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    names.into_iter().find_map(|name| {
        let base = Path::new("/sys/class/net").join(&name);
        if read_trimmed(base.join("operstate")).as_deref() != Some("up") {
            return None;
        }
        let mac = read_trimmed(base.join("address"))?;
        (mac != "00:00:00:00:00:00").then(|| mac.to_ascii_uppercase().replace(':', "-"))
    })
}

/// The IPv4 address the default route would use. Connecting a UDP socket sends nothing.
fn ipv4_addresses() -> Vec<String> {
    let probe = UdpSocket::bind(("0.0.0.0", 0)).and_then(|s| {
        s.connect(("192.0.2.1", 9))?;
        s.local_addr()
    });
    match probe {
        Ok(addr) if matches!(addr.ip(), IpAddr::V4(ip) if !ip.is_unspecified()) => {
            vec![addr.ip().to_string()]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_usable_identity() {
        let info = LinuxIdentity.collect();
        assert_eq!(info.device_id.as_str().len(), 16);
        assert!(!info.platform.is_empty());
        assert!(info.processor_count >= 1);
        // Compact form must stay parseable: no separators inside fields we control.
        assert!(!info.device_id.as_str().contains('|'));
    }

    #[test]
    fn stable_across_calls() {
        assert_eq!(LinuxIdentity.collect().device_id, LinuxIdentity.collect().device_id);
    }
}
