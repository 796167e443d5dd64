//! Host identity discovery
//!
//! Collects the static facts reported as the `system-info` metric and sent
//! with a registration request:
//! - Hostname, OS, kernel and architecture
//! - Network interfaces with their addresses
//! - Primary MAC address, chosen Ethernet first, then wireless, then anything

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: Option<String>,
    pub addresses: Vec<String>,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub os: String,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub architecture: String,
    pub cpu_count: usize,
    pub primary_mac: Option<String>,
    pub interfaces: Vec<NetworkInterface>,
}

impl HostIdentity {
    /// Discover identity of the running host. Blocking.
    pub fn discover() -> Result<Self> {
        let interfaces = discover_interfaces().context("Failed to enumerate network interfaces")?;
        let primary_mac = select_primary_mac(&interfaces);

        let identity = HostIdentity {
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            os: std::env::consts::OS.to_string(),
            os_version: System::long_os_version(),
            kernel_version: System::kernel_version(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            primary_mac,
            interfaces,
        };
        debug!(
            "Host identity: {} ({} {}), primary MAC {:?}",
            identity.hostname, identity.os, identity.architecture, identity.primary_mac
        );
        Ok(identity)
    }
}

fn format_mac(bytes: [u8; 6]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

fn discover_interfaces() -> Result<Vec<NetworkInterface>> {
    let mut interfaces: Vec<NetworkInterface> = Vec::new();

    for if_addr in get_if_addrs()? {
        let address = match if_addr.addr {
            IfAddr::V4(ref v4) => v4.ip.to_string(),
            IfAddr::V6(ref v6) => v6.ip.to_string(),
        };

        // One entry per interface, several addresses each
        if let Some(existing) = interfaces.iter_mut().find(|i| i.name == if_addr.name) {
            existing.addresses.push(address);
            continue;
        }

        let interface_type = if if_addr.is_loopback() {
            InterfaceType::Loopback
        } else {
            classify_interface(&if_addr.name)
        };
        let mac = match mac_address::mac_address_by_name(&if_addr.name) {
            Ok(mac) => mac.map(|m| format_mac(m.bytes())),
            Err(e) => {
                debug!("Error getting MAC for {}: {}", if_addr.name, e);
                None
            }
        };

        interfaces.push(NetworkInterface {
            name: if_addr.name.clone(),
            mac,
            addresses: vec![address],
            interface_type,
        });
    }
    Ok(interfaces)
}

fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();

    if name == "lo" || name.starts_with("lo0") {
        return InterfaceType::Loopback;
    }
    if ["wlan", "wlp", "wlo", "wifi"].iter().any(|p| name.contains(p)) {
        return InterfaceType::Wireless;
    }
    if ["eth", "en", "eno", "ens", "enp"].iter().any(|p| name.starts_with(p)) {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

fn select_primary_mac(interfaces: &[NetworkInterface]) -> Option<String> {
    let with_mac = |kind: InterfaceType| {
        interfaces
            .iter()
            .filter(move |i| i.interface_type == kind)
            .find_map(|i| i.mac.clone().filter(|m| m != "00:00:00:00:00:00"))
    };

    with_mac(InterfaceType::Ethernet)
        .or_else(|| with_mac(InterfaceType::Wireless))
        .or_else(|| with_mac(InterfaceType::Other))
}
