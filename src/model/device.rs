//! LAN devices with per-device routing modes

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    /// Subject only to the global domain/network rules
    #[default]
    Default,
    /// Everything from this device goes through the tunnel
    VpnAll,
    /// Nothing from this device goes through the tunnel
    DirectAll,
    /// Only the selected services go through the tunnel
    Custom,
}

impl std::str::FromStr for DeviceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(DeviceMode::Default),
            "vpn_all" | "vpn-all" => Ok(DeviceMode::VpnAll),
            "direct_all" | "direct-all" => Ok(DeviceMode::DirectAll),
            "custom" => Ok(DeviceMode::Custom),
            other => Err(format!("unknown device mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Lower-case, colon separated
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub mode: DeviceMode,
    #[serde(default)]
    pub enabled: bool,
    /// Service ids routed through the tunnel when `mode` is `Custom`
    #[serde(default)]
    pub services: Vec<String>,
}

impl Device {
    /// Stable identifier attached to every firewall object installed for this
    /// device. Restricted to characters nft accepts in set names.
    pub fn rule_tag(&self) -> String {
        device_rule_tag(&self.id)
    }

    /// True if `other` claims the same ip or mac as this device
    pub fn shares_identity(&self, ip: Option<IpAddr>, mac: Option<&str>) -> bool {
        let ip_match = matches!((self.ip, ip), (Some(a), Some(b)) if a == b);
        let mac_match = matches!((self.mac.as_deref(), mac), (Some(a), Some(b)) if a == b);
        ip_match || mac_match
    }
}

pub fn device_rule_tag(device_id: &str) -> String {
    let cleaned: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("dev_{}", cleaned)
}
