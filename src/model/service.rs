//! Services: named bundles of domains and networks routed together

use crate::normalize::{merge_domains, merge_networks};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a remote source list is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Netmask format if any `route add` line is present, plain CIDRs otherwise
    #[default]
    Auto,
    /// One address or CIDR per line
    Plain,
    /// `route add <ip> mask <netmask> <gw>` lines
    Netmask,
    /// One domain per line
    Domains,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceList {
    pub url: String,
    #[serde(default)]
    pub format: SourceFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    /// From bundled or downloaded source lists; not edited by the user
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ips: Vec<IpNet>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub custom_ips: Vec<IpNet>,
    /// Ranges routed whenever the service is enabled, even if no resolved
    /// domain points at them (shared CDN space, hijacked DNS answers)
    #[serde(default)]
    pub extra_ranges: Vec<IpNet>,
    #[serde(default)]
    pub sources: Vec<SourceList>,
    #[serde(default)]
    pub enabled: bool,
    /// User-defined, may be deleted
    #[serde(default)]
    pub custom: bool,
}

impl Service {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: String::new(),
            domains: Vec::new(),
            ips: Vec::new(),
            custom_domains: Vec::new(),
            custom_ips: Vec::new(),
            extra_ranges: Vec::new(),
            sources: Vec::new(),
            enabled: false,
            custom: false,
        }
    }

    /// `domains ∪ custom_domains`, normalised
    pub fn effective_domains(&self) -> BTreeSet<String> {
        merge_domains([self.domains.as_slice(), self.custom_domains.as_slice()])
    }

    /// `ips ∪ custom_ips`, normalised
    pub fn effective_networks(&self) -> BTreeSet<IpNet> {
        merge_networks([self.ips.as_slice(), self.custom_ips.as_slice()])
    }

    /// Everything that goes into the network set while this service is enabled
    pub fn routed_networks(&self) -> BTreeSet<IpNet> {
        merge_networks([
            self.ips.as_slice(),
            self.custom_ips.as_slice(),
            self.extra_ranges.as_slice(),
        ])
    }
}

#[derive(Debug, Deserialize)]
struct Catalog {
    services: Vec<Service>,
}

const BUNDLED_CATALOG: &str = include_str!("catalog.toml");

/// Services shipped with the binary, used to seed an empty store
pub fn bundled_services() -> Result<Vec<Service>, toml::de::Error> {
    let catalog: Catalog = toml::from_str(BUNDLED_CATALOG)?;
    Ok(catalog.services)
}
