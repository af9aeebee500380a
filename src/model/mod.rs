//! Declarative routing model
//!
//! Everything the operator edits lives here. The compiler turns a snapshot of
//! these types into a [`RuleSet`](crate::compiler::RuleSet); nothing in this
//! module talks to the system.

pub mod device;
pub mod service;
pub mod tunnel;

pub use device::{Device, DeviceMode};
pub use service::{Service, SourceFormat, SourceList, bundled_services};
pub use tunnel::{
    Group, GroupPolicy, Latency, Obfs, Protocol, Subscription, SubscriptionFormat, Tls, TlsKind,
    Transport, Tunnel,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Route key for the "everything" pseudo-service used by `vpn_all` devices
pub const ALL_SERVICES: &str = "all";

/// Per-service outbound overrides plus the default outbound
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Routes {
    /// service id (or [`ALL_SERVICES`]) -> tunnel or group tag
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    /// Tunnel or group used when no override applies
    #[serde(default)]
    pub active: Option<String>,
}

impl Routes {
    /// Outbound for a service: its override, else the active outbound
    pub fn resolve(&self, service_id: &str) -> Option<&str> {
        self.overrides
            .get(service_id)
            .map(String::as_str)
            .or(self.active.as_deref())
    }

    /// Drop every reference to an outbound that no longer exists
    pub fn forget_outbound(&mut self, tag: &str) {
        self.overrides.retain(|_, outbound| outbound != tag);
        if self.active.as_deref() == Some(tag) {
            self.active = None;
        }
    }
}

/// Outcome of the last apply, persisted for status queries
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplyStatus {
    #[serde(default)]
    pub last_applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub networks: usize,
    #[serde(default)]
    pub domains: usize,
    #[serde(default)]
    pub device_rules: usize,
    #[serde(default)]
    pub skipped_networks: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Rule tags of devices whose firewall objects are currently installed
    #[serde(default)]
    pub installed_devices: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_resolve_falls_back_to_active() {
        let mut routes = Routes::default();
        assert_eq!(routes.resolve("youtube"), None);

        routes.active = Some("main".to_string());
        assert_eq!(routes.resolve("youtube"), Some("main"));

        routes
            .overrides
            .insert("youtube".to_string(), "fast".to_string());
        assert_eq!(routes.resolve("youtube"), Some("fast"));
        assert_eq!(routes.resolve("discord"), Some("main"));
    }

    #[test]
    fn test_forget_outbound() {
        let mut routes = Routes {
            overrides: BTreeMap::from([
                ("a".to_string(), "t1".to_string()),
                ("b".to_string(), "t2".to_string()),
            ]),
            active: Some("t1".to_string()),
        };
        routes.forget_outbound("t1");
        assert_eq!(routes.overrides.len(), 1);
        assert_eq!(routes.active, None);
    }
}
