//! Configuration handling for splitroute

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[source] std::io::Error),
    #[error("Failed to write config file: {0}")]
    WriteError(#[source] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// System-wide config location checked before the per-user one
pub const SYSTEM_CONFIG_PATH: &str = "/etc/splitroute/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub firewall: FirewallConfig,
    pub resolver: ResolverConfig,
    pub client: ClientConfig,
    pub health: HealthConfig,
    pub subscriptions: SubscriptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    /// dnsmasq DHCP lease file used for device discovery
    pub leases_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/opt/splitroute/data"),
            leases_file: PathBuf::from("/tmp/dhcp.leases"),
        }
    }
}

/// nftables objects managed by the applier.
///
/// The table, sets and chains are created on first apply if missing; after
/// that only their contents are rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub nft: String,
    pub family: String,
    pub table: String,
    /// Static CIDRs from enabled services (IPv4)
    pub network_set: String,
    pub network_set6: String,
    /// Filled at resolve time by dnsmasq
    pub domain_set: String,
    pub domain_set6: String,
    /// Base chain hooked at prerouting
    pub prerouting_chain: String,
    /// Chain jumped to before the global marking rule
    pub device_chain: String,
    pub mark: String,
    /// Policy routing table that sends marked traffic into the tunnel
    pub route_table: u32,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            nft: "nft".to_string(),
            family: "inet".to_string(),
            table: "splitroute".to_string(),
            network_set: "tunnel_nets".to_string(),
            network_set6: "tunnel_nets6".to_string(),
            domain_set: "tunnel_ips".to_string(),
            domain_set6: "tunnel_ips6".to_string(),
            prerouting_chain: "prerouting".to_string(),
            device_chain: "devices".to_string(),
            mark: "0x100".to_string(),
            route_table: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub config_path: PathBuf,
    pub reload_command: Vec<String>,
    /// Domains answered with `::` so clients fall back to IPv4 through the tunnel
    pub block_ipv6_domains: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/tmp/dnsmasq.d/splitroute.conf"),
            reload_command: vec!["/etc/init.d/dnsmasq".to_string(), "restart".to_string()],
            block_ipv6_domains: vec![
                "googlevideo.com".to_string(),
                "youtube.com".to_string(),
                "ytimg.com".to_string(),
                "ggpht.com".to_string(),
            ],
        }
    }
}

/// The VPN client process that consumes the rendered outbound config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub config_path: PathBuf,
    pub restart_command: Vec<String>,
    pub tun_interface: String,
    pub tun_address: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/sing-box/config.json"),
            restart_command: vec!["/etc/init.d/sing-box".to_string(), "restart".to_string()],
            tun_interface: "tun1".to_string(),
            tun_address: "10.0.0.1/30".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_timeout_ms: u64,
    pub batch_timeout_ms: u64,
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3000,
            batch_timeout_ms: 10_000,
            interval_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    pub auto_update_hours: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            user_agent: concat!("splitroute/", env!("CARGO_PKG_VERSION")).to_string(),
            auto_update_hours: 24,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::WriteError)?;
        }
        std::fs::write(path, content).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Resolve the config file to use when none is given on the command line.
    ///
    /// Returns the system path if it exists, otherwise the per-user path if it
    /// exists, otherwise `None` (built-in defaults apply).
    pub fn discover() -> Option<PathBuf> {
        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Some(system);
        }
        Self::user_path().filter(|p| p.exists())
    }

    pub fn user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("splitroute").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::default();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.firewall.table, "splitroute");
        assert_eq!(loaded.health.probe_timeout_ms, 3000);
        assert_eq!(
            loaded.resolver.reload_command,
            vec!["/etc/init.d/dnsmasq", "restart"]
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[firewall]\ntable = \"custom\"\n\n[health]\nprobe_timeout_ms = 1500\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.firewall.table, "custom");
        assert_eq!(config.firewall.network_set, "tunnel_nets");
        assert_eq!(config.health.probe_timeout(), Duration::from_millis(1500));
        assert_eq!(config.health.batch_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/splitroute.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[firewall\ntable = ").unwrap();

        let result = Config::load(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
