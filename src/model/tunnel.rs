//! Tunnels, tunnel groups and subscriptions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last measured round trip to a tunnel endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Latency {
    #[default]
    Unknown,
    Millis(u32),
    Unreachable,
}

impl Latency {
    pub fn millis(&self) -> Option<u32> {
        match self {
            Latency::Millis(ms) => Some(*ms),
            _ => None,
        }
    }
}

impl std::fmt::Display for Latency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Latency::Unknown => write!(f, "-"),
            Latency::Millis(ms) => write!(f, "{}ms", ms),
            Latency::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obfs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub password: String,
}

/// Protocol family plus the credentials it needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Protocol {
    Vless {
        uuid: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        flow: String,
    },
    Vmess {
        uuid: String,
        #[serde(default)]
        alter_id: u32,
        #[serde(default = "default_vmess_security")]
        security: String,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
    Trojan {
        password: String,
    },
    Hysteria2 {
        #[serde(default)]
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        obfs: Option<Obfs>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_mbps: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        down_mbps: Option<u32>,
    },
}

fn default_vmess_security() -> String {
    "auto".to_string()
}

impl Protocol {
    pub fn kind(&self) -> &'static str {
        match self {
            Protocol::Vless { .. } => "vless",
            Protocol::Vmess { .. } => "vmess",
            Protocol::Shadowsocks { .. } => "shadowsocks",
            Protocol::Trojan { .. } => "trojan",
            Protocol::Hysteria2 { .. } => "hysteria2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsKind {
    #[default]
    Tls,
    Reality,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tls {
    #[serde(default)]
    pub kind: TlsKind,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Ws {
        path: String,
        #[serde(default)]
        host: String,
    },
    Grpc {
        service_name: String,
    },
    Http {
        path: String,
        #[serde(default)]
        host: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    /// Unique outbound tag
    pub tag: String,
    #[serde(default)]
    pub name: String,
    pub server: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub tls: Option<Tls>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub latency: Latency,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Tunnel {
    pub fn kind(&self) -> &'static str {
        self.protocol.kind()
    }

    /// Replace everything describing how to reach the endpoint, keeping
    /// health data and identity.
    pub fn update_connection(&mut self, other: Tunnel) {
        self.name = other.name;
        self.server = other.server;
        self.port = other.port;
        self.protocol = other.protocol;
        self.tls = other.tls;
        self.transport = other.transport;
        if other.subscription_id.is_some() {
            self.subscription_id = other.subscription_id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Lowest measured latency wins
    #[default]
    Auto,
    /// Selection changes only on explicit request
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub tag: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub policy: GroupPolicy,
    #[serde(default)]
    pub selected: Option<String>,
    /// Set when the last health batch found no reachable member
    #[serde(default)]
    pub degraded: bool,
}

impl Group {
    pub fn new(tag: impl Into<String>, members: Vec<String>, policy: GroupPolicy) -> Self {
        let selected = match policy {
            GroupPolicy::Manual => members.first().cloned(),
            GroupPolicy::Auto => None,
        };
        Self {
            tag: tag.into(),
            members,
            policy,
            selected,
            degraded: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionFormat {
    #[default]
    Auto,
    Base64,
    Singbox,
    Clash,
    Links,
}

impl std::str::FromStr for SubscriptionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(SubscriptionFormat::Auto),
            "base64" => Ok(SubscriptionFormat::Base64),
            "singbox" | "sing-box" => Ok(SubscriptionFormat::Singbox),
            "clash" => Ok(SubscriptionFormat::Clash),
            "links" => Ok(SubscriptionFormat::Links),
            other => Err(format!("unknown subscription format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub format: SubscriptionFormat,
    #[serde(default)]
    pub node_count: usize,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub auto_update: bool,
}
