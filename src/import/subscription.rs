//! Subscription payloads
//!
//! A subscription URL returns one of: a sing-box JSON document with an
//! `outbounds` array, a Clash YAML document with `proxies`, a base64 blob of
//! share links, or share links in plain text.

use super::link::{LinkError, decode_base64, dedupe_tags, new_tunnel, parse_link};
use crate::config::SubscriptionConfig;
use crate::model::{Obfs, Protocol, SubscriptionFormat, Tls, TlsKind, Transport, Tunnel};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Failed to fetch subscription: {0}")]
    FetchFailed(#[from] reqwest::Error),
    #[error("Unsupported subscription format: {0}")]
    UnsupportedFormat(String),
}

/// GET `url` as text with the configured timeout and user agent
pub async fn fetch_text(url: &str, config: &SubscriptionConfig) -> Result<String, reqwest::Error> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()?;

    info!("Fetching {}", url);
    let response = client.get(url).send().await?.error_for_status()?;
    let body = response.text().await?;
    debug!("Fetched {} bytes from {}", body.len(), url);
    Ok(body)
}

pub async fn fetch_subscription(
    url: &str,
    format: SubscriptionFormat,
    config: &SubscriptionConfig,
) -> Result<Vec<Tunnel>, SubscriptionError> {
    let body = fetch_text(url, config).await?;
    parse_subscription(&body, format)
}

fn detect(content: &str) -> SubscriptionFormat {
    if content.starts_with('{') {
        SubscriptionFormat::Singbox
    } else if content.starts_with("proxies:") || content.contains("\nproxies:") {
        SubscriptionFormat::Clash
    } else if content.contains("://") {
        SubscriptionFormat::Links
    } else {
        SubscriptionFormat::Base64
    }
}

/// Parse a subscription body into tunnels with batch-unique tags.
///
/// Entries that cannot be parsed are skipped; a body that yields nothing is
/// an error.
pub fn parse_subscription(
    content: &str,
    format: SubscriptionFormat,
) -> Result<Vec<Tunnel>, SubscriptionError> {
    let content = content.trim_start_matches('\u{feff}').trim();
    let format = match format {
        SubscriptionFormat::Auto => detect(content),
        other => other,
    };
    debug!("Parsing subscription as {:?}", format);

    let mut tunnels = match format {
        SubscriptionFormat::Singbox => {
            let doc: Value = serde_json::from_str(content)
                .map_err(|e| SubscriptionError::UnsupportedFormat(e.to_string()))?;
            from_entries(doc.get("outbounds"), singbox_outbound)
        }
        SubscriptionFormat::Clash => {
            let doc: Value = serde_yaml::from_str(content)
                .map_err(|e| SubscriptionError::UnsupportedFormat(e.to_string()))?;
            from_entries(doc.get("proxies"), clash_proxy)
        }
        SubscriptionFormat::Links => links(content),
        SubscriptionFormat::Base64 | SubscriptionFormat::Auto => {
            let decoded = decode_base64(content)
                .and_then(|b| String::from_utf8(b).ok())
                .ok_or_else(|| {
                    SubscriptionError::UnsupportedFormat("not valid base64".to_string())
                })?;
            links(&decoded)
        }
    };

    if tunnels.is_empty() {
        return Err(SubscriptionError::UnsupportedFormat(
            "no supported entries".to_string(),
        ));
    }
    dedupe_tags(&mut tunnels);
    Ok(tunnels)
}

fn links(text: &str) -> Vec<Tunnel> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match parse_link(line) {
            Ok(t) => Some(t),
            Err(LinkError::UnsupportedScheme(s)) => {
                debug!("Skipping unsupported entry ({})", s);
                None
            }
            Err(e) => {
                warn!("Skipping entry: {}", e);
                None
            }
        })
        .collect()
}

fn from_entries(list: Option<&Value>, convert: fn(&Value) -> Option<Tunnel>) -> Vec<Tunnel> {
    list.and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(convert).collect())
        .unwrap_or_default()
}

fn s<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn owned(v: &Value, key: &str) -> String {
    s(v, key).unwrap_or_default().to_string()
}

fn num(v: &Value, key: &str) -> Option<u64> {
    match v.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn endpoint(v: &Value, port_key: &str) -> Option<(String, u16)> {
    let server = s(v, "server")?.to_string();
    let port = num(v, port_key).and_then(|p| u16::try_from(p).ok())?;
    Some((server, port))
}

fn singbox_outbound(ob: &Value) -> Option<Tunnel> {
    let kind = s(ob, "type")?;
    let (server, port) = endpoint(ob, "server_port")?;

    let protocol = match kind {
        "vless" => Protocol::Vless {
            uuid: s(ob, "uuid")?.to_string(),
            flow: owned(ob, "flow"),
        },
        "vmess" => Protocol::Vmess {
            uuid: s(ob, "uuid")?.to_string(),
            alter_id: num(ob, "alter_id").unwrap_or(0) as u32,
            security: s(ob, "security").unwrap_or("auto").to_string(),
        },
        "shadowsocks" => Protocol::Shadowsocks {
            method: s(ob, "method")?.to_string(),
            password: owned(ob, "password"),
        },
        "trojan" => Protocol::Trojan {
            password: owned(ob, "password"),
        },
        "hysteria2" => Protocol::Hysteria2 {
            password: owned(ob, "password"),
            obfs: ob.get("obfs").and_then(|o| {
                Some(Obfs {
                    kind: s(o, "type")?.to_string(),
                    password: owned(o, "password"),
                })
            }),
            up_mbps: num(ob, "up_mbps").map(|v| v as u32),
            down_mbps: num(ob, "down_mbps").map(|v| v as u32),
        },
        other => {
            debug!("Skipping {} outbound", other);
            return None;
        }
    };

    let tls = ob
        .get("tls")
        .filter(|t| flag(t, "enabled"))
        .map(|t| {
            let reality = t.get("reality").filter(|r| flag(r, "enabled"));
            let fingerprint = t
                .get("utls")
                .map(|u| owned(u, "fingerprint"))
                .unwrap_or_default();
            Tls {
                kind: if reality.is_some() {
                    TlsKind::Reality
                } else {
                    TlsKind::Tls
                },
                server_name: owned(t, "server_name"),
                insecure: flag(t, "insecure"),
                alpn: t
                    .get("alpn")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                fingerprint,
                public_key: reality.map(|r| owned(r, "public_key")).unwrap_or_default(),
                short_id: reality.map(|r| owned(r, "short_id")).unwrap_or_default(),
            }
        });

    let transport = match ob.get("transport") {
        Some(t) => match s(t, "type") {
            Some("ws") => Transport::Ws {
                path: s(t, "path").unwrap_or("/").to_string(),
                host: t
                    .get("headers")
                    .map(|h| owned(h, "Host"))
                    .unwrap_or_default(),
            },
            Some("grpc") => Transport::Grpc {
                service_name: owned(t, "service_name"),
            },
            Some("http") => Transport::Http {
                path: s(t, "path").unwrap_or("/").to_string(),
                host: t
                    .get("host")
                    .and_then(Value::as_array)
                    .and_then(|h| h.first())
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => Transport::Tcp,
        },
        None => Transport::Tcp,
    };

    Some(new_tunnel(owned(ob, "tag"), server, port, protocol, tls, transport))
}

fn clash_proxy(p: &Value) -> Option<Tunnel> {
    let kind = s(p, "type")?.to_ascii_lowercase();
    let (server, port) = endpoint(p, "port")?;

    let protocol = match kind.as_str() {
        "vless" => Protocol::Vless {
            uuid: s(p, "uuid")?.to_string(),
            flow: owned(p, "flow"),
        },
        "vmess" => Protocol::Vmess {
            uuid: s(p, "uuid")?.to_string(),
            alter_id: num(p, "alterId").unwrap_or(0) as u32,
            security: s(p, "cipher").unwrap_or("auto").to_string(),
        },
        "ss" | "shadowsocks" => Protocol::Shadowsocks {
            method: s(p, "cipher")?.to_string(),
            password: owned(p, "password"),
        },
        "trojan" => Protocol::Trojan {
            password: owned(p, "password"),
        },
        "hysteria2" => Protocol::Hysteria2 {
            password: owned(p, "password"),
            obfs: s(p, "obfs").map(|kind| Obfs {
                kind: kind.to_string(),
                password: owned(p, "obfs-password"),
            }),
            up_mbps: None,
            down_mbps: None,
        },
        other => {
            debug!("Skipping {} proxy", other);
            return None;
        }
    };

    let server_name = s(p, "sni")
        .or_else(|| s(p, "servername"))
        .unwrap_or_default()
        .to_string();
    let tls = if let Some(reality) = p.get("reality-opts") {
        Some(Tls {
            kind: TlsKind::Reality,
            server_name,
            fingerprint: s(p, "client-fingerprint").unwrap_or("chrome").to_string(),
            public_key: owned(reality, "public-key"),
            short_id: owned(reality, "short-id"),
            ..Tls::default()
        })
    } else if flag(p, "tls") || matches!(kind.as_str(), "trojan" | "hysteria2") {
        Some(Tls {
            server_name,
            insecure: flag(p, "skip-cert-verify"),
            ..Tls::default()
        })
    } else {
        None
    };

    let transport = match s(p, "network") {
        Some("ws") => {
            let opts = p.get("ws-opts");
            Transport::Ws {
                path: opts.and_then(|o| s(o, "path")).unwrap_or("/").to_string(),
                host: opts
                    .and_then(|o| o.get("headers"))
                    .map(|h| owned(h, "Host"))
                    .unwrap_or_default(),
            }
        }
        Some("grpc") => Transport::Grpc {
            service_name: p
                .get("grpc-opts")
                .map(|o| owned(o, "grpc-service-name"))
                .unwrap_or_default(),
        },
        _ => Transport::Tcp,
    };

    Some(new_tunnel(owned(p, "name"), server, port, protocol, tls, transport))
}
