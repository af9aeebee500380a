//! VPN client configuration
//!
//! The client is a black box that reads one JSON document: a tun inbound, one
//! outbound per enabled tunnel, a `selector` outbound per group, and
//! route rules that pick an outbound for marked traffic arriving on the tun.

use crate::compiler::{DeviceMatch, RuleAction, RuleSet};
use crate::config::ClientConfig;
use crate::model::{Group, GroupPolicy, Protocol, TlsKind, Transport, Tunnel};
use ipnet::IpNet;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const DIRECT_TAG: &str = "direct-out";
const TUN_INBOUND_TAG: &str = "tun-in";

fn tunnel_outbound(tunnel: &Tunnel) -> Value {
    let mut out = Map::new();
    out.insert("type".into(), json!(tunnel.kind()));
    out.insert("tag".into(), json!(tunnel.tag));
    out.insert("server".into(), json!(tunnel.server));
    out.insert("server_port".into(), json!(tunnel.port));

    match &tunnel.protocol {
        Protocol::Vless { uuid, flow } => {
            out.insert("uuid".into(), json!(uuid));
            if !flow.is_empty() {
                out.insert("flow".into(), json!(flow));
            }
        }
        Protocol::Vmess {
            uuid,
            alter_id,
            security,
        } => {
            out.insert("uuid".into(), json!(uuid));
            out.insert("alter_id".into(), json!(alter_id));
            out.insert("security".into(), json!(security));
        }
        Protocol::Shadowsocks { method, password } => {
            out.insert("method".into(), json!(method));
            out.insert("password".into(), json!(password));
        }
        Protocol::Trojan { password } => {
            out.insert("password".into(), json!(password));
        }
        Protocol::Hysteria2 {
            password,
            obfs,
            up_mbps,
            down_mbps,
        } => {
            out.insert("password".into(), json!(password));
            if let Some(obfs) = obfs {
                out.insert(
                    "obfs".into(),
                    json!({ "type": obfs.kind, "password": obfs.password }),
                );
            }
            if let Some(up) = up_mbps {
                out.insert("up_mbps".into(), json!(up));
            }
            if let Some(down) = down_mbps {
                out.insert("down_mbps".into(), json!(down));
            }
        }
    }

    if let Some(tls) = &tunnel.tls {
        let server_name = if tls.server_name.is_empty() {
            &tunnel.server
        } else {
            &tls.server_name
        };
        let mut t = Map::new();
        t.insert("enabled".into(), json!(true));
        t.insert("server_name".into(), json!(server_name));
        if tls.insecure {
            t.insert("insecure".into(), json!(true));
        }
        if !tls.alpn.is_empty() {
            t.insert("alpn".into(), json!(tls.alpn));
        }
        if !tls.fingerprint.is_empty() || tls.kind == TlsKind::Reality {
            let fingerprint = if tls.fingerprint.is_empty() {
                "chrome"
            } else {
                tls.fingerprint.as_str()
            };
            t.insert(
                "utls".into(),
                json!({ "enabled": true, "fingerprint": fingerprint }),
            );
        }
        if tls.kind == TlsKind::Reality {
            t.insert(
                "reality".into(),
                json!({
                    "enabled": true,
                    "public_key": tls.public_key,
                    "short_id": tls.short_id,
                }),
            );
        }
        out.insert("tls".into(), Value::Object(t));
    }

    let transport = match &tunnel.transport {
        Transport::Tcp => None,
        Transport::Ws { path, host } | Transport::Http { path, host } => {
            let kind = if matches!(tunnel.transport, Transport::Ws { .. }) {
                "ws"
            } else {
                "http"
            };
            let path = if path.is_empty() { "/" } else { path.as_str() };
            let mut t = json!({ "type": kind, "path": path });
            if !host.is_empty() {
                if kind == "ws" {
                    t["headers"] = json!({ "Host": host });
                } else {
                    t["host"] = json!([host]);
                }
            }
            Some(t)
        }
        Transport::Grpc { service_name } => {
            Some(json!({ "type": "grpc", "service_name": service_name }))
        }
    };
    if let Some(t) = transport {
        out.insert("transport".into(), t);
    }

    Value::Object(out)
}

/// Auto groups are pinned to the member the health monitor picked, so the
/// client never runs its own probing.
fn group_outbound(group: &Group, enabled: &BTreeSet<&str>) -> Option<Value> {
    let members: Vec<&str> = group
        .members
        .iter()
        .map(String::as_str)
        .filter(|m| enabled.contains(m))
        .collect();
    if members.is_empty() {
        debug!("Group {} has no enabled members, leaving it out", group.tag);
        return None;
    }

    let default = group
        .selected
        .as_deref()
        .filter(|s| members.contains(s))
        .unwrap_or(members[0]);
    if group.policy == GroupPolicy::Auto && group.selected.as_deref() != Some(default) {
        debug!("Group {} has no usable selection yet, using {}", group.tag, default);
    }
    Some(json!({
        "type": "selector",
        "tag": group.tag,
        "outbounds": members,
        "default": default,
    }))
}

/// Build the client document for the given rule set
pub fn render_client_config(
    tunnels: &[Tunnel],
    groups: &[Group],
    rules: &RuleSet,
    active: Option<&str>,
    client: &ClientConfig,
) -> Value {
    let enabled: BTreeSet<&str> = tunnels
        .iter()
        .filter(|t| t.enabled)
        .map(|t| t.tag.as_str())
        .collect();

    let mut outbounds = vec![json!({ "type": "direct", "tag": DIRECT_TAG })];
    outbounds.extend(tunnels.iter().filter(|t| t.enabled).map(tunnel_outbound));

    let mut valid: BTreeSet<&str> = enabled.clone();
    valid.insert(DIRECT_TAG);
    for group in groups {
        if let Some(out) = group_outbound(group, &enabled) {
            outbounds.push(out);
            valid.insert(&group.tag);
        }
    }

    let mut route_rules = Vec::new();

    // Device-scoped rules first, mirroring firewall precedence
    for rule in &rules.device_rules {
        let RuleAction::Mark { outbound } = &rule.action else {
            continue;
        };
        let DeviceMatch::Ip(ip) = &rule.source else {
            debug!(
                "Device {} is matched by MAC only, client routes by destination",
                rule.device_id
            );
            continue;
        };
        if !valid.contains(outbound.as_str()) {
            warn!(
                "Device {} routes to unusable outbound {}",
                rule.device_id, outbound
            );
            continue;
        }
        let source = IpNet::from(*ip).to_string();
        let mut r = json!({ "source_ip_cidr": [source], "outbound": outbound });
        if !rule.destinations.is_empty() {
            let cidrs: Vec<String> = rule.destinations.iter().map(|n| n.to_string()).collect();
            r["ip_cidr"] = json!(cidrs);
        }
        if !rule.domains.is_empty() {
            r["domain_suffix"] = json!(rule.domains);
        }
        route_rules.push(r);
    }

    let mut domains: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for d in &rules.domains {
        domains
            .entry(d.outbound.as_str())
            .or_default()
            .push(d.domain.as_str());
    }
    let mut networks: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for n in &rules.networks {
        networks
            .entry(n.outbound.as_str())
            .or_default()
            .push(n.network.to_string());
    }

    for (outbound, list) in domains {
        if valid.contains(outbound) {
            route_rules.push(json!({ "domain_suffix": list, "outbound": outbound }));
        } else {
            warn!("Outbound {} is not usable, dropping its domain rules", outbound);
        }
    }
    for (outbound, list) in networks {
        if valid.contains(outbound) {
            route_rules.push(json!({ "ip_cidr": list, "outbound": outbound }));
        } else {
            warn!("Outbound {} is not usable, dropping its network rules", outbound);
        }
    }

    let fallback = active.filter(|a| valid.contains(a)).unwrap_or(DIRECT_TAG);

    json!({
        "log": { "level": "warn" },
        "inbounds": [{
            "type": "tun",
            "tag": TUN_INBOUND_TAG,
            "interface_name": client.tun_interface,
            "address": [client.tun_address],
            "auto_route": false,
            "sniff": true,
            "stack": "gvisor",
        }],
        "outbounds": outbounds,
        "route": {
            "rules": route_rules,
            "final": fallback,
            "auto_detect_interface": true,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::model::{Device, DeviceMode, Latency, Service, Tls};
    use std::collections::BTreeMap;

    fn tunnel(tag: &str, protocol: Protocol) -> Tunnel {
        Tunnel {
            tag: tag.to_string(),
            name: tag.to_string(),
            server: format!("{}.example.net", tag),
            port: 443,
            protocol,
            tls: None,
            transport: Transport::Tcp,
            enabled: true,
            latency: Latency::Unknown,
            last_check: None,
            subscription_id: None,
        }
    }

    fn trojan(tag: &str) -> Tunnel {
        tunnel(
            tag,
            Protocol::Trojan {
                password: "secret".to_string(),
            },
        )
    }

    #[test]
    fn test_reality_vless_outbound() {
        let mut t = tunnel(
            "lux",
            Protocol::Vless {
                uuid: "uuid-1".to_string(),
                flow: "xtls-rprx-vision".to_string(),
            },
        );
        t.tls = Some(Tls {
            kind: TlsKind::Reality,
            server_name: "google.com".to_string(),
            public_key: "pk".to_string(),
            short_id: "f4".to_string(),
            ..Tls::default()
        });

        let out = tunnel_outbound(&t);
        assert_eq!(out["type"], "vless");
        assert_eq!(out["server_port"], 443);
        assert_eq!(out["flow"], "xtls-rprx-vision");
        assert_eq!(out["tls"]["server_name"], "google.com");
        assert_eq!(out["tls"]["utls"]["fingerprint"], "chrome");
        assert_eq!(out["tls"]["reality"]["short_id"], "f4");
        assert!(out.get("transport").is_none());
    }

    #[test]
    fn test_ws_transport() {
        let mut t = trojan("ws1");
        t.transport = Transport::Ws {
            path: "/ray".to_string(),
            host: "cdn.example.com".to_string(),
        };
        let out = tunnel_outbound(&t);
        assert_eq!(out["transport"]["type"], "ws");
        assert_eq!(out["transport"]["headers"]["Host"], "cdn.example.com");
    }

    #[test]
    fn test_groups_skip_disabled_members() {
        let mut off = trojan("b");
        off.enabled = false;
        let tunnels = vec![trojan("a"), off];
        let groups = vec![
            Group::new("auto", vec!["a".into(), "b".into()], GroupPolicy::Auto),
            Group::new("empty", vec!["b".into()], GroupPolicy::Manual),
        ];

        let doc = render_client_config(
            &tunnels,
            &groups,
            &RuleSet::default(),
            Some("auto"),
            &ClientConfig::default(),
        );
        let outbounds = doc["outbounds"].as_array().unwrap();
        let tags: Vec<&str> = outbounds.iter().map(|o| o["tag"].as_str().unwrap()).collect();
        assert_eq!(tags, vec![DIRECT_TAG, "a", "auto"]);
        assert_eq!(outbounds[2]["type"], "selector");
        assert_eq!(outbounds[2]["outbounds"], json!(["a"]));
        assert_eq!(outbounds[2]["default"], "a");
        assert_eq!(doc["route"]["final"], "auto");
    }

    #[test]
    fn test_auto_group_follows_health_selection() {
        let tunnels = vec![trojan("a"), trojan("b")];
        let mut group = Group::new("auto", vec!["a".into(), "b".into()], GroupPolicy::Auto);
        let render = |group: &Group| {
            render_client_config(
                &tunnels,
                std::slice::from_ref(group),
                &RuleSet::default(),
                Some("auto"),
                &ClientConfig::default(),
            )
        };

        group.selected = Some("a".to_string());
        let before = render(&group);
        group.selected = Some("b".to_string());
        let after = render(&group);

        assert_eq!(before["outbounds"][3]["default"], "a");
        assert_eq!(after["outbounds"][3]["default"], "b");
        assert_ne!(
            serde_json::to_vec(&before).unwrap(),
            serde_json::to_vec(&after).unwrap()
        );
    }

    #[test]
    fn test_route_rules_follow_rule_set() {
        let mut svc = Service::new("yt", "YouTube");
        svc.domains = vec!["youtube.com".to_string()];
        svc.ips = vec!["1.1.1.0/24".parse().unwrap()];
        svc.enabled = true;
        let dev = Device {
            id: "tv".to_string(),
            name: "TV".to_string(),
            ip: Some("192.168.1.50".parse().unwrap()),
            mac: None,
            mode: DeviceMode::VpnAll,
            enabled: true,
            services: vec![],
        };
        let rules = compile(&[svc], &[dev], &BTreeMap::new(), Some("main"));

        let doc = render_client_config(
            &[trojan("main")],
            &[],
            &rules,
            Some("main"),
            &ClientConfig::default(),
        );
        let route = &doc["route"]["rules"];
        assert_eq!(route[0]["source_ip_cidr"], json!(["192.168.1.50/32"]));
        assert_eq!(route[1]["domain_suffix"], json!(["youtube.com"]));
        assert_eq!(route[2]["ip_cidr"], json!(["1.1.1.0/24"]));
        assert_eq!(doc["inbounds"][0]["interface_name"], "tun1");
    }

    #[test]
    fn test_custom_device_domains_bind_to_source() {
        let mut svc = Service::new("yt", "YouTube");
        svc.domains = vec!["youtube.com".to_string()];
        let dev = Device {
            id: "d3".to_string(),
            name: "Tablet".to_string(),
            ip: Some("10.0.0.7".parse().unwrap()),
            mac: None,
            mode: DeviceMode::Custom,
            enabled: true,
            services: vec!["yt".to_string()],
        };
        let rules = compile(&[svc], &[dev], &BTreeMap::new(), Some("main"));

        let doc = render_client_config(
            &[trojan("main")],
            &[],
            &rules,
            Some("main"),
            &ClientConfig::default(),
        );
        let route = &doc["route"]["rules"];
        assert_eq!(route[0]["source_ip_cidr"], json!(["10.0.0.7/32"]));
        assert_eq!(route[0]["domain_suffix"], json!(["youtube.com"]));
        assert!(route[0].get("ip_cidr").is_none());
        assert_eq!(route[0]["outbound"], "main");
    }

    #[test]
    fn test_unknown_active_falls_back_to_direct() {
        let doc = render_client_config(
            &[],
            &[],
            &RuleSet::default(),
            Some("gone"),
            &ClientConfig::default(),
        );
        assert_eq!(doc["route"]["final"], DIRECT_TAG);
    }
}
