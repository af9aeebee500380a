//! Share-link parsing
//!
//! Supported schemes: `vless://`, `vmess://` (base64 JSON), `ss://` (SIP002
//! and the legacy all-base64 form), `trojan://`, `hysteria2://` / `hy2://`.

use crate::model::{Latency, Obfs, Protocol, Tls, TlsKind, Transport, Tunnel};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use url::{Host, Url};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Unsupported link scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Malformed {scheme} link: {reason}")]
    MalformedLink { scheme: String, reason: String },
}

fn malformed(scheme: &str, reason: impl Into<String>) -> LinkError {
    LinkError::MalformedLink {
        scheme: scheme.to_string(),
        reason: reason.into(),
    }
}

/// Decode base64 in any of the alphabets and paddings found in the wild
pub(crate) fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('=')
        .to_string();
    STANDARD_NO_PAD
        .decode(&cleaned)
        .or_else(|_| URL_SAFE_NO_PAD.decode(&cleaned))
        .ok()
}

fn decode_component(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// Lower-case ASCII slug, empty when nothing usable remains
pub fn slug(raw: &str) -> String {
    let mut out = String::new();
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    trimmed.chars().take(48).collect::<String>().trim_end_matches('-').to_string()
}

/// Stable tag for an imported tunnel: its name, else type, server and port
pub fn tunnel_tag(name: &str, kind: &str, server: &str, port: u16) -> String {
    let from_name = slug(name);
    if from_name.is_empty() {
        slug(&format!("{}-{}-{}", kind, server, port))
    } else {
        from_name
    }
}

pub(crate) fn new_tunnel(
    name: String,
    server: String,
    port: u16,
    protocol: Protocol,
    tls: Option<Tls>,
    transport: Transport,
) -> Tunnel {
    let tag = tunnel_tag(&name, protocol.kind(), &server, port);
    let name = if name.is_empty() { tag.clone() } else { name };
    Tunnel {
        tag,
        name,
        server,
        port,
        protocol,
        tls,
        transport,
        enabled: true,
        latency: Latency::Unknown,
        last_check: None,
        subscription_id: None,
    }
}

struct Parts {
    user: String,
    server: String,
    port: u16,
    params: HashMap<String, String>,
    name: String,
}

fn host_string(host: Host<&str>) -> String {
    match host {
        Host::Domain(d) => d.to_string(),
        Host::Ipv4(ip) => ip.to_string(),
        Host::Ipv6(ip) => ip.to_string(),
    }
}

fn split_url(scheme: &str, link: &str) -> Result<Parts, LinkError> {
    let url = Url::parse(link).map_err(|e| malformed(scheme, e.to_string()))?;
    let server = url
        .host()
        .map(host_string)
        .ok_or_else(|| malformed(scheme, "missing server"))?;
    let port = url.port().ok_or_else(|| malformed(scheme, "missing port"))?;
    let params = url.query_pairs().into_owned().collect();
    let name = url.fragment().map(decode_component).unwrap_or_default();

    Ok(Parts {
        user: decode_component(url.username()),
        server,
        port,
        params,
        name,
    })
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn alpn(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default()
}

fn transport_from_params(params: &HashMap<String, String>) -> Transport {
    match param(params, "type").unwrap_or("tcp") {
        "ws" => Transport::Ws {
            path: param(params, "path").unwrap_or("/").to_string(),
            host: param(params, "host").unwrap_or_default().to_string(),
        },
        "grpc" => Transport::Grpc {
            service_name: param(params, "serviceName")
                .unwrap_or_default()
                .to_string(),
        },
        "http" | "h2" => Transport::Http {
            path: param(params, "path").unwrap_or("/").to_string(),
            host: param(params, "host").unwrap_or_default().to_string(),
        },
        _ => Transport::Tcp,
    }
}

fn parse_vless(link: &str) -> Result<Tunnel, LinkError> {
    let p = split_url("vless", link)?;
    if p.user.is_empty() {
        return Err(malformed("vless", "missing uuid"));
    }

    let tls = match param(&p.params, "security") {
        Some("reality") => Some(Tls {
            kind: TlsKind::Reality,
            server_name: param(&p.params, "sni").unwrap_or_default().to_string(),
            fingerprint: param(&p.params, "fp").unwrap_or("chrome").to_string(),
            public_key: param(&p.params, "pbk").unwrap_or_default().to_string(),
            short_id: param(&p.params, "sid").unwrap_or_default().to_string(),
            ..Tls::default()
        }),
        Some("tls") | Some("xtls") => Some(Tls {
            server_name: param(&p.params, "sni").unwrap_or(&p.server).to_string(),
            fingerprint: param(&p.params, "fp").unwrap_or_default().to_string(),
            alpn: alpn(param(&p.params, "alpn")),
            ..Tls::default()
        }),
        _ => None,
    };

    let protocol = Protocol::Vless {
        uuid: p.user,
        flow: param(&p.params, "flow").unwrap_or_default().to_string(),
    };
    let transport = transport_from_params(&p.params);
    Ok(new_tunnel(p.name, p.server, p.port, protocol, tls, transport))
}

fn parse_trojan(link: &str) -> Result<Tunnel, LinkError> {
    let p = split_url("trojan", link)?;
    if p.user.is_empty() {
        return Err(malformed("trojan", "missing password"));
    }

    let tls = Tls {
        server_name: param(&p.params, "sni").unwrap_or(&p.server).to_string(),
        insecure: param(&p.params, "allowInsecure") == Some("1"),
        alpn: alpn(param(&p.params, "alpn")),
        fingerprint: param(&p.params, "fp").unwrap_or_default().to_string(),
        ..Tls::default()
    };
    let transport = transport_from_params(&p.params);
    let protocol = Protocol::Trojan { password: p.user };
    Ok(new_tunnel(p.name, p.server, p.port, protocol, Some(tls), transport))
}

fn parse_hysteria2(link: &str) -> Result<Tunnel, LinkError> {
    let p = split_url("hysteria2", link)?;
    let mbps = |key: &str| param(&p.params, key).and_then(|v| v.trim().parse::<u32>().ok());

    let obfs = param(&p.params, "obfs").map(|kind| Obfs {
        kind: kind.to_string(),
        password: param(&p.params, "obfs-password")
            .unwrap_or_default()
            .to_string(),
    });
    let tls = Tls {
        server_name: param(&p.params, "sni").unwrap_or(&p.server).to_string(),
        insecure: param(&p.params, "insecure") == Some("1"),
        ..Tls::default()
    };
    let protocol = Protocol::Hysteria2 {
        password: p.user,
        obfs,
        up_mbps: mbps("up"),
        down_mbps: mbps("down"),
    };
    Ok(new_tunnel(
        p.name,
        p.server,
        p.port,
        protocol,
        Some(tls),
        Transport::Tcp,
    ))
}

fn split_host_port(scheme: &str, s: &str) -> Result<(String, u16), LinkError> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| malformed(scheme, "bad IPv6 address"))?;
        (host, port)
    } else {
        s.rsplit_once(':')
            .ok_or_else(|| malformed(scheme, "missing port"))?
    };
    let port = port
        .trim_end_matches('/')
        .parse::<u16>()
        .map_err(|_| malformed(scheme, format!("bad port {:?}", port)))?;
    if host.is_empty() {
        return Err(malformed(scheme, "missing server"));
    }
    Ok((host.to_string(), port))
}

fn parse_shadowsocks(link: &str) -> Result<Tunnel, LinkError> {
    let body = &link["ss://".len()..];
    let (body, name) = match body.rsplit_once('#') {
        Some((b, n)) => (b, decode_component(n)),
        None => (body, String::new()),
    };
    // Plugin options are not supported; drop the query
    let body = body.split_once('?').map_or(body, |(b, _)| b);

    let (userinfo, server, port) = match body.rsplit_once('@') {
        Some((userinfo, host_port)) => {
            let (server, port) = split_host_port("ss", host_port)?;
            let userinfo = decode_component(userinfo);
            let userinfo = match decode_base64(&userinfo)
                .and_then(|b| String::from_utf8(b).ok())
                .filter(|s| s.contains(':'))
            {
                Some(decoded) => decoded,
                None => userinfo,
            };
            (userinfo, server, port)
        }
        None => {
            let decoded = decode_base64(body)
                .and_then(|b| String::from_utf8(b).ok())
                .ok_or_else(|| malformed("ss", "invalid base64"))?;
            let (userinfo, host_port) = decoded
                .rsplit_once('@')
                .ok_or_else(|| malformed("ss", "missing server"))?;
            let (server, port) = split_host_port("ss", host_port)?;
            (userinfo.to_string(), server, port)
        }
    };

    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| malformed("ss", "missing method or password"))?;
    let protocol = Protocol::Shadowsocks {
        method: method.to_string(),
        password: password.to_string(),
    };
    Ok(new_tunnel(name, server, port, protocol, None, Transport::Tcp))
}

fn json_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Numbers in vmess JSON show up both as numbers and as strings
fn json_u64(v: &Value, key: &str) -> Option<u64> {
    match v.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_vmess(link: &str) -> Result<Tunnel, LinkError> {
    let body = &link["vmess://".len()..];
    let decoded = decode_base64(body)
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or_else(|| malformed("vmess", "invalid base64"))?;
    let data: Value =
        serde_json::from_str(&decoded).map_err(|e| malformed("vmess", e.to_string()))?;

    let server = json_str(&data, "add")
        .ok_or_else(|| malformed("vmess", "missing server"))?
        .to_string();
    let port = json_u64(&data, "port")
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| malformed("vmess", "missing port"))?;
    let uuid = json_str(&data, "id")
        .ok_or_else(|| malformed("vmess", "missing id"))?
        .to_string();

    let host = json_str(&data, "host").unwrap_or_default().to_string();
    let path = json_str(&data, "path");
    let tls = (json_str(&data, "tls") == Some("tls")).then(|| Tls {
        server_name: json_str(&data, "sni")
            .or(json_str(&data, "host"))
            .unwrap_or(&server)
            .to_string(),
        alpn: alpn(json_str(&data, "alpn")),
        fingerprint: json_str(&data, "fp").unwrap_or_default().to_string(),
        ..Tls::default()
    });
    let transport = match json_str(&data, "net").unwrap_or("tcp") {
        "ws" => Transport::Ws {
            path: path.unwrap_or("/").to_string(),
            host,
        },
        "grpc" => Transport::Grpc {
            service_name: path.unwrap_or_default().to_string(),
        },
        "h2" | "http" => Transport::Http {
            path: path.unwrap_or("/").to_string(),
            host,
        },
        _ => Transport::Tcp,
    };

    let protocol = Protocol::Vmess {
        uuid,
        alter_id: json_u64(&data, "aid")
            .and_then(|a| u32::try_from(a).ok())
            .unwrap_or(0),
        security: json_str(&data, "scy").unwrap_or("auto").to_string(),
    };
    let name = json_str(&data, "ps").unwrap_or_default().to_string();
    Ok(new_tunnel(name, server, port, protocol, tls, transport))
}

/// Parse one share link into a tunnel
pub fn parse_link(raw: &str) -> Result<Tunnel, LinkError> {
    let link = raw.trim();
    let scheme = link
        .split_once("://")
        .map(|(s, _)| s.to_ascii_lowercase())
        .ok_or_else(|| LinkError::UnsupportedScheme(link.chars().take(16).collect()))?;

    match scheme.as_str() {
        "vless" => parse_vless(link),
        "vmess" => parse_vmess(link),
        "ss" => parse_shadowsocks(link),
        "trojan" => parse_trojan(link),
        "hysteria2" | "hy2" => parse_hysteria2(link),
        _ => Err(LinkError::UnsupportedScheme(scheme)),
    }
}

/// Make tags unique within one batch by suffixing `-2`, `-3`, ...
pub fn dedupe_tags(tunnels: &mut [Tunnel]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for tunnel in tunnels.iter_mut() {
        let count = seen.entry(tunnel.tag.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            let mut n = *count;
            let mut candidate = format!("{}-{}", tunnel.tag, n);
            while seen.contains_key(&candidate) {
                n += 1;
                candidate = format!("{}-{}", tunnel.tag, n);
            }
            seen.insert(candidate.clone(), 1);
            tunnel.tag = candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn test_vless_reality() {
        let t = parse_link(
            "vless://e813ebca-6880-412a-a2d2-310a19877fb8@s1.example.net:443\
             ?security=reality&sni=google.com&fp=chrome&pbk=xkUZ3D&sid=f4\
             &flow=xtls-rprx-vision&type=tcp#Lux%20VLESS",
        )
        .unwrap();

        assert_eq!(t.tag, "lux-vless");
        assert_eq!(t.name, "Lux VLESS");
        assert_eq!(t.server, "s1.example.net");
        assert_eq!(t.port, 443);
        assert_eq!(
            t.protocol,
            Protocol::Vless {
                uuid: "e813ebca-6880-412a-a2d2-310a19877fb8".to_string(),
                flow: "xtls-rprx-vision".to_string(),
            }
        );
        let tls = t.tls.unwrap();
        assert_eq!(tls.kind, TlsKind::Reality);
        assert_eq!(tls.public_key, "xkUZ3D");
        assert_eq!(tls.short_id, "f4");
        assert_eq!(t.transport, Transport::Tcp);
    }

    #[test]
    fn test_vless_ws_ipv6() {
        let t = parse_link("vless://id@[2001:db8::1]:8443?security=tls&type=ws&path=%2Fray&host=cdn.example.com")
            .unwrap();
        assert_eq!(t.server, "2001:db8::1");
        assert_eq!(t.port, 8443);
        assert_eq!(
            t.transport,
            Transport::Ws {
                path: "/ray".to_string(),
                host: "cdn.example.com".to_string()
            }
        );
        assert_eq!(t.tls.unwrap().server_name, "2001:db8::1");
        // No name: tag falls back to type, server and port
        assert_eq!(t.tag, "vless-2001-db8-1-8443");
    }

    #[test]
    fn test_vmess_base64_json() {
        let json = r#"{"v":"2","ps":"Tokyo 01","add":"jp.example.net","port":"443","id":"uuid-1","aid":0,"net":"ws","path":"/v","host":"jp.example.net","tls":"tls"}"#;
        let link = format!("vmess://{}", STANDARD.encode(json));
        let t = parse_link(&link).unwrap();

        assert_eq!(t.tag, "tokyo-01");
        assert_eq!(t.port, 443);
        assert!(matches!(t.protocol, Protocol::Vmess { ref security, .. } if security == "auto"));
        assert!(matches!(t.transport, Transport::Ws { .. }));
        assert_eq!(t.tls.unwrap().server_name, "jp.example.net");
    }

    #[test]
    fn test_shadowsocks_sip002_and_legacy() {
        let userinfo = URL_SAFE_NO_PAD.encode("aes-256-gcm:p@ss");
        let t = parse_link(&format!("ss://{}@1.2.3.4:8388#SS%20One", userinfo)).unwrap();
        assert_eq!(t.server, "1.2.3.4");
        assert_eq!(
            t.protocol,
            Protocol::Shadowsocks {
                method: "aes-256-gcm".to_string(),
                password: "p@ss".to_string()
            }
        );

        let legacy = STANDARD.encode("chacha20-ietf-poly1305:secret@ss.example.net:443");
        let t = parse_link(&format!("ss://{}#Legacy", legacy)).unwrap();
        assert_eq!(t.server, "ss.example.net");
        assert_eq!(t.port, 443);
        assert_eq!(t.name, "Legacy");
    }

    #[test]
    fn test_trojan_and_hysteria2() {
        let t = parse_link("trojan://pa%24s@tr.example.net:443?sni=front.example.com#TR").unwrap();
        assert_eq!(
            t.protocol,
            Protocol::Trojan {
                password: "pa$s".to_string()
            }
        );
        assert_eq!(t.tls.unwrap().server_name, "front.example.com");

        let t = parse_link("hy2://pw@hy.example.net:8443?obfs=salamander&obfs-password=x&insecure=1&up=50")
            .unwrap();
        let Protocol::Hysteria2 { obfs, up_mbps, down_mbps, .. } = &t.protocol else {
            panic!("expected hysteria2");
        };
        assert_eq!(obfs.as_ref().unwrap().kind, "salamander");
        assert_eq!(*up_mbps, Some(50));
        assert_eq!(*down_mbps, None);
        assert!(t.tls.unwrap().insecure);
    }

    #[test]
    fn test_rejected_links() {
        assert!(matches!(
            parse_link("wireguard://abc"),
            Err(LinkError::UnsupportedScheme(s)) if s == "wireguard"
        ));
        assert!(matches!(
            parse_link("not a link"),
            Err(LinkError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_link("vless://uuid@host.example.net"),
            Err(LinkError::MalformedLink { .. })
        ));
        assert!(matches!(
            parse_link("vmess://!!!"),
            Err(LinkError::MalformedLink { .. })
        ));
    }

    #[test]
    fn test_dedupe_tags() {
        let link = "trojan://pw@a.example.net:443#Same";
        let mut batch = vec![
            parse_link(link).unwrap(),
            parse_link(link).unwrap(),
            parse_link(link).unwrap(),
        ];
        dedupe_tags(&mut batch);
        let tags: Vec<&str> = batch.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(tags, vec!["same", "same-2", "same-3"]);
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("  Hello, World!! "), "hello-world");
        assert_eq!(slug("🇯🇵 Tokyo"), "tokyo");
        assert_eq!(slug("Тест"), "");
    }
}
