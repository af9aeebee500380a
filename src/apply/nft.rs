//! nftables script rendering
//!
//! Every script starts with [`skeleton`], which creates the table, sets and
//! chains if missing and rebuilds the prerouting chain. `add` is a no-op for
//! objects that already exist, so each script can be loaded on its own.

use crate::compiler::{DeviceMatch, DeviceRule, RuleAction};
use crate::config::FirewallConfig;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::fmt::Write;

/// Prefix of the comment attached to every device rule
pub const RULE_COMMENT_PREFIX: &str = "splitroute:";

fn object(fw: &FirewallConfig, kind: &str, name: &str) -> String {
    format!("{} {} {} {}", kind, fw.family, fw.table, name)
}

/// IPv4 and IPv6 domain sets owned by one device rule tag
pub fn device_domain_sets(tag: &str) -> (String, String) {
    (format!("{}_ips", tag), format!("{}_ips6", tag))
}

pub fn skeleton(fw: &FirewallConfig) -> String {
    let mut s = String::new();
    let chain = |name: &str| object(fw, "chain", name);
    let set = |name: &str| object(fw, "set", name);
    let rule = |text: String| {
        format!(
            "add rule {} {} {} {}\n",
            fw.family, fw.table, fw.prerouting_chain, text
        )
    };

    let _ = writeln!(s, "add table {} {}", fw.family, fw.table);
    let _ = writeln!(s, "add {} {{ type ipv4_addr; flags interval; }}", set(&fw.network_set));
    let _ = writeln!(s, "add {} {{ type ipv6_addr; flags interval; }}", set(&fw.network_set6));
    let _ = writeln!(s, "add {} {{ type ipv4_addr; }}", set(&fw.domain_set));
    let _ = writeln!(s, "add {} {{ type ipv6_addr; }}", set(&fw.domain_set6));
    let _ = writeln!(s, "add {}", chain(&fw.device_chain));
    let _ = writeln!(
        s,
        "add {} {{ type filter hook prerouting priority mangle; policy accept; }}",
        chain(&fw.prerouting_chain)
    );
    let _ = writeln!(s, "flush {}", chain(&fw.prerouting_chain));

    s.push_str(&rule(format!("jump {}", fw.device_chain)));
    for (proto, set_name) in [
        ("ip", &fw.network_set),
        ("ip6", &fw.network_set6),
        ("ip", &fw.domain_set),
        ("ip6", &fw.domain_set6),
    ] {
        s.push_str(&rule(format!(
            "{} daddr @{} meta mark set {} counter",
            proto, set_name, fw.mark
        )));
    }
    s
}

fn join(nets: &[IpNet]) -> String {
    nets.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn split_families(nets: &[IpNet]) -> (Vec<IpNet>, Vec<IpNet>) {
    nets.iter().partition(|n| matches!(n, IpNet::V4(_)))
}

/// Skeleton, flush of both network sets, then one bulk insert per family
pub fn network_sets(fw: &FirewallConfig, nets: &[IpNet]) -> String {
    let mut s = skeleton(fw);
    let _ = writeln!(s, "flush {}", object(fw, "set", &fw.network_set));
    let _ = writeln!(s, "flush {}", object(fw, "set", &fw.network_set6));

    let (v4, v6) = split_families(nets);
    for (set_name, list) in [(&fw.network_set, v4), (&fw.network_set6, v6)] {
        if !list.is_empty() {
            let _ = writeln!(
                s,
                "add element {} {} {} {{ {} }}",
                fw.family,
                fw.table,
                set_name,
                join(&list)
            );
        }
    }
    s
}

/// Insert a single network, used when the bulk insert is rejected
pub fn network_element(fw: &FirewallConfig, net: &IpNet) -> String {
    let set_name = match net {
        IpNet::V4(_) => &fw.network_set,
        IpNet::V6(_) => &fw.network_set6,
    };
    format!(
        "add element {} {} {} {{ {} }}\n",
        fw.family, fw.table, set_name, net
    )
}

fn source_match(source: &DeviceMatch) -> String {
    match source {
        DeviceMatch::Ip(ip) if ip.is_ipv4() => format!("ip saddr {}", ip),
        DeviceMatch::Ip(ip) => format!("ip6 saddr {}", ip),
        DeviceMatch::Mac(mac) => format!("ether saddr {}", mac),
    }
}

fn device_rule_lines(fw: &FirewallConfig, rule: &DeviceRule) -> Vec<String> {
    let prefix = format!("add rule {} {} {}", fw.family, fw.table, fw.device_chain);
    let source = source_match(&rule.source);
    let comment = format!("comment \"{}{}\"", RULE_COMMENT_PREFIX, rule.tag);
    let verdict = match &rule.action {
        RuleAction::Mark { .. } => format!("meta mark set {} counter accept", fw.mark),
        RuleAction::Bypass => "counter accept".to_string(),
    };

    if rule.is_unscoped() {
        return vec![format!("{} {} {} {}", prefix, source, verdict, comment)];
    }

    let (v4, v6) = split_families(&rule.destinations);
    let mut targets: Vec<String> = [("ip", v4), ("ip6", v6)]
        .into_iter()
        .filter(|(_, list)| !list.is_empty())
        .map(|(proto, list)| format!("{} daddr {{ {} }}", proto, join(&list)))
        .collect();

    if !rule.domains.is_empty() {
        let (set4, set6) = device_domain_sets(&rule.tag);
        let (want4, want6) = match &rule.source {
            DeviceMatch::Ip(ip) => (ip.is_ipv4(), ip.is_ipv6()),
            DeviceMatch::Mac(_) => (true, true),
        };
        if want4 {
            targets.push(format!("ip daddr @{}", set4));
        }
        if want6 {
            targets.push(format!("ip6 daddr @{}", set6));
        }
    }

    targets
        .into_iter()
        .map(|target| format!("{} {} {} {} {}", prefix, source, target, verdict, comment))
        .collect()
}

fn add_domain_sets(s: &mut String, fw: &FirewallConfig, tag: &str) -> (String, String) {
    let (set4, set6) = device_domain_sets(tag);
    let _ = writeln!(s, "add {} {{ type ipv4_addr; }}", object(fw, "set", &set4));
    let _ = writeln!(s, "add {} {{ type ipv6_addr; }}", object(fw, "set", &set6));
    (set4, set6)
}

/// Replace the whole device chain in one transaction.
///
/// Domain sets of `previous` tags that no longer carry domains are dropped
/// once the chain no longer references them. They are added first so the
/// delete holds whether or not they exist.
pub fn device_chain(fw: &FirewallConfig, rules: &[DeviceRule], previous: &[String]) -> String {
    let mut s = skeleton(fw);
    let _ = writeln!(s, "flush {}", object(fw, "chain", &fw.device_chain));

    let scoped: BTreeSet<&str> = rules
        .iter()
        .filter(|r| !r.domains.is_empty())
        .map(|r| r.tag.as_str())
        .collect();
    let stale: BTreeSet<&str> = previous
        .iter()
        .map(String::as_str)
        .filter(|t| !scoped.contains(t))
        .collect();
    for tag in stale {
        let (set4, set6) = add_domain_sets(&mut s, fw, tag);
        let _ = writeln!(s, "delete {}", object(fw, "set", &set4));
        let _ = writeln!(s, "delete {}", object(fw, "set", &set6));
    }
    for tag in &scoped {
        add_domain_sets(&mut s, fw, tag);
    }

    for rule in rules {
        for line in device_rule_lines(fw, rule) {
            s.push_str(&line);
            s.push('\n');
        }
    }
    s
}
