//! Rule compilation
//!
//! [`compile`] turns the declarative model into a [`RuleSet`]: the contents of
//! the global network set, the resolver directives that feed the domain set,
//! and the ordered per-device override rules. It is a pure function of its
//! inputs; output collections are sorted so two calls over the same state
//! serialize identically.
//!
//! Firewall evaluation order is fixed: device rules (first match wins), then
//! the global rule marking anything in the network or domain sets.
//!
//! A `custom` device bypasses the global rules, so the domains of the services
//! it selects are bound to a domain set of its own and matched by its rules.

use crate::model::{ALL_SERVICES, Device, DeviceMode, Service};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// A CIDR in the global network set and the outbound it is routed through
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkEntry {
    pub network: IpNet,
    pub outbound: String,
    pub service: String,
}

/// A domain whose resolved addresses are added to the global domain set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainDirective {
    pub domain: String,
    pub outbound: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMatch {
    Ip(IpAddr),
    Mac(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Mark for the tunnel; the VPN client routes it via `outbound`
    Mark { outbound: String },
    /// Stop evaluating, send direct
    Bypass,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRule {
    pub device_id: String,
    /// Stable identifier attached to the installed rule
    pub tag: String,
    pub source: DeviceMatch,
    pub destinations: Vec<IpNet>,
    /// Names resolved into the device's own domain sets
    pub domains: Vec<String>,
    pub action: RuleAction,
}

impl DeviceRule {
    /// No destination or domain scope: the rule takes all traffic
    pub fn is_unscoped(&self) -> bool {
        self.destinations.is_empty() && self.domains.is_empty()
    }

    fn matches(&self, packet: &Packet<'_>) -> bool {
        let source = match &self.source {
            DeviceMatch::Ip(ip) => *ip == packet.source,
            DeviceMatch::Mac(mac) => packet.mac == Some(mac.as_str()),
        };
        if !source {
            return false;
        }
        self.is_unscoped()
            || self.destinations.iter().any(|n| n.contains(&packet.dest))
            || packet
                .domain
                .is_some_and(|name| self.domains.iter().any(|d| domain_matches(d, name)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleSet {
    pub networks: Vec<NetworkEntry>,
    pub domains: Vec<DomainDirective>,
    pub device_rules: Vec<DeviceRule>,
}

/// A synthetic packet for [`RuleSet::verdict`]
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub source: IpAddr,
    pub mac: Option<&'a str>,
    pub dest: IpAddr,
    /// Name the destination was resolved from, if it went through the resolver
    pub domain: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Tunnel(String),
    Direct,
}

impl RuleSet {
    /// Evaluate the rule chain the way the firewall does
    pub fn verdict(&self, packet: &Packet<'_>) -> Verdict {
        for rule in &self.device_rules {
            if rule.matches(packet) {
                return match &rule.action {
                    RuleAction::Mark { outbound } => Verdict::Tunnel(outbound.clone()),
                    RuleAction::Bypass => Verdict::Direct,
                };
            }
        }

        if let Some(entry) = self.networks.iter().find(|e| e.network.contains(&packet.dest)) {
            return Verdict::Tunnel(entry.outbound.clone());
        }

        if let Some(domain) = packet.domain {
            if let Some(d) = self.domains.iter().find(|d| domain_matches(&d.domain, domain)) {
                return Verdict::Tunnel(d.outbound.clone());
            }
        }

        Verdict::Direct
    }

    /// Distinct outbounds referenced anywhere in the set
    pub fn outbounds(&self) -> BTreeSet<&str> {
        let mut out: BTreeSet<&str> = BTreeSet::new();
        out.extend(self.networks.iter().map(|e| e.outbound.as_str()));
        out.extend(self.domains.iter().map(|d| d.outbound.as_str()));
        for rule in &self.device_rules {
            if let RuleAction::Mark { outbound } = &rule.action {
                out.insert(outbound);
            }
        }
        out
    }
}

/// dnsmasq semantics: a directive for `example.com` covers its subdomains
fn domain_matches(directive: &str, name: &str) -> bool {
    name == directive
        || name
            .strip_suffix(directive)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn resolve<'a>(
    routes: &'a BTreeMap<String, String>,
    active: Option<&'a str>,
    key: &str,
) -> Option<&'a str> {
    routes.get(key).map(String::as_str).or(active)
}

fn same_family(source: &DeviceMatch, net: &IpNet) -> bool {
    match source {
        DeviceMatch::Ip(IpAddr::V4(_)) => matches!(net, IpNet::V4(_)),
        DeviceMatch::Ip(IpAddr::V6(_)) => matches!(net, IpNet::V6(_)),
        DeviceMatch::Mac(_) => true,
    }
}

/// Collapse nested and adjacent networks sharing an outbound. Interval sets
/// reject overlapping elements.
fn aggregate_networks(entries: impl IntoIterator<Item = NetworkEntry>) -> Vec<NetworkEntry> {
    let mut by_outbound: BTreeMap<String, Vec<NetworkEntry>> = BTreeMap::new();
    for entry in entries {
        by_outbound.entry(entry.outbound.clone()).or_default().push(entry);
    }

    let mut out = Vec::new();
    for (outbound, members) in by_outbound {
        let nets: Vec<IpNet> = members.iter().map(|e| e.network).collect();
        for network in IpNet::aggregate(&nets) {
            let service = members
                .iter()
                .find(|e| network.contains(&e.network))
                .map(|e| e.service.clone())
                .unwrap_or_default();
            out.push(NetworkEntry {
                network,
                outbound: outbound.clone(),
                service,
            });
        }
    }
    out.sort_by(|a, b| a.network.cmp(&b.network));
    out
}

/// Compile the current model into a rule set.
///
/// `routes` maps service ids (or [`ALL_SERVICES`]) to outbound tags; anything
/// without an override uses `active`. Entries that resolve to no outbound are
/// left out entirely. When two enabled services claim the same domain or
/// network the one declared first wins. Networks routed through the same
/// outbound are aggregated.
pub fn compile(
    services: &[Service],
    devices: &[Device],
    routes: &BTreeMap<String, String>,
    active: Option<&str>,
) -> RuleSet {
    let mut networks: BTreeMap<IpNet, NetworkEntry> = BTreeMap::new();
    let mut domains: BTreeMap<String, DomainDirective> = BTreeMap::new();

    for service in services.iter().filter(|s| s.enabled) {
        let Some(outbound) = resolve(routes, active, &service.id) else {
            continue;
        };

        for network in service.routed_networks() {
            networks.entry(network).or_insert_with(|| NetworkEntry {
                network,
                outbound: outbound.to_string(),
                service: service.id.clone(),
            });
        }

        for domain in service.effective_domains() {
            domains
                .entry(domain.clone())
                .or_insert_with(|| DomainDirective {
                    domain,
                    outbound: outbound.to_string(),
                    service: service.id.clone(),
                });
        }
    }

    let device_rules = devices
        .iter()
        .filter(|d| d.enabled)
        .flat_map(|d| device_rules(d, services, routes, active))
        .collect();

    RuleSet {
        networks: aggregate_networks(networks.into_values()),
        domains: domains.into_values().collect(),
        device_rules,
    }
}

fn device_rules(
    device: &Device,
    services: &[Service],
    routes: &BTreeMap<String, String>,
    active: Option<&str>,
) -> Vec<DeviceRule> {
    let source = match (&device.ip, &device.mac) {
        (Some(ip), _) => DeviceMatch::Ip(*ip),
        (None, Some(mac)) => DeviceMatch::Mac(mac.clone()),
        (None, None) => return Vec::new(),
    };
    let tag = device.rule_tag();
    let rule = |destinations: Vec<IpNet>, domains: Vec<String>, action: RuleAction| DeviceRule {
        device_id: device.id.clone(),
        tag: tag.clone(),
        source: source.clone(),
        destinations,
        domains,
        action,
    };

    match device.mode {
        DeviceMode::Default => Vec::new(),
        DeviceMode::DirectAll => vec![rule(Vec::new(), Vec::new(), RuleAction::Bypass)],
        DeviceMode::VpnAll => match resolve(routes, active, ALL_SERVICES) {
            Some(outbound) => vec![rule(
                Vec::new(),
                Vec::new(),
                RuleAction::Mark {
                    outbound: outbound.to_string(),
                },
            )],
            None => Vec::new(),
        },
        DeviceMode::Custom => {
            let mut rules = Vec::new();
            let mut seen = BTreeSet::new();

            for service_id in &device.services {
                if !seen.insert(service_id.as_str()) {
                    continue;
                }
                let Some(service) = services.iter().find(|s| &s.id == service_id) else {
                    continue;
                };
                let Some(outbound) = resolve(routes, active, service_id) else {
                    continue;
                };
                let nets: Vec<IpNet> = service
                    .routed_networks()
                    .into_iter()
                    .filter(|n| same_family(&source, n))
                    .collect();
                let domains: Vec<String> = service.effective_domains().into_iter().collect();
                if nets.is_empty() && domains.is_empty() {
                    continue;
                }
                rules.push(rule(
                    IpNet::aggregate(&nets),
                    domains,
                    RuleAction::Mark {
                        outbound: outbound.to_string(),
                    },
                ));
            }

            // Everything else from this device skips the global rules
            rules.push(rule(Vec::new(), Vec::new(), RuleAction::Bypass));
            rules
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_network;

    fn service(id: &str, domains: &[&str], ips: &[&str], enabled: bool) -> Service {
        let mut s = Service::new(id, id);
        s.domains = domains.iter().map(|d| d.to_string()).collect();
        s.ips = ips.iter().map(|n| normalize_network(n).unwrap()).collect();
        s.enabled = enabled;
        s
    }

    fn device(id: &str, ip: &str, mode: DeviceMode) -> Device {
        Device {
            id: id.to_string(),
            name: id.to_string(),
            ip: Some(ip.parse().unwrap()),
            mac: None,
            mode,
            enabled: true,
            services: vec![],
        }
    }

    fn packet<'a>(source: &str, dest: &str, domain: Option<&'a str>) -> Packet<'a> {
        Packet {
            source: source.parse().unwrap(),
            mac: None,
            dest: dest.parse().unwrap(),
            domain,
        }
    }

    #[test]
    fn test_end_to_end_default_device() {
        let mut youtube = service("youtube", &["youtube.com"], &[], true);
        youtube.custom_domains = vec!["ytimg.com".to_string()];
        let d1 = device("d1", "192.168.1.10", DeviceMode::Default);

        let rules = compile(&[youtube], &[d1], &BTreeMap::new(), Some("main"));

        let domains: Vec<_> = rules
            .domains
            .iter()
            .map(|d| (d.domain.as_str(), d.outbound.as_str()))
            .collect();
        assert_eq!(domains, vec![("youtube.com", "main"), ("ytimg.com", "main")]);
        assert!(rules.device_rules.is_empty());
    }

    #[test]
    fn test_disabled_services_contribute_nothing() {
        let svc = service("svc", &["a.com"], &["1.1.1.0/24"], false);
        let rules = compile(&[svc], &[], &BTreeMap::new(), Some("main"));
        assert_eq!(rules, RuleSet::default());
    }

    #[test]
    fn test_fail_closed_without_active_tunnel() {
        let a = service("a", &["a.com"], &["1.1.1.0/24"], true);
        let b = service("b", &["b.com"], &["2.2.2.0/24"], true);
        let routes = BTreeMap::from([("b".to_string(), "fast".to_string())]);

        let rules = compile(&[a, b], &[], &routes, None);
        assert_eq!(rules.domains.len(), 1);
        assert_eq!(rules.domains[0].domain, "b.com");
        assert_eq!(rules.networks.len(), 1);
        assert_eq!(rules.networks[0].outbound, "fast");
    }

    #[test]
    fn test_route_override_selects_outbound() {
        let a = service("a", &["a.com"], &[], true);
        let b = service("b", &["b.com"], &[], true);
        let routes = BTreeMap::from([("a".to_string(), "group-eu".to_string())]);

        let rules = compile(&[a, b], &[], &routes, Some("main"));
        assert_eq!(rules.domains[0].outbound, "group-eu");
        assert_eq!(rules.domains[1].outbound, "main");
    }

    #[test]
    fn test_first_declared_service_wins_overlap() {
        let a = service("a", &["shared.com"], &["1.1.1.0/24"], true);
        let b = service("b", &["shared.com"], &["1.1.1.0/24"], true);
        let routes = BTreeMap::from([("b".to_string(), "other".to_string())]);

        let rules = compile(&[a, b], &[], &routes, Some("main"));
        assert_eq!(rules.domains.len(), 1);
        assert_eq!(rules.domains[0].service, "a");
        assert_eq!(rules.networks[0].outbound, "main");
    }

    #[test]
    fn test_extra_ranges_only_when_enabled() {
        let mut insta = service("instagram", &["instagram.com"], &[], false);
        insta.extra_ranges = vec![normalize_network("157.240.0.0/16").unwrap()];

        let off = compile(std::slice::from_ref(&insta), &[], &BTreeMap::new(), Some("main"));
        assert!(off.networks.is_empty());

        insta.enabled = true;
        let on = compile(&[insta], &[], &BTreeMap::new(), Some("main"));
        assert_eq!(on.networks.len(), 1);
        assert_eq!(on.networks[0].network.to_string(), "157.240.0.0/16");
    }

    #[test]
    fn test_nested_networks_collapse_per_outbound() {
        let mut insta = service("instagram", &["instagram.com"], &[], true);
        insta.extra_ranges = vec![normalize_network("157.240.0.0/16").unwrap()];
        insta.custom_ips = vec![normalize_network("157.240.1.1").unwrap()];
        let adjacent = service("cdn", &[], &["10.0.0.0/25", "10.0.0.128/25"], true);

        let rules = compile(&[insta, adjacent], &[], &BTreeMap::new(), Some("main"));
        let nets: Vec<_> = rules
            .networks
            .iter()
            .map(|e| (e.network.to_string(), e.service.as_str()))
            .collect();
        assert_eq!(
            nets,
            vec![
                ("10.0.0.0/24".to_string(), "cdn"),
                ("157.240.0.0/16".to_string(), "instagram"),
            ]
        );
    }

    #[test]
    fn test_compile_is_deterministic() {
        let services = vec![
            service("b", &["z.com", "a.com"], &["9.9.9.0/24", "1.0.0.0/8"], true),
            service("a", &["m.com"], &["5.5.5.5"], true),
        ];
        let mut custom = device("c", "10.0.0.9", DeviceMode::Custom);
        custom.services = vec!["b".to_string(), "a".to_string()];
        let devices = vec![custom, device("v", "10.0.0.8", DeviceMode::VpnAll)];
        let routes = BTreeMap::from([("a".to_string(), "x".to_string())]);

        let first = serde_json::to_string(&compile(&services, &devices, &routes, Some("main")))
            .unwrap();
        let second = serde_json::to_string(&compile(&services, &devices, &routes, Some("main")))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_vpn_all_marks_everything() {
        let svc = service("svc", &["a.com"], &["1.1.1.0/24"], true);
        let dev = device("d1", "1.2.3.4", DeviceMode::VpnAll);
        let rules = compile(&[svc.clone()], &[dev.clone()], &BTreeMap::new(), Some("main"));

        for dest in ["8.8.8.8", "1.1.1.1", "93.184.216.34"] {
            assert_eq!(
                rules.verdict(&packet("1.2.3.4", dest, None)),
                Verdict::Tunnel("main".to_string())
            );
        }

        let mut direct = dev;
        direct.mode = DeviceMode::DirectAll;
        let rules = compile(&[svc], &[direct], &BTreeMap::new(), Some("main"));
        for dest in ["8.8.8.8", "1.1.1.1"] {
            assert_eq!(rules.verdict(&packet("1.2.3.4", dest, Some("a.com"))), Verdict::Direct);
        }
    }

    #[test]
    fn test_vpn_all_uses_all_route_override() {
        let dev = device("d1", "1.2.3.4", DeviceMode::VpnAll);
        let routes = BTreeMap::from([(ALL_SERVICES.to_string(), "group-fast".to_string())]);

        let rules = compile(&[], &[dev.clone()], &routes, Some("main"));
        assert_eq!(
            rules.device_rules[0].action,
            RuleAction::Mark {
                outbound: "group-fast".to_string()
            }
        );

        let rules = compile(&[], &[dev], &BTreeMap::new(), None);
        assert!(rules.device_rules.is_empty());
    }

    #[test]
    fn test_direct_all_bypass_precedes_domain_rules() {
        let svc = service("svc", &["a.com"], &["10.0.0.0/8"], true);
        let d2 = device("d2", "10.0.0.5", DeviceMode::DirectAll);
        let rules = compile(&[svc], &[d2], &BTreeMap::new(), Some("main"));

        assert_eq!(rules.device_rules.len(), 1);
        assert_eq!(rules.device_rules[0].action, RuleAction::Bypass);
        assert_eq!(
            rules.device_rules[0].source,
            DeviceMatch::Ip("10.0.0.5".parse().unwrap())
        );
        assert_eq!(rules.verdict(&packet("10.0.0.5", "10.1.1.1", None)), Verdict::Direct);
        assert_eq!(
            rules.verdict(&packet("10.0.0.6", "10.1.1.1", None)),
            Verdict::Tunnel("main".to_string())
        );
    }

    #[test]
    fn test_custom_mode_scoped_to_selected_services() {
        let svc_a = service("svc_a", &["a.com"], &["1.1.1.0/24"], true);
        let svc_b = service("svc_b", &["b.com"], &["2.2.2.0/24"], true);
        let mut dev = device("d3", "10.0.0.7", DeviceMode::Custom);
        dev.services = vec!["svc_a".to_string()];

        let rules = compile(&[svc_a, svc_b], &[dev], &BTreeMap::new(), Some("main"));

        let marks: Vec<_> = rules
            .device_rules
            .iter()
            .filter(|r| matches!(r.action, RuleAction::Mark { .. }))
            .collect();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].destinations[0].to_string(), "1.1.1.0/24");
        assert_eq!(rules.device_rules.last().unwrap().action, RuleAction::Bypass);

        assert_eq!(
            rules.verdict(&packet("10.0.0.7", "1.1.1.1", None)),
            Verdict::Tunnel("main".to_string())
        );
        assert_eq!(rules.verdict(&packet("10.0.0.7", "2.2.2.2", None)), Verdict::Direct);
        assert_eq!(
            rules.verdict(&packet("10.0.0.7", "3.3.3.3", Some("b.com"))),
            Verdict::Direct
        );
        assert_eq!(
            rules.verdict(&packet("10.0.0.7", "3.3.3.3", Some("www.a.com"))),
            Verdict::Tunnel("main".to_string())
        );
    }

    #[test]
    fn test_custom_mode_routes_domain_only_service() {
        let youtube = service("youtube", &["youtube.com"], &[], true);
        let mut dev = device("d3", "10.0.0.7", DeviceMode::Custom);
        dev.services = vec!["youtube".to_string()];

        let rules = compile(&[youtube], &[dev], &BTreeMap::new(), Some("main"));

        assert_eq!(rules.device_rules.len(), 2);
        assert!(rules.device_rules[0].destinations.is_empty());
        assert_eq!(rules.device_rules[0].domains, vec!["youtube.com"]);
        assert!(!rules.device_rules[0].is_unscoped());
        assert_eq!(
            rules.verdict(&packet("10.0.0.7", "142.250.1.1", Some("www.youtube.com"))),
            Verdict::Tunnel("main".to_string())
        );
        assert_eq!(
            rules.verdict(&packet("10.0.0.7", "142.250.1.1", None)),
            Verdict::Direct
        );
    }

    #[test]
    fn test_disabled_device_behaves_like_anonymous_host() {
        let svc = service("svc", &[], &["1.1.1.0/24"], true);
        let mut dev = device("d4", "10.0.0.4", DeviceMode::DirectAll);
        dev.enabled = false;

        let rules = compile(&[svc], &[dev], &BTreeMap::new(), Some("main"));
        assert!(rules.device_rules.is_empty());
        assert_eq!(
            rules.verdict(&packet("10.0.0.4", "1.1.1.1", None)),
            Verdict::Tunnel("main".to_string())
        );
    }

    #[test]
    fn test_mac_only_device_matches_by_mac() {
        let mut dev = device("m1", "10.0.0.1", DeviceMode::DirectAll);
        dev.ip = None;
        dev.mac = Some("aa:bb:cc:dd:ee:ff".to_string());

        let rules = compile(&[], &[dev], &BTreeMap::new(), Some("main"));
        assert_eq!(
            rules.device_rules[0].source,
            DeviceMatch::Mac("aa:bb:cc:dd:ee:ff".to_string())
        );
    }

    #[test]
    fn test_domain_directive_covers_subdomains() {
        assert!(domain_matches("youtube.com", "youtube.com"));
        assert!(domain_matches("youtube.com", "www.youtube.com"));
        assert!(!domain_matches("youtube.com", "notyoutube.com"));
    }
}
