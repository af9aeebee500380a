//! dnsmasq directive rendering

use super::nft::device_domain_sets;
use crate::compiler::RuleSet;
use crate::config::FirewallConfig;
use crate::normalize::normalize_domain;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use tracing::warn;

const HEADER: &str = "# Managed by splitroute. Changes are overwritten on apply.\n";

/// `a.b.c`, `b.c`, `c`
fn suffixes(domain: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(domain), |d| d.split_once('.').map(|(_, parent)| parent))
}

fn covered(domain: &str, routed: &BTreeSet<&str>) -> bool {
    suffixes(domain).any(|d| routed.contains(d))
}

/// Set pairs each domain's resolved addresses go into: the global domain sets
/// for routed services, and the device sets of `custom` devices selecting it.
fn bindings<'a>(
    fw: &FirewallConfig,
    rules: &'a RuleSet,
) -> BTreeMap<&'a str, BTreeSet<(String, String)>> {
    let mut sets: BTreeMap<&str, BTreeSet<(String, String)>> = BTreeMap::new();
    for d in &rules.domains {
        sets.entry(d.domain.as_str())
            .or_default()
            .insert((fw.domain_set.clone(), fw.domain_set6.clone()));
    }
    for rule in rules.device_rules.iter().filter(|r| !r.domains.is_empty()) {
        let pair = device_domain_sets(&rule.tag);
        for domain in &rule.domains {
            sets.entry(domain.as_str()).or_default().insert(pair.clone());
        }
    }
    sets
}

/// One `nftset` line per routed domain binding both address families, plus
/// `address=/<d>/::` for IPv6-suppressed domains that are routed.
///
/// dnsmasq only applies the longest matching directive, so a line also carries
/// the sets of every routed parent domain.
pub fn render(fw: &FirewallConfig, rules: &RuleSet, block_ipv6: &[String]) -> String {
    let mut out = String::from(HEADER);
    let sets = bindings(fw, rules);

    for domain in sets.keys() {
        let targets: BTreeSet<&(String, String)> = suffixes(domain)
            .filter_map(|d| sets.get(d))
            .flatten()
            .collect();
        let line: Vec<String> = targets
            .into_iter()
            .map(|(set4, set6)| {
                format!(
                    "4#{}#{}#{},6#{}#{}#{}",
                    fw.family, fw.table, set4, fw.family, fw.table, set6
                )
            })
            .collect();
        let _ = writeln!(out, "nftset=/{}/{}", domain, line.join(","));
    }

    let routed: BTreeSet<&str> = sets.keys().copied().collect();
    let mut suppressed = BTreeSet::new();
    for raw in block_ipv6 {
        match normalize_domain(raw) {
            Ok(domain) if covered(&domain, &routed) => {
                suppressed.insert(domain);
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring IPv6 suppression entry: {}", e),
        }
    }
    for domain in suppressed {
        let _ = writeln!(out, "address=/{}/::", domain);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{DeviceMatch, DeviceRule, DomainDirective, RuleAction};

    fn routed(domains: &[&str]) -> RuleSet {
        RuleSet {
            domains: domains
                .iter()
                .map(|d| DomainDirective {
                    domain: d.to_string(),
                    outbound: "main".to_string(),
                    service: "svc".to_string(),
                })
                .collect(),
            ..RuleSet::default()
        }
    }

    fn custom_device(tag: &str, domains: &[&str]) -> DeviceRule {
        DeviceRule {
            device_id: "d3".to_string(),
            tag: tag.to_string(),
            source: DeviceMatch::Ip("10.0.0.7".parse().unwrap()),
            destinations: vec![],
            domains: domains.iter().map(|d| d.to_string()).collect(),
            action: RuleAction::Mark {
                outbound: "main".to_string(),
            },
        }
    }

    #[test]
    fn test_render_binds_both_families() {
        let text = render(&FirewallConfig::default(), &routed(&["youtube.com"]), &[]);
        assert!(text.starts_with('#'));
        assert!(text.contains(
            "nftset=/youtube.com/4#inet#splitroute#tunnel_ips,6#inet#splitroute#tunnel_ips6\n"
        ));
    }

    #[test]
    fn test_device_domains_feed_device_sets() {
        let mut rules = routed(&["youtube.com"]);
        rules.device_rules = vec![custom_device("dev_d3", &["youtube.com", "netflix.com"])];

        let text = render(&FirewallConfig::default(), &rules, &[]);
        assert!(text.contains(
            "nftset=/netflix.com/4#inet#splitroute#dev_d3_ips,6#inet#splitroute#dev_d3_ips6\n"
        ));
        assert!(text.contains(
            "nftset=/youtube.com/4#inet#splitroute#dev_d3_ips,6#inet#splitroute#dev_d3_ips6,\
             4#inet#splitroute#tunnel_ips,6#inet#splitroute#tunnel_ips6\n"
        ));
    }

    #[test]
    fn test_subdomain_line_inherits_parent_sets() {
        let mut rules = routed(&["youtube.com"]);
        rules.device_rules = vec![custom_device("dev_d3", &["www.youtube.com"])];

        let text = render(&FirewallConfig::default(), &rules, &[]);
        let line = text
            .lines()
            .find(|l| l.starts_with("nftset=/www.youtube.com/"))
            .unwrap();
        assert!(line.contains("#dev_d3_ips6"));
        assert!(line.contains("#tunnel_ips6"));
    }

    #[test]
    fn test_ipv6_suppression_only_for_routed_domains() {
        let text = render(
            &FirewallConfig::default(),
            &routed(&["youtube.com"]),
            &[
                "youtube.com".to_string(),
                "www.youtube.com".to_string(),
                "googlevideo.com".to_string(),
                "not a domain".to_string(),
            ],
        );
        assert!(text.contains("address=/youtube.com/::\n"));
        assert!(text.contains("address=/www.youtube.com/::\n"));
        assert!(!text.contains("googlevideo.com"));
    }

    #[test]
    fn test_empty_rule_set_renders_header_only() {
        assert_eq!(render(&FirewallConfig::default(), &RuleSet::default(), &[]), HEADER);
    }
}
