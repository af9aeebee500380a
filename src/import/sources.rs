//! Remote source lists feeding a service's `domains` and `ips`

use super::subscription::fetch_text;
use crate::config::SubscriptionConfig;
use crate::model::{SourceFormat, SourceList};
use crate::normalize::{normalize_domain, normalize_network};
use ipnet::{IpNet, Ipv4Net, ipv4_mask_to_prefix};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to fetch {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("No usable entries in {0}")]
    Empty(String),
}

/// Entries collected from one or more source lists
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SourceContent {
    pub domains: BTreeSet<String>,
    pub networks: BTreeSet<IpNet>,
}

impl SourceContent {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.networks.is_empty()
    }

    pub fn extend(&mut self, other: SourceContent) {
        self.domains.extend(other.domains);
        self.networks.extend(other.networks);
    }
}

fn content_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(|l| l.split('#').next().unwrap_or_default().trim())
        .filter(|l| !l.is_empty())
}

/// `route add <ip> mask <netmask> [gateway]`
fn parse_route_line(line: &str) -> Option<IpNet> {
    let mut words = line.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("route") || !words.next()?.eq_ignore_ascii_case("add") {
        return None;
    }
    let addr: Ipv4Addr = words.next()?.parse().ok()?;
    if !words.next()?.eq_ignore_ascii_case("mask") {
        return None;
    }
    let mask: Ipv4Addr = words.next()?.parse().ok()?;
    let prefix = ipv4_mask_to_prefix(mask).ok()?;
    Ipv4Net::new(addr, prefix).ok().map(|n| IpNet::V4(n.trunc()))
}

/// Parse a source list body. Lines that do not fit the format are skipped.
pub fn parse_source(text: &str, format: SourceFormat) -> SourceContent {
    let format = match format {
        SourceFormat::Auto if content_lines(text).any(|l| l.starts_with("route ")) => {
            SourceFormat::Netmask
        }
        SourceFormat::Auto => SourceFormat::Plain,
        other => other,
    };

    let mut content = SourceContent::default();
    let mut skipped = 0usize;
    for line in content_lines(text) {
        let ok = match format {
            SourceFormat::Netmask => parse_route_line(line).map(|n| content.networks.insert(n)),
            SourceFormat::Plain | SourceFormat::Auto => {
                normalize_network(line).ok().map(|n| content.networks.insert(n))
            }
            SourceFormat::Domains => normalize_domain(line).ok().map(|d| content.domains.insert(d)),
        };
        if ok.is_none() {
            skipped += 1;
        }
    }
    if skipped > 0 {
        debug!("Skipped {} unparseable source lines ({:?})", skipped, format);
    }
    content
}

pub async fn fetch_source(
    source: &SourceList,
    config: &SubscriptionConfig,
) -> Result<SourceContent, SourceError> {
    let text = fetch_text(&source.url, config)
        .await
        .map_err(|e| SourceError::FetchFailed {
            url: source.url.clone(),
            source: e,
        })?;
    let content = parse_source(&text, source.format);
    if content.is_empty() {
        return Err(SourceError::Empty(source.url.clone()));
    }
    info!(
        "Source {}: {} domains, {} networks",
        source.url,
        content.domains.len(),
        content.networks.len()
    );
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask_lines() {
        let text = "# generated\n\
                    route add 91.108.4.0 mask 255.255.252.0 default\n\
                    route add 149.154.167.99 mask 255.255.255.255 default\n\
                    route add 10.0.0.1 mask 255.0.255.0 default\n\
                    garbage\n";
        let content = parse_source(text, SourceFormat::Auto);
        let nets: Vec<String> = content.networks.iter().map(|n| n.to_string()).collect();
        assert_eq!(nets, vec!["91.108.4.0/22", "149.154.167.99/32"]);
    }

    #[test]
    fn test_plain_lines() {
        let text = "1.2.3.4\n10.0.0.0/8 # private\n2001:db8::/32\nnot-an-ip\n";
        let content = parse_source(text, SourceFormat::Auto);
        assert_eq!(content.networks.len(), 3);
        assert!(content.domains.is_empty());
    }

    #[test]
    fn test_domain_lines() {
        let text = "*.Discord.com\ndiscord.gg\n\nnot a domain\n";
        let content = parse_source(text, SourceFormat::Domains);
        let domains: Vec<&str> = content.domains.iter().map(String::as_str).collect();
        assert_eq!(domains, vec!["discord.com", "discord.gg"]);
    }

    #[test]
    fn test_empty_body() {
        assert!(parse_source("# nothing\n", SourceFormat::Plain).is_empty());
    }
}
