//! Domain and network canonicalisation
//!
//! Everything that ends up in a firewall set or a resolver directive passes
//! through here first. Domains are lower-cased and stripped of decoration,
//! networks are widened to CIDR form and truncated to their network address.
//! Effective sets are `BTreeSet`s so merging is idempotent and ordered.

use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),
    #[error("Invalid network: {0:?}")]
    InvalidNetwork(String),
    #[error("Invalid MAC address: {0:?}")]
    InvalidMac(String),
}

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

fn is_decoration(c: char) -> bool {
    matches!(
        c,
        '.' | ',' | ';' | '"' | '\'' | '`' | '(' | ')' | '[' | ']' | '<' | '>'
    )
}

/// Canonicalise a domain name.
///
/// Accepts pasted forms such as `" *.YouTube.com. "` or
/// `https://youtube.com/watch` and reduces them to `youtube.com`.
pub fn normalize_domain(raw: &str) -> Result<String, NormalizeError> {
    let invalid = || NormalizeError::InvalidDomain(raw.to_string());

    let mut s = raw.trim();
    if let Some((_, rest)) = s.split_once("://") {
        s = rest;
    }
    if let Some(idx) = s.find(['/', '?', '#']) {
        s = &s[..idx];
    }
    let s = s.trim().trim_start_matches("*.").trim_matches(is_decoration);
    let domain = s.to_ascii_lowercase();

    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN || !domain.contains('.') {
        return Err(invalid());
    }
    if domain.parse::<IpAddr>().is_ok() {
        return Err(invalid());
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid());
        }
    }

    Ok(domain)
}

/// Canonicalise an address or CIDR.
///
/// Bare addresses become host networks (`/32` or `/128`); explicit prefixes
/// are truncated to the network address (`10.1.2.3/8` becomes `10.0.0.0/8`).
pub fn normalize_network(raw: &str) -> Result<IpNet, NormalizeError> {
    let s = raw.trim().trim_matches(|c| matches!(c, ',' | ';' | '"' | '\''));
    let invalid = || NormalizeError::InvalidNetwork(raw.to_string());

    if s.contains('/') {
        let net: IpNet = s.parse().map_err(|_| invalid())?;
        return Ok(net.trunc());
    }

    let addr: IpAddr = s.parse().map_err(|_| invalid())?;
    Ok(IpNet::from(addr))
}

/// Canonicalise a MAC address to lower-case, colon-separated form.
pub fn normalize_mac(raw: &str) -> Result<String, NormalizeError> {
    let invalid = || NormalizeError::InvalidMac(raw.to_string());
    let octets: Vec<&str> = raw.trim().split([':', '-']).collect();
    if octets.len() != 6 {
        return Err(invalid());
    }
    let mut out = Vec::with_capacity(6);
    for octet in octets {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        out.push(octet.to_ascii_lowercase());
    }
    Ok(out.join(":"))
}

/// Merge domain lists into one canonical set, dropping entries that fail
/// normalisation.
pub fn merge_domains<'a, I>(lists: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut out = BTreeSet::new();
    for list in lists {
        for raw in list {
            match normalize_domain(raw) {
                Ok(d) => {
                    out.insert(d);
                }
                Err(e) => debug!("Dropping entry during merge: {}", e),
            }
        }
    }
    out
}

/// Merge network lists into one canonical set.
pub fn merge_networks<'a, I>(lists: I) -> BTreeSet<IpNet>
where
    I: IntoIterator<Item = &'a [IpNet]>,
{
    lists
        .into_iter()
        .flat_map(|list| list.iter().map(IpNet::trunc))
        .collect()
}

/// Normalise a batch of raw domain strings, failing on the first bad entry.
pub fn normalize_domains(raw: &[String]) -> Result<Vec<String>, NormalizeError> {
    let set: BTreeSet<String> = raw
        .iter()
        .map(|d| normalize_domain(d))
        .collect::<Result<_, _>>()?;
    Ok(set.into_iter().collect())
}

/// Normalise a batch of raw network strings, failing on the first bad entry.
pub fn normalize_networks(raw: &[String]) -> Result<Vec<IpNet>, NormalizeError> {
    let set: BTreeSet<IpNet> = raw
        .iter()
        .map(|n| normalize_network(n))
        .collect::<Result<_, _>>()?;
    Ok(set.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_lowercase_and_trim() {
        assert_eq!(normalize_domain("  YouTube.COM ").unwrap(), "youtube.com");
        assert_eq!(normalize_domain("*.ytimg.com").unwrap(), "ytimg.com");
        assert_eq!(normalize_domain("\"ggpht.com\",").unwrap(), "ggpht.com");
        assert_eq!(normalize_domain(".example.org.").unwrap(), "example.org");
    }

    #[test]
    fn test_domain_from_url() {
        assert_eq!(
            normalize_domain("https://Music.YouTube.com/watch?v=1").unwrap(),
            "music.youtube.com"
        );
    }

    #[test]
    fn test_domain_rejects_garbage() {
        for bad in ["", "   ", "localhost", "exa mple.com", "-bad.com", "a..b", "1.2.3.4"] {
            assert!(
                matches!(normalize_domain(bad), Err(NormalizeError::InvalidDomain(_))),
                "expected {:?} to be rejected",
                bad
            );
        }
        let long_label = format!("{}.com", "a".repeat(64));
        assert!(normalize_domain(&long_label).is_err());
    }

    #[test]
    fn test_domain_normalize_is_stable() {
        let once = normalize_domain(" *.Instagram.com. ").unwrap();
        let twice = normalize_domain(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_network_bare_addresses_widened() {
        assert_eq!(
            normalize_network("1.2.3.4").unwrap().to_string(),
            "1.2.3.4/32"
        );
        assert_eq!(
            normalize_network("2001:db8::1").unwrap().to_string(),
            "2001:db8::1/128"
        );
    }

    #[test]
    fn test_network_cidr_truncated() {
        assert_eq!(
            normalize_network("157.240.12.1/16").unwrap().to_string(),
            "157.240.0.0/16"
        );
        assert_eq!(
            normalize_network(" 10.0.0.0/8 ").unwrap().to_string(),
            "10.0.0.0/8"
        );
    }

    #[test]
    fn test_network_rejects_malformed() {
        for bad in ["", "10.0.0.0/33", "10.0.0/8", "not-an-ip", "1.2.3.4/", "::1/129"] {
            assert!(
                matches!(normalize_network(bad), Err(NormalizeError::InvalidNetwork(_))),
                "expected {:?} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_mac_normalized() {
        assert_eq!(
            normalize_mac("AA-BB-CC-00-11-22").unwrap(),
            "aa:bb:cc:00:11:22"
        );
        assert!(normalize_mac("aa:bb:cc:00:11").is_err());
        assert!(normalize_mac("zz:bb:cc:00:11:22").is_err());
    }

    #[test]
    fn test_merge_domains_is_set_union() {
        let source = vec!["youtube.com".to_string(), "YouTube.com".to_string()];
        let custom = vec!["ytimg.com".to_string(), "youtube.com ".to_string()];

        let merged = merge_domains([source.as_slice(), custom.as_slice()]);
        assert_eq!(
            merged.iter().cloned().collect::<Vec<_>>(),
            vec!["youtube.com", "ytimg.com"]
        );

        let as_vec: Vec<String> = merged.iter().cloned().collect();
        let again = merge_domains([as_vec.as_slice(), custom.as_slice()]);
        assert_eq!(merged, again);
    }

    #[test]
    fn test_merge_networks_dedupes() {
        let a = vec![normalize_network("1.1.1.1").unwrap()];
        let b = vec![
            normalize_network("1.1.1.1/32").unwrap(),
            normalize_network("8.8.8.0/24").unwrap(),
        ];
        let merged = merge_networks([a.as_slice(), b.as_slice()]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_normalize_batches() {
        let ok = normalize_domains(&["B.com".to_string(), "a.com".to_string(), "b.com".to_string()])
            .unwrap();
        assert_eq!(ok, vec!["a.com", "b.com"]);

        let err = normalize_networks(&["1.1.1.1".to_string(), "bogus".to_string()]);
        assert_eq!(err, Err(NormalizeError::InvalidNetwork("bogus".to_string())));
    }
}
