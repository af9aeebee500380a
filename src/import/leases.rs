//! dnsmasq lease file reader for device discovery

use crate::normalize::normalize_mac;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;

/// One active DHCP lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: String,
    pub ip: IpAddr,
    /// Empty when the client sent no hostname (`*` in the file)
    pub hostname: String,
}

/// Parse `<expiry> <mac> <ip> <hostname> <client-id>` lines.
/// DHCPv6 entries and the `duid` line have no MAC and are skipped.
pub fn parse_leases(text: &str) -> Vec<Lease> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let mac = normalize_mac(fields[1]).ok()?;
            let ip: IpAddr = fields[2].parse().ok()?;
            let hostname = match fields[3] {
                "*" => String::new(),
                name => name.to_string(),
            };
            Some(Lease { mac, ip, hostname })
        })
        .collect()
}

/// Read leases from `path`; a missing file means no leases
pub fn read_leases(path: &Path) -> io::Result<Vec<Lease>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse_leases(&text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No lease file at {}", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}
