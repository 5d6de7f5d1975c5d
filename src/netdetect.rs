use std::collections::HashSet;
use std::net::Ipv4Addr;

use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};

use crate::error::{Result, ScanError};

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 CIDR network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed. Used to resolve presets whose target pattern is the local subnet.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let ifaces = get_if_addrs()
        .map_err(|e| ScanError::invalid_target("local", format!("interface lookup failed: {e}")))?;
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in ifaces {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(v4.ip));
        }
    }
    let mut cidrs: Vec<Ipv4Net> = set.into_iter().collect();
    // Sort for stable output
    cidrs.sort_by_key(|n| (u32::from(n.network()), n.prefix_len()));
    Ok(cidrs.into_iter().map(IpNet::V4).collect())
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    // /24 is always a valid prefix length, so `trunc` cannot fail here.
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24)
        .map(|n| n.trunc())
        .unwrap_or_else(|_| Ipv4Net::from(ip))
}
