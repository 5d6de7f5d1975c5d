use netscan_rs::netdetect::{detect_local_cidrs, ipv4_to_default_cidr};
use std::net::Ipv4Addr;

#[test]
fn default_cidr_is_24() {
    let cidr = ipv4_to_default_cidr(Ipv4Addr::new(192, 168, 42, 99));
    assert_eq!(cidr.to_string(), "192.168.42.0/24");
}

#[test]
fn detected_subnets_are_ipv4_slash_24() {
    if let Ok(cidrs) = detect_local_cidrs() {
        let mut sorted = cidrs.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), cidrs.len(), "duplicates in {cidrs:?}");
        for cidr in cidrs {
            match cidr {
                ipnet::IpNet::V4(net) => {
                    assert_eq!(net.prefix_len(), 24);
                    assert_eq!(net.network().octets()[3], 0);
                    assert!(!net.network().is_loopback());
                }
                ipnet::IpNet::V6(net) => panic!("unexpected IPv6 subnet {net}"),
            }
        }
    }
}
