use netscan_rs::ports::{parse_port_number, parse_port_spec};
use netscan_rs::ScanError;

#[test]
fn parse_lists_ranges_and_prefixes() {
    let ports = parse_port_spec("22,80, 443,8000-8002,8001,U:53,T:3389").expect("parse ok");
    // Dedup, first appearance wins
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002, 53, 3389]);
}

#[test]
fn lone_dash_means_every_port() {
    let ports = parse_port_spec("-").expect("all ports");
    assert_eq!(ports.len(), 65535);
    assert_eq!(ports.first(), Some(&1));
    assert_eq!(ports.last(), Some(&65535));
}

#[test]
fn invalid_port_rejected() {
    for bad in ["0", "65536", "80-", "-80", "9000-8000", "http", "22,,80", ""] {
        match parse_port_spec(bad) {
            Err(ScanError::DisallowedFlag { flag, .. }) => assert!(flag.starts_with("-p")),
            other => panic!("{bad:?} should be rejected, got {other:?}"),
        }
    }
}

#[test]
fn port_numbers_are_strict() {
    assert_eq!(parse_port_number("65535"), Ok(65535));
    assert_eq!(parse_port_number(" 1 "), Ok(1));
    assert!(parse_port_number("+22").is_err());
    assert!(parse_port_number("99999999999").is_err());
}
