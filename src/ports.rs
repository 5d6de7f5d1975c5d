use std::collections::HashSet;

use crate::error::{Result, ScanError};

/// Parse an nmap-style port specification into a deduplicated list of ports (1..=65535).
///
/// Supported forms, comma separated:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - transport prefix on any item: `T:22`, `U:53,161`
/// - a lone `-`: all ports
///
/// A prefix applies to the items that follow it, as nmap does; the transport itself is
/// not tracked here.
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    if spec.trim().is_empty() {
        return Err(reject(spec, "empty port specification"));
    }
    // `-p-` means every port.
    if spec.trim() == "-" {
        return Ok((1..=u16::MAX).collect());
    }

    for raw in spec.split(',') {
        let item = raw.trim();
        let item = item
            .strip_prefix("T:")
            .or_else(|| item.strip_prefix("U:"))
            .unwrap_or(item);
        if item.is_empty() {
            return Err(reject(spec, "empty item"));
        }

        if let Some((a, b)) = item.split_once('-') {
            let start = parse_port_number(a).map_err(|e| reject(spec, e))?;
            let end = parse_port_number(b).map_err(|e| reject(spec, e))?;
            if start > end {
                return Err(reject(spec, format!("invalid range {start}-{end} (start > end)")));
            }
            for p in start..=end {
                if seen.insert(p) {
                    out.push(p);
                }
            }
            continue;
        }

        let p = parse_port_number(item).map_err(|e| reject(spec, e))?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    Ok(out)
}

/// Strictly parse a port number, rejecting 0 and anything above 65535.
pub fn parse_port_number(s: &str) -> std::result::Result<u16, String> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("not a port number: {s:?}"));
    }
    let val: u32 = s
        .parse::<u32>()
        .map_err(|_| format!("port out of range: {s}"))?;
    if val == 0 || val > 65535 {
        return Err(format!("port out of range: {val}"));
    }
    Ok(val as u16)
}

fn reject(spec: &str, reason: impl Into<String>) -> ScanError {
    ScanError::disallowed_flag(format!("-p {spec}"), reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let ports = parse_port_spec("80,22, 443 ").unwrap();
        assert_eq!(ports, vec![80, 22, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_spec("8000-8002,80,8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn transport_prefixes_are_accepted() {
        let ports = parse_port_spec("T:22,80,U:53").unwrap();
        assert_eq!(ports, vec![22, 80, 53]);
    }

    #[test]
    fn out_of_range_values_error() {
        assert!(parse_port_spec("70000").is_err());
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("20-10").is_err());
        assert!(parse_port_spec("80,,81").is_err());
    }

    #[test]
    fn port_number_rejects_signs_and_huge_values() {
        assert_eq!(parse_port_number("65535"), Ok(65535));
        assert!(parse_port_number("+22").is_err());
        assert!(parse_port_number("99999999999").is_err());
    }
}
