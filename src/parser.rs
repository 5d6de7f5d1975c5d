//! Incremental parser for the scanner's human-readable output.
//!
//! Two host-banner dialects are recognized:
//!
//! ```text
//! Nmap scan report for gateway.lan (192.168.1.1)
//! Host: 10.0.0.1 (up)
//! ```
//!
//! followed by port rows such as `22/tcp open ssh OpenSSH 9.6`. Lines that belong to
//! neither shape are either known chatter (banners, footers, NSE script output) or
//! reported as [`MalformedLine`] diagnostics.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::ports::parse_port_number;
use crate::types::{
    HostEvent, MacEvent, MalformedLine, ParseEvent, Port, PortEvent, PortState, Reachability,
    RunStats, Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Idle,
    InHostBlock,
    InPortTable,
}

static NMAP_REPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Nmap scan report for (?:(?P<name>\S+) \((?P<addr>[^)\s]+)\)|(?P<bare>\S+))$")
        .expect("report regex is valid")
});

static HOST_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Host:\s+(?P<addr>[^\s()]+)(?:\s+(?P<name>[^\s()]+))?\s+\((?P<state>[A-Za-z]+)\)$",
    )
    .expect("host regex is valid")
});

static PORT_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<port>\d+)/(?P<proto>[a-z]+)\s+(?P<state>[a-z|]+)(?:\s+(?P<service>\S+))?(?:\s+(?P<version>.+?))?\s*$",
    )
    .expect("port regex is valid")
});

static MAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^MAC Address: (?P<mac>[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5})(?: \((?P<vendor>[^)]*)\))?$")
        .expect("mac regex is valid")
});

static DONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Nmap done: (?P<total>\d+) IP address(?:es)? \((?P<up>\d+) hosts? up\) scanned in (?P<secs>\d+(?:\.\d+)?) seconds$",
    )
    .expect("footer regex is valid")
});

/// Chatter that never changes parse state, even inside a port table.
const CONTINUATION_PREFIXES: &[&str] = &["|", "Not shown:", "All ", "Some closed ports"];

/// Lines the scanner routinely prints outside of host/port records.
const KNOWN_PREFIXES: &[&str] = &[
    "Starting Nmap",
    "Nmap done:",
    "Host is up",
    "Host seems down",
    "PORT ",
    "MAC Address:",
    "Service Info:",
    "Service detection performed",
    "OS detection performed",
    "Read data files from:",
    "Other addresses for",
    "rDNS record for",
    "Device type:",
    "Running:",
    "Running (JUST GUESSING):",
    "OS CPE:",
    "OS details:",
    "Aggressive OS guesses:",
    "No exact OS matches",
    "Network Distance:",
    "TRACEROUTE",
    "HOP ",
    "Host script results:",
    "Warning:",
    "Initiating ",
    "Completed ",
    "Scanning ",
    "Discovered open port",
    "Stats:",
    "NSE:",
    "Uptime guess:",
    "TCP Sequence Prediction:",
    "IP ID Sequence Generation:",
    "Raw packets sent:",
    "Nmap scan report for",
];

/// Line-at-a-time state machine producing [`ParseEvent`]s.
///
/// A malformed line never alters the state or the current host.
#[derive(Debug)]
pub struct OutputParser {
    state: ParserState,
    current_host: Option<String>,
    line_no: u64,
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Idle,
            current_host: None,
            line_no: 0,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn current_host(&self) -> Option<&str> {
        self.current_host.as_deref()
    }

    pub fn lines_seen(&self) -> u64 {
        self.line_no
    }

    /// Feed one line (without its terminator). Returns at most one event.
    pub fn feed(&mut self, raw: &str) -> Option<ParseEvent> {
        self.line_no += 1;
        let line = raw.trim_end_matches(['\r', '\n']).trim();

        if let Some(event) = self.try_host_banner(line) {
            return Some(event);
        }

        if let Some(caps) = PORT_ROW_RE.captures(line) {
            return Some(self.port_row(line, &caps));
        }

        if let Some(state) = host_status_line(line) {
            // `Host is up` / `Host seems down` refine the reachability of the open block.
            if self.state == ParserState::InHostBlock {
                if let Some(addr) = self.current_host.clone() {
                    return Some(ParseEvent::Host(HostEvent {
                        address: addr,
                        hostname: None,
                        state,
                    }));
                }
            }
            return None;
        }

        if let Some(caps) = MAC_RE.captures(line) {
            let event = self.current_host.clone().map(|host| {
                ParseEvent::Mac(MacEvent {
                    host,
                    mac: caps["mac"].to_ascii_uppercase(),
                    vendor: caps
                        .name("vendor")
                        .map(|m| m.as_str().trim().to_string())
                        .filter(|v| !v.is_empty() && v != "Unknown"),
                })
            });
            self.close_port_table();
            return event;
        }

        if let Some(caps) = DONE_RE.captures(line) {
            self.close_port_table();
            return run_stats(&caps).map(ParseEvent::Finished);
        }

        if line.is_empty() || KNOWN_PREFIXES.iter().any(|p| line.starts_with(p)) {
            self.close_port_table();
            return None;
        }

        if CONTINUATION_PREFIXES.iter().any(|p| line.starts_with(p)) {
            return None;
        }

        Some(self.malformed(line, "unrecognized line"))
    }

    /// Parse a complete transcript, for tests and offline use.
    pub fn parse_all<'a, I>(&mut self, lines: I) -> Vec<ParseEvent>
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines.into_iter().filter_map(|l| self.feed(l)).collect()
    }

    fn try_host_banner(&mut self, line: &str) -> Option<ParseEvent> {
        let (address, hostname, state) = if let Some(caps) = NMAP_REPORT_RE.captures(line) {
            match (caps.name("addr"), caps.name("bare")) {
                (Some(addr), _) => (
                    addr.as_str().to_string(),
                    caps.name("name").map(|m| m.as_str().to_string()),
                    Reachability::Unknown,
                ),
                (None, Some(bare)) => (bare.as_str().to_string(), None, Reachability::Unknown),
                (None, None) => return None,
            }
        } else if let Some(caps) = HOST_LINE_RE.captures(line) {
            let word = caps.name("state").map(|m| m.as_str()).unwrap_or_default();
            let Some(state) = Reachability::from_word(word) else {
                return Some(self.malformed(line, &format!("unknown host state: {word}")));
            };
            (
                caps["addr"].to_string(),
                caps.name("name").map(|m| m.as_str().to_string()),
                state,
            )
        } else {
            return None;
        };

        self.state = ParserState::InHostBlock;
        self.current_host = Some(address.clone());
        Some(ParseEvent::Host(HostEvent {
            address,
            hostname,
            state,
        }))
    }

    fn port_row(&mut self, line: &str, caps: &regex::Captures<'_>) -> ParseEvent {
        let host = match (self.state, self.current_host.as_ref()) {
            (ParserState::InHostBlock | ParserState::InPortTable, Some(h)) => h.clone(),
            _ => return self.malformed(line, "port row outside of a host block"),
        };
        let number = match parse_port_number(&caps["port"]) {
            Ok(n) => n,
            Err(e) => return self.malformed(line, &e),
        };
        let transport: Transport = match caps["proto"].parse() {
            Ok(t) => t,
            Err(e) => return self.malformed(line, &e),
        };
        let Some(state) = PortState::from_nmap(&caps["state"]) else {
            return self.malformed(line, &format!("unknown port state: {}", &caps["state"]));
        };

        self.state = ParserState::InPortTable;
        ParseEvent::Port(PortEvent {
            host,
            port: Port {
                number,
                transport,
                state,
                service: caps.name("service").map(|m| m.as_str().to_string()),
                version: caps
                    .name("version")
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|v| !v.is_empty()),
            },
        })
    }

    fn close_port_table(&mut self) {
        if self.state == ParserState::InPortTable {
            self.state = ParserState::Idle;
            self.current_host = None;
        }
    }

    fn malformed(&self, line: &str, reason: &str) -> ParseEvent {
        debug!(line_no = self.line_no, reason, "malformed scanner output line");
        ParseEvent::Malformed(MalformedLine {
            line_no: self.line_no,
            line: line.to_string(),
            reason: reason.to_string(),
        })
    }
}

fn run_stats(caps: &regex::Captures<'_>) -> Option<RunStats> {
    let hosts_total: u32 = caps["total"].parse().ok()?;
    let hosts_up: u32 = caps["up"].parse().ok()?;
    let secs: f64 = caps["secs"].parse().ok()?;
    Some(RunStats {
        hosts_total,
        hosts_up,
        hosts_down: hosts_total.saturating_sub(hosts_up),
        elapsed_ms: (secs * 1000.0).round() as u64,
    })
}

fn host_status_line(line: &str) -> Option<Reachability> {
    if line.starts_with("Host is up") {
        Some(Reachability::Up)
    } else if line.starts_with("Host seems down") {
        Some(Reachability::Down)
    } else {
        None
    }
}
