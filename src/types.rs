use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A validated scanner invocation: flags first, then targets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub targets: Vec<String>,
    pub flags: Vec<String>,
    pub preset: Option<String>,
}

impl ScanRequest {
    /// Argument vector handed to the scanner binary (no shell involved).
    pub fn args(&self) -> Vec<String> {
        self.flags.iter().chain(self.targets.iter()).cloned().collect()
    }

    /// The target expression as the user would read it.
    pub fn target_expression(&self) -> String {
        self.targets.join(" ")
    }
}

/// Lifecycle of one scanner execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Transitions only move forward; terminal states are final.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended in `Failed`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The scanner exited nonzero (or was killed by a signal when `exit_code` is `None`).
    ProcessFailure { exit_code: Option<i32> },
    /// The configured maximum runtime elapsed.
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessFailure {
                exit_code: Some(code),
            } => write!(f, "scanner exited with code {code}"),
            Self::ProcessFailure { exit_code: None } => f.write_str("scanner terminated by signal"),
            Self::Timeout => f.write_str("maximum runtime exceeded"),
        }
    }
}

/// One execution of the external scanner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanSession {
    pub id: Uuid,
    pub request: ScanRequest,
    pub status: ScanStatus,
    pub failure: Option<FailureReason>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub line_count: u64,
    pub exit_code: Option<i32>,
    pub command: Vec<String>,
}

impl ScanSession {
    pub fn new(request: ScanRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            status: ScanStatus::Pending,
            failure: None,
            started_at: None,
            ended_at: None,
            line_count: 0,
            exit_code: None,
            command: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unsupported transport: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Unknown,
}

impl PortState {
    /// Map a state column as nmap prints it.
    pub fn from_nmap(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "filtered" | "open|filtered" | "closed|filtered" => Some(Self::Filtered),
            "unfiltered" | "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Filtered => "filtered",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Up,
    Down,
    #[default]
    Unknown,
}

impl Reachability {
    pub fn from_word(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Up => Some(true),
            Self::Down => Some(false),
            Self::Unknown => None,
        }
    }

    pub fn from_bool(up: Option<bool>) -> Self {
        match up {
            Some(true) => Self::Up,
            Some(false) => Self::Down,
            None => Self::Unknown,
        }
    }
}

/// A single transport endpoint on a host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub number: u16,
    pub transport: Transport,
    pub state: PortState,
    pub service: Option<String>,
    pub version: Option<String>,
}

/// A network endpoint and the ports discovered on it, in discovery order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub address: String,
    pub hostname: Option<String>,
    pub state: Reachability,
    pub ports: Vec<Port>,
    #[serde(default)]
    pub mac: Option<String>,
    /// Hardware vendor nmap derives from the MAC prefix.
    #[serde(default)]
    pub vendor: Option<String>,
}

impl Host {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            hostname: None,
            state: Reachability::Unknown,
            ports: Vec::new(),
            mac: None,
            vendor: None,
        }
    }

    /// Insert a port, or update the existing entry with the same number and transport in place.
    pub fn upsert_port(&mut self, port: Port) {
        match self
            .ports
            .iter_mut()
            .find(|p| p.number == port.number && p.transport == port.transport)
        {
            Some(existing) => *existing = port,
            None => self.ports.push(port),
        }
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(|p| p.state == PortState::Open)
    }

    pub fn has_open_port(&self) -> bool {
        self.open_ports().next().is_some()
    }

    /// `addr (hostname)` when a distinct hostname is known.
    pub fn label(&self) -> String {
        match self.hostname.as_deref() {
            Some(name) if name != self.address => format!("{} ({})", self.address, name),
            _ => self.address.clone(),
        }
    }
}

/// Display-oriented digest of one host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostSummary {
    pub label: String,
    pub state: Reachability,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub total_ports: usize,
    pub open_ports: usize,
    /// `22/tcp ssh [OpenSSH 9.6]`, one per open port, sorted by port then transport.
    pub open: Vec<String>,
}

impl Host {
    pub fn summary(&self) -> HostSummary {
        let mut open: Vec<&Port> = self.open_ports().collect();
        open.sort_by_key(|p| (p.number, p.transport.as_str()));
        HostSummary {
            label: self.label(),
            state: self.state,
            mac: self.mac.clone(),
            vendor: self.vendor.clone(),
            total_ports: self.ports.len(),
            open_ports: open.len(),
            open: open
                .into_iter()
                .map(|p| {
                    let service = p.service.as_deref().unwrap_or("unknown");
                    match p.version.as_deref() {
                        Some(v) => format!("{}/{} {service} [{v}]", p.number, p.transport),
                        None => format!("{}/{} {service}", p.number, p.transport),
                    }
                })
                .collect(),
        }
    }
}

/// A line the parser could not turn into a record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    pub line_no: u64,
    pub line: String,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    pub address: String,
    pub hostname: Option<String>,
    pub state: Reachability,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortEvent {
    pub host: String,
    pub port: Port,
}

/// Hardware address reported for the host block being parsed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MacEvent {
    pub host: String,
    pub mac: String,
    pub vendor: Option<String>,
}

/// Totals from the scanner's closing `Nmap done:` line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub hosts_total: u32,
    pub hosts_up: u32,
    pub hosts_down: u32,
    pub elapsed_ms: u64,
}

/// Output of the line parser.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ParseEvent {
    Host(HostEvent),
    Port(PortEvent),
    Mac(MacEvent),
    Finished(RunStats),
    Malformed(MalformedLine),
}

/// Immutable view of the current (or most recent) scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResultSet {
    pub session: Option<ScanSession>,
    pub hosts: Vec<Host>,
    pub diagnostics: Vec<MalformedLine>,
    pub diagnostics_dropped: u64,
    pub run_stats: Option<RunStats>,
}

impl ScanResultSet {
    pub fn host(&self, address: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.address == address)
    }

    pub fn port_count(&self) -> usize {
        self.hosts.iter().map(|h| h.ports.len()).sum()
    }

    pub fn open_port_count(&self) -> usize {
        self.hosts.iter().map(|h| h.open_ports().count()).sum()
    }

    pub fn status(&self) -> Option<ScanStatus> {
        self.session.as_ref().map(|s| s.status)
    }
}
