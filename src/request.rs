//! Turns presets or user-entered text into validated [`ScanRequest`]s.
//!
//! Nothing here touches the network or spawns processes, apart from reading a target file
//! or listing local interfaces when a preset asks for the local subnet.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use ipnet::IpNet;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, ScanError};
use crate::netdetect;
use crate::ports::parse_port_spec;
use crate::types::ScanRequest;

/// Where a preset gets its targets from.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetPattern {
    /// The user must supply at least one target.
    Required,
    /// Falls back to the detected local /24 networks when no target is given.
    LocalSubnet,
}

/// A named, pre-validated flag combination.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct Preset {
    pub key: &'static str,
    pub name: &'static str,
    pub flags: &'static [&'static str],
    pub target: TargetPattern,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        key: "quick",
        name: "Quick scan (fast)",
        flags: &["-T4", "-F"],
        target: TargetPattern::Required,
    },
    Preset {
        key: "intense",
        name: "Intense scan",
        flags: &["-T4", "-A", "-v"],
        target: TargetPattern::Required,
    },
    Preset {
        key: "ping",
        name: "Ping sweep (host discovery)",
        flags: &["-sn"],
        target: TargetPattern::LocalSubnet,
    },
    Preset {
        key: "service",
        name: "Service/version scan",
        flags: &["-sV", "--top-ports", "1000"],
        target: TargetPattern::Required,
    },
    Preset {
        key: "udp",
        name: "Common UDP ports",
        flags: &["-sU", "--top-ports", "200"],
        target: TargetPattern::Required,
    },
];

pub fn find_preset(key: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.key.eq_ignore_ascii_case(key))
}

#[derive(Debug, Clone, Copy)]
enum FlagValue {
    PortSpec,
    Count { min: u32, max: u32 },
    Duration,
}

/// Flags that take no value.
const SWITCHES: &[&str] = &[
    "-sS", "-sT", "-sU", "-sV", "-sn", "-sC", "-Pn", "-n", "-R", "-F", "-A", "-O", "-v", "-vv",
    "-6", "-T0", "-T1", "-T2", "-T3", "-T4", "-T5", "--open", "--reason", "--traceroute",
    "--version-light", "--version-all",
];

/// Flags that consume one value, with how that value is checked.
const VALUED: &[(&str, FlagValue)] = &[
    ("-p", FlagValue::PortSpec),
    ("--top-ports", FlagValue::Count { min: 1, max: 65535 }),
    ("--max-retries", FlagValue::Count { min: 0, max: 10 }),
    ("--min-rate", FlagValue::Count { min: 1, max: 100_000 }),
    ("--max-rate", FlagValue::Count { min: 1, max: 100_000 }),
    ("--version-intensity", FlagValue::Count { min: 0, max: 9 }),
    ("--host-timeout", FlagValue::Duration),
];

const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '[', ']', '\'', '"', '\\', '!', '?',
    '~', '\n', '\r', '\0',
];

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*\.?$",
    )
    .expect("hostname regex is valid")
});

static OCTET_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*|\d{1,3}(?:-\d{1,3})?)\.(\*|\d{1,3}(?:-\d{1,3})?)\.(\*|\d{1,3}(?:-\d{1,3})?)\.(\*|\d{1,3}(?:-\d{1,3})?)$")
        .expect("octet range regex is valid")
});

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{1,6}(ms|s|m|h)?$").expect("duration regex is valid")
});

/// Collects a preset and/or free-form input, then validates it into a [`ScanRequest`].
#[derive(Debug, Clone, Default)]
pub struct ScanRequestBuilder {
    preset: Option<String>,
    targets: Vec<String>,
    tokens: Vec<String>,
}

impl ScanRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a named preset.
    pub fn preset(mut self, key: impl Into<String>) -> Self {
        self.preset = Some(key.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets.extend(targets.into_iter().map(Into::into));
        self
    }

    /// Free-form `flags and targets` text, e.g. `-sV -p 22,80 192.168.1.0/24`.
    ///
    /// Split on whitespace only; quoting is not interpreted.
    pub fn args(mut self, text: &str) -> Self {
        self.tokens
            .extend(text.split_whitespace().map(str::to_string));
        self
    }

    /// Append every target listed in a file (see [`load_targets_file`]).
    pub fn targets_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let targets = load_targets_file(path)?;
        Ok(self.targets(targets))
    }

    pub fn build(self) -> Result<ScanRequest> {
        let preset = match self.preset.as_deref() {
            Some(key) => Some(find_preset(key).ok_or_else(|| {
                warn!(preset = key, "unknown preset requested");
                ScanError::UnknownPreset(key.to_string())
            })?),
            None => None,
        };

        let mut flags: Vec<String> = preset
            .map(|p| p.flags.iter().map(|f| f.to_string()).collect())
            .unwrap_or_default();
        let mut targets: Vec<String> = Vec::new();

        let mut tokens = self.tokens.into_iter();
        while let Some(token) = tokens.next() {
            if token.starts_with('-') {
                let (flag, value) = split_flag(&token);
                match lookup_flag(&flag)? {
                    None => flags.push(flag),
                    Some(kind) => {
                        let value = match value {
                            Some(v) => v,
                            None => tokens.next().ok_or_else(|| {
                                ScanError::disallowed_flag(&flag, "missing value")
                            })?,
                        };
                        validate_flag_value(&flag, &value, kind)?;
                        flags.push(flag);
                        flags.push(value);
                    }
                }
            } else {
                targets.push(token);
            }
        }

        targets.extend(self.targets);
        for t in &targets {
            validate_target(t)?;
        }

        if targets.is_empty() {
            match preset.map(|p| p.target) {
                Some(TargetPattern::LocalSubnet) => {
                    targets = netdetect::detect_local_cidrs()?
                        .into_iter()
                        .map(|c| c.to_string())
                        .collect();
                    if targets.is_empty() {
                        return Err(ScanError::invalid_target(
                            "local",
                            "no local IPv4 network detected",
                        ));
                    }
                }
                _ => return Err(ScanError::invalid_target("", "no target given")),
            }
        }

        dedup_in_order(&mut targets);
        let request = ScanRequest {
            targets,
            flags,
            preset: preset.map(|p| p.key.to_string()),
        };
        debug!(args = ?request.args(), "built scan request");
        Ok(request)
    }
}

/// Split `-p22`, `--top-ports=100` style tokens into flag and attached value.
fn split_flag(token: &str) -> (String, Option<String>) {
    if let Some((flag, value)) = token.split_once('=') {
        if flag.starts_with("--") {
            return (flag.to_string(), Some(value.to_string()));
        }
    }
    if let Some(rest) = token.strip_prefix("-p") {
        if !rest.is_empty() && !token.starts_with("--") {
            return ("-p".to_string(), Some(rest.to_string()));
        }
    }
    (token.to_string(), None)
}

/// `Ok(None)` for a switch, `Ok(Some(kind))` for a valued flag.
fn lookup_flag(flag: &str) -> Result<Option<FlagValue>> {
    if flag.contains(SHELL_METACHARACTERS) {
        return Err(ScanError::disallowed_flag(flag, "contains shell metacharacters"));
    }
    if SWITCHES.contains(&flag) {
        return Ok(None);
    }
    if let Some((_, kind)) = VALUED.iter().find(|(name, _)| *name == flag) {
        return Ok(Some(*kind));
    }
    warn!(flag, "rejected flag outside the allow-list");
    Err(ScanError::disallowed_flag(flag, "not in the allow-list"))
}

fn validate_flag_value(flag: &str, value: &str, kind: FlagValue) -> Result<()> {
    let all_ports = matches!(kind, FlagValue::PortSpec) && value == "-";
    if value.contains(SHELL_METACHARACTERS) || (value.starts_with('-') && !all_ports) {
        return Err(ScanError::disallowed_flag(
            format!("{flag} {value}"),
            "invalid value",
        ));
    }
    match kind {
        FlagValue::PortSpec => parse_port_spec(value).map(|_| ()),
        FlagValue::Count { min, max } => {
            let n: u32 = value
                .parse()
                .map_err(|_| ScanError::disallowed_flag(format!("{flag} {value}"), "not a number"))?;
            if n < min || n > max {
                return Err(ScanError::disallowed_flag(
                    format!("{flag} {value}"),
                    format!("must be between {min} and {max}"),
                ));
            }
            Ok(())
        }
        FlagValue::Duration => {
            if DURATION_RE.is_match(value) {
                Ok(())
            } else {
                Err(ScanError::disallowed_flag(
                    format!("{flag} {value}"),
                    "expected a duration such as 30s or 5m",
                ))
            }
        }
    }
}

/// Accepts an IP address, a CIDR block, an IPv4 octet range (`10.0.0.1-20`, `192.168.*.1`)
/// or a hostname.
pub fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(ScanError::invalid_target(target, "empty target"));
    }
    if target.contains(SHELL_METACHARACTERS) || target.chars().any(char::is_whitespace) {
        return Err(ScanError::invalid_target(target, "contains shell metacharacters"));
    }
    if target.starts_with('-') {
        return Err(ScanError::invalid_target(target, "looks like a flag"));
    }
    if target.parse::<IpAddr>().is_ok() || target.parse::<IpNet>().is_ok() {
        return Ok(());
    }
    if target.contains('/') {
        return Err(ScanError::invalid_target(target, "invalid CIDR block"));
    }
    if let Some(caps) = OCTET_RANGE_RE.captures(target) {
        for octet in caps.iter().skip(1).flatten() {
            check_octet(target, octet.as_str())?;
        }
        return Ok(());
    }
    let looks_numeric = target
        .split('.')
        .all(|label| !label.is_empty() && label.bytes().all(|b| b.is_ascii_digit()));
    if looks_numeric {
        return Err(ScanError::invalid_target(target, "invalid IPv4 address"));
    }
    if target.len() <= 253 && HOSTNAME_RE.is_match(target) {
        return Ok(());
    }
    Err(ScanError::invalid_target(
        target,
        "expected a host, IP address, range or CIDR block",
    ))
}

fn check_octet(target: &str, octet: &str) -> Result<()> {
    if octet == "*" {
        return Ok(());
    }
    let (a, b) = octet.split_once('-').unwrap_or((octet, octet));
    let parse = |s: &str| {
        s.parse::<u16>()
            .ok()
            .filter(|n| *n <= 255)
            .ok_or_else(|| ScanError::invalid_target(target, format!("octet out of range: {s}")))
    };
    if parse(a)? > parse(b)? {
        return Err(ScanError::invalid_target(target, format!("reversed range: {octet}")));
    }
    Ok(())
}

/// Read one target per line. Blank lines and `#` comments are skipped, a leading `~` expands
/// to `$HOME`, and every entry is validated.
pub fn load_targets_file(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = expand_home(path.as_ref());
    let fail = |reason: String| ScanError::TargetFile {
        path: path.clone(),
        reason,
    };
    if !path.exists() {
        return Err(fail("not found".into()));
    }
    if !path.is_file() {
        return Err(fail("not a file".into()));
    }
    let content = std::fs::read_to_string(&path).map_err(|e| fail(e.to_string()))?;
    let mut targets = Vec::new();
    for raw in content.lines() {
        let line = raw.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        validate_target(line)?;
        targets.push(line.to_string());
    }
    if targets.is_empty() {
        return Err(fail("file is empty".into()));
    }
    Ok(targets)
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn dedup_in_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|t| seen.insert(t.clone()));
}
