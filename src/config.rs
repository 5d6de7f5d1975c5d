//! Engine configuration: TOML file, `NETSCAN_*` environment overrides, then CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Scanner executable: a bare name searched on `PATH`, or a path.
    pub scanner_binary: PathBuf,
    /// How long a cancelled scanner gets to exit before it is killed.
    pub grace_period_ms: u64,
    /// Optional ceiling on scan runtime; the session fails with `Timeout` when reached.
    pub max_runtime_secs: Option<u64>,
    /// Capacity of the output line channel between the process and the parser.
    pub line_buffer: usize,
    /// Parser diagnostics retained per session; older ones are counted and dropped.
    pub max_diagnostics: usize,
    /// Superseded sessions kept for inspection.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scanner_binary: PathBuf::from("nmap"),
            grace_period_ms: 3_000,
            max_runtime_secs: None,
            line_buffer: 1024,
            max_diagnostics: 500,
            history_limit: 16,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScanError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ScanError::Config(format!("failed to parse config: {e}")))
    }

    /// Apply `NETSCAN_SCANNER`, `NETSCAN_GRACE_MS` and `NETSCAN_MAX_RUNTIME_SECS`.
    pub fn merge_env(self) -> Result<Self> {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    fn merge_vars(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(val) = get("NETSCAN_SCANNER") {
            self.scanner_binary = PathBuf::from(val);
        }
        if let Some(val) = get("NETSCAN_GRACE_MS") {
            self.grace_period_ms = parse_env_number("NETSCAN_GRACE_MS", &val)?;
        }
        if let Some(val) = get("NETSCAN_MAX_RUNTIME_SECS") {
            self.max_runtime_secs = match val.trim() {
                "" | "0" => None,
                v => Some(parse_env_number("NETSCAN_MAX_RUNTIME_SECS", v)?),
            };
        }
        Ok(self)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_secs.map(Duration::from_secs)
    }
}

fn parse_env_number(key: &str, val: &str) -> Result<u64> {
    val.trim()
        .parse()
        .map_err(|_| ScanError::Config(format!("{key} must be a non-negative integer, got {val:?}")))
}
