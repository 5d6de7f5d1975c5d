//! JSON and CSV serialization of result snapshots.

use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::types::{
    Host, Port, PortState, Reachability, RunStats, ScanResultSet, ScanStatus, Transport,
};

pub const CSV_HEADER: [&str; 7] = [
    "address",
    "hostname",
    "port",
    "transport",
    "state",
    "service",
    "version",
];

/// The JSON export document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub id: Option<Uuid>,
    pub target: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub status: Option<ScanStatus>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Totals from the scanner's closing summary, when it printed one.
    #[serde(default)]
    pub run_stats: Option<RunStats>,
    pub hosts: Vec<ExportHost>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExportHost {
    pub address: String,
    pub hostname: Option<String>,
    /// `null` when reachability was never reported.
    pub up: Option<bool>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    pub ports: Vec<ExportPort>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExportPort {
    pub number: u16,
    pub transport: Transport,
    pub state: PortState,
    pub service: Option<String>,
    pub version: Option<String>,
}

impl ExportDocument {
    pub fn from_result_set(set: &ScanResultSet) -> Self {
        let session = set.session.as_ref();
        Self {
            id: session.map(|s| s.id),
            target: session
                .map(|s| s.request.target_expression())
                .unwrap_or_default(),
            command: session.map(|s| s.command.clone()).unwrap_or_default(),
            started_at: session.and_then(|s| s.started_at),
            ended_at: session.and_then(|s| s.ended_at),
            status: session.map(|s| s.status),
            exit_code: session.and_then(|s| s.exit_code),
            reason: session.and_then(|s| s.failure.as_ref()).map(|f| f.to_string()),
            run_stats: set.run_stats,
            hosts: set.hosts.iter().map(ExportHost::from).collect(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ScanError::Import(e.to_string()))
    }

    /// Rebuild the host/port records.
    pub fn to_hosts(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .map(|h| Host {
                address: h.address.clone(),
                hostname: h.hostname.clone(),
                state: Reachability::from_bool(h.up),
                mac: h.mac.clone(),
                vendor: h.vendor.clone(),
                ports: h
                    .ports
                    .iter()
                    .map(|p| Port {
                        number: p.number,
                        transport: p.transport,
                        state: p.state,
                        service: p.service.clone(),
                        version: p.version.clone(),
                    })
                    .collect(),
            })
            .collect()
    }
}

impl From<&Host> for ExportHost {
    fn from(h: &Host) -> Self {
        Self {
            address: h.address.clone(),
            hostname: h.hostname.clone(),
            up: h.state.as_bool(),
            mac: h.mac.clone(),
            vendor: h.vendor.clone(),
            ports: h
                .ports
                .iter()
                .map(|p| ExportPort {
                    number: p.number,
                    transport: p.transport,
                    state: p.state,
                    service: p.service.clone(),
                    version: p.version.clone(),
                })
                .collect(),
        }
    }
}

pub fn to_json(set: &ScanResultSet) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(&ExportDocument::from_result_set(set))
        .map_err(|e| ScanError::Export(e.to_string()))
}

/// One row per (host, port); hosts without ports produce no rows.
pub fn to_csv(set: &ScanResultSet) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for host in &set.hosts {
        for port in &host.ports {
            let number = port.number.to_string();
            writer.write_record([
                host.address.as_str(),
                host.hostname.as_deref().unwrap_or(""),
                number.as_str(),
                port.transport.as_str(),
                port.state.as_str(),
                port.service.as_deref().unwrap_or(""),
                port.version.as_deref().unwrap_or(""),
            ])?;
        }
    }
    writer
        .into_inner()
        .map_err(|e| ScanError::Export(e.to_string()))
}

/// `nmap_scan_YYYYMMDD_HHMMSS.<ext>` for the given instant.
pub fn default_filename(ext: &str, at: OffsetDateTime) -> String {
    let stamp = at
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| String::from("00000000_000000"));
    format!("nmap_scan_{stamp}.{ext}")
}
