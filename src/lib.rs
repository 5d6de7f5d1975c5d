//! Library crate for netscan-rs: runs nmap as a child process, parses its output while it
//! streams, and keeps the results as immutable snapshots for display and export.
pub mod config;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod logging;
pub mod netdetect;
pub mod parser;
pub mod ports;
pub mod process;
pub mod request;
pub mod server;
pub mod store;
pub mod types;

pub use coordinator::ScanCoordinator;
pub use error::{Result, ScanError};
pub use request::ScanRequestBuilder;
