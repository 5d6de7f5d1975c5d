use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use time::OffsetDateTime;

use netscan_rs::config::EngineConfig;
use netscan_rs::logging::{self, LogConfig, LogFormat};
use netscan_rs::request::{ScanRequestBuilder, TargetPattern, PRESETS};
use netscan_rs::types::{ScanResultSet, ScanStatus};
use netscan_rs::{export, process, server, ScanCoordinator};

/// Command-line options for a single scan run.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "netscan-rs",
    version,
    about = "Run nmap presets or allow-listed custom scans and parse results as they stream.",
    long_about = None
)]
struct Cli {
    /// Named preset: quick, intense, ping, service, udp (see --list-presets).
    #[arg(long)]
    preset: Option<String>,

    /// Target host, IP, range (10.0.0.1-20) or CIDR block. Repeatable.
    #[arg(long = "target")]
    targets: Vec<String>,

    /// File with one target per line (`#` comments allowed).
    #[arg(long = "targets-file")]
    targets_file: Option<PathBuf>,

    /// Extra scanner flags, e.g. "-sV -p 22,80". Checked against the allow-list.
    #[arg(long, allow_hyphen_values = true)]
    flags: Option<String>,

    /// Write the JSON export here. Pass "auto" for nmap_scan_<timestamp>.json.
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write the CSV export here. Pass "auto" for nmap_scan_<timestamp>.csv.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// TOML engine configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scanner binary (name on PATH or a path).
    #[arg(long)]
    scanner: Option<PathBuf>,

    /// Grace period before a cancelled scanner is killed, in milliseconds.
    #[arg(long = "grace-ms")]
    grace_ms: Option<u64>,

    /// Fail the scan with a timeout after this many seconds.
    #[arg(long = "max-runtime-secs")]
    max_runtime_secs: Option<u64>,

    /// After the scan, print the address to hand to ssh for this host.
    #[arg(long)]
    connect: Option<String>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Log format: pretty, compact or json.
    #[arg(long = "log-format", default_value = "compact")]
    log_format: LogFormat,

    /// Print the preset table and exit.
    #[arg(long = "list-presets", default_value_t = false)]
    list_presets: bool,

    /// Serve the polling API while scanning and until Ctrl+C.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Bind address for --serve-ui.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

impl Cli {
    fn wants_scan(&self) -> bool {
        self.preset.is_some()
            || !self.targets.is_empty()
            || self.targets_file.is_some()
            || self.flags.is_some()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(
        LogConfig::default()
            .level(cli.log_level.clone())
            .format(cli.log_format),
    )?;

    if cli.list_presets {
        print_presets();
        return Ok(());
    }

    let config = load_config(&cli)?;
    let banner = process::check_tool(&config.scanner_binary)
        .await
        .context("scanner is not available")?;
    println!("scanner      : {banner}");

    let coordinator = ScanCoordinator::new(&config);

    if cli.serve_ui {
        let bind = cli.bind.clone();
        let api = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, api).await {
                eprintln!("HTTP API server error: {e}");
            }
        });
        println!("API server   : http://{}/api (Ctrl+C to stop)", cli.bind);
    }

    if !cli.wants_scan() {
        if cli.serve_ui {
            let _ = tokio::signal::ctrl_c().await;
            return Ok(());
        }
        bail!("nothing to do: pass --preset, --target, --targets-file or --flags (see --help)");
    }

    let mut builder = ScanRequestBuilder::new().targets(cli.targets.clone());
    if let Some(preset) = cli.preset.as_deref() {
        builder = builder.preset(preset);
    }
    if let Some(path) = cli.targets_file.as_deref() {
        builder = builder.targets_file(path)?;
    }
    if let Some(flags) = cli.flags.as_deref() {
        builder = builder.args(flags);
    }
    let request = builder.build()?;
    println!("running      : nmap {}", request.args().join(" "));

    let session = coordinator.run_scan(request).await?;
    println!("session      : {}", session.id);

    // Ctrl-C cancels the scan.
    let cancel_on_ctrlc = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_ctrlc.cancel().await;
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let session = loop {
        ticker.tick().await;
        let snapshot = coordinator.snapshot();
        let Some(session) = snapshot.session.clone() else {
            bail!("scan session disappeared");
        };
        if session.status.is_terminal() {
            break session;
        }
        println!(
            "  [{}] lines={} hosts={} open={}",
            session.status,
            session.line_count,
            snapshot.hosts.len(),
            snapshot.open_port_count()
        );
    };

    let results = coordinator.snapshot();
    print_results_table(&results);

    if let Some(path) = cli.json.as_deref() {
        let path = resolve_export_path(path, "json");
        write_export(&path, &coordinator.export_json()?)?;
    }
    if let Some(path) = cli.csv.as_deref() {
        let path = resolve_export_path(path, "csv");
        write_export(&path, &coordinator.export_csv()?)?;
    }

    if let Some(host) = cli.connect.as_deref() {
        match coordinator.resolve_connect_target(host) {
            Ok(address) => println!("connect      : ssh {address}"),
            Err(e) => eprintln!("connect      : {e}"),
        }
    }

    if cli.serve_ui {
        println!("Press Ctrl+C to stop the server...");
        let _ = tokio::signal::ctrl_c().await;
    }

    match session.status {
        ScanStatus::Completed => Ok(()),
        ScanStatus::Cancelled => {
            println!("Scan cancelled; partial results kept.");
            Ok(())
        }
        _ => bail!(
            "scan failed: {}",
            session
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown reason".to_string())
        ),
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let base = match cli.config.as_deref() {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let mut config = base.merge_env()?;
    if let Some(scanner) = cli.scanner.clone() {
        config.scanner_binary = scanner;
    }
    if let Some(ms) = cli.grace_ms {
        config.grace_period_ms = ms;
    }
    if let Some(secs) = cli.max_runtime_secs {
        config.max_runtime_secs = (secs > 0).then_some(secs);
    }
    Ok(config)
}

fn resolve_export_path(path: &Path, ext: &str) -> PathBuf {
    if path.as_os_str() == "auto" {
        PathBuf::from(export::default_filename(ext, OffsetDateTime::now_utc()))
    } else {
        path.to_path_buf()
    }
}

fn write_export(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn print_presets() {
    let key_w = PRESETS.iter().map(|p| p.key.len()).max().unwrap_or(3).max(3);
    let name_w = PRESETS.iter().map(|p| p.name.len()).max().unwrap_or(4);
    println!("{:<key_w$}  {:<name_w$}  flags", "key", "name");
    for p in PRESETS {
        let target = match p.target {
            TargetPattern::Required => "",
            TargetPattern::LocalSubnet => "  (defaults to local /24)",
        };
        println!(
            "{:<key_w$}  {:<name_w$}  {}{}",
            p.key,
            p.name,
            p.flags.join(" "),
            target
        );
    }
}

fn print_results_table(results: &ScanResultSet) {
    let mut addr_w = "address".len();
    let mut svc_w = "service".len();
    for h in &results.hosts {
        addr_w = addr_w.max(h.label().chars().count());
        for p in &h.ports {
            svc_w = svc_w.max(p.service.as_deref().unwrap_or("").chars().count().min(20));
        }
    }
    let port_w = "port/proto".len();
    let state_w = "filtered".len();

    println!(
        "\nHosts: {}  Ports: {} ({} open)  Diagnostics: {}",
        results.hosts.len(),
        results.port_count(),
        results.open_port_count(),
        results.diagnostics.len() as u64 + results.diagnostics_dropped
    );
    if let Some(stats) = results.run_stats {
        println!(
            "nmap done    : {} addresses, {} up, {} down in {:.2}s",
            stats.hosts_total,
            stats.hosts_up,
            stats.hosts_down,
            stats.elapsed_ms as f64 / 1000.0
        );
    }
    println!(
        "{:<addr_w$}  {:<port_w$}  {:<state_w$}  {:<svc_w$}  version",
        "address", "port/proto", "state", "service"
    );
    println!(
        "{:-<addr_w$}  {:-<port_w$}  {:-<state_w$}  {:-<svc_w$}  {:-<7}",
        "", "", "", "", ""
    );
    for h in &results.hosts {
        let label = h.label();
        if let Some(mac) = h.mac.as_deref() {
            match h.vendor.as_deref() {
                Some(vendor) => println!("{label}  mac {mac} ({vendor})"),
                None => println!("{label}  mac {mac}"),
            }
        }
        if h.ports.is_empty() {
            let state = match h.state.as_bool() {
                Some(true) => "up",
                Some(false) => "down",
                None => "?",
            };
            println!("{label:<addr_w$}  {:<port_w$}  {state:<state_w$}", "-");
            continue;
        }
        for p in &h.ports {
            let service = clip(p.service.as_deref().unwrap_or(""), 20);
            let version = clip(p.version.as_deref().unwrap_or(""), 60);
            println!(
                "{label:<addr_w$}  {:<port_w$}  {:<state_w$}  {service:<svc_w$}  {version}",
                format!("{}/{}", p.number, p.transport),
                p.state.as_str(),
            );
        }
    }
}

/// First `max` characters of `s`; never splits a UTF-8 sequence.
fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
