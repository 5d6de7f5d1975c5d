#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use netscan_rs::config::EngineConfig;
use netscan_rs::export::ExportDocument;
use netscan_rs::store::StatusChange;
use netscan_rs::types::{FailureReason, RunStats, ScanRequest, ScanStatus};
use netscan_rs::{ScanCoordinator, ScanError, ScanRequestBuilder};
use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;

const TWO_HOSTS: &str = r#"
echo "Starting Nmap 7.94 ( https://nmap.org )"
echo "Warning: fake scanner in use" >&2
echo "Host: 10.0.0.1 router.lan (up)"
echo "22/tcp open ssh OpenSSH 9.6"
echo "80/tcp open http"
echo "Host: 10.0.0.2 (up)"
echo "443/tcp open https"
echo "Nmap done: 2 IP addresses (2 hosts up) scanned in 0.01 seconds"
"#;

const FAILS_AFTER_ONE_HOST: &str = r#"
echo "Host: 10.0.0.1 (up)"
echo "22/tcp open ssh"
echo "scan aborted" >&2
exit 3
"#;

const HANGS_AFTER_ONE_HOST: &str = r#"
echo "Host: 10.0.0.1 (up)"
echo "22/tcp open ssh"
exec sleep 30
"#;

const IGNORES_SIGTERM: &str = r#"
trap '' TERM
echo "Host: 10.0.0.1 (up)"
while :; do sleep 0.1; done
"#;

const LAN_HOST_WITH_MAC: &str = r#"
echo "Host: 192.168.1.7 (up)"
echo "22/tcp open ssh"
echo "MAC Address: b8:27:eb:12:34:56 (Raspberry Pi Foundation)"
echo "Nmap done: 4 IP addresses (1 host up) scanned in 1.25 seconds"
"#;

const EXITS_LEAVING_CHILD_ON_STDOUT: &str = r#"
echo 'Host: 10.0.0.1 (up)'
echo '22/tcp open ssh'
sleep 20 &
exit 0
"#;

const WAIT: Duration = Duration::from_secs(10);

fn fake_scanner(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn coordinator(scanner: &Path, max_runtime_secs: Option<u64>) -> ScanCoordinator {
    ScanCoordinator::new(&EngineConfig {
        scanner_binary: scanner.to_path_buf(),
        grace_period_ms: 300,
        max_runtime_secs,
        ..EngineConfig::default()
    })
}

fn request() -> ScanRequest {
    ScanRequestBuilder::new()
        .target("10.0.0.0/30")
        .args("-sV -p 22,80,443")
        .build()
        .unwrap()
}

async fn wait_for_hosts(coordinator: &ScanCoordinator, n: usize) {
    let mut rx = coordinator.store().subscribe();
    timeout(WAIT, rx.wait_for(|set| set.hosts.len() >= n))
        .await
        .expect("hosts did not appear in time")
        .expect("store closed");
}

#[tokio::test]
async fn completed_scan_collects_hosts_in_order() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", TWO_HOSTS), None);

    let started = coordinator.run_scan(request()).await.unwrap();
    assert_eq!(started.status, ScanStatus::Running);
    assert!(started.command[0].ends_with("nmap"));
    assert!(started.command.contains(&"-sV".to_string()));
    assert_eq!(started.command.last().map(String::as_str), Some("10.0.0.0/30"));

    let done = timeout(WAIT, coordinator.wait()).await.unwrap().unwrap();
    assert_eq!(done.id, started.id);
    assert_eq!(done.status, ScanStatus::Completed);
    assert_eq!(done.exit_code, Some(0));
    assert_eq!(done.failure, None);
    assert_eq!(done.line_count, 8);
    assert!(done.started_at <= done.ended_at);

    let snap = coordinator.snapshot();
    let counts: Vec<_> = snap
        .hosts
        .iter()
        .map(|h| (h.address.as_str(), h.ports.len()))
        .collect();
    assert_eq!(counts, vec![("10.0.0.1", 2), ("10.0.0.2", 1)]);
    assert_eq!(snap.hosts[0].hostname.as_deref(), Some("router.lan"));
    assert!(snap.diagnostics.is_empty(), "{:?}", snap.diagnostics);
}

#[tokio::test]
async fn nonzero_exit_fails_and_keeps_partial_results() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", FAILS_AFTER_ONE_HOST), None);

    coordinator.run_scan(request()).await.unwrap();
    let done = timeout(WAIT, coordinator.wait()).await.unwrap().unwrap();

    assert_eq!(done.status, ScanStatus::Failed);
    assert_eq!(
        done.failure,
        Some(FailureReason::ProcessFailure { exit_code: Some(3) })
    );
    let snap = coordinator.snapshot();
    assert_eq!(snap.hosts.len(), 1);
    assert_eq!(snap.port_count(), 1);
    // stderr chatter that is not scanner output shows up as a diagnostic
    assert_eq!(snap.diagnostics.len(), 1);
    assert_eq!(snap.diagnostics[0].line, "scan aborted");
}

#[tokio::test]
async fn cancel_stops_the_scan_and_freezes_results() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", HANGS_AFTER_ONE_HOST), None);

    coordinator.run_scan(request()).await.unwrap();
    wait_for_hosts(&coordinator, 1).await;

    let cancelled = timeout(WAIT, coordinator.cancel()).await.unwrap().unwrap();
    assert_eq!(cancelled.status, ScanStatus::Cancelled);
    assert!(cancelled.ended_at.is_some());

    let before = coordinator.snapshot();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = coordinator.snapshot();
    assert_eq!(before.hosts, after.hosts);
    assert_eq!(after.status(), Some(ScanStatus::Cancelled));
    assert_eq!(after.port_count(), 1);
}

#[tokio::test]
async fn stubborn_scanner_is_killed_after_grace_period() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", IGNORES_SIGTERM), None);

    coordinator.run_scan(request()).await.unwrap();
    wait_for_hosts(&coordinator, 1).await;

    let cancelled = timeout(WAIT, coordinator.cancel()).await.unwrap().unwrap();
    assert_eq!(cancelled.status, ScanStatus::Cancelled);
    assert_eq!(cancelled.exit_code, None);
}

#[tokio::test]
async fn new_scan_replaces_the_running_one() {
    let dir = TempDir::new().unwrap();
    let slow = fake_scanner(&dir, "slow-nmap", HANGS_AFTER_ONE_HOST);
    let coordinator = coordinator(&slow, None);

    let first = coordinator.run_scan(request()).await.unwrap();
    wait_for_hosts(&coordinator, 1).await;
    let second = coordinator.run_scan(request()).await.unwrap();
    assert_ne!(first.id, second.id);

    let history = coordinator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, first.id);
    assert_eq!(history[0].status, ScanStatus::Cancelled);

    // The fresh session starts from an empty result set.
    assert_eq!(coordinator.status().map(|s| s.id), Some(second.id));
    coordinator.cancel().await;
}

#[tokio::test]
async fn max_runtime_fails_with_timeout() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", HANGS_AFTER_ONE_HOST), Some(1));

    coordinator.run_scan(request()).await.unwrap();
    let done = timeout(WAIT, coordinator.wait()).await.unwrap().unwrap();
    assert_eq!(done.status, ScanStatus::Failed);
    assert_eq!(done.failure, Some(FailureReason::Timeout));
    assert_eq!(coordinator.snapshot().hosts.len(), 1);
}

#[tokio::test]
async fn missing_scanner_never_creates_a_session() {
    let coordinator = coordinator(Path::new("/nonexistent/dir/nmap"), None);
    match coordinator.run_scan(request()).await {
        Err(ScanError::ToolNotFound { binary, .. }) => assert!(binary.contains("nonexistent")),
        other => panic!("expected ToolNotFound, got {other:?}"),
    }
    assert!(coordinator.status().is_none());
    assert!(coordinator.history().is_empty());
}

#[tokio::test]
async fn exports_follow_the_snapshot() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", TWO_HOSTS), None);
    coordinator.run_scan(request()).await.unwrap();
    timeout(WAIT, coordinator.wait()).await.unwrap().unwrap();

    let doc = ExportDocument::from_json(&coordinator.export_json().unwrap()).unwrap();
    assert_eq!(doc.target, "10.0.0.0/30");
    assert_eq!(doc.status, Some(ScanStatus::Completed));
    assert_eq!(doc.exit_code, Some(0));
    assert_eq!(doc.run_stats, coordinator.snapshot().run_stats);
    assert_eq!(doc.run_stats.map(|s| s.hosts_up), Some(2));
    assert_eq!(doc.to_hosts(), coordinator.snapshot().hosts);

    let csv = String::from_utf8(coordinator.export_csv().unwrap()).unwrap();
    let rows: Vec<_> = csv.lines().collect();
    assert_eq!(rows.len(), 1 + coordinator.snapshot().port_count());
    assert!(rows[1].starts_with("10.0.0.1,router.lan,22,tcp,open,ssh"));
}

#[tokio::test]
async fn connect_target_needs_an_open_port() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", TWO_HOSTS), None);
    coordinator.run_scan(request()).await.unwrap();
    timeout(WAIT, coordinator.wait()).await.unwrap().unwrap();

    assert_eq!(coordinator.resolve_connect_target("router.lan").unwrap(), "10.0.0.1");
    assert_eq!(coordinator.resolve_connect_target("10.0.0.2").unwrap(), "10.0.0.2");
    assert!(matches!(
        coordinator.resolve_connect_target("10.0.0.99"),
        Err(ScanError::NotFound(_))
    ));
}

#[tokio::test]
async fn exited_scanner_completes_despite_lingering_child() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(
        &fake_scanner(&dir, "nmap", EXITS_LEAVING_CHILD_ON_STDOUT),
        None,
    );

    coordinator.run_scan(request()).await.unwrap();
    let done = timeout(Duration::from_secs(5), coordinator.wait())
        .await
        .expect("session stayed running after the scanner exited")
        .unwrap();
    assert_eq!(done.status, ScanStatus::Completed);
    assert_eq!(done.exit_code, Some(0));

    let snap = coordinator.snapshot();
    assert_eq!(snap.hosts.len(), 1);
    assert_eq!(snap.hosts[0].address, "10.0.0.1");
    assert_eq!(snap.hosts[0].ports.len(), 1);
}

#[tokio::test]
async fn status_changes_arrive_in_order_without_repeats() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", TWO_HOSTS), None);
    let mut changes = coordinator.store().status_changes();

    let started = coordinator.run_scan(request()).await.unwrap();
    let mut seen = Vec::new();
    while seen.last().map_or(true, |s: &ScanStatus| !s.is_terminal()) {
        let StatusChange { session, status } = timeout(WAIT, changes.recv())
            .await
            .expect("no terminal status in time")
            .unwrap();
        assert_eq!(session, started.id);
        seen.push(status);
    }
    assert_eq!(
        seen,
        vec![ScanStatus::Pending, ScanStatus::Running, ScanStatus::Completed]
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn failed_spawn_publishes_no_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nmap");
    std::fs::write(&path, "#!/nonexistent/interp\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();

    let coordinator = coordinator(&path, None);
    let mut changes = coordinator.store().status_changes();
    assert!(matches!(
        coordinator.run_scan(request()).await,
        Err(ScanError::ToolNotFound { .. })
    ));
    assert!(coordinator.status().is_none());
    assert!(coordinator.history().is_empty());
    assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn mac_vendor_and_run_stats_reach_the_snapshot() {
    let dir = TempDir::new().unwrap();
    let coordinator = coordinator(&fake_scanner(&dir, "nmap", LAN_HOST_WITH_MAC), None);
    coordinator.run_scan(request()).await.unwrap();
    timeout(WAIT, coordinator.wait()).await.unwrap().unwrap();

    let snap = coordinator.snapshot();
    let summary = snap.hosts[0].summary();
    assert_eq!(summary.mac.as_deref(), Some("B8:27:EB:12:34:56"));
    assert_eq!(summary.vendor.as_deref(), Some("Raspberry Pi Foundation"));
    assert_eq!(
        snap.run_stats,
        Some(RunStats {
            hosts_total: 4,
            hosts_up: 1,
            hosts_down: 3,
            elapsed_ms: 1250,
        })
    );
    assert!(snap.diagnostics.is_empty(), "{:?}", snap.diagnostics);
}
