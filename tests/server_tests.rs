#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use netscan_rs::config::EngineConfig;
use netscan_rs::server::router;
use netscan_rs::ScanCoordinator;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const SCANNER: &str = r#"#!/bin/sh
echo "Nmap scan report for router.lan (10.0.0.1)"
echo "Host is up (0.0010s latency)."
echo "PORT   STATE SERVICE VERSION"
echo "22/tcp open  ssh     OpenSSH 9.6"
echo "80/tcp closed http"
echo ""
echo "Nmap scan report for 10.0.0.2"
echo "Host seems down."
"#;

fn app(scanner: &Path) -> (Router, ScanCoordinator) {
    let coordinator = ScanCoordinator::new(&EngineConfig {
        scanner_binary: scanner.to_path_buf(),
        grace_period_ms: 300,
        ..EngineConfig::default()
    });
    (router(coordinator.clone()), coordinator)
}

fn fake_scanner(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("nmap");
    std::fs::write(&path, SCANNER).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
}

async fn body_json(resp: Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn idle_status_and_presets() {
    let (app, _) = app(Path::new("/nonexistent/nmap"));

    let resp = send(&app, Method::GET, "/api/status", None).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = send(&app, Method::GET, "/api/presets", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let presets = body_json(resp).await;
    let keys: Vec<_> = presets
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["key"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(keys, ["quick", "intense", "ping", "service", "udp"]);
}

#[tokio::test]
async fn rejected_requests_map_to_status_codes() {
    let (app, coordinator) = app(Path::new("/nonexistent/nmap"));

    let resp = send(
        &app,
        Method::POST,
        "/api/scan",
        Some(json!({ "targets": ["10.0.0.1"], "args": "--script vuln" })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(resp).await["error"].as_str().unwrap().contains("--script"));

    let resp = send(
        &app,
        Method::POST,
        "/api/scan",
        Some(json!({ "targets": ["10.0.0.1; rm -rf /"] })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = send(&app, Method::POST, "/api/scan", Some(json!({ "preset": "quick", "targets": ["10.0.0.1"] }))).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(coordinator.status().is_none());
}

#[tokio::test]
async fn scan_lifecycle_over_http() {
    let dir = TempDir::new().unwrap();
    let (app, coordinator) = app(&fake_scanner(&dir));

    let resp = send(
        &app,
        Method::POST,
        "/api/scan",
        Some(json!({ "preset": "quick", "targets": ["10.0.0.0/30"] })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let session = body_json(resp).await;
    assert_eq!(session["status"], "running");

    let done = tokio::time::timeout(Duration::from_secs(10), coordinator.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.id.to_string(), session["id"].as_str().unwrap());

    let status = body_json(send(&app, Method::GET, "/api/status", None).await).await;
    assert_eq!(status["status"], "completed");

    let results = body_json(send(&app, Method::GET, "/api/results", None).await).await;
    assert_eq!(results["hosts"].as_array().unwrap().len(), 2);

    let resp = send(&app, Method::GET, "/api/hosts/10.0.0.1", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let summary = body_json(resp).await;
    assert_eq!(summary["label"], "10.0.0.1 (router.lan)");
    assert_eq!(summary["open_ports"], 1);
    assert_eq!(summary["total_ports"], 2);

    let resp = send(&app, Method::GET, "/api/hosts/10.9.9.9", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = send(&app, Method::GET, "/api/export/csv", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
    assert!(disposition.contains("nmap_scan_") && disposition.ends_with(".csv\""));
    let csv = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&csv).lines().count(), 3);

    let export = body_json(send(&app, Method::GET, "/api/export/json", None).await).await;
    assert_eq!(export["hosts"][0]["up"], true);
    assert_eq!(export["hosts"][1]["up"], false);

    let connect = body_json(send(&app, Method::GET, "/api/connect/router.lan", None).await).await;
    assert_eq!(connect["address"], "10.0.0.1");
    let resp = send(&app, Method::GET, "/api/connect/10.0.0.2", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = send(&app, Method::POST, "/api/cancel", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["status"], "completed");
}
