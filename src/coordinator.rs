//! Runs scans end to end: process, parser and store, on a background task per session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::parser::OutputParser;
use crate::process::{OutputLine, ProcessOutcome, ScanHandle, ScanProcessManager};
use crate::store::ResultStore;
use crate::types::{FailureReason, ScanRequest, ScanResultSet, ScanSession, ScanStatus};

/// How long to keep reading output after the scanner exits while a descendant
/// still holds the pipe open.
const EXIT_DRAIN: Duration = Duration::from_millis(500);

struct ActiveScan {
    id: Uuid,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    processes: ScanProcessManager,
    store: ResultStore,
    max_runtime: Option<Duration>,
    history_limit: usize,
    active: AsyncMutex<Option<ActiveScan>>,
    history: Mutex<VecDeque<ScanSession>>,
}

/// Owns the single active scan. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScanCoordinator {
    inner: Arc<Inner>,
}

enum Finish {
    Exit(ProcessOutcome),
    Cancelled,
    Timeout,
}

impl ScanCoordinator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                processes: ScanProcessManager::new(
                    config.scanner_binary.clone(),
                    config.grace_period(),
                    config.line_buffer,
                ),
                store: ResultStore::new(config.max_diagnostics),
                max_runtime: config.max_runtime(),
                history_limit: config.history_limit,
                active: AsyncMutex::new(None),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.inner.store
    }

    /// Start `request`, cancelling and replacing any scan already in flight.
    ///
    /// Returns the new session once it is `Running`. A missing scanner binary fails here,
    /// before any existing scan is touched. The session is only published after the
    /// process has spawned, so a failed spawn leaves no session behind.
    pub async fn run_scan(&self, request: ScanRequest) -> Result<ScanSession> {
        let mut active = self.inner.active.lock().await;
        let program = self.inner.processes.resolve()?;

        if let Some(previous) = active.take() {
            self.retire(previous).await;
        }

        let handle = self.inner.processes.spawn(&program, &request)?;
        let session = ScanSession::new(request);
        let id = session.id;
        let store = &self.inner.store;
        store.begin(session.clone());
        store.set_command(id, handle.command().to_vec());
        store.transition(id, ScanStatus::Running, None, None);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(consume(
            self.inner.clone(),
            id,
            handle,
            cancel.clone(),
            self.inner.max_runtime,
        ));
        *active = Some(ActiveScan {
            id,
            cancel,
            task: Some(task),
        });
        Ok(self.session(id).unwrap_or(session))
    }

    /// Current (or most recent) session, for polling.
    pub fn status(&self) -> Option<ScanSession> {
        self.inner.store.snapshot().session.clone()
    }

    pub fn snapshot(&self) -> Arc<ScanResultSet> {
        self.inner.store.snapshot()
    }

    /// Request cancellation of the active scan and wait until its session is terminal.
    ///
    /// Once this returns no further events are applied for that session.
    pub async fn cancel(&self) -> Option<ScanSession> {
        let id = {
            let active = self.inner.active.lock().await;
            let scan = active.as_ref()?;
            scan.cancel.cancel();
            scan.id
        };
        self.wait_for_session(id).await
    }

    /// Wait until the current session reaches a terminal status.
    pub async fn wait(&self) -> Option<ScanSession> {
        let id = self.status()?.id;
        self.wait_for_session(id).await
    }

    /// Sessions replaced by later scans or cleared, oldest first.
    pub fn history(&self) -> Vec<ScanSession> {
        self.history_lock().iter().cloned().collect()
    }

    /// Cancel any active scan and drop the current results.
    pub async fn clear(&self) {
        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            self.retire(previous).await;
        }
        self.inner.store.clear();
    }

    pub fn export_json(&self) -> Result<Vec<u8>> {
        self.inner.store.export_json()
    }

    pub fn export_csv(&self) -> Result<Vec<u8>> {
        self.inner.store.export_csv()
    }

    pub fn resolve_connect_target(&self, address: &str) -> Result<String> {
        self.inner.store.resolve_connect_target(address)
    }

    async fn retire(&self, mut previous: ActiveScan) {
        previous.cancel.cancel();
        if let Some(task) = previous.task.take() {
            if let Err(e) = task.await {
                warn!(session = %previous.id, "scan task ended abnormally: {e}");
            }
        }
        if let Some(session) = self.session(previous.id) {
            let mut history = self.history_lock();
            history.push_back(session);
            while history.len() > self.inner.history_limit {
                history.pop_front();
            }
        }
    }

    fn session(&self, id: Uuid) -> Option<ScanSession> {
        self.inner
            .store
            .snapshot()
            .session
            .clone()
            .filter(|s| s.id == id)
    }

    async fn wait_for_session(&self, id: Uuid) -> Option<ScanSession> {
        let mut rx = self.inner.store.subscribe();
        let settled = rx
            .wait_for(|set| match set.session.as_ref() {
                Some(s) if s.id == id => s.status.is_terminal(),
                _ => true,
            })
            .await
            .ok()
            .and_then(|set| set.session.clone());
        match settled {
            Some(s) if s.id == id => Some(s),
            _ => self.history_lock().iter().rev().find(|s| s.id == id).cloned(),
        }
    }

    fn history_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ScanSession>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Background consumption loop: the only writer of the session's hosts and ports.
async fn consume(
    inner: Arc<Inner>,
    id: Uuid,
    mut handle: ScanHandle,
    cancel: CancellationToken,
    max_runtime: Option<Duration>,
) {
    let store = &inner.store;
    let mut parser = OutputParser::new();
    let deadline = max_runtime.map(|d| Instant::now() + d);
    let timer = async move {
        match deadline {
            Some(at) => time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timer);

    let exited = handle.exited();
    tokio::pin!(exited);

    let mut finish = None;
    while finish.is_none() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => finish = Some(Finish::Cancelled),
            _ = &mut timer => finish = Some(Finish::Timeout),
            line = handle.next_line() => match line {
                Some(line) => {
                    if cancel.is_cancelled() {
                        finish = Some(Finish::Cancelled);
                        continue;
                    }
                    ingest(store, id, &mut parser, &line);
                }
                None => break,
            },
            // Only reached when no line is ready: the scanner is gone but something it
            // started may still hold the pipe.
            outcome = &mut exited => finish = Some(Finish::Exit(outcome)),
        }
    }

    // Output closed: the process is exiting, but cancellation and the deadline still apply.
    let finish = match finish {
        Some(f) => f,
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Finish::Cancelled,
            _ = &mut timer => Finish::Timeout,
            outcome = &mut exited => Finish::Exit(outcome),
        },
    };

    if let Finish::Exit(_) = finish {
        let drain_until = Instant::now() + EXIT_DRAIN;
        while let Ok(Some(line)) = time::timeout_at(drain_until, handle.next_line()).await {
            ingest(store, id, &mut parser, &line);
        }
    }

    match finish {
        Finish::Cancelled => {
            let outcome = handle.cancel().await;
            info!(session = %id, ?outcome, "scan cancelled");
            store.transition(id, ScanStatus::Cancelled, None, exit_code(outcome));
        }
        Finish::Timeout => {
            let outcome = handle.cancel().await;
            warn!(session = %id, ?outcome, "scan exceeded maximum runtime");
            store.transition(id, ScanStatus::Failed, Some(FailureReason::Timeout), exit_code(outcome));
        }
        Finish::Exit(outcome) if outcome.success() => {
            store.transition(id, ScanStatus::Completed, None, Some(0));
        }
        Finish::Exit(outcome) => {
            let code = exit_code(outcome);
            warn!(session = %id, ?code, "scanner failed");
            store.transition(
                id,
                ScanStatus::Failed,
                Some(FailureReason::ProcessFailure { exit_code: code }),
                code,
            );
        }
    }

    let snap = store.snapshot();
    info!(
        session = %id,
        hosts = snap.hosts.len(),
        ports = snap.port_count(),
        diagnostics = snap.diagnostics.len() as u64 + snap.diagnostics_dropped,
        "scan finished"
    );
}

fn ingest(store: &ResultStore, id: Uuid, parser: &mut OutputParser, line: &OutputLine) {
    store.record_line(id);
    if let Some(event) = parser.feed(&line.text) {
        store.apply(id, event);
    }
}

fn exit_code(outcome: ProcessOutcome) -> Option<i32> {
    match outcome {
        ProcessOutcome::Exited { code } => code,
        ProcessOutcome::Terminated | ProcessOutcome::Killed => None,
    }
}
