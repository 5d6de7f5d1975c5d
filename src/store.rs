//! Result state for the current scan, published as immutable snapshots.
//!
//! Writers mutate through [`ResultStore`]; every change is published through a
//! `tokio::sync::watch` channel holding an `Arc<ScanResultSet>`. A reader's snapshot is never
//! modified afterwards: the next write clones the set if any snapshot is still alive.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::export;
use crate::types::{
    FailureReason, Host, ParseEvent, Reachability, ScanResultSet, ScanSession, ScanStatus,
};

/// One accepted status change. Unlike snapshots these are never coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub session: Uuid,
    pub status: ScanStatus,
}

#[derive(Debug)]
pub struct ResultStore {
    tx: watch::Sender<Arc<ScanResultSet>>,
    status_tx: broadcast::Sender<StatusChange>,
    max_diagnostics: usize,
}

impl ResultStore {
    pub fn new(max_diagnostics: usize) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ScanResultSet::default()));
        let (status_tx, _) = broadcast::channel(64);
        Self {
            tx,
            status_tx,
            max_diagnostics,
        }
    }

    /// Current settled state. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<ScanResultSet> {
        self.tx.borrow().clone()
    }

    /// Receiver that wakes whenever a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ScanResultSet>> {
        self.tx.subscribe()
    }

    /// Every accepted status change, in order, starting with `Pending` from [`Self::begin`].
    pub fn status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    /// Replace the result set with a fresh one for `session`.
    pub fn begin(&self, session: ScanSession) {
        info!(session = %session.id, target = %session.request.target_expression(), "new scan session");
        let change = StatusChange {
            session: session.id,
            status: session.status,
        };
        self.tx.send_replace(Arc::new(ScanResultSet {
            session: Some(session),
            ..ScanResultSet::default()
        }));
        let _ = self.status_tx.send(change);
    }

    /// Drop all results, including the session.
    pub fn clear(&self) {
        self.tx.send_replace(Arc::new(ScanResultSet::default()));
    }

    /// Move `session` to `next`. Refused (returns `false`) for stale sessions and for
    /// non-monotonic transitions.
    pub fn transition(
        &self,
        session: Uuid,
        next: ScanStatus,
        failure: Option<FailureReason>,
        exit_code: Option<i32>,
    ) -> bool {
        let accepted = self.modify_session(session, |set| {
            let Some(s) = set.session.as_mut() else {
                return false;
            };
            if !s.status.can_transition_to(next) {
                warn!(session = %s.id, from = %s.status, to = %next, "refused status transition");
                return false;
            }
            let now = OffsetDateTime::now_utc();
            if next == ScanStatus::Running || s.started_at.is_none() {
                s.started_at = Some(now);
            }
            if next.is_terminal() {
                s.ended_at = Some(now);
                s.failure = failure;
                s.exit_code = exit_code;
            }
            info!(session = %s.id, status = %next, "scan status changed");
            s.status = next;
            true
        });
        if accepted {
            let _ = self.status_tx.send(StatusChange {
                session,
                status: next,
            });
        }
        accepted
    }

    pub fn set_command(&self, session: Uuid, command: Vec<String>) -> bool {
        self.modify_session(session, |set| match set.session.as_mut() {
            Some(s) => {
                s.command = command;
                true
            }
            None => false,
        })
    }

    /// Count one raw output line against the active session.
    pub fn record_line(&self, session: Uuid) -> bool {
        self.modify_active(session, |set| {
            if let Some(s) = set.session.as_mut() {
                s.line_count += 1;
            }
        })
    }

    /// Apply a parser event to the active session's host/port set.
    ///
    /// Ignored once the session is terminal or has been superseded.
    pub fn apply(&self, session: Uuid, event: ParseEvent) -> bool {
        let max_diagnostics = self.max_diagnostics;
        self.modify_active(session, move |set| match event {
            ParseEvent::Host(ev) => {
                let host = match set.hosts.iter_mut().position(|h| h.address == ev.address) {
                    Some(idx) => &mut set.hosts[idx],
                    None => {
                        set.hosts.push(Host::new(ev.address.clone()));
                        let last = set.hosts.len() - 1;
                        &mut set.hosts[last]
                    }
                };
                if ev.hostname.is_some() {
                    host.hostname = ev.hostname;
                }
                if ev.state != Reachability::Unknown {
                    host.state = ev.state;
                }
            }
            ParseEvent::Port(ev) => {
                match set.hosts.iter_mut().find(|h| h.address == ev.host) {
                    Some(host) => host.upsert_port(ev.port),
                    None => {
                        let mut host = Host::new(ev.host);
                        host.upsert_port(ev.port);
                        set.hosts.push(host);
                    }
                }
            }
            ParseEvent::Mac(ev) => {
                let idx = match set.hosts.iter().position(|h| h.address == ev.host) {
                    Some(idx) => idx,
                    None => {
                        set.hosts.push(Host::new(ev.host));
                        set.hosts.len() - 1
                    }
                };
                let host = &mut set.hosts[idx];
                host.mac = Some(ev.mac);
                host.vendor = ev.vendor;
            }
            ParseEvent::Finished(stats) => set.run_stats = Some(stats),
            ParseEvent::Malformed(line) => {
                if set.diagnostics.len() < max_diagnostics {
                    set.diagnostics.push(line);
                } else {
                    set.diagnostics_dropped += 1;
                }
            }
        })
    }

    pub fn export_json(&self) -> Result<Vec<u8>> {
        export::to_json(&self.snapshot())
    }

    pub fn export_csv(&self) -> Result<Vec<u8>> {
        export::to_csv(&self.snapshot())
    }

    /// Address to hand to a remote-shell launcher for `address`, which must be a host in
    /// the current snapshot with at least one open port.
    pub fn resolve_connect_target(&self, address: &str) -> Result<String> {
        let snapshot = self.snapshot();
        snapshot
            .hosts
            .iter()
            .find(|h| h.address == address || h.hostname.as_deref() == Some(address))
            .filter(|h| h.has_open_port())
            .map(|h| h.address.clone())
            .ok_or_else(|| ScanError::NotFound(address.to_string()))
    }

    fn modify_session(&self, session: Uuid, f: impl FnOnce(&mut ScanResultSet) -> bool) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|current| {
            if current.session.as_ref().map(|s| s.id) != Some(session) {
                debug!(%session, "ignoring update for superseded session");
                return false;
            }
            changed = f(Arc::make_mut(current));
            changed
        });
        changed
    }

    fn modify_active(&self, session: Uuid, f: impl FnOnce(&mut ScanResultSet)) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|current| {
            match current.session.as_ref() {
                Some(s) if s.id == session && s.is_active() => {}
                _ => return false,
            }
            f(Arc::make_mut(current));
            applied = true;
            true
        });
        applied
    }
}
