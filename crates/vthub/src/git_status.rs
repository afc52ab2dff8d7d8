// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Git-Status Watcher (§4.8, expanded from a lightly-specified upstream
//! feature): one watcher per (sessionId, workingDir), coalescing filesystem
//! churn into debounced recomputation via a `GitStatusProbe`.
//!
//! The `notify` setup and wake-channel debounce follow `LogWatcher` in
//! `crates/cli/src/driver/log_watch.rs`, generalized from tailing a single
//! file to watching a directory (plus `.git/HEAD`/`.git/index` when present)
//! and from "read new lines" to "recompute status".

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collab::GitStatusProbe;
use crate::monitor::{Notification, SessionMonitor};

const COALESCE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Watches one session's working directory for git-relevant filesystem
/// churn and forwards recomputed status through the shared notification
/// stream, scoped to the owning session.
pub struct GitStatusWatcher {
    session_id: String,
    working_dir: PathBuf,
    probe: Arc<dyn GitStatusProbe>,
    monitor: Arc<SessionMonitor>,
}

impl GitStatusWatcher {
    pub fn new(
        session_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        probe: Arc<dyn GitStatusProbe>,
        monitor: Arc<SessionMonitor>,
    ) -> Self {
        Self { session_id: session_id.into(), working_dir: working_dir.into(), probe, monitor }
    }

    /// Watch the working directory (and `.git/HEAD`/`.git/index` if present)
    /// until `shutdown` is cancelled, coalescing bursts of filesystem events
    /// with a short debounce before recomputing status.
    pub async fn run(self, shutdown: CancellationToken) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(8);
        let _watchers = self.setup_notify_watchers(wake_tx);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                woken = wake_rx.recv() => {
                    if woken.is_none() {
                        return;
                    }
                }
            }

            // Coalesce a burst of events (e.g. from `git checkout`) into one
            // recomputation: drain anything else that arrives within the
            // debounce window before probing.
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(COALESCE_DEBOUNCE) => {}
            }
            while wake_rx.try_recv().is_ok() {}

            if let Some(status) = self.probe.probe(&self.working_dir.to_string_lossy()).await {
                self.emit(status);
            }
        }
    }

    fn emit(&self, status: serde_json::Value) {
        self.monitor.publish(Notification::git_status(self.session_id.clone(), status));
    }

    fn setup_notify_watchers(&self, wake_tx: mpsc::Sender<()>) -> Vec<notify::RecommendedWatcher> {
        let mut watchers = Vec::new();

        if let Some(watcher) = watch_path(&self.working_dir, RecursiveMode::NonRecursive, wake_tx.clone()) {
            watchers.push(watcher);
        }

        let git_dir = self.working_dir.join(".git");
        for name in ["HEAD", "index"] {
            let path = git_dir.join(name);
            if path.exists() {
                if let Some(watcher) = watch_path(&path, RecursiveMode::NonRecursive, wake_tx.clone()) {
                    watchers.push(watcher);
                }
            }
        }

        watchers
    }
}

fn watch_path(path: &Path, mode: RecursiveMode, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .ok()?;
    watcher.watch(path, mode).ok()?;
    Some(watcher)
}

#[cfg(test)]
#[path = "git_status_tests.rs"]
mod tests;
