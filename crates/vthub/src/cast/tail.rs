// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tailing File Reader (§4.2): watches a growing cast log, resuming from a
//! stored byte offset and delivering whole newly appended lines in order.
//!
//! Polls at 200 ms until the file exists, then switches to a `notify` watch
//! on the parent directory with a periodic stat-verify poll as a fallback
//! (some platforms coalesce notify events — see §9). File shrink is treated
//! as fatal per the cast protocol's append-only contract, unlike a resumable
//! log watcher that would reset its offset on truncation.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

const EXISTS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STAT_VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A batch of new lines, or a fatal condition that ends the tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    Lines(Vec<String>),
    Fatal(String),
}

pub struct TailReader {
    path: PathBuf,
    offset: u64,
    carry: String,
    poll_interval: Duration,
}

impl TailReader {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0, carry: String::new(), poll_interval: STAT_VERIFY_POLL_INTERVAL }
    }

    pub fn with_offset(path: PathBuf, offset: u64) -> Self {
        Self { path, offset, carry: String::new(), poll_interval: STAT_VERIFY_POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read new complete lines appended since the last read. Stats the file
    /// itself rather than trusting the caller's notification payload.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>, CoreError> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(CoreError::io_failure(e.to_string())),
        };

        let meta = file.metadata().map_err(|e| CoreError::io_failure(e.to_string()))?;
        if meta.len() < self.offset {
            return Err(CoreError::fatal(format!(
                "cast log {} shrank from {} to {} bytes",
                self.path.display(),
                self.offset,
                meta.len()
            )));
        }
        if meta.len() == self.offset {
            return Ok(vec![]);
        }

        file.seek(SeekFrom::Start(self.offset)).map_err(|e| CoreError::io_failure(e.to_string()))?;
        let mut buf = Vec::with_capacity((meta.len() - self.offset) as usize);
        file.read_to_end(&mut buf).map_err(|e| CoreError::io_failure(e.to_string()))?;
        self.offset += buf.len() as u64;

        let chunk = String::from_utf8_lossy(&buf);
        let combined = format!("{}{}", self.carry, chunk);

        let mut lines = Vec::new();
        let mut parts = combined.split('\n').peekable();
        let mut last = "";
        while let Some(part) = parts.next() {
            if parts.peek().is_some() {
                lines.push(part.to_owned());
            } else {
                last = part;
            }
        }
        self.carry = last.to_owned();

        Ok(lines)
    }

    /// Poll at 200 ms until the file exists, or shutdown is requested.
    pub async fn wait_for_file(&self, shutdown: &CancellationToken) -> bool {
        loop {
            if self.path.exists() {
                return true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(EXISTS_POLL_INTERVAL) => {}
            }
        }
    }

    /// Run the tail loop until `stop()` (the `shutdown` token) is cancelled,
    /// the fatal shrink condition fires, or the receiver drops.
    pub async fn run(mut self, line_tx: mpsc::Sender<TailEvent>, shutdown: CancellationToken) {
        if !self.wait_for_file(&shutdown).await {
            return;
        }

        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _watcher = self.setup_notify_watcher(wake_tx);

        let mut poll_interval = tokio::time::interval(self.poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = wake_rx.recv() => {}
                _ = poll_interval.tick() => {}
            }

            match self.read_new_lines() {
                Ok(lines) if !lines.is_empty() => {
                    if line_tx.send(TailEvent::Lines(lines)).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    tracing::warn!(path = %self.path.display(), err = %e, "cast log shrank, stopping tail");
                    let _ = line_tx.send(TailEvent::Fatal(e.message().to_owned())).await;
                    return;
                }
                Err(e) => {
                    tracing::debug!(path = %self.path.display(), err = %e, "transient tail read error");
                }
            }
        }
    }

    fn setup_notify_watcher(&self, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
            let _ = wake_tx.try_send(());
        })
        .ok()?;

        let watch_path = self.path.parent().unwrap_or(self.path.as_ref());
        watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;

        Some(watcher)
    }
}

#[cfg(test)]
#[path = "tail_tests.rs"]
mod tests;
