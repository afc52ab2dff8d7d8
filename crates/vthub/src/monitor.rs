// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Monitor (§4.7): lifecycle and activity detection over live PTY
//! output, emitting a single global notification stream.
//!
//! Driven by explicit calls (`session_started`, `track_pty_output`, ...)
//! rather than registering as a `PtyManager` callback itself — the caller
//! that owns the real PTY spawner is responsible for forwarding its lifecycle
//! events here. The phrase-table classification and debounce-then-emit shape
//! follow `ClaudeScreenDetector` in
//! `crates/cli/src/driver/claude/screen_detect.rs`, generalized from
//! screen-snapshot polling to streamed output-chunk scanning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const WORKING_PHRASES: &[&str] = &["Thinking...", "Analyzing", "Working on", "Let me"];
const FINISHED_PHRASES: &[&str] =
    &["I've completed", "I've finished", "Done!", "Here's", "The task is complete"];

/// A single Session Monitor notification, serialized exactly as the shared
/// `{type, sessionId, sessionName, timestamp, ...}` envelope (§4.7).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename = "session-start")]
    SessionStart { session_id: String, session_name: String, timestamp: String },
    #[serde(rename = "session-exit")]
    SessionExit { session_id: String, session_name: String, timestamp: String, code: Option<i32> },
    #[serde(rename = "bell")]
    Bell { session_id: String, session_name: String, timestamp: String },
    #[serde(rename = "command-finished")]
    CommandFinished {
        session_id: String,
        session_name: String,
        timestamp: String,
        command: String,
        duration_ms: u64,
    },
    #[serde(rename = "command-error")]
    CommandError {
        session_id: String,
        session_name: String,
        timestamp: String,
        command: String,
        duration_ms: u64,
        exit_code: i32,
    },
    #[serde(rename = "assistant-turn")]
    AssistantTurn { session_id: String, session_name: String, timestamp: String },
    /// Emitted by the Git-Status Watcher (§4.8), not this state machine —
    /// carried on the same stream since the WS hub forwards both identically.
    #[serde(rename = "git-status")]
    GitStatus {
        session_id: String,
        timestamp: String,
        #[serde(flatten)]
        status: Value,
    },
}

impl Notification {
    pub fn git_status(session_id: impl Into<String>, status: Value) -> Self {
        Notification::GitStatus { session_id: session_id.into(), timestamp: now_iso8601(), status }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Notification::SessionStart { session_id, .. }
            | Notification::SessionExit { session_id, .. }
            | Notification::Bell { session_id, .. }
            | Notification::CommandFinished { session_id, .. }
            | Notification::CommandError { session_id, .. }
            | Notification::AssistantTurn { session_id, .. }
            | Notification::GitStatus { session_id, .. } => session_id,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("notification always serializes")
    }
}

/// Current UTC time as an ISO 8601 string (e.g. "2026-02-14T01:23:45Z").
pub(crate) fn now_iso8601() -> String {
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = dur.as_secs();
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;
    // Civil calendar from days since epoch (Howard Hinnant's algorithm).
    let days = secs / 86400;
    let z = days as i64 + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

#[derive(Debug, Clone)]
struct Activity {
    is_active: bool,
    last_activity_at: Instant,
}

struct SessionState {
    name: String,
    is_running: bool,
    command_start_at: Option<Instant>,
    last_command: Option<String>,
    activity: Activity,
    assistant_idle_notified: bool,
    is_assistant_session: bool,
    idle_debounce: Option<CancellationToken>,
}

struct Inner {
    sessions: HashMap<String, SessionState>,
}

/// Tunable timings, sourced from `CoreConfig` (§4.9).
#[derive(Debug, Clone, Copy)]
pub struct MonitorTimings {
    pub assistant_idle_debounce: Duration,
    pub assistant_finish_grace: Duration,
    pub min_command_duration: Duration,
    pub session_exit_grace: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            assistant_idle_debounce: Duration::from_secs(2),
            assistant_finish_grace: Duration::from_secs(1),
            min_command_duration: Duration::from_millis(3000),
            session_exit_grace: Duration::from_secs(5),
        }
    }
}

/// Tracks per-session lifecycle and activity, broadcasting a single global
/// notification stream.
pub struct SessionMonitor {
    inner: Mutex<Inner>,
    notifications: broadcast::Sender<Notification>,
    timings: MonitorTimings,
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new(MonitorTimings::default())
    }
}

impl SessionMonitor {
    pub fn new(timings: MonitorTimings) -> Self {
        let (notifications, _) = broadcast::channel(1024);
        Self { inner: Mutex::new(Inner { sessions: HashMap::new() }), notifications, timings }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    fn emit(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    /// Publish a notification originating outside this state machine (the
    /// Git-Status Watcher) onto the same global stream.
    pub fn publish(&self, notification: Notification) {
        self.emit(notification);
    }

    pub async fn session_started(&self, id: &str, name: &str, command: &str) {
        let is_assistant_session = command.to_lowercase().contains("claude");
        {
            let mut guard = self.inner.lock().await;
            guard.sessions.insert(
                id.to_owned(),
                SessionState {
                    name: name.to_owned(),
                    is_running: true,
                    command_start_at: None,
                    last_command: None,
                    activity: Activity { is_active: false, last_activity_at: Instant::now() },
                    assistant_idle_notified: false,
                    is_assistant_session,
                    idle_debounce: None,
                },
            );
        }
        self.emit(Notification::SessionStart {
            session_id: id.to_owned(),
            session_name: name.to_owned(),
            timestamp: now_iso8601(),
        });
    }

    /// Record raw PTY output: bumps activity, detects BEL, and for assistant
    /// sessions scans for working/finished phrases.
    pub async fn track_pty_output(self: &Arc<Self>, id: &str, chunk: &str) {
        let (name, became_idle_candidate, is_bell) = {
            let mut guard = self.inner.lock().await;
            let Some(state) = guard.sessions.get_mut(id) else { return };
            state.activity.last_activity_at = Instant::now();

            let is_bell = chunk.as_bytes().contains(&0x07);

            let mut became_idle_candidate = false;
            if state.is_assistant_session {
                if WORKING_PHRASES.iter().any(|p| chunk.contains(p)) {
                    if state.activity.is_active {
                        // still active, no transition
                    } else {
                        state.activity.is_active = true;
                        state.assistant_idle_notified = false;
                        if let Some(token) = state.idle_debounce.take() {
                            token.cancel();
                        }
                    }
                }
                if FINISHED_PHRASES.iter().any(|p| chunk.contains(p)) {
                    became_idle_candidate = true;
                }
            }
            (state.name.clone(), became_idle_candidate, is_bell)
        };

        if is_bell {
            self.emit(Notification::Bell {
                session_id: id.to_owned(),
                session_name: name.clone(),
                timestamp: now_iso8601(),
            });
        }

        if became_idle_candidate {
            self.schedule_idle_debounce(id, &name).await;
        }
    }

    /// After the "finished" phrase grace, transition active->idle and (after
    /// a further debounce) emit `AssistantTurn` if still idle and not yet
    /// notified for this idle period.
    async fn schedule_idle_debounce(self: &Arc<Self>, session_id: &str, session_name: &str) {
        let token = CancellationToken::new();
        {
            let mut guard = self.inner.lock().await;
            if let Some(state) = guard.sessions.get_mut(session_id) {
                if let Some(previous) = state.idle_debounce.replace(token.clone()) {
                    previous.cancel();
                }
            } else {
                return;
            }
        }

        let this = Arc::clone(self);
        let session_id = session_id.to_owned();
        let session_name = session_name.to_owned();
        let finish_grace = self.timings.assistant_finish_grace;
        let idle_debounce = self.timings.assistant_idle_debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(finish_grace) => {}
            }

            {
                let mut guard = this.inner.lock().await;
                if let Some(state) = guard.sessions.get_mut(&session_id) {
                    state.activity.is_active = false;
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(idle_debounce) => {}
            }

            let should_emit = {
                let mut guard = this.inner.lock().await;
                match guard.sessions.get_mut(&session_id) {
                    Some(state) if !state.activity.is_active && !state.assistant_idle_notified => {
                        state.assistant_idle_notified = true;
                        true
                    }
                    _ => false,
                }
            };
            if should_emit {
                this.emit(Notification::AssistantTurn {
                    session_id,
                    session_name,
                    timestamp: now_iso8601(),
                });
            }
        });
    }

    pub async fn update_command(&self, id: &str, command: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(state) = guard.sessions.get_mut(id) {
            state.last_command = Some(command.to_owned());
            state.command_start_at = Some(Instant::now());
        }
    }

    pub async fn handle_command_completion(&self, id: &str, exit_code: i32) {
        let (name, command, duration) = {
            let mut guard = self.inner.lock().await;
            let Some(state) = guard.sessions.get_mut(id) else { return };
            let Some(started_at) = state.command_start_at.take() else { return };
            let command = state.last_command.take().unwrap_or_default();
            (state.name.clone(), command, started_at.elapsed())
        };

        if duration < self.timings.min_command_duration {
            return;
        }

        let duration_ms = duration.as_millis() as u64;
        if exit_code == 0 {
            self.emit(Notification::CommandFinished {
                session_id: id.to_owned(),
                session_name: name,
                timestamp: now_iso8601(),
                command,
                duration_ms,
            });
        } else {
            self.emit(Notification::CommandError {
                session_id: id.to_owned(),
                session_name: name,
                timestamp: now_iso8601(),
                command,
                duration_ms,
                exit_code,
            });
        }
    }

    /// Handle a session exit: emit immediately, then remove bookkeeping state
    /// after a grace period so any still-in-flight tail events can resolve.
    pub async fn session_exited(self: &Arc<Self>, id: &str, code: Option<i32>) {
        let name = {
            let mut guard = self.inner.lock().await;
            match guard.sessions.get_mut(id) {
                Some(state) => {
                    state.is_running = false;
                    if let Some(token) = state.idle_debounce.take() {
                        token.cancel();
                    }
                    state.name.clone()
                }
                None => return,
            }
        };

        self.emit(Notification::SessionExit {
            session_id: id.to_owned(),
            session_name: name,
            timestamp: now_iso8601(),
            code,
        });

        let this = Arc::clone(self);
        let id = id.to_owned();
        let exit_grace = self.timings.session_exit_grace;
        tokio::spawn(async move {
            tokio::time::sleep(exit_grace).await;
            let mut guard = this.inner.lock().await;
            guard.sessions.remove(&id);
        });
    }

    pub async fn is_running(&self, id: &str) -> bool {
        let guard = self.inner.lock().await;
        guard.sessions.get(id).is_some_and(|s| s.is_running)
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
