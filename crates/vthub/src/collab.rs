// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trait seams for the external collaborators this core consumes but does not
//! own: the native PTY spawner, the on-disk session layout, and the terminal
//! buffer renderer. Production implementations of these traits (actual PTY
//! spawning, actual session directory layout) live outside this crate.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Minimal description of a session, as returned by `PtyManager::get_session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: String,
    pub working_dir: String,
    pub git_repo_path: Option<String>,
    pub command: String,
    pub pid: Option<i32>,
}

/// Input sent to a PTY: either typed text or a named key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputPayload {
    Text(String),
    Key(String),
}

/// Persisted sidecar: `{lastClearOffset}` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub last_clear_offset: u64,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Operations this core calls on the native PTY spawner (§6).
pub trait PtyManager: Send + Sync {
    fn get_session<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SessionDescriptor>>;
    fn send_input<'a>(
        &'a self,
        id: &'a str,
        input: InputPayload,
    ) -> BoxFuture<'a, Result<(), crate::error::CoreError>>;
    fn resize_session<'a>(
        &'a self,
        id: &'a str,
        cols: u16,
        rows: u16,
    ) -> BoxFuture<'a, Result<(), crate::error::CoreError>>;
    fn kill_session<'a>(
        &'a self,
        id: &'a str,
        signal: &'a str,
    ) -> BoxFuture<'a, Result<(), crate::error::CoreError>>;
    fn reset_session_size<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), crate::error::CoreError>>;
    fn list_sessions(&self) -> BoxFuture<'_, Vec<SessionDescriptor>>;
}

/// Operations this core calls on the terminal-buffer renderer (§6). Snapshot
/// bytes are opaque to this core; it only forwards them as `SNAPSHOT_VT`.
pub trait TerminalManager: Send + Sync {
    /// Subscribe to buffer changes for a session; returns a cancellation handle.
    fn subscribe_to_buffer_changes<'a>(
        &'a self,
        session_id: &'a str,
        sender: tokio::sync::mpsc::Sender<bytes::Bytes>,
    ) -> BoxFuture<'a, tokio_util::sync::CancellationToken>;
}

/// Operations this core calls on the on-disk session layout owner (§6).
pub trait SessionManager: Send + Sync {
    /// Path to the append-only cast log for a session, if the session is known.
    fn stdout_path<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<std::path::PathBuf>>;
    fn load_session_info<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SessionInfo>>;
    /// Persist `info` iff a SessionInfo sidecar already exists for `id` (never create one).
    fn save_session_info<'a>(
        &'a self,
        id: &'a str,
        info: SessionInfo,
    ) -> BoxFuture<'a, Result<(), crate::error::CoreError>>;
}

/// Recomputes git status for a working directory (§4.8). Actual `git`
/// plumbing is outside this core's concern; the watcher only decides *when*
/// to call this.
pub trait GitStatusProbe: Send + Sync {
    fn probe<'a>(&'a self, working_dir: &'a str) -> BoxFuture<'a, Option<serde_json::Value>>;
}
