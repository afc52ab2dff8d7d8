// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimal file-backed stand-ins for the external collaborators named in
//! `collab.rs` (§3.1), wired by the demo binary so the Cast Output Hub and
//! WS v3 Hub can be exercised against real files on disk without a real PTY
//! spawner or terminal renderer. Production deployments supply their own
//! implementations of these traits; nothing here is meant to be load-bearing.
//!
//! Layout under `control_dir`: one subdirectory per session id, containing
//! an append-only `stdout` cast log (consumed by the Cast Output Hub) and an
//! optional `session-info.json` sidecar (`SessionInfo`, §3).

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::collab::{
    GitStatusProbe, InputPayload, PtyManager, SessionDescriptor, SessionInfo, SessionManager, TerminalManager,
};
use crate::error::CoreError;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Session-directory layout under `control_dir`, as `SessionManager`.
pub struct DemoSessionManager {
    control_dir: PathBuf,
}

impl DemoSessionManager {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self { control_dir: control_dir.into() }
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.control_dir.join(id)
    }
}

impl SessionManager for DemoSessionManager {
    fn stdout_path<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<PathBuf>> {
        Box::pin(async move {
            let path = self.session_dir(id).join("stdout");
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                Some(path)
            } else {
                None
            }
        })
    }

    fn load_session_info<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SessionInfo>> {
        Box::pin(async move {
            let path = self.session_dir(id).join("session-info.json");
            let contents = tokio::fs::read_to_string(&path).await.ok()?;
            serde_json::from_str(&contents).ok()
        })
    }

    fn save_session_info<'a>(&'a self, id: &'a str, info: SessionInfo) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            let path = self.session_dir(id).join("session-info.json");
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(());
            }
            let body = serde_json::json!({ "lastClearOffset": info.last_clear_offset }).to_string();
            tokio::fs::write(&path, body).await.map_err(|e| CoreError::io_failure(e.to_string()))
        })
    }
}

/// In-memory `SessionDescriptor` registry seeded from `control_dir` at
/// startup. There is no real PTY behind this demo: `send_input`,
/// `resize_session`, `kill_session`, and `reset_session_size` only log what
/// would have been sent.
pub struct DemoPtyManager {
    sessions: RwLock<HashMap<String, SessionDescriptor>>,
}

impl DemoPtyManager {
    /// Seed the registry by reading `descriptor.json` out of each immediate
    /// subdirectory of `control_dir` that has one; directories without one are
    /// skipped (they still serve cast history via `DemoSessionManager`, just
    /// without PTY-control session metadata).
    pub async fn discover(control_dir: impl AsRef<Path>) -> Self {
        let mut sessions = HashMap::new();
        let mut entries = match tokio::fs::read_dir(control_dir.as_ref()).await {
            Ok(entries) => entries,
            Err(_) => return Self { sessions: RwLock::new(sessions) },
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let descriptor_path = entry.path().join("descriptor.json");
            let Ok(contents) = tokio::fs::read_to_string(&descriptor_path).await else { continue };
            let Ok(descriptor) = serde_json::from_str::<SessionDescriptor>(&contents) else { continue };
            sessions.insert(descriptor.id.clone(), descriptor);
        }
        Self { sessions: RwLock::new(sessions) }
    }
}

impl PtyManager for DemoPtyManager {
    fn get_session<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<SessionDescriptor>> {
        Box::pin(async move { self.sessions.read().await.get(id).cloned() })
    }

    fn send_input<'a>(&'a self, id: &'a str, input: InputPayload) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            tracing::debug!(session_id = %id, ?input, "demo pty: input discarded, no real PTY attached");
            Ok(())
        })
    }

    fn resize_session<'a>(&'a self, id: &'a str, cols: u16, rows: u16) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            tracing::debug!(session_id = %id, cols, rows, "demo pty: resize discarded, no real PTY attached");
            Ok(())
        })
    }

    fn kill_session<'a>(&'a self, id: &'a str, signal: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            tracing::debug!(session_id = %id, signal, "demo pty: kill discarded, no real PTY attached");
            Ok(())
        })
    }

    fn reset_session_size<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            tracing::debug!(session_id = %id, "demo pty: reset size discarded, no real PTY attached");
            Ok(())
        })
    }

    fn list_sessions(&self) -> BoxFuture<'_, Vec<SessionDescriptor>> {
        Box::pin(async move { self.sessions.read().await.values().cloned().collect() })
    }
}

/// No terminal renderer is wired in the demo: subscribing succeeds but never
/// delivers a snapshot, since there is no `avt`-backed buffer behind it.
pub struct DemoTerminalManager;

impl TerminalManager for DemoTerminalManager {
    fn subscribe_to_buffer_changes<'a>(
        &'a self,
        _session_id: &'a str,
        _sender: mpsc::Sender<bytes::Bytes>,
    ) -> BoxFuture<'a, CancellationToken> {
        Box::pin(async move { CancellationToken::new() })
    }
}

/// Shells out to `git status --porcelain=v2 --branch`, the same plumbing a
/// production `GitStatusProbe` would use, to produce the `{type:"git-status"}`
/// payload body for §4.8.
pub struct DemoGitStatusProbe;

impl GitStatusProbe for DemoGitStatusProbe {
    fn probe<'a>(&'a self, working_dir: &'a str) -> BoxFuture<'a, Option<serde_json::Value>> {
        Box::pin(async move {
            let output = tokio::process::Command::new("git")
                .args(["status", "--porcelain=v2", "--branch"])
                .current_dir(working_dir)
                .output()
                .await
                .ok()?;
            if !output.status.success() {
                return None;
            }
            let text = String::from_utf8_lossy(&output.stdout);
            Some(parse_porcelain_v2(&text))
        })
    }
}

fn parse_porcelain_v2(text: &str) -> serde_json::Value {
    let mut branch = None;
    let mut ahead = 0i64;
    let mut behind = 0i64;
    let mut modified = 0u64;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("# branch.head ") {
            branch = Some(rest.to_owned());
        } else if let Some(rest) = line.strip_prefix("# branch.ab ") {
            for token in rest.split_whitespace() {
                if let Some(n) = token.strip_prefix('+') {
                    ahead = n.parse().unwrap_or(0);
                } else if let Some(n) = token.strip_prefix('-') {
                    behind = n.parse().unwrap_or(0);
                }
            }
        } else if !line.starts_with('#') {
            modified += 1;
        }
    }

    serde_json::json!({
        "type": "git-status",
        "branch": branch,
        "ahead": ahead,
        "behind": behind,
        "modifiedCount": modified,
        "hasChanges": modified > 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_branch_and_ahead_behind() {
        let text = "# branch.oid abcdef\n# branch.head main\n# branch.upstream origin/main\n# branch.ab +2 -1\n1 .M N... 100644 100644 100644 deadbeef deadbeef src/lib.rs\n";
        let status = parse_porcelain_v2(text);
        assert_eq!(status["branch"], "main");
        assert_eq!(status["ahead"], 2);
        assert_eq!(status["behind"], 1);
        assert_eq!(status["modifiedCount"], 1);
        assert_eq!(status["hasChanges"], true);
    }

    #[test]
    fn clean_tree_has_no_changes() {
        let text = "# branch.oid abcdef\n# branch.head main\n# branch.upstream origin/main\n# branch.ab +0 -0\n";
        let status = parse_porcelain_v2(text);
        assert_eq!(status["modifiedCount"], 0);
        assert_eq!(status["hasChanges"], false);
    }
}
