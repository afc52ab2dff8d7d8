// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the VibeTunnel core server.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "vthub", version, about)]
pub struct CoreConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "VT_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 4020, env = "VT_PORT")]
    pub port: u16,

    /// Control directory: parent of `<sessionId>/stdout` cast logs.
    #[arg(long, env = "VT_CONTROL_DIR")]
    pub control_dir: std::path::PathBuf,

    /// Input ownership expiry, in seconds, after the last activity on a record.
    #[arg(long, default_value_t = 30, env = "VT_OWNERSHIP_TIMEOUT_SECS")]
    pub ownership_timeout_secs: u64,

    /// Input ownership sweep interval, in seconds.
    #[arg(long, default_value_t = 5, env = "VT_OWNERSHIP_SWEEP_SECS")]
    pub ownership_sweep_secs: u64,

    /// Per-client STDOUT send-buffer byte limit before the socket is closed.
    #[arg(long, default_value_t = 4 * 1024 * 1024, env = "VT_CLIENT_SEND_BUFFER_BYTES")]
    pub client_send_buffer_bytes: usize,

    /// Assistant idle debounce, in milliseconds (Session Monitor §4.7).
    #[arg(long, default_value_t = 2000, env = "VT_ASSISTANT_IDLE_DEBOUNCE_MS")]
    pub assistant_idle_debounce_ms: u64,

    /// Assistant "finished" trailing-output grace, in milliseconds.
    #[arg(long, default_value_t = 1000, env = "VT_ASSISTANT_FINISH_GRACE_MS")]
    pub assistant_finish_grace_ms: u64,

    /// Minimum command duration, in milliseconds, to emit CommandFinished/CommandError.
    #[arg(long, default_value_t = 3000, env = "VT_MIN_COMMAND_DURATION_MS")]
    pub min_command_duration_ms: u64,

    /// Grace period, in milliseconds, before a SessionState is removed after exit.
    #[arg(long, default_value_t = 5000, env = "VT_SESSION_EXIT_GRACE_MS")]
    pub session_exit_grace_ms: u64,

    /// Remote (HQ mode) entries as repeatable `name=url=token` triples. Empty disables HQ mode.
    #[arg(long = "hq-remote", env = "VT_HQ_REMOTES", value_delimiter = ',')]
    pub hq_remotes: Vec<String>,

    /// Remote upstream handshake timeout, in seconds.
    #[arg(long, default_value_t = 5, env = "VT_REMOTE_HANDSHAKE_TIMEOUT_SECS")]
    pub remote_handshake_timeout_secs: u64,
}

impl CoreConfig {
    pub fn ownership_timeout(&self) -> Duration {
        Duration::from_secs(self.ownership_timeout_secs)
    }

    pub fn ownership_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.ownership_sweep_secs)
    }

    pub fn assistant_idle_debounce(&self) -> Duration {
        Duration::from_millis(self.assistant_idle_debounce_ms)
    }

    pub fn assistant_finish_grace(&self) -> Duration {
        Duration::from_millis(self.assistant_finish_grace_ms)
    }

    pub fn min_command_duration(&self) -> Duration {
        Duration::from_millis(self.min_command_duration_ms)
    }

    pub fn session_exit_grace(&self) -> Duration {
        Duration::from_millis(self.session_exit_grace_ms)
    }

    pub fn remote_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_handshake_timeout_secs)
    }

    /// Parse the `name=url=token` triples into `(name, url, token)`.
    pub fn parsed_remotes(&self) -> Vec<(String, String, String)> {
        self.hq_remotes
            .iter()
            .filter_map(|entry| {
                let mut parts = entry.splitn(3, '=');
                let name = parts.next()?.to_owned();
                let url = parts.next()?.to_owned();
                let token = parts.next().unwrap_or("").to_owned();
                Some((name, url, token))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_triples() {
        let config = CoreConfig {
            host: "127.0.0.1".into(),
            port: 4020,
            control_dir: "/tmp".into(),
            ownership_timeout_secs: 30,
            ownership_sweep_secs: 5,
            client_send_buffer_bytes: 4096,
            assistant_idle_debounce_ms: 2000,
            assistant_finish_grace_ms: 1000,
            min_command_duration_ms: 3000,
            session_exit_grace_ms: 5000,
            hq_remotes: vec![
                "hq1=https://hq1.example=tok123".to_owned(),
                "hq2=https://hq2.example".to_owned(),
                "bad-entry".to_owned(),
            ],
            remote_handshake_timeout_secs: 5,
        };

        let parsed = config.parsed_remotes();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], ("hq1".to_owned(), "https://hq1.example".to_owned(), "tok123".to_owned()));
        assert_eq!(parsed[1], ("hq2".to_owned(), "https://hq2.example".to_owned(), "".to_owned()));
    }
}
