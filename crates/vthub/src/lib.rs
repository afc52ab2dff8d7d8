// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! VibeTunnel core: the Cast Output Hub, WebSocket v3 Hub, Input Ownership
//! Service, Session Monitor, and Git-Status Watcher that make terminal
//! multiplexing correct and efficient. Native PTY spawning, on-disk session
//! layout, and terminal rendering are external collaborators (`collab.rs`);
//! `demo.rs` wires minimal file-backed stand-ins for them so this crate's
//! binary can be exercised against real files on disk.

pub mod cast;
pub mod collab;
pub mod config;
pub mod demo;
pub mod error;
pub mod git_status;
pub mod monitor;
pub mod ownership;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cast::hub::CastOutputHub;
use crate::config::CoreConfig;
use crate::demo::{DemoGitStatusProbe, DemoPtyManager, DemoSessionManager, DemoTerminalManager};
use crate::monitor::{MonitorTimings, SessionMonitor};
use crate::ownership::OwnershipService;
use crate::ws::hub::Hub;
use crate::ws::remote::{spawn_remote_link, RemoteRegistry, RemoteRouter};

/// Run the core server until `shutdown` fires or the listener fails.
pub async fn run(config: CoreConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let session_manager = Arc::new(DemoSessionManager::new(config.control_dir.clone()));
    let cast_hub = Arc::new(CastOutputHub::new(session_manager));
    let monitor = Arc::new(SessionMonitor::new(MonitorTimings {
        assistant_idle_debounce: config.assistant_idle_debounce(),
        assistant_finish_grace: config.assistant_finish_grace(),
        min_command_duration: config.min_command_duration(),
        session_exit_grace: config.session_exit_grace(),
    }));
    let pty = Arc::new(DemoPtyManager::discover(&config.control_dir).await);
    let terminal = Arc::new(DemoTerminalManager);
    let git_probe = Arc::new(DemoGitStatusProbe);
    let ownership = Arc::new(OwnershipService::new(config.ownership_timeout(), config.ownership_sweep_interval()));

    let remotes: Vec<_> = config
        .parsed_remotes()
        .into_iter()
        .map(|(name, url, token)| spawn_remote_link(name, &url, token, config.remote_handshake_timeout()))
        .collect();
    let remote_router = Arc::new(RemoteRouter::new(remotes));
    let remote_registry = Arc::new(RemoteRegistry::new());

    let hub = Arc::new(Hub::new(
        cast_hub,
        monitor,
        pty,
        terminal,
        git_probe,
        Arc::clone(&ownership),
        remote_router,
        remote_registry,
        config.client_send_buffer_bytes,
    ));

    tokio::spawn({
        let ownership = Arc::clone(&ownership);
        let shutdown = shutdown.clone();
        async move { ownership.run_sweeper(shutdown).await }
    });

    let router = Router::new().route("/ws", get(ws::server::ws_handler)).with_state(hub);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(%addr, "vthub listening");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
