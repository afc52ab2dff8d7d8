// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket v3 Hub (§4.5): a per-connection subscription state machine that
//! fans cast output, snapshot frames, lifecycle events, and git-status
//! updates to clients, and routes input/resize/kill back to the owning PTY
//! (locally) or a federated remote.
//!
//! `handle_connection` in `crates/cli/src/transport/ws.rs` drives a *fixed*
//! set of broadcast receivers known entirely at connect time, all matched in
//! one `tokio::select!`. The v3 protocol's subscriptions are dynamic instead
//! (created and torn down by client SUBSCRIBE/UNSUBSCRIBE at arbitrary
//! points in the connection's life), so that shape is generalized here: every
//! dynamically-spawned per-session forwarder task writes encoded frames into
//! one outbound mux (see `ws::outbound`), and the connection's own
//! `tokio::select!` shrinks to two arms — drain the mux, or read the next
//! client frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cast::hub::{CastOutputHub, HubEvent};
use crate::collab::{InputPayload, PtyManager, TerminalManager};
use crate::git_status::GitStatusWatcher;
use crate::monitor::{now_iso8601, Notification, SessionMonitor};
use crate::ownership::OwnershipService;
use crate::ws::frame::{self, message_type, subscribe_flags, Frame};
use crate::ws::outbound::{CloseReason, Outgoing, OutboundMux};
use crate::ws::remote::{RemoteRegistry, RemoteRouter};

/// Per-client, per-session subscription bookkeeping (§4.5 "Per-client state").
#[derive(Default)]
struct ClientSub {
    flags: u32,
    cancel_stdout: Option<CancellationToken>,
    cancel_snapshots: Option<CancellationToken>,
    cancel_git: Option<CancellationToken>,
    remote_name: Option<String>,
}

impl ClientSub {
    fn cancel_all(self) {
        if let Some(t) = self.cancel_stdout {
            t.cancel();
        }
        if let Some(t) = self.cancel_snapshots {
            t.cancel();
        }
        if let Some(t) = self.cancel_git {
            t.cancel();
        }
    }
}

type SharedSubs = Arc<Mutex<HashMap<String, ClientSub>>>;

/// Every collaborator a connection's dispatch needs, shared across clients.
pub struct Hub {
    pub cast_hub: Arc<CastOutputHub>,
    pub monitor: Arc<SessionMonitor>,
    pub pty: Arc<dyn PtyManager>,
    pub terminal: Arc<dyn TerminalManager>,
    pub git_probe: Arc<dyn crate::collab::GitStatusProbe>,
    pub ownership: Arc<OwnershipService>,
    pub remotes: Arc<RemoteRouter>,
    pub remote_registry: Arc<RemoteRegistry>,
    /// Per-client STDOUT send-buffer byte limit before the outbound mux
    /// latches closed (§4.9 `client_send_buffer_bytes`, §5 backpressure).
    pub stdout_byte_limit: usize,
    next_client_id: AtomicU64,
}

impl Hub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cast_hub: Arc<CastOutputHub>,
        monitor: Arc<SessionMonitor>,
        pty: Arc<dyn PtyManager>,
        terminal: Arc<dyn TerminalManager>,
        git_probe: Arc<dyn crate::collab::GitStatusProbe>,
        ownership: Arc<OwnershipService>,
        remotes: Arc<RemoteRouter>,
        remote_registry: Arc<RemoteRegistry>,
        stdout_byte_limit: usize,
    ) -> Self {
        Self {
            cast_hub,
            monitor,
            pty,
            terminal,
            git_probe,
            ownership,
            remotes,
            remote_registry,
            stdout_byte_limit,
            next_client_id: AtomicU64::new(1),
        }
    }

    fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Drive one client connection end to end: WELCOME, the always-on global
/// event forwarder, then the two-arm outbound/inbound select loop, then
/// teardown of every subscription this client held.
pub async fn handle_socket(hub: Arc<Hub>, socket: WebSocket) {
    let client_id = hub.next_client_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let outbound = Arc::new(OutboundMux::new(hub.stdout_byte_limit));
    let subs: SharedSubs = Arc::new(Mutex::new(HashMap::new()));

    let welcome = Frame::global(message_type::WELCOME, json!({"ok": true, "version": 3}).to_string().into_bytes());
    if ws_tx.send(Message::Binary(welcome.encode())).await.is_err() {
        return;
    }

    let global_forwarder = spawn_global_forwarder(Arc::clone(&hub), Arc::clone(&subs), Arc::clone(&outbound));

    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                match outgoing {
                    Outgoing::Frame(bytes) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close(reason) => {
                        let (code, description) = match reason {
                            CloseReason::StdoutOverflow => (1009, "stdout send buffer exceeded"),
                        };
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame { code, reason: description.into() })))
                            .await;
                        break;
                    }
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        match Frame::decode(Bytes::from(bytes)) {
                            Ok(frame) => dispatch_frame(&hub, client_id, frame, &subs, &outbound).await,
                            Err(e) => {
                                tracing::debug!(client_id, err = %e, "dropped malformed v3 frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(client_id, err = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    global_forwarder.cancel();
    teardown_client(&hub, client_id, &subs).await;
}

/// Spawn the single always-running per-connection task that forwards every
/// Session Monitor notification as a global `EVENT`, gated dynamically at
/// delivery time on whether `subs[""]` currently carries the `Events` flag
/// (§4.5 "attaches (once)").
fn spawn_global_forwarder(hub: Arc<Hub>, subs: SharedSubs, outbound: Arc<OutboundMux>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let mut events = hub.monitor.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => return,
                received = events.recv() => match received {
                    Ok(notification) => forward_global_notification(&subs, &outbound, &notification).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    });
    cancel
}

async fn forward_global_notification(subs: &SharedSubs, outbound: &OutboundMux, notification: &Notification) {
    let wants = { subs.lock().await.get("").is_some_and(|s| s.flags & subscribe_flags::EVENTS != 0) };
    if !wants {
        return;
    }
    let frame = Frame::new(message_type::EVENT, notification.session_id(), json_bytes(&notification.to_json()));
    outbound.send_other(frame.encode()).await;
}

fn json_bytes(value: &serde_json::Value) -> Bytes {
    Bytes::from(value.to_string().into_bytes())
}

async fn send_error(outbound: &OutboundMux, session_id: &str, message: impl Into<String>) {
    let body = json!({ "message": message.into() });
    let frame = Frame::new(message_type::ERROR, session_id, json_bytes(&body));
    outbound.send_other(frame.encode()).await;
}

async fn dispatch_frame(hub: &Arc<Hub>, client_id: u64, frame: Frame, subs: &SharedSubs, outbound: &Arc<OutboundMux>) {
    match frame.message_type {
        message_type::PING => {
            let pong = Frame::new(message_type::PONG, frame.session_id, frame.payload);
            outbound.send_other(pong.encode()).await;
        }
        message_type::SUBSCRIBE => handle_subscribe(hub, client_id, &frame, subs, outbound).await,
        message_type::UNSUBSCRIBE => handle_unsubscribe(hub, client_id, &frame.session_id, subs).await,
        message_type::INPUT_TEXT => {
            if let Ok(text) = std::str::from_utf8(&frame.payload) {
                hub.ownership.claim(&frame.session_id, client_id, "").await;
                route_input(hub, &frame, InputPayload::Text(text.to_owned()), outbound).await;
            } else {
                send_error(outbound, &frame.session_id, "INPUT_TEXT payload is not valid UTF-8").await;
            }
        }
        message_type::INPUT_KEY => {
            if let Ok(key) = std::str::from_utf8(&frame.payload) {
                hub.ownership.claim(&frame.session_id, client_id, "").await;
                route_input(hub, &frame, InputPayload::Key(key.to_owned()), outbound).await;
            } else {
                send_error(outbound, &frame.session_id, "INPUT_KEY payload is not valid UTF-8").await;
            }
        }
        message_type::RESIZE => match frame::decode_resize_payload(&frame.payload) {
            Ok((cols, rows)) => {
                if let Some(remote_name) = hub.remote_registry.owning_remote(&frame.session_id).await {
                    forward_to_remote(hub, &remote_name, &frame, outbound).await;
                } else if let Err(e) = hub.pty.resize_session(&frame.session_id, cols, rows).await {
                    send_error(outbound, &frame.session_id, e.message().to_owned()).await;
                }
            }
            Err(e) => send_error(outbound, &frame.session_id, e.message().to_owned()).await,
        },
        message_type::KILL => match frame::decode_kill_payload(&frame.payload) {
            Ok(signal) => {
                if let Some(remote_name) = hub.remote_registry.owning_remote(&frame.session_id).await {
                    forward_to_remote(hub, &remote_name, &frame, outbound).await;
                } else if let Err(e) = hub.pty.kill_session(&frame.session_id, &signal).await {
                    send_error(outbound, &frame.session_id, e.message().to_owned()).await;
                }
            }
            Err(e) => send_error(outbound, &frame.session_id, e.message().to_owned()).await,
        },
        message_type::RESET_SIZE => {
            if let Some(remote_name) = hub.remote_registry.owning_remote(&frame.session_id).await {
                forward_to_remote(hub, &remote_name, &frame, outbound).await;
            } else if let Err(e) = hub.pty.reset_session_size(&frame.session_id).await {
                send_error(outbound, &frame.session_id, e.message().to_owned()).await;
            }
        }
        other => {
            tracing::debug!(client_id, message_type = other, "ignoring unknown v3 frame type");
        }
    }
}

async fn route_input(hub: &Arc<Hub>, frame: &Frame, payload: InputPayload, outbound: &OutboundMux) {
    if let Some(remote_name) = hub.remote_registry.owning_remote(&frame.session_id).await {
        forward_to_remote(hub, &remote_name, frame, outbound).await;
        return;
    }
    if let Err(e) = hub.pty.send_input(&frame.session_id, payload).await {
        send_error(outbound, &frame.session_id, e.message().to_owned()).await;
    }
}

async fn forward_to_remote(hub: &Arc<Hub>, remote_name: &str, frame: &Frame, outbound: &OutboundMux) {
    match hub.remotes.get(remote_name) {
        Some(remote) => remote.forward_upstream(frame.encode()),
        None => send_error(outbound, &frame.session_id, format!("unknown remote '{remote_name}'")).await,
    }
}

async fn handle_subscribe(hub: &Arc<Hub>, client_id: u64, frame: &Frame, subs: &SharedSubs, outbound: &Arc<OutboundMux>) {
    let flags = match frame::decode_subscribe_payload(&frame.payload) {
        Ok(flags) => flags,
        Err(e) => {
            send_error(outbound, &frame.session_id, e.message().to_owned()).await;
            return;
        }
    };

    if frame.session_id.is_empty() {
        subs.lock().await.insert(String::new(), ClientSub { flags, ..Default::default() });
        let connected = json!({ "type": "connected", "timestamp": now_iso8601() });
        let event = Frame::global(message_type::EVENT, json_bytes(&connected));
        outbound.send_other(event.encode()).await;
        return;
    }

    let session_id = frame.session_id.clone();

    teardown_session_sub(hub, client_id, &session_id, subs).await;

    if let Some(remote_name) = hub.remote_registry.owning_remote(&session_id).await {
        match hub.remotes.get(&remote_name) {
            Some(remote) => {
                remote.register_downstream(client_id, Arc::clone(outbound)).await;
                remote.update_subscription(&session_id, client_id, flags).await;
                subs.lock().await.insert(
                    session_id,
                    ClientSub { flags, remote_name: Some(remote_name), ..Default::default() },
                );
            }
            None => send_error(outbound, &session_id, format!("unknown remote '{remote_name}'")).await,
        }
        return;
    }

    let mut sub = ClientSub { flags, ..Default::default() };
    if flags & subscribe_flags::STDOUT != 0 {
        sub.cancel_stdout = Some(spawn_stdout_forwarder(hub, &session_id, flags, Arc::clone(outbound)).await);
    }
    if flags & subscribe_flags::SNAPSHOTS != 0 {
        sub.cancel_snapshots = Some(spawn_snapshot_forwarder(hub, &session_id, Arc::clone(outbound)).await);
    }
    if flags & subscribe_flags::EVENTS != 0 {
        sub.cancel_git = Some(spawn_git_status_forwarder(hub, &session_id, Arc::clone(outbound)).await);
    }
    subs.lock().await.insert(session_id, sub);
}

async fn handle_unsubscribe(hub: &Arc<Hub>, client_id: u64, session_id: &str, subs: &SharedSubs) {
    if session_id.is_empty() {
        subs.lock().await.remove("");
        return;
    }
    teardown_session_sub(hub, client_id, session_id, subs).await;
}

/// Fully cancel (and, for a remote sub, unregister) any existing subscription
/// for `session_id`, per "re-subscribing cancels the entire prior sub". The
/// client's downstream sender on that remote is left registered: it is keyed
/// by client id, not session id, and may still be needed by another of this
/// client's sessions routed through the same remote (see `teardown_client`).
async fn teardown_session_sub(hub: &Arc<Hub>, client_id: u64, session_id: &str, subs: &SharedSubs) {
    let Some(sub) = subs.lock().await.remove(session_id) else { return };
    if let Some(remote_name) = &sub.remote_name {
        if let Some(remote) = hub.remotes.get(remote_name) {
            remote.remove_client_from_session(session_id, client_id).await;
        }
    }
    sub.cancel_all();
}

async fn teardown_client(hub: &Arc<Hub>, client_id: u64, subs: &SharedSubs) {
    let all: Vec<(String, ClientSub)> = subs.lock().await.drain().collect();
    let mut remotes_used: std::collections::HashSet<String> = std::collections::HashSet::new();
    for (session_id, sub) in all {
        if let Some(remote_name) = &sub.remote_name {
            if let Some(remote) = hub.remotes.get(remote_name) {
                remote.remove_client_from_session(&session_id, client_id).await;
            }
            remotes_used.insert(remote_name.clone());
        }
        sub.cancel_all();
    }
    for remote_name in remotes_used {
        if let Some(remote) = hub.remotes.get(&remote_name) {
            remote.remove_downstream(client_id).await;
        }
    }
    hub.ownership.release_all_for_client(client_id).await;
}

/// Subscribe to the Cast Output Hub and translate its events into v3 frames.
/// `Resize`/`Header` are only forwarded (as EVENT JSON) if `flags` also
/// carries `Events`; `Exit`/`Error` are forwarded unconditionally once a
/// Stdout subscription exists.
async fn spawn_stdout_forwarder(hub: &Arc<Hub>, session_id: &str, flags: u32, outbound: Arc<OutboundMux>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let session_id = session_id.to_owned();
    let mut subscription = hub.cast_hub.subscribe(&session_id).await;
    let also_events = flags & subscribe_flags::EVENTS != 0;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    subscription.handle.unsubscribe().await;
                    return;
                }
                event = subscription.rx.recv() => {
                    let Some(event) = event else { return };
                    if outbound.is_closed().await {
                        subscription.handle.unsubscribe().await;
                        return;
                    }
                    match event {
                        HubEvent::Output { data, .. } => {
                            let out = Frame::new(message_type::STDOUT, session_id.clone(), data.into_bytes());
                            outbound.send_stdout(out.encode()).await;
                        }
                        HubEvent::Resize { cols, rows, .. } if also_events => {
                            let body = json!({ "type": "resize", "cols": cols, "rows": rows });
                            let out = Frame::new(message_type::EVENT, session_id.clone(), json_bytes(&body));
                            outbound.send_other(out.encode()).await;
                        }
                        HubEvent::Resize { .. } => {}
                        HubEvent::Header(header) if also_events => {
                            let body = json!({ "type": "header", "header": header });
                            let out = Frame::new(message_type::EVENT, session_id.clone(), json_bytes(&body));
                            outbound.send_other(out.encode()).await;
                        }
                        HubEvent::Header(_) => {}
                        HubEvent::Exit { code } => {
                            let body = json!({ "kind": "exit", "exitCode": code });
                            let out = Frame::new(message_type::EVENT, session_id.clone(), json_bytes(&body));
                            outbound.send_other(out.encode()).await;
                            return;
                        }
                        HubEvent::Error { message } => {
                            let body = json!({ "message": message });
                            let out = Frame::new(message_type::ERROR, session_id.clone(), json_bytes(&body));
                            outbound.send_other(out.encode()).await;
                        }
                    }
                }
            }
        }
    });

    cancel
}

/// Subscribe to the external `TerminalManager`'s buffer-change feed and
/// forward each opaque snapshot as `SNAPSHOT_VT`, coalesced by the outbound
/// mux (§5: "only the latest pending matters").
async fn spawn_snapshot_forwarder(hub: &Arc<Hub>, session_id: &str, outbound: Arc<OutboundMux>) -> CancellationToken {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(64);
    let cancel = hub.terminal.subscribe_to_buffer_changes(session_id, tx).await;
    let task_cancel = cancel.clone();
    let session_id = session_id.to_owned();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => return,
                received = rx.recv() => match received {
                    Some(buf) => {
                        if outbound.is_closed().await {
                            return;
                        }
                        let out = Frame::new(message_type::SNAPSHOT_VT, session_id.clone(), buf);
                        outbound.send_snapshot(&session_id, out.encode()).await;
                    }
                    None => return,
                }
            }
        }
    });

    cancel
}

/// Start a `GitStatusWatcher` for the session's working (or git-repo) dir and
/// forward its status notifications, scoped to this session, as `EVENT` JSON.
async fn spawn_git_status_forwarder(hub: &Arc<Hub>, session_id: &str, outbound: Arc<OutboundMux>) -> CancellationToken {
    let cancel = CancellationToken::new();

    let Some(descriptor) = hub.pty.get_session(session_id).await else {
        send_error(&outbound, session_id, "session not found, not watching git status").await;
        return cancel;
    };
    let watch_dir = descriptor.git_repo_path.unwrap_or(descriptor.working_dir);

    let watcher = GitStatusWatcher::new(session_id.to_owned(), watch_dir, Arc::clone(&hub.git_probe), Arc::clone(&hub.monitor));
    let watcher_cancel = cancel.clone();
    tokio::spawn(watcher.run(watcher_cancel));

    let forward_cancel = cancel.clone();
    let session_id = session_id.to_owned();
    let mut events = hub.monitor.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = forward_cancel.cancelled() => return,
                received = events.recv() => match received {
                    Ok(notification @ Notification::GitStatus { .. }) if notification.session_id() == session_id => {
                        let out = Frame::new(message_type::EVENT, session_id.clone(), json_bytes(&notification.to_json()));
                        outbound.send_other(out.encode()).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    });

    cancel
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
