// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote federation / HQ mode (§4.5.1): a lazy outbound v3 WebSocket per
//! remote, with per-session subscription aggregated across downstream
//! clients and re-sent only when the aggregate changes.
//!
//! Modeled on `WsBridge`'s single-upstream-fan-out-to-many-downstream shape
//! (`crates/mux/src/upstream/bridge.rs`), adapted from JSON correlation
//! routing to v3 binary framing with flag-aggregated subscriptions instead of
//! a fixed subscribe string, and from a query-token to a Bearer header.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::ws::frame::{self, message_type};
use crate::ws::outbound::OutboundMux;

const MAX_BACKOFF: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Per-remote state: the lazily-started connection task and the per-session,
/// per-client flag contributions used to compute the aggregate subscription.
struct RemoteState {
    /// session_id -> (client_id -> flags)
    session_clients: RwLock<HashMap<String, HashMap<u64, u32>>>,
    /// session_id -> last subscription flags actually sent upstream (0 = unsubscribed).
    sent_flags: RwLock<HashMap<String, u32>>,
    downstream: RwLock<HashMap<u64, Arc<OutboundMux>>>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// One remote's lazily-connected outbound link.
pub struct RemoteLink {
    name: String,
    url: String,
    token: String,
    handshake_timeout: Duration,
    state: Arc<RemoteState>,
    cancel: CancellationToken,
}

impl RemoteLink {
    /// Build a new remote link. The returned receiver must be handed to
    /// [`run_remote_link`] (spawned by the caller) to actually drive the
    /// connection — construction itself makes no connection attempt.
    pub fn new(
        name: impl Into<String>,
        http_url: &str,
        token: impl Into<String>,
        handshake_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RemoteState {
            session_clients: RwLock::new(HashMap::new()),
            sent_flags: RwLock::new(HashMap::new()),
            downstream: RwLock::new(HashMap::new()),
            outbound,
        });
        let url = to_ws_url(http_url);
        let link = Self {
            name: name.into(),
            url,
            token: token.into(),
            handshake_timeout,
            state,
            cancel: CancellationToken::new(),
        };
        (link, outbound_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a downstream client's desired per-session flags and (re)compute
    /// the aggregate SUBSCRIBE/UNSUBSCRIBE to send upstream, only on change.
    pub async fn update_subscription(&self, session_id: &str, client_id: u64, flags: u32) {
        {
            let mut clients = self.state.session_clients.write().await;
            clients.entry(session_id.to_owned()).or_default().insert(client_id, flags);
        }
        self.recompute_and_send(session_id).await;
    }

    /// Remove a client's contribution (on UNSUBSCRIBE or disconnect) and
    /// recompute, sending UNSUBSCRIBE upstream if the aggregate drops to zero.
    pub async fn remove_client_from_session(&self, session_id: &str, client_id: u64) {
        {
            let mut clients = self.state.session_clients.write().await;
            if let Some(per_client) = clients.get_mut(session_id) {
                per_client.remove(&client_id);
            }
        }
        self.recompute_and_send(session_id).await;
    }

    pub async fn register_downstream(&self, client_id: u64, outbound: Arc<OutboundMux>) {
        self.state.downstream.write().await.insert(client_id, outbound);
    }

    pub async fn remove_downstream(&self, client_id: u64) {
        self.state.downstream.write().await.remove(&client_id);
    }

    async fn recompute_and_send(&self, session_id: &str) {
        let aggregate = {
            let clients = self.state.session_clients.read().await;
            clients.get(session_id).map(|m| m.values().fold(0u32, |acc, f| acc | f)).unwrap_or(0)
        };

        let changed = {
            let mut sent = self.state.sent_flags.write().await;
            let previous = sent.get(session_id).copied().unwrap_or(0);
            if previous == aggregate {
                false
            } else {
                sent.insert(session_id.to_owned(), aggregate);
                true
            }
        };
        if !changed {
            return;
        }

        let frame = if aggregate == 0 {
            frame::Frame::new(message_type::UNSUBSCRIBE, session_id, Bytes::new())
        } else {
            frame::Frame::new(message_type::SUBSCRIBE, session_id, frame::encode_subscribe_payload(aggregate))
        };
        let _ = self.state.outbound.send(frame.encode());
    }

    /// Forward a raw (already-encoded) frame upstream — used for INPUT_TEXT/
    /// INPUT_KEY/RESIZE/KILL/RESET_SIZE routed to a remotely-hosted session.
    pub fn forward_upstream(&self, encoded: Bytes) {
        let _ = self.state.outbound.send(encoded);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

fn to_ws_url(http_url: &str) -> String {
    let swapped = if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_owned()
    };
    format!("{}/ws", swapped.trim_end_matches('/'))
}

/// Construct a remote link and spawn its connection-driving task.
pub fn spawn_remote_link(
    name: impl Into<String>,
    http_url: &str,
    token: impl Into<String>,
    handshake_timeout: Duration,
) -> Arc<RemoteLink> {
    let (link, outbound_rx) = RemoteLink::new(name, http_url, token, handshake_timeout);
    let link = Arc::new(link);
    tokio::spawn(run_remote_link(Arc::clone(&link), outbound_rx));
    link
}

/// Owns every configured remote, keyed by name (§4.9 `hq_remotes`).
#[derive(Default)]
pub struct RemoteRouter {
    remotes: HashMap<String, Arc<RemoteLink>>,
}

impl RemoteRouter {
    pub fn new(remotes: Vec<Arc<RemoteLink>>) -> Self {
        Self { remotes: remotes.into_iter().map(|r| (r.name().to_owned(), r)).collect() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<RemoteLink>> {
        self.remotes.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }
}

/// Maps a session id to the name of the remote that owns it (HQ mode). An
/// empty registry means this process is not running as an HQ.
#[derive(Default)]
pub struct RemoteRegistry {
    owners: RwLock<HashMap<String, String>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn owning_remote(&self, session_id: &str) -> Option<String> {
        self.owners.read().await.get(session_id).cloned()
    }

    pub async fn register(&self, session_id: impl Into<String>, remote_name: impl Into<String>) {
        self.owners.write().await.insert(session_id.into(), remote_name.into());
    }

    pub async fn unregister(&self, session_id: &str) {
        self.owners.write().await.remove(session_id);
    }
}

/// Drive one remote's outbound connection: connect (Bearer auth, bounded
/// handshake), resend the full SUBSCRIBE burst for every session with a
/// nonzero aggregate, then pump outbound frames out and inbound frames to
/// matching downstream clients, with exponential backoff on disconnect.
pub async fn run_remote_link(link: Arc<RemoteLink>, mut outbound_rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if link.cancel.is_cancelled() {
            return;
        }

        let request = match Request::builder()
            .uri(&link.url)
            .header("Authorization", format!("Bearer {}", link.token))
            .header("Host", host_of(&link.url))
            .header("Sec-WebSocket-Key", tokio_tungstenite::tungstenite::handshake::client::generate_key())
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .body(())
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(remote = %link.name, err = %e, "malformed remote url, not retrying");
                return;
            }
        };

        let connect = tokio_tungstenite::connect_async(request);
        let connected = tokio::time::timeout(link.handshake_timeout, connect).await;

        match connected {
            Ok(Ok((stream, _))) => {
                backoff = INITIAL_BACKOFF;
                tracing::debug!(remote = %link.name, "remote link connected");
                let (mut write, mut read) = stream.split();

                // Reconnect burst: re-send every currently-nonzero aggregate.
                let burst: Vec<(String, u32)> = {
                    let sent = link.state.sent_flags.read().await;
                    sent.iter().filter(|(_, f)| **f != 0).map(|(k, v)| (k.clone(), *v)).collect()
                };
                for (session_id, flags) in burst {
                    let frame =
                        frame::Frame::new(message_type::SUBSCRIBE, session_id, frame::encode_subscribe_payload(flags));
                    if write.send(Message::Binary(frame.encode())).await.is_err() {
                        break;
                    }
                }

                loop {
                    tokio::select! {
                        _ = link.cancel.cancelled() => return,
                        outgoing = outbound_rx.recv() => match outgoing {
                            Some(bytes) => {
                                if write.send(Message::Binary(bytes)).await.is_err() {
                                    tracing::debug!(remote = %link.name, "remote link write failed");
                                    break;
                                }
                            }
                            None => return,
                        },
                        incoming = read.next() => match incoming {
                            Some(Ok(Message::Binary(bytes))) => {
                                route_inbound(&link, Bytes::from(bytes)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::debug!(remote = %link.name, "remote link closed");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::debug!(remote = %link.name, err = %e, "remote link read error");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(remote = %link.name, err = %e, backoff_ms = backoff.as_millis() as u64, "remote connect failed");
            }
            Err(_) => {
                tracing::debug!(remote = %link.name, "remote handshake timed out");
            }
        }

        tokio::select! {
            _ = link.cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn route_inbound(link: &Arc<RemoteLink>, bytes: Bytes) {
    let Ok(decoded) = frame::Frame::decode(bytes.clone()) else {
        tracing::debug!(remote = %link.name, "dropped malformed frame from remote");
        return;
    };

    // ERROR is exempt from the subscription-flag filter (always forwarded as
    // a debugging affordance), but every frame type, ERROR included, is still
    // scoped to the set of local clients actually subscribed to this session.
    let required_flag = match decoded.message_type {
        message_type::STDOUT => Some(crate::ws::frame::subscribe_flags::STDOUT),
        message_type::SNAPSHOT_VT => Some(crate::ws::frame::subscribe_flags::SNAPSHOTS),
        message_type::EVENT => Some(crate::ws::frame::subscribe_flags::EVENTS),
        message_type::ERROR => None,
        _ => return,
    };

    let clients = link.state.session_clients.read().await;
    let Some(per_client) = clients.get(&decoded.session_id) else { return };
    let downstream = link.state.downstream.read().await;

    for (client_id, outbound) in downstream.iter() {
        let Some(flags) = per_client.get(client_id) else { continue };
        let matches = match required_flag {
            None => true,
            Some(flag) => flags & flag != 0,
        };
        if !matches {
            continue;
        }
        match decoded.message_type {
            message_type::STDOUT => outbound.send_stdout(bytes.clone()).await,
            message_type::SNAPSHOT_VT => outbound.send_snapshot(&decoded.session_id, bytes.clone()).await,
            _ => outbound.send_other(bytes.clone()).await,
        }
    }
}

fn host_of(ws_url: &str) -> String {
    ws_url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("")
        .to_owned()
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
