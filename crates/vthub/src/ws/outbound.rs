// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection outbound frame mux (§5 "Shared resources").
//!
//! A slow client must not be handled by silently dropping non-STDOUT frames:
//! instead SNAPSHOT_VT frames are coalesced (only the latest pending one per
//! session is kept) and STDOUT is queued up to a per-client byte limit; once
//! that limit is exceeded the mux latches closed and the connection is torn
//! down with a close frame rather than left to backpressure forever.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

/// Why the mux latched closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StdoutOverflow,
}

/// One item handed back by [`OutboundMux::recv`].
pub enum Outgoing {
    Frame(Bytes),
    Close(CloseReason),
}

enum QueueItem {
    Stdout(Bytes),
    Other(Bytes),
    /// A pending SNAPSHOT_VT for this session id; look its bytes up in
    /// `pending_snapshots` at drain time, since a later snapshot for the same
    /// session may have replaced it in place without re-queuing a marker.
    Snapshot(String),
}

struct MuxState {
    queue: VecDeque<QueueItem>,
    pending_snapshots: HashMap<String, Bytes>,
    stdout_bytes_queued: usize,
    closed: Option<CloseReason>,
}

/// The single channel every frame bound for one client flows through.
pub struct OutboundMux {
    state: Mutex<MuxState>,
    notify: Notify,
    stdout_byte_limit: usize,
}

impl OutboundMux {
    pub fn new(stdout_byte_limit: usize) -> Self {
        Self {
            state: Mutex::new(MuxState {
                queue: VecDeque::new(),
                pending_snapshots: HashMap::new(),
                stdout_bytes_queued: 0,
                closed: None,
            }),
            notify: Notify::new(),
            stdout_byte_limit,
        }
    }

    /// Enqueue a WELCOME/PONG/EVENT/ERROR frame: these are small and rare
    /// enough that no special backpressure handling applies beyond FIFO order.
    pub async fn send_other(&self, bytes: Bytes) {
        let mut state = self.state.lock().await;
        if state.closed.is_some() {
            return;
        }
        state.queue.push_back(QueueItem::Other(bytes));
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue a STDOUT frame, counted against the per-client byte limit. If
    /// this push would exceed the limit, the mux latches closed instead:
    /// everything already queued is discarded and the connection's send loop
    /// observes [`Outgoing::Close`] on its next poll.
    pub async fn send_stdout(&self, bytes: Bytes) {
        let mut state = self.state.lock().await;
        if state.closed.is_some() {
            return;
        }
        if state.stdout_bytes_queued + bytes.len() > self.stdout_byte_limit {
            state.closed = Some(CloseReason::StdoutOverflow);
            state.queue.clear();
            state.pending_snapshots.clear();
            state.stdout_bytes_queued = 0;
            drop(state);
            self.notify.notify_one();
            return;
        }
        state.stdout_bytes_queued += bytes.len();
        state.queue.push_back(QueueItem::Stdout(bytes));
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue a SNAPSHOT_VT frame for `session_id`. If one is already
    /// pending for that session, it is replaced in place — only the latest
    /// matters, so the queue never carries more than one marker per session.
    pub async fn send_snapshot(&self, session_id: &str, bytes: Bytes) {
        let mut state = self.state.lock().await;
        if state.closed.is_some() {
            return;
        }
        let already_queued = state.pending_snapshots.contains_key(session_id);
        state.pending_snapshots.insert(session_id.to_owned(), bytes);
        if !already_queued {
            state.queue.push_back(QueueItem::Snapshot(session_id.to_owned()));
        }
        drop(state);
        self.notify.notify_one();
    }

    /// True once the mux has latched closed (used by forwarders to stop
    /// pushing once a connection is already doomed).
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed.is_some()
    }

    /// Wait for the next frame to send, or for the mux to latch closed.
    pub async fn recv(&self) -> Outgoing {
        loop {
            {
                let mut state = self.state.lock().await;
                while let Some(item) = state.queue.pop_front() {
                    match item {
                        QueueItem::Stdout(bytes) => {
                            state.stdout_bytes_queued -= bytes.len();
                            return Outgoing::Frame(bytes);
                        }
                        QueueItem::Other(bytes) => return Outgoing::Frame(bytes),
                        QueueItem::Snapshot(session_id) => {
                            if let Some(bytes) = state.pending_snapshots.remove(&session_id) {
                                return Outgoing::Frame(bytes);
                            }
                        }
                    }
                }
                if let Some(reason) = state.closed {
                    return Outgoing::Close(reason);
                }
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
#[path = "outbound_tests.rs"]
mod tests;
