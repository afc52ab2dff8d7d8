// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Input Ownership Service (§4.6): last-writer-wins coordination of which
//! client currently drives a shared session, with pending-input broadcast
//! for cross-device sync, inactivity expiry, and a periodic sweep.
//!
//! The locked inner map follows the `InputGate`/`DeliveryGateInner` shape in
//! `crates/cli/src/transport/state.rs` (a `tokio::sync::Mutex` guarding plain
//! bookkeeping state). Ownership-change notifications go out over a
//! `broadcast` channel instead of a callback list: each subscriber drains its
//! own receiver in its own task, so one subscriber's misbehavior can't block
//! or poison delivery to the others — the same per-listener isolation a
//! synchronous callback list would need to simulate, gotten for free from the
//! channel's fan-out semantics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

/// `(sessionId, newOwner, previousOwner, pendingInput)` — the single shape
/// every ownership change is reported as, whether from a claim, an explicit
/// release, or sweep-driven expiry (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChanged {
    pub session_id: String,
    pub new_owner: Option<u64>,
    pub previous_owner: Option<u64>,
    pub pending_input: String,
}

struct OwnerRecord {
    client_id: u64,
    last_activity: Instant,
    pending_input: String,
}

struct Inner {
    owners: HashMap<String, OwnerRecord>,
}

/// Tracks which client currently owns input delivery for each session.
pub struct OwnershipService {
    inner: Mutex<Inner>,
    events: broadcast::Sender<OwnershipChanged>,
    timeout: Duration,
    sweep_interval: Duration,
}

impl OwnershipService {
    pub fn new(timeout: Duration, sweep_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { inner: Mutex::new(Inner { owners: HashMap::new() }), events, timeout, sweep_interval }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OwnershipChanged> {
        self.events.subscribe()
    }

    /// Claim exclusive ownership of `session_id` for `client_id`, displacing
    /// any previous owner. Notifies only if the owner or pending input
    /// actually changed.
    pub async fn claim(&self, session_id: &str, client_id: u64, pending_input: &str) {
        let changed = {
            let mut guard = self.inner.lock().await;
            let previous = guard.owners.get(session_id);
            let owner_changed = previous.map(|r| r.client_id) != Some(client_id);
            let input_changed = previous.map(|r| r.pending_input.as_str()) != Some(pending_input);
            let previous_owner = previous.map(|r| r.client_id);
            guard.owners.insert(
                session_id.to_owned(),
                OwnerRecord {
                    client_id,
                    last_activity: Instant::now(),
                    pending_input: pending_input.to_owned(),
                },
            );
            (owner_changed || input_changed).then_some(previous_owner)
        };
        if let Some(previous_owner) = changed {
            let _ = self.events.send(OwnershipChanged {
                session_id: session_id.to_owned(),
                new_owner: Some(client_id),
                previous_owner,
                pending_input: pending_input.to_owned(),
            });
        }
    }

    /// Update the pending-input preview for cross-device sync. If
    /// `client_id` is not the current owner, this is equivalent to `claim`.
    pub async fn update_pending(&self, session_id: &str, client_id: u64, pending_input: &str) {
        let is_owner = {
            let guard = self.inner.lock().await;
            guard.owners.get(session_id).is_some_and(|r| r.client_id == client_id)
        };
        if !is_owner {
            self.claim(session_id, client_id, pending_input).await;
            return;
        }

        let changed = {
            let mut guard = self.inner.lock().await;
            let Some(record) = guard.owners.get_mut(session_id) else { return };
            record.last_activity = Instant::now();
            if record.pending_input == pending_input {
                false
            } else {
                record.pending_input = pending_input.to_owned();
                true
            }
        };
        if changed {
            let _ = self.events.send(OwnershipChanged {
                session_id: session_id.to_owned(),
                new_owner: Some(client_id),
                previous_owner: Some(client_id),
                pending_input: pending_input.to_owned(),
            });
        }
    }

    /// True iff nobody owns the session (anyone may write) or `client_id` is
    /// the current, non-expired owner.
    pub async fn has_ownership(&self, session_id: &str, client_id: u64) -> bool {
        let guard = self.inner.lock().await;
        match guard.owners.get(session_id) {
            None => true,
            Some(record) => record.client_id == client_id && record.last_activity.elapsed() < self.timeout,
        }
    }

    /// Release ownership if `client_id` currently holds it.
    pub async fn release(&self, session_id: &str, client_id: u64) {
        let released = {
            let mut guard = self.inner.lock().await;
            match guard.owners.get(session_id) {
                Some(r) if r.client_id == client_id => {
                    guard.owners.remove(session_id);
                    true
                }
                _ => false,
            }
        };
        if released {
            let _ = self.events.send(OwnershipChanged {
                session_id: session_id.to_owned(),
                new_owner: None,
                previous_owner: Some(client_id),
                pending_input: String::new(),
            });
        }
    }

    /// Release every session owned by `client_id` (called on client disconnect).
    pub async fn release_all_for_client(&self, client_id: u64) {
        let released_sessions: Vec<String> = {
            let mut guard = self.inner.lock().await;
            let sessions: Vec<String> = guard
                .owners
                .iter()
                .filter(|(_, r)| r.client_id == client_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &sessions {
                guard.owners.remove(id);
            }
            sessions
        };
        for session_id in released_sessions {
            let _ = self.events.send(OwnershipChanged {
                session_id,
                new_owner: None,
                previous_owner: Some(client_id),
                pending_input: String::new(),
            });
        }
    }

    /// Sweep once: release ownership of any session idle past `timeout`.
    async fn sweep_once(&self) {
        let expired: Vec<(String, u64)> = {
            let mut guard = self.inner.lock().await;
            let expired_ids: Vec<String> = guard
                .owners
                .iter()
                .filter(|(_, r)| r.last_activity.elapsed() >= self.timeout)
                .map(|(id, _)| id.clone())
                .collect();
            let mut expired = Vec::with_capacity(expired_ids.len());
            for id in expired_ids {
                if let Some(record) = guard.owners.remove(&id) {
                    expired.push((id, record.client_id));
                }
            }
            expired
        };
        for (session_id, client_id) in expired {
            let _ = self.events.send(OwnershipChanged {
                session_id,
                new_owner: None,
                previous_owner: Some(client_id),
                pending_input: String::new(),
            });
        }
    }

    /// Run the periodic sweep until `shutdown` is cancelled.
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => self.sweep_once().await,
            }
        }
    }
}

#[cfg(test)]
#[path = "ownership_tests.rs"]
mod tests;
