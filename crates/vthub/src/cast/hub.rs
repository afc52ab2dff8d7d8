// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cast Output Hub (§4.3): the per-session, tailed-file, fan-out broadcaster.
//! Replays pruned history to a new subscriber, then live-tails.
//!
//! Subscribing to the live broadcast channel *before* running history replay
//! means any live events published while replay is in flight are already
//! queued in the new subscriber's own receiver; draining history first and
//! only then reading from that receiver gives the "history precedes live"
//! ordering guarantee (§4.3 Concurrency) without a second manual buffer.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cast::codec::{self, CastEvent};
use crate::cast::tail::{TailEvent, TailReader};
use crate::collab::{SessionInfo, SessionManager};
use crate::error::CoreError;

/// Capacity of the per-session live broadcast channel. Sized generously so
/// that live events published during a (streaming, but not instantaneous)
/// history replay are not lost before the new listener starts draining them.
const LIVE_CHANNEL_CAPACITY: usize = 4096;

/// Event kinds delivered to a Cast Output Hub listener (§4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Header(Value),
    Output { live: bool, data: String },
    Resize { live: bool, cols: u16, rows: u16 },
    Exit { code: i32 },
    Error { message: String },
}

/// A single historical event retained in the replay working set.
#[derive(Debug, Clone, PartialEq)]
enum ReplayedEvent {
    Output(String),
    Resize(u16, u16),
    Exit(i32),
}

/// Outcome of one history-replay pass (§4.3 steps 1-7).
struct ReplayOutcome {
    header: Option<Value>,
    events: Vec<ReplayedEvent>,
    new_last_clear_offset: u64,
}

/// Stream the cast log from `start_offset` to EOF, applying the history
/// replay algorithm. Does not hold the whole file in memory: lines are read
/// and folded into `events` one at a time (§9: "ensure it is streaming").
fn replay_history(path: &Path, session_info: Option<SessionInfo>) -> Result<ReplayOutcome, CoreError> {
    let file_size = std::fs::metadata(path).map_err(|e| CoreError::io_failure(e.to_string()))?.len();
    let start_offset = session_info.map(|i| i.last_clear_offset).unwrap_or(0).min(file_size);

    // Step 2: best-effort read of line 0 for the Header, independent of start_offset.
    let header = {
        let file = std::fs::File::open(path).map_err(|e| CoreError::io_failure(e.to_string()))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => match codec::parse_line(&line) {
                CastEvent::Header(value) => Some(value),
                _ => None,
            },
            Err(_) => None,
        }
    };

    let file = std::fs::File::open(path).map_err(|e| CoreError::io_failure(e.to_string()))?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(start_offset)).map_err(|e| CoreError::io_failure(e.to_string()))?;

    let mut file_offset = start_offset;

    // If we're resuming mid-file, the byte at `start_offset` may land inside
    // a line (the conservative, "into-the-line" offset persisted by a prior
    // replay — see DESIGN.md open-question #2), or it may already sit exactly
    // on a line boundary (a prune that consumed its line's entire remainder
    // leaves `last_clear_offset` pointing at the next line's first byte).
    // Only discard a straddling remainder in the former case: check whether
    // the byte immediately before `start_offset` is a newline.
    if start_offset > 0 {
        let mut probe = std::fs::File::open(path).map_err(|e| CoreError::io_failure(e.to_string()))?;
        probe.seek(SeekFrom::Start(start_offset - 1)).map_err(|e| CoreError::io_failure(e.to_string()))?;
        let mut prev_byte = [0u8; 1];
        use std::io::Read;
        let at_line_start = probe.read_exact(&mut prev_byte).is_ok() && prev_byte[0] == b'\n';

        if !at_line_start {
            let mut discard = String::new();
            let consumed = reader.read_line(&mut discard).map_err(|e| CoreError::io_failure(e.to_string()))?;
            file_offset += consumed as u64;
        }
    }

    let mut events: Vec<ReplayedEvent> = Vec::new();
    let mut current_resize: Option<(u16, u16)> = None;
    let mut last_clear_index: Option<i64> = None;
    let mut last_resize_before_clear: Option<(u16, u16)> = None;
    let mut last_clear_offset = start_offset;

    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).map_err(|e| CoreError::io_failure(e.to_string()))?;
        if bytes_read == 0 {
            break;
        }
        file_offset += bytes_read as u64;
        let trimmed = line.trim_end_matches(['\r', '\n']);

        match codec::parse_line(trimmed) {
            CastEvent::Header(_) | CastEvent::Input { .. } => {
                // Header (excluding line 0, handled above) and recorded Input
                // are never delivered to viewers; only the byte offset matters.
            }
            CastEvent::Output { data, .. } => {
                push_output(
                    data,
                    file_offset,
                    &mut events,
                    current_resize,
                    &mut last_clear_index,
                    &mut last_resize_before_clear,
                    &mut last_clear_offset,
                );
            }
            CastEvent::Resize { cols, rows, .. } => {
                current_resize = Some((cols, rows));
                events.push(ReplayedEvent::Resize(cols, rows));
            }
            CastEvent::Exit { code, .. } => {
                events.push(ReplayedEvent::Exit(code));
            }
            CastEvent::Unknown => {
                // Leniency: a non-asciinema chunk is treated as raw Output (§4.3 live rule,
                // applied consistently here so history and live agree on unknown lines).
                push_output(
                    trimmed.to_owned(),
                    file_offset,
                    &mut events,
                    current_resize,
                    &mut last_clear_index,
                    &mut last_resize_before_clear,
                    &mut last_clear_offset,
                );
            }
        }
    }

    // Step 5: the boundary right after the last fully-pruned event is where replay resumes.
    let start_index = last_clear_index.map(|i| (i + 1) as usize).unwrap_or(0);
    let surviving = events.split_off(start_index.min(events.len()));

    // Step 6: synthesize the Header, overriding geometry if a clear was found.
    let synthesized_header = header.map(|mut value| {
        if let (Some((cols, rows)), Value::Object(ref mut map)) = (last_resize_before_clear, &mut value) {
            map.insert("width".to_owned(), Value::from(cols));
            map.insert("height".to_owned(), Value::from(rows));
        }
        value
    });

    Ok(ReplayOutcome { header: synthesized_header, events: surviving, new_last_clear_offset: last_clear_offset })
}

/// Push an Output (or unknown-as-output) line into the replay working set,
/// truncating it to its post-prune suffix and cutting history before it if
/// the line contains a prune sequence (§4.3 step 4).
#[allow(clippy::too_many_arguments)]
fn push_output(
    data: String,
    file_offset_after_line: u64,
    events: &mut Vec<ReplayedEvent>,
    current_resize: Option<(u16, u16)>,
    last_clear_index: &mut Option<i64>,
    last_resize_before_clear: &mut Option<(u16, u16)>,
    last_clear_offset: &mut u64,
) {
    match codec::find_last_prune_point(&data) {
        Some(point) => {
            let after = &data[point.byte_offset_after..];
            *last_clear_index = Some(events.len() as i64 - 1);
            *last_resize_before_clear = current_resize;
            *last_clear_offset = file_offset_after_line - after.len() as u64;
            events.push(ReplayedEvent::Output(after.to_owned()));
        }
        None => events.push(ReplayedEvent::Output(data)),
    }
}

/// Per-session tailing state shared by every listener of that session.
struct SessionHub {
    live_tx: broadcast::Sender<HubEvent>,
    listener_count: AtomicUsize,
    tail_cancel: CancellationToken,
}

/// A live subscription returned by [`CastOutputHub::subscribe`].
pub struct CastSubscription {
    pub rx: mpsc::Receiver<HubEvent>,
    pub handle: UnsubscribeHandle,
}

/// Idempotent unsubscribe handle (§8: "unsubscribe called twice yields the
/// same observable state as calling it once").
#[derive(Clone)]
pub struct UnsubscribeHandle {
    forward_cancel: CancellationToken,
    released: Arc<AtomicBool>,
    hub: Arc<CastOutputHubInner>,
    session_id: String,
}

impl UnsubscribeHandle {
    pub async fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forward_cancel.cancel();
        self.hub.release_listener(&self.session_id).await;
    }
}

struct CastOutputHubInner {
    sessions: RwLock<HashMap<String, Arc<SessionHub>>>,
    session_manager: Arc<dyn SessionManager>,
}

/// Per-session, tailed-file, fan-out broadcaster (§4.3).
#[derive(Clone)]
pub struct CastOutputHub {
    inner: Arc<CastOutputHubInner>,
}

impl CastOutputHub {
    pub fn new(session_manager: Arc<dyn SessionManager>) -> Self {
        Self {
            inner: Arc::new(CastOutputHubInner {
                sessions: RwLock::new(HashMap::new()),
                session_manager,
            }),
        }
    }

    /// Subscribe to a session: runs history replay, then attaches to live tail.
    pub async fn subscribe(&self, session_id: &str) -> CastSubscription {
        let (tx, mut rx) = mpsc::channel(256);

        let Some(stdout_path) = self.inner.session_manager.stdout_path(session_id).await else {
            let _ = tx.send(HubEvent::Error { message: format!("session {session_id} not found") }).await;
            drop(tx);
            let forward_cancel = CancellationToken::new();
            forward_cancel.cancel();
            return CastSubscription {
                rx,
                handle: UnsubscribeHandle {
                    forward_cancel,
                    released: Arc::new(AtomicBool::new(true)),
                    hub: Arc::clone(&self.inner),
                    session_id: session_id.to_owned(),
                },
            };
        };

        let session_hub = self.get_or_create_session(session_id, &stdout_path).await;
        // Subscribe to live events *before* running replay, so nothing is missed.
        let mut live_rx = session_hub.live_tx.subscribe();
        session_hub.listener_count.fetch_add(1, Ordering::SeqCst);

        let forward_cancel = CancellationToken::new();
        let session_id_owned = session_id.to_owned();
        let session_manager = Arc::clone(&self.inner.session_manager);
        let path = stdout_path.clone();
        let forward_tx = tx.clone();
        let cancel_for_task = forward_cancel.clone();

        tokio::spawn(async move {
            let session_info = session_manager.load_session_info(&session_id_owned).await;
            match replay_history(&path, session_info) {
                Ok(outcome) => {
                    if let Some(info) = session_info {
                        if outcome.new_last_clear_offset > info.last_clear_offset {
                            let _ = session_manager
                                .save_session_info(
                                    &session_id_owned,
                                    SessionInfo { last_clear_offset: outcome.new_last_clear_offset },
                                )
                                .await;
                        }
                    }

                    if let Some(header) = outcome.header {
                        if forward_tx.send(HubEvent::Header(header)).await.is_err() {
                            return;
                        }
                    }
                    for event in outcome.events {
                        let is_exit = matches!(event, ReplayedEvent::Exit(_));
                        let mapped = match event {
                            ReplayedEvent::Output(data) => HubEvent::Output { live: false, data },
                            ReplayedEvent::Resize(cols, rows) => HubEvent::Resize { live: false, cols, rows },
                            ReplayedEvent::Exit(code) => HubEvent::Exit { code },
                        };
                        if forward_tx.send(mapped).await.is_err() {
                            return;
                        }
                        // A terminated session has nothing further to replay or live-tail.
                        if is_exit {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = forward_tx.send(HubEvent::Error { message: e.message().to_owned() }).await;
                    // Transient history-read failure: the live feed may still work.
                }
            }

            // Drain whatever the live broadcast channel queued while replay ran,
            // then keep forwarding until cancelled or the listener disconnects.
            loop {
                tokio::select! {
                    _ = cancel_for_task.cancelled() => return,
                    recv = live_rx.recv() => match recv {
                        Ok(event) => {
                            let is_exit = matches!(event, HubEvent::Exit { .. });
                            if forward_tx.send(event).await.is_err() {
                                return;
                            }
                            if is_exit {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let _ = forward_tx
                                .send(HubEvent::Error { message: "listener lagged behind live stream".to_owned() })
                                .await;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        CastSubscription {
            rx,
            handle: UnsubscribeHandle {
                forward_cancel,
                released: Arc::new(AtomicBool::new(false)),
                hub: Arc::clone(&self.inner),
                session_id: session_id.to_owned(),
            },
        }
    }

    async fn get_or_create_session(&self, session_id: &str, path: &Path) -> Arc<SessionHub> {
        if let Some(existing) = self.inner.sessions.read().await.get(session_id) {
            return Arc::clone(existing);
        }

        let mut sessions = self.inner.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            return Arc::clone(existing);
        }

        let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let tail_cancel = CancellationToken::new();
        let session_hub =
            Arc::new(SessionHub { live_tx: live_tx.clone(), listener_count: AtomicUsize::new(0), tail_cancel: tail_cancel.clone() });

        spawn_live_tail(path.to_path_buf(), live_tx, tail_cancel);

        sessions.insert(session_id.to_owned(), Arc::clone(&session_hub));
        session_hub
    }

    async fn release_listener(&self, session_id: &str) {
        let mut sessions = self.inner.sessions.write().await;
        let Some(session_hub) = sessions.get(session_id) else { return };
        let remaining = session_hub.listener_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            session_hub.tail_cancel.cancel();
            sessions.remove(session_id);
        }
    }
}

/// Live-tail a session's cast log: the remainder of the file from its current
/// size onward is fed through the codec and broadcast to all subscribers.
fn spawn_live_tail(path: std::path::PathBuf, live_tx: broadcast::Sender<HubEvent>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let start_offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let reader = TailReader::with_offset(path, start_offset);
        let (tail_tx, mut tail_rx) = mpsc::channel(64);

        let reader_cancel = cancel.clone();
        tokio::spawn(reader.run(tail_tx, reader_cancel));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = tail_rx.recv() => match event {
                    Some(TailEvent::Lines(lines)) => {
                        for line in lines {
                            if let Some(event) = map_live_line(&line) {
                                let _ = live_tx.send(event);
                            }
                        }
                    }
                    Some(TailEvent::Fatal(message)) => {
                        let _ = live_tx.send(HubEvent::Error { message });
                        return;
                    }
                    None => return,
                }
            }
        }
    });
}

fn map_live_line(line: &str) -> Option<HubEvent> {
    match codec::parse_line(line) {
        // Header lines during live follow are dropped: a subscriber already got one.
        CastEvent::Header(_) | CastEvent::Input { .. } => None,
        CastEvent::Output { data, .. } => Some(HubEvent::Output { live: true, data }),
        CastEvent::Resize { cols, rows, .. } => Some(HubEvent::Resize { live: true, cols, rows }),
        CastEvent::Exit { code, .. } => Some(HubEvent::Exit { code }),
        CastEvent::Unknown => Some(HubEvent::Output { live: true, data: line.to_owned() }),
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
