// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cast-Event Codec (§4.1): parses one append-only cast-log line at a time,
//! and scans Output bytes for ANSI prune sequences that bound history replay.

use serde_json::Value;

/// Known ANSI sequences whose effect is to clear visible terminal state.
/// The content preceding one in the cast log is no longer needed by a fresh viewer.
const PRUNE_SEQUENCES: &[&str] = &[
    "\u{1b}[3J",
    "\u{1b}c",
    "\u{1b}[2J",
    "\u{1b}[H\u{1b}[J",
    "\u{1b}[H\u{1b}[2J",
    "\u{1b}[?1049h",
    "\u{1b}[?1049l",
    "\u{1b}[?47h",
    "\u{1b}[?47l",
];

/// One decoded cast-log line.
#[derive(Debug, Clone, PartialEq)]
pub enum CastEvent {
    Header(Value),
    Output { time: f64, data: String },
    Input { time: f64, data: String },
    Resize { time: f64, cols: u16, rows: u16 },
    Exit { code: i32, session_id: String },
    /// Failed to parse or didn't match a known shape. Never thrown, only returned.
    Unknown,
}

/// Parse one line (without its trailing newline). Malformed lines classify as `Unknown`.
pub fn parse_line(line: &str) -> CastEvent {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return CastEvent::Unknown;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => return CastEvent::Unknown,
    };

    // Header: a JSON object (not an array).
    if value.is_object() {
        return CastEvent::Header(value);
    }

    let Some(array) = value.as_array() else {
        return CastEvent::Unknown;
    };

    // Exit: ["exit", code, sessionId]
    if array.len() == 3 && array[0].as_str() == Some("exit") {
        let (Some(code), Some(session_id)) = (array[1].as_i64(), array[2].as_str()) else {
            return CastEvent::Unknown;
        };
        return CastEvent::Exit { code: code as i32, session_id: session_id.to_owned() };
    }

    // Output/Input/Resize: [t, kind, data]
    if array.len() == 3 {
        let (Some(time), Some(kind), Some(data)) =
            (array[0].as_f64(), array[1].as_str(), array[2].as_str())
        else {
            return CastEvent::Unknown;
        };

        return match kind {
            "o" => CastEvent::Output { time, data: data.to_owned() },
            "i" => CastEvent::Input { time, data: data.to_owned() },
            "r" => match parse_resize(data) {
                Some((cols, rows)) => CastEvent::Resize { time, cols, rows },
                None => CastEvent::Unknown,
            },
            _ => CastEvent::Unknown,
        };
    }

    CastEvent::Unknown
}

fn parse_resize(data: &str) -> Option<(u16, u16)> {
    let (cols, rows) = data.split_once('x')?;
    Some((cols.parse().ok()?, rows.parse().ok()?))
}

/// Fast substring-scan check for whether `data` contains any prune sequence,
/// meant to precede the more expensive `find_last_prune_point` scan (§9).
pub fn contains_pruning_sequence(data: &str) -> bool {
    PRUNE_SEQUENCES.iter().any(|seq| data.contains(seq))
}

/// The rightmost prune sequence found in `data`, and the byte offset into
/// `data` immediately *after* that sequence ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunePoint {
    pub sequence: &'static str,
    pub byte_offset_after: usize,
}

/// Scan for every known prune escape and return the rightmost hit, if any.
pub fn find_last_prune_point(data: &str) -> Option<PrunePoint> {
    if !contains_pruning_sequence(data) {
        return None;
    }

    let mut best: Option<PrunePoint> = None;
    for seq in PRUNE_SEQUENCES {
        if let Some(start) = data.rfind(seq) {
            let after = start + seq.len();
            let better = match best {
                Some(b) => after > b.byte_offset_after,
                None => true,
            };
            if better {
                best = Some(PrunePoint { sequence: seq, byte_offset_after: after });
            }
        }
    }
    best
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
