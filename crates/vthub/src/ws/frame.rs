// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket v3 Frame Codec (§4.4): the binary wire layout shared by the
//! inbound client hub and the outbound remote-federation bridge.
//!
//! Layout: `u8 messageType, u16 BE sessionIdLen, N bytes sessionId, payload`.
//! The codec only knows the envelope; per-type payload shapes are decoded by
//! the small helpers below and consumed by `ws::hub`/`ws::remote`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CoreError;

pub mod message_type {
    pub const PING: u8 = 1;
    pub const PONG: u8 = 2;
    pub const SUBSCRIBE: u8 = 10;
    pub const UNSUBSCRIBE: u8 = 11;
    pub const WELCOME: u8 = 12;
    pub const STDOUT: u8 = 20;
    pub const SNAPSHOT_VT: u8 = 21;
    pub const EVENT: u8 = 30;
    pub const ERROR: u8 = 31;
    pub const INPUT_TEXT: u8 = 40;
    pub const INPUT_KEY: u8 = 41;
    pub const RESIZE: u8 = 42;
    pub const KILL: u8 = 43;
    pub const RESET_SIZE: u8 = 44;
}

/// SUBSCRIBE payload bitmask (§4.4).
pub mod subscribe_flags {
    pub const STDOUT: u32 = 1;
    pub const SNAPSHOTS: u32 = 2;
    pub const EVENTS: u32 = 4;
}

/// One decoded frame: its type byte, target session id (empty for the global
/// channel), and raw payload. Per-type payload parsing is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u8,
    pub session_id: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u8, session_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { message_type, session_id: session_id.into(), payload: payload.into() }
    }

    pub fn global(message_type: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(message_type, "", payload)
    }

    pub fn encode(&self) -> Bytes {
        let session_id_bytes = self.session_id.as_bytes();
        let mut buf = BytesMut::with_capacity(1 + 2 + session_id_bytes.len() + self.payload.len());
        buf.put_u8(self.message_type);
        buf.put_u16(session_id_bytes.len() as u16);
        buf.put_slice(session_id_bytes);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, CoreError> {
        if bytes.len() < 3 {
            return Err(CoreError::protocol("frame shorter than the 3-byte envelope header"));
        }
        let message_type = bytes.get_u8();
        let session_id_len = bytes.get_u16() as usize;
        if bytes.remaining() < session_id_len {
            return Err(CoreError::protocol("sessionId length exceeds remaining frame bytes"));
        }
        let session_id_bytes = bytes.split_to(session_id_len);
        let session_id = String::from_utf8(session_id_bytes.to_vec())
            .map_err(|_| CoreError::protocol("sessionId is not valid UTF-8"))?;
        Ok(Self { message_type, session_id, payload: bytes })
    }
}

/// Encode a SUBSCRIBE payload: `u32 BE` flag bitmask.
pub fn encode_subscribe_payload(flags: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(flags);
    buf.freeze()
}

/// Decode a SUBSCRIBE payload's flag bitmask.
pub fn decode_subscribe_payload(payload: &[u8]) -> Result<u32, CoreError> {
    if payload.len() != 4 {
        return Err(CoreError::protocol("SUBSCRIBE payload must be exactly 4 bytes"));
    }
    let mut buf = payload;
    Ok(buf.get_u32())
}

/// Encode a RESIZE payload: `u16 cols, u16 rows`, both BE.
pub fn encode_resize_payload(cols: u16, rows: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16(cols);
    buf.put_u16(rows);
    buf.freeze()
}

/// Decode a RESIZE payload.
pub fn decode_resize_payload(payload: &[u8]) -> Result<(u16, u16), CoreError> {
    if payload.len() != 4 {
        return Err(CoreError::protocol("RESIZE payload must be exactly 4 bytes"));
    }
    let mut buf = payload;
    Ok((buf.get_u16(), buf.get_u16()))
}

const DEFAULT_KILL_SIGNAL: &str = "SIGTERM";

/// Decode a KILL payload: a UTF-8 signal name, defaulting to SIGTERM when empty.
pub fn decode_kill_payload(payload: &[u8]) -> Result<String, CoreError> {
    if payload.is_empty() {
        return Ok(DEFAULT_KILL_SIGNAL.to_owned());
    }
    std::str::from_utf8(payload).map(str::to_owned).map_err(|_| CoreError::protocol("KILL payload is not valid UTF-8"))
}

pub fn encode_kill_payload(signal: &str) -> Bytes {
    Bytes::copy_from_slice(signal.as_bytes())
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
