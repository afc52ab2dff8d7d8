// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Axum upgrade glue for the v3 WebSocket endpoint.
//!
//! Unlike the v2 downstream handler, which resolves a session (and its
//! subscription flags) from the upgrade request itself, v3 clients choose
//! sessions and flags after connecting via SUBSCRIBE frames. The upgrade
//! handler here has nothing to validate or look up; it just hands the socket
//! to [`crate::ws::hub::handle_socket`]. Caller authentication is out of
//! scope for this boundary.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;

use crate::ws::hub::Hub;

/// `GET /ws` — WebSocket upgrade for the v3 protocol.
pub async fn ws_handler(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::ws::hub::handle_socket(hub, socket))
}
