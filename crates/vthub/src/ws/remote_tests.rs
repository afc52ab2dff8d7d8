// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;
use crate::ws::frame::{subscribe_flags, Frame};
use crate::ws::outbound::Outgoing;

async fn next_frame(outbound: &OutboundMux) -> Frame {
    let outgoing = tokio::time::timeout(Duration::from_secs(3), outbound.recv()).await.expect("frame timeout");
    match outgoing {
        Outgoing::Frame(bytes) => Frame::decode(bytes).expect("valid frame"),
        Outgoing::Close(reason) => panic!("expected a frame, mux closed instead: {reason:?}"),
    }
}

async fn no_frame(outbound: &OutboundMux) {
    let outcome = tokio::time::timeout(Duration::from_millis(100), outbound.recv()).await;
    assert!(outcome.is_err(), "expected no frame to be delivered");
}

fn test_link() -> (RemoteLink, mpsc::UnboundedReceiver<Bytes>) {
    RemoteLink::new("hq", "http://hq.example:4020", "tok", Duration::from_secs(1))
}

#[tokio::test]
async fn subscribe_flags_aggregate_across_clients_by_oring() {
    let (link, mut outbound_rx) = test_link();

    link.update_subscription("s1", 1, subscribe_flags::STDOUT).await;
    let sent = Frame::decode(outbound_rx.recv().await.expect("frame sent")).unwrap();
    assert_eq!(sent.message_type, message_type::SUBSCRIBE);
    assert_eq!(frame::decode_subscribe_payload(&sent.payload).unwrap(), subscribe_flags::STDOUT);

    link.update_subscription("s1", 2, subscribe_flags::SNAPSHOTS).await;
    let sent = Frame::decode(outbound_rx.recv().await.expect("frame sent")).unwrap();
    assert_eq!(sent.message_type, message_type::SUBSCRIBE);
    assert_eq!(
        frame::decode_subscribe_payload(&sent.payload).unwrap(),
        subscribe_flags::STDOUT | subscribe_flags::SNAPSHOTS
    );

    // A third client re-requesting a flag already covered by the aggregate
    // does not change it, so nothing new is sent upstream.
    link.update_subscription("s1", 3, subscribe_flags::STDOUT).await;
    assert!(outbound_rx.try_recv().is_err());
}

#[tokio::test]
async fn removing_the_last_client_unsubscribes_upstream() {
    let (link, mut outbound_rx) = test_link();

    link.update_subscription("s1", 1, subscribe_flags::STDOUT).await;
    let _ = outbound_rx.recv().await.expect("initial subscribe");

    link.remove_client_from_session("s1", 1).await;
    let sent = Frame::decode(outbound_rx.recv().await.expect("frame sent")).unwrap();
    assert_eq!(sent.message_type, message_type::UNSUBSCRIBE);
}

#[tokio::test]
async fn stdout_from_a_remote_only_reaches_clients_with_the_stdout_flag() {
    let (link, _outbound_rx) = test_link();
    let link = Arc::new(link);

    let stdout_only = Arc::new(OutboundMux::new(4096));
    let snapshots_only = Arc::new(OutboundMux::new(4096));
    link.register_downstream(1, Arc::clone(&stdout_only)).await;
    link.register_downstream(2, Arc::clone(&snapshots_only)).await;
    link.update_subscription("s1", 1, subscribe_flags::STDOUT).await;
    link.update_subscription("s1", 2, subscribe_flags::SNAPSHOTS).await;

    let frame = Frame::new(message_type::STDOUT, "s1", Bytes::from_static(b"hello"));
    route_inbound(&link, frame.encode()).await;

    let delivered = next_frame(&stdout_only).await;
    assert_eq!(delivered.message_type, message_type::STDOUT);
    no_frame(&snapshots_only).await;
}

#[tokio::test]
async fn error_frames_are_exempt_from_the_flag_filter_but_not_from_session_membership() {
    let (link, _outbound_rx) = test_link();
    let link = Arc::new(link);

    // Client 1 is subscribed to "s1" (STDOUT only — ERROR must still reach it
    // despite not carrying the STDOUT flag, since ERROR skips the flag check).
    let member = Arc::new(OutboundMux::new(4096));
    link.register_downstream(1, Arc::clone(&member)).await;
    link.update_subscription("s1", 1, subscribe_flags::STDOUT).await;

    // Client 2 is registered as a downstream of this remote (e.g. subscribed
    // to a different session) but never joined "s1" — it must not receive
    // ERROR frames scoped to a session it has no membership in.
    let non_member = Arc::new(OutboundMux::new(4096));
    link.register_downstream(2, Arc::clone(&non_member)).await;

    let error = Frame::new(message_type::ERROR, "s1", Bytes::from_static(b"{\"message\":\"boom\"}"));
    route_inbound(&link, error.encode()).await;

    let delivered = next_frame(&member).await;
    assert_eq!(delivered.message_type, message_type::ERROR);
    no_frame(&non_member).await;
}

#[tokio::test]
async fn error_for_an_entirely_unknown_session_reaches_nobody() {
    let (link, _outbound_rx) = test_link();
    let link = Arc::new(link);

    let client = Arc::new(OutboundMux::new(4096));
    link.register_downstream(1, Arc::clone(&client)).await;
    // client 1 never subscribed to any session on this remote.

    let error = Frame::new(message_type::ERROR, "unrelated-session", Bytes::from_static(b"{}"));
    route_inbound(&link, error.encode()).await;

    no_frame(&client).await;
}

/// Scenario 6 (upstream aggregation): two local clients subscribe to the same
/// remotely-hosted session with different flag sets; a single inbound STDOUT
/// frame from the remote fans out only to the client that asked for it, while
/// an inbound ERROR reaches every client actually joined to that session.
#[tokio::test]
async fn scenario_upstream_aggregation_fans_out_per_client_subscription() {
    let (link, mut outbound_rx) = test_link();
    let link = Arc::new(link);

    let viewer = Arc::new(OutboundMux::new(4096));
    let watcher = Arc::new(OutboundMux::new(4096));
    link.register_downstream(10, Arc::clone(&viewer)).await;
    link.register_downstream(11, Arc::clone(&watcher)).await;

    link.update_subscription("shared-session", 10, subscribe_flags::STDOUT).await;
    link.update_subscription("shared-session", 11, subscribe_flags::EVENTS).await;

    // Aggregate sent upstream should OR both clients' flags together.
    let mut last = None;
    while let Ok(bytes) = outbound_rx.try_recv() {
        last = Some(Frame::decode(bytes).unwrap());
    }
    let aggregate = last.expect("at least one subscribe sent");
    assert_eq!(
        frame::decode_subscribe_payload(&aggregate.payload).unwrap(),
        subscribe_flags::STDOUT | subscribe_flags::EVENTS
    );

    let stdout = Frame::new(message_type::STDOUT, "shared-session", Bytes::from_static(b"output"));
    route_inbound(&link, stdout.encode()).await;
    let delivered = next_frame(&viewer).await;
    assert_eq!(&delivered.payload[..], b"output");
    no_frame(&watcher).await;

    let event = Frame::new(message_type::EVENT, "shared-session", Bytes::from_static(b"{\"type\":\"bell\"}"));
    route_inbound(&link, event.encode()).await;
    no_frame(&viewer).await;
    let delivered = next_frame(&watcher).await;
    assert_eq!(delivered.message_type, message_type::EVENT);
}

#[test]
fn to_ws_url_swaps_http_schemes_for_websocket_schemes_and_adds_the_path() {
    assert_eq!(to_ws_url("https://hq.example:4020"), "wss://hq.example:4020/ws");
    assert_eq!(to_ws_url("http://hq.example:4020/"), "ws://hq.example:4020/ws");
}

#[test]
fn host_of_extracts_the_authority_from_a_ws_url() {
    assert_eq!(host_of("wss://hq.example:4020/ws"), "hq.example:4020");
    assert_eq!(host_of("ws://hq.example/ws"), "hq.example");
}

#[tokio::test]
async fn reconnecting_resends_every_nonzero_aggregate_as_a_burst() {
    let (link, _outbound_rx) = test_link();

    link.update_subscription("s1", 1, subscribe_flags::STDOUT).await;
    link.update_subscription("s2", 2, subscribe_flags::SNAPSHOTS).await;
    link.remove_client_from_session("s2", 2).await;

    let sent = link.state.sent_flags.read().await;
    assert_eq!(sent.get("s1").copied(), Some(subscribe_flags::STDOUT));
    assert_eq!(sent.get("s2").copied(), Some(0));
    // The reconnect burst in `run_remote_link` resends every session whose
    // last-sent aggregate is nonzero, i.e. just "s1" here.
    let nonzero: Vec<_> = sent.iter().filter(|(_, f)| **f != 0).map(|(k, _)| k.clone()).collect();
    assert_eq!(nonzero, vec!["s1".to_owned()]);
}
