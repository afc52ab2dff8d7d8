// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[tokio::test]
async fn frames_are_delivered_in_fifo_order() {
    let mux = OutboundMux::new(1024);
    mux.send_other(bytes("a")).await;
    mux.send_other(bytes("b")).await;

    let Outgoing::Frame(first) = mux.recv().await else { panic!("expected frame") };
    let Outgoing::Frame(second) = mux.recv().await else { panic!("expected frame") };
    assert_eq!(&first[..], b"a");
    assert_eq!(&second[..], b"b");
}

#[tokio::test]
async fn snapshot_for_the_same_session_coalesces_to_the_latest() {
    let mux = OutboundMux::new(1024);
    mux.send_other(bytes("before")).await;
    mux.send_snapshot("s1", bytes("stale")).await;
    mux.send_snapshot("s1", bytes("fresh")).await;
    mux.send_other(bytes("after")).await;

    let Outgoing::Frame(first) = mux.recv().await else { panic!("expected frame") };
    assert_eq!(&first[..], b"before");
    let Outgoing::Frame(snapshot) = mux.recv().await else { panic!("expected frame") };
    assert_eq!(&snapshot[..], b"fresh", "only the latest pending snapshot is kept");
    let Outgoing::Frame(last) = mux.recv().await else { panic!("expected frame") };
    assert_eq!(&last[..], b"after");
}

#[tokio::test]
async fn snapshots_for_different_sessions_are_independent() {
    let mux = OutboundMux::new(1024);
    mux.send_snapshot("s1", bytes("one")).await;
    mux.send_snapshot("s2", bytes("two")).await;

    let Outgoing::Frame(first) = mux.recv().await else { panic!("expected frame") };
    let Outgoing::Frame(second) = mux.recv().await else { panic!("expected frame") };
    assert_eq!(&first[..], b"one");
    assert_eq!(&second[..], b"two");
}

#[tokio::test]
async fn stdout_within_the_byte_limit_is_queued_normally() {
    let mux = OutboundMux::new(10);
    mux.send_stdout(bytes("abcde")).await;
    assert!(!mux.is_closed().await);

    let Outgoing::Frame(frame) = mux.recv().await else { panic!("expected frame") };
    assert_eq!(&frame[..], b"abcde");
}

#[tokio::test]
async fn stdout_past_the_byte_limit_latches_closed_and_drops_the_backlog() {
    let mux = OutboundMux::new(10);
    mux.send_other(bytes("queued-before-overflow")).await;
    mux.send_stdout(bytes("0123456789")).await;
    assert!(!mux.is_closed().await);

    // This push exceeds the 10-byte limit and must close rather than queue.
    mux.send_stdout(bytes("x")).await;
    assert!(mux.is_closed().await);

    match mux.recv().await {
        Outgoing::Close(CloseReason::StdoutOverflow) => {}
        Outgoing::Frame(_) => panic!("overflow must discard the backlog, not drain it"),
    }
}

#[tokio::test]
async fn sends_after_close_are_silently_ignored() {
    let mux = OutboundMux::new(1);
    mux.send_stdout(bytes("xx")).await;
    assert!(mux.is_closed().await);

    mux.send_other(bytes("late")).await;
    mux.send_snapshot("s1", bytes("late-snapshot")).await;

    match mux.recv().await {
        Outgoing::Close(CloseReason::StdoutOverflow) => {}
        Outgoing::Frame(_) => panic!("no frame should be queued after close"),
    }
}
