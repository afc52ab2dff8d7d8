// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;

async fn next_event(rx: &mut broadcast::Receiver<OwnershipChanged>) -> OwnershipChanged {
    tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.expect("event timeout").expect("channel open")
}

#[tokio::test]
async fn claim_grants_ownership_and_emits_event() {
    let service = OwnershipService::new(Duration::from_secs(30), Duration::from_secs(5));
    let mut events = service.subscribe();

    service.claim("s1", 1, "").await;
    assert!(service.has_ownership("s1", 1).await);
    assert!(!service.has_ownership("s1", 2).await);

    let event = next_event(&mut events).await;
    assert_eq!(event.session_id, "s1");
    assert_eq!(event.new_owner, Some(1));
    assert_eq!(event.previous_owner, None);
}

#[tokio::test]
async fn second_claim_displaces_the_first_owner() {
    let service = OwnershipService::new(Duration::from_secs(30), Duration::from_secs(5));
    service.claim("s1", 1, "").await;
    let mut events = service.subscribe();

    service.claim("s1", 2, "hi").await;
    assert!(service.has_ownership("s1", 2).await);
    assert!(!service.has_ownership("s1", 1).await);

    let event = next_event(&mut events).await;
    assert_eq!(event.new_owner, Some(2));
    assert_eq!(event.previous_owner, Some(1));
    assert_eq!(event.pending_input, "hi");
}

#[tokio::test]
async fn repeated_claim_with_unchanged_owner_and_input_does_not_notify() {
    let service = OwnershipService::new(Duration::from_secs(30), Duration::from_secs(5));
    service.claim("s1", 1, "abc").await;
    let mut events = service.subscribe();

    service.claim("s1", 1, "abc").await;

    let result = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(result.is_err(), "unchanged claim should not notify");
}

#[tokio::test]
async fn update_pending_by_non_owner_is_treated_as_a_claim() {
    let service = OwnershipService::new(Duration::from_secs(30), Duration::from_secs(5));
    service.claim("s1", 1, "").await;
    let mut events = service.subscribe();

    service.update_pending("s1", 2, "typing").await;

    assert!(service.has_ownership("s1", 2).await);
    let event = next_event(&mut events).await;
    assert_eq!(event.new_owner, Some(2));
    assert_eq!(event.previous_owner, Some(1));
}

#[tokio::test]
async fn update_pending_by_owner_notifies_only_on_change() {
    let service = OwnershipService::new(Duration::from_secs(30), Duration::from_secs(5));
    service.claim("s1", 1, "a").await;
    let mut events = service.subscribe();

    service.update_pending("s1", 1, "a").await;
    let result = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(result.is_err(), "unchanged pending input should not notify");

    service.update_pending("s1", 1, "ab").await;
    let event = next_event(&mut events).await;
    assert_eq!(event.new_owner, Some(1));
    assert_eq!(event.previous_owner, Some(1));
    assert_eq!(event.pending_input, "ab");
}

#[tokio::test]
async fn release_is_a_no_op_for_a_non_owner() {
    let service = OwnershipService::new(Duration::from_secs(30), Duration::from_secs(5));
    service.claim("s1", 1, "").await;
    let mut events = service.subscribe();

    service.release("s1", 2).await;
    assert!(service.has_ownership("s1", 1).await);

    service.release("s1", 1).await;
    assert!(service.has_ownership("s1", 1).await, "no owner means anyone may write");
    let event = next_event(&mut events).await;
    assert_eq!(event.session_id, "s1");
    assert_eq!(event.new_owner, None);
    assert_eq!(event.previous_owner, Some(1));
}

#[tokio::test]
async fn release_all_for_client_clears_every_owned_session() {
    let service = OwnershipService::new(Duration::from_secs(30), Duration::from_secs(5));
    service.claim("s1", 1, "").await;
    service.claim("s2", 1, "").await;
    service.claim("s3", 2, "").await;

    service.release_all_for_client(1).await;

    assert!(service.has_ownership("s1", 1).await);
    assert!(service.has_ownership("s2", 1).await);
    assert!(!service.has_ownership("s3", 1).await);
    assert!(service.has_ownership("s3", 2).await);
}

#[tokio::test]
async fn update_pending_refreshes_activity_and_prevents_expiry() {
    let service = Arc::new(OwnershipService::new(Duration::from_millis(150), Duration::from_millis(30)));
    service.claim("s1", 1, "").await;
    let mut events = service.subscribe();
    let _ = next_event(&mut events).await; // drain Claimed

    let shutdown = CancellationToken::new();
    let sweeper_shutdown = shutdown.clone();
    let sweeper_service = Arc::clone(&service);
    let sweeper = tokio::spawn(async move { sweeper_service.run_sweeper(sweeper_shutdown).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    service.update_pending("s1", 1, "still typing").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(service.has_ownership("s1", 1).await);

    shutdown.cancel();
    let _ = sweeper.await;
}

#[tokio::test]
async fn idle_ownership_expires_via_the_periodic_sweep() {
    let service = Arc::new(OwnershipService::new(Duration::from_millis(100), Duration::from_millis(30)));
    service.claim("s1", 1, "").await;
    let mut events = service.subscribe();
    let _ = next_event(&mut events).await; // drain Claimed

    let shutdown = CancellationToken::new();
    let sweeper_shutdown = shutdown.clone();
    let sweeper_service = Arc::clone(&service);
    let sweeper = tokio::spawn(async move { sweeper_service.run_sweeper(sweeper_shutdown).await });

    let event = next_event(&mut events).await;
    assert_eq!(event.session_id, "s1");
    assert_eq!(event.new_owner, None);
    assert_eq!(event.previous_owner, Some(1));
    assert!(service.has_ownership("s1", 1).await, "no owner after expiry means anyone may write");

    shutdown.cancel();
    let _ = sweeper.await;
}
