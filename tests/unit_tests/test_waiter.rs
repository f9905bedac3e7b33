// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use soulseek_client_rs::{
    client::waiter::{WaitKey, Waiter},
    error::WaiterError,
    models::codes::ServerCode,
};
use tokio_util::sync::CancellationToken;

fn key() -> WaitKey {
    WaitKey::ServerReply(ServerCode::RoomList)
}

fn user_key(username: &str) -> WaitKey {
    WaitKey::ServerUser {
        code: ServerCode::GetPeerAddress,
        username: username.to_string(),
    }
}

#[tokio::test]
async fn test_complete_resolves_wait() -> Result<()> {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let wait = waiter.wait::<u32>(key(), None, &cancel);
    assert!(waiter.complete(&key(), 7u32));
    assert_eq!(wait.await?, 7);
    assert_eq!(waiter.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn test_fifo_min_n_m_semantics() -> Result<()> {
    let waiter = Arc::new(Waiter::new(Duration::from_millis(400)));
    let cancel = CancellationToken::new();

    // N = 3 concurrent waits, M = 2 completions: the two oldest resolve in
    // FIFO order, the third times out at its deadline.
    let w1 = waiter.wait::<u32>(key(), None, &cancel);
    let w2 = waiter.wait::<u32>(key(), None, &cancel);
    let w3 = waiter.wait::<u32>(key(), None, &cancel);
    assert_eq!(waiter.pending(), 3);

    assert!(waiter.complete(&key(), 1u32));
    assert!(waiter.complete(&key(), 2u32));

    assert_eq!(w1.await?, 1);
    assert_eq!(w2.await?, 2);
    assert_eq!(w3.await.unwrap_err(), WaiterError::TimedOut);
    assert_eq!(waiter.pending(), 0);
    Ok(())
}

#[tokio::test]
async fn test_complete_all() -> Result<()> {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let w1 = waiter.wait::<&'static str>(key(), None, &cancel);
    let w2 = waiter.wait::<&'static str>(key(), None, &cancel);
    assert_eq!(waiter.complete_all(&key(), "done"), 2);
    assert_eq!(w1.await?, "done");
    assert_eq!(w2.await?, "done");
    Ok(())
}

#[tokio::test]
async fn test_type_mismatch() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let wait = waiter.wait::<u32>(key(), None, &cancel);
    assert!(waiter.complete(&key(), "wrong type".to_string()));
    assert_eq!(wait.await.unwrap_err(), WaiterError::TypeMismatch);
}

#[tokio::test]
async fn test_cancellation_token_resolves_promptly() {
    let waiter = Waiter::new(Duration::from_secs(60));
    let cancel = CancellationToken::new();

    let wait = waiter.wait::<u32>(key(), None, &cancel);
    cancel.cancel();
    assert_eq!(wait.await.unwrap_err(), WaiterError::Cancelled);
    assert_eq!(waiter.pending(), 0);
}

#[tokio::test]
async fn test_throw_propagates_error() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let wait = waiter.wait::<u32>(key(), None, &cancel);
    assert!(waiter.throw(&key(), WaiterError::Disconnected));
    assert_eq!(wait.await.unwrap_err(), WaiterError::Disconnected);
}

#[tokio::test]
async fn test_cancel_all_fails_every_wait() {
    let waiter = Waiter::new(Duration::from_secs(60));
    let cancel = CancellationToken::new();

    let w1 = waiter.wait::<u32>(key(), None, &cancel);
    let w2 = waiter.wait::<u32>(user_key("a"), None, &cancel);
    waiter.cancel_all();
    assert_eq!(w1.await.unwrap_err(), WaiterError::Cancelled);
    assert_eq!(w2.await.unwrap_err(), WaiterError::Cancelled);
}

#[tokio::test]
async fn test_disconnect_user_scopes_by_username() {
    let waiter = Waiter::new(Duration::from_millis(300));
    let cancel = CancellationToken::new();

    let gone = waiter.wait::<u32>(user_key("gone"), None, &cancel);
    let kept = waiter.wait::<u32>(user_key("kept"), None, &cancel);
    waiter.disconnect_user("gone");

    assert_eq!(gone.await.unwrap_err(), WaiterError::Disconnected);
    // Unrelated wait is untouched until its own deadline.
    assert_eq!(kept.await.unwrap_err(), WaiterError::TimedOut);
}

#[tokio::test]
async fn test_completion_received_even_before_first_poll() -> Result<()> {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    // The slot is registered when `wait` is CALLED, not when first polled.
    let wait = waiter.wait::<u32>(key(), None, &cancel);
    assert_eq!(waiter.pending(), 1);
    assert!(waiter.complete(&key(), 5u32));
    assert_eq!(wait.await?, 5);
    Ok(())
}

#[tokio::test]
async fn test_find_key_by_token() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();
    let registered = WaitKey::IndirectTransfer {
        username: "u".to_string(),
        filename: "f.mp3".to_string(),
        token: 9,
    };
    let _wait = waiter.wait::<u32>(registered.clone(), None, &cancel);

    let found = waiter.find_key(|k| matches!(k, WaitKey::IndirectTransfer { token: 9, .. }));
    assert_eq!(found, Some(registered));
    assert!(waiter.find_key(|k| matches!(k, WaitKey::IndirectConnect { .. })).is_none());
}
