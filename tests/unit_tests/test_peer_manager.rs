// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::Result;
use soulseek_client_rs::{
    cfg::config::{ConnectionOptions, PeerConfig},
    client::{peer_manager::PeerConnectionManager, waiter::Waiter},
    models::{codes::InitCode, init::PeerInit},
};
use tokio::{net::TcpListener, time::sleep};
use tokio_util::sync::CancellationToken;

fn opts() -> ConnectionOptions {
    ConnectionOptions {
        buffer_size: 4096,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(5),
    }
}

fn manager(limit: u32) -> Arc<PeerConnectionManager> {
    let waiter = Arc::new(Waiter::new(Duration::from_secs(5)));
    let mgr = PeerConnectionManager::new(
        PeerConfig {
            concurrent_message_connections: limit,
        },
        opts(),
        waiter,
    );
    mgr.attach_self();
    mgr.set_local_username("me");
    mgr
}

/// Accepts peer connections and checks each opens with a "P" PeerInit.
async fn fake_peer() -> Result<(TcpListener, std::net::SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

async fn accept_and_check_init(listener: &TcpListener) -> Result<PeerInit> {
    let (mut stream, _) = listener.accept().await?;
    let msg = crate::unit_tests::read_frame(&mut stream).await?;
    assert_eq!(msg.code, u32::from(InitCode::PeerInit));
    let init = PeerInit::from_message(&msg)?;
    // Park the socket so the connection stays alive for the test body.
    tokio::spawn(async move {
        let _stream = stream;
        sleep(Duration::from_secs(5)).await;
    });
    Ok(init)
}

#[tokio::test]
async fn test_get_or_add_pools_one_connection_per_key() -> Result<()> {
    let (listener, addr) = fake_peer().await?;
    let checker = tokio::spawn(async move { accept_and_check_init(&listener).await });

    let mgr = manager(10);
    let cancel = CancellationToken::new();
    let ip = Ipv4Addr::new(127, 0, 0, 1);

    let first = mgr
        .get_or_add_message_connection("alice", ip, addr.port(), &cancel)
        .await?;
    let second = mgr
        .get_or_add_message_connection("alice", ip, addr.port(), &cancel)
        .await?;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(mgr.len(), 1);

    let init = checker.await??;
    assert_eq!(init.username, "me");
    assert_eq!(init.kind, soulseek_client_rs::models::codes::ConnectionKind::Peer);
    Ok(())
}

#[tokio::test]
async fn test_find_by_username() -> Result<()> {
    let (listener, addr) = fake_peer().await?;
    tokio::spawn(async move { accept_and_check_init(&listener).await });

    let mgr = manager(10);
    let cancel = CancellationToken::new();
    mgr.get_or_add_message_connection(
        "bob",
        Ipv4Addr::new(127, 0, 0, 1),
        addr.port(),
        &cancel,
    )
    .await?;

    assert!(mgr.find_by_username("bob").is_some());
    assert!(mgr.find_by_username("nobody").is_none());
    Ok(())
}

#[tokio::test]
async fn test_capacity_evicts_least_recently_used() -> Result<()> {
    let (listener_a, addr_a) = fake_peer().await?;
    let (listener_b, addr_b) = fake_peer().await?;
    tokio::spawn(async move {
        let _ = accept_and_check_init(&listener_a).await;
    });
    tokio::spawn(async move {
        let _ = accept_and_check_init(&listener_b).await;
    });

    let mgr = manager(1);
    let cancel = CancellationToken::new();
    let ip = Ipv4Addr::new(127, 0, 0, 1);

    let first = mgr
        .get_or_add_message_connection("alice", ip, addr_a.port(), &cancel)
        .await?;
    assert_eq!(mgr.len(), 1);

    mgr.get_or_add_message_connection("carol", ip, addr_b.port(), &cancel)
        .await?;

    // The older entry was disconnected to make room.
    assert!(!first.is_connected());
    sleep(Duration::from_millis(100)).await;
    assert_eq!(mgr.len(), 1);
    assert!(mgr.find_by_username("alice").is_none());
    assert!(mgr.find_by_username("carol").is_some());
    Ok(())
}

#[tokio::test]
async fn test_dead_entries_are_replaced() -> Result<()> {
    let (listener, addr) = fake_peer().await?;
    tokio::spawn(async move {
        let _ = accept_and_check_init(&listener).await;
        let _ = accept_and_check_init(&listener).await;
    });

    let mgr = manager(10);
    let cancel = CancellationToken::new();
    let ip = Ipv4Addr::new(127, 0, 0, 1);

    let first = mgr
        .get_or_add_message_connection("dave", ip, addr.port(), &cancel)
        .await?;
    first.disconnect("simulated failure").await;
    sleep(Duration::from_millis(50)).await;

    let second = mgr
        .get_or_add_message_connection("dave", ip, addr.port(), &cancel)
        .await?;
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_connected());
    assert_eq!(mgr.len(), 1);
    Ok(())
}
