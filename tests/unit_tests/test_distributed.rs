// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use soulseek_client_rs::{
    cfg::config::{ConnectionOptions, DistributedConfig},
    client::{
        connection::{Connection, ConnectionRole},
        distributed_manager::DistributedConnectionManager,
        message_connection::MessageConnection,
        waiter::Waiter,
    },
    models::{
        codes::{ConnectionKind, DistributedCode},
        distributed::{DistributedBranchLevel, DistributedBranchRoot, DistributedSearchRequest},
        init::PeerInit,
    },
};
use tokio::{net::TcpStream, time::sleep};
use tokio_util::sync::CancellationToken;

fn opts() -> ConnectionOptions {
    ConnectionOptions {
        buffer_size: 4096,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(10),
    }
}

fn manager() -> Arc<DistributedConnectionManager> {
    let waiter = Arc::new(Waiter::new(Duration::from_secs(5)));
    let mgr = DistributedConnectionManager::new(
        DistributedConfig {
            accept_children: true,
            child_limit: 25,
            deduplicate_search_requests: true,
        },
        opts(),
        waiter,
    );
    mgr.attach_self();
    mgr.set_local_username("me");
    mgr
}

/// Attach a fake child over a real socket pair; returns the child's end.
async fn attach_child(
    mgr: &Arc<DistributedConnectionManager>,
    name: &str,
) -> Result<TcpStream> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        stream
    });

    let conn = Connection::new("127.0.0.1", addr.port(), opts());
    let cancel = CancellationToken::new();
    conn.connect(&cancel).await?;
    let mc = MessageConnection::new(conn, ConnectionRole::Distributed);

    let init = PeerInit::new(name, ConnectionKind::Distributed, 1);
    mgr.add_child_from_init(&init, mc).await?;
    Ok(accept.await?)
}

#[tokio::test]
async fn test_new_child_receives_level_then_root() -> Result<()> {
    let mgr = manager();
    let mut child = attach_child(&mgr, "kid").await?;
    assert_eq!(mgr.child_count(), 1);

    let level = crate::unit_tests::read_frame(&mut child).await?;
    assert_eq!(level.code, u32::from(DistributedCode::BranchLevel));
    assert_eq!(DistributedBranchLevel::from_message(&level)?.level, 0);

    let root = crate::unit_tests::read_frame(&mut child).await?;
    assert_eq!(root.code, u32::from(DistributedCode::BranchRoot));
    assert_eq!(DistributedBranchRoot::from_message(&root)?.root, "me");
    Ok(())
}

#[tokio::test]
async fn test_branch_level_update_reaches_every_child_next() -> Result<()> {
    let mgr = manager();
    let mut child_a = attach_child(&mgr, "a").await?;
    let mut child_b = attach_child(&mgr, "b").await?;

    // Consume each child's handshake pair.
    for child in [&mut child_a, &mut child_b] {
        crate::unit_tests::read_frame(child).await?;
        crate::unit_tests::read_frame(child).await?;
    }

    // Parent announces level 3: our level becomes 4 and every child hears
    // BranchLevel(4) before anything else.
    mgr.set_branch_level(3).await;
    assert_eq!(mgr.branch_level(), 4);

    for child in [&mut child_a, &mut child_b] {
        let next = crate::unit_tests::read_frame(child).await?;
        assert_eq!(next.code, u32::from(DistributedCode::BranchLevel));
        assert_eq!(DistributedBranchLevel::from_message(&next)?.level, 4);
    }
    Ok(())
}

#[tokio::test]
async fn test_branch_root_propagates_to_children() -> Result<()> {
    let mgr = manager();
    let mut child = attach_child(&mgr, "kid").await?;
    crate::unit_tests::read_frame(&mut child).await?;
    crate::unit_tests::read_frame(&mut child).await?;

    mgr.set_branch_root("rootA").await;
    assert_eq!(mgr.branch_root(), "rootA");

    let next = crate::unit_tests::read_frame(&mut child).await?;
    assert_eq!(next.code, u32::from(DistributedCode::BranchRoot));
    assert_eq!(DistributedBranchRoot::from_message(&next)?.root, "rootA");
    Ok(())
}

#[tokio::test]
async fn test_search_dissemination_reaches_children() -> Result<()> {
    let mgr = manager();
    let mut child = attach_child(&mgr, "kid").await?;
    crate::unit_tests::read_frame(&mut child).await?;
    crate::unit_tests::read_frame(&mut child).await?;

    let request = DistributedSearchRequest {
        username: "asker".to_string(),
        token: 42,
        query: "hello".to_string(),
    };
    assert!(mgr.disseminate_search(&request).await?);

    let fanned = crate::unit_tests::read_frame(&mut child).await?;
    assert_eq!(fanned.code, u32::from(DistributedCode::SearchRequest));
    assert_eq!(DistributedSearchRequest::from_message(&fanned)?, request);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_searches_suppressed_within_window() -> Result<()> {
    let mgr = manager();
    let request = DistributedSearchRequest {
        username: "asker".to_string(),
        token: 7,
        query: "dup".to_string(),
    };

    assert!(mgr.disseminate_search(&request).await?);
    assert!(!mgr.disseminate_search(&request).await?);

    // A different token is a different search.
    let other = DistributedSearchRequest {
        token: 8,
        ..request.clone()
    };
    assert!(mgr.disseminate_search(&other).await?);

    // And the original returns once the window has passed.
    sleep(Duration::from_millis(600)).await;
    assert!(mgr.disseminate_search(&request).await?);
    Ok(())
}

#[tokio::test]
async fn test_child_limit_turns_connections_away() -> Result<()> {
    let waiter = Arc::new(Waiter::new(Duration::from_secs(5)));
    let mgr = DistributedConnectionManager::new(
        DistributedConfig {
            accept_children: true,
            child_limit: 1,
            deduplicate_search_requests: true,
        },
        opts(),
        waiter,
    );
    mgr.attach_self();
    mgr.set_local_username("me");

    let _first = attach_child(&mgr, "one").await?;
    assert_eq!(mgr.child_count(), 1);
    assert!(attach_child(&mgr, "two").await.is_err());
    assert_eq!(mgr.child_count(), 1);
    Ok(())
}
