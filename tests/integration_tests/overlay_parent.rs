// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::{client::SoulseekClient, distributed_manager::ParentCandidate},
    models::{
        codes::InitCode,
        distributed::{DistributedBranchLevel, DistributedBranchRoot},
        init::PeerInit,
    },
};
use tokio::{net::TcpListener, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{read_frame, test_config, write_frame};

/// Adopting a parent at level 3 makes us level 4 under its root.
#[tokio::test]
#[serial]
async fn parent_adoption_sets_branch_state() -> Result<()> {
    let parent_listener = TcpListener::bind("127.0.0.1:0").await?;
    let parent_addr = parent_listener.local_addr()?;

    let parent = tokio::spawn(async move {
        let (mut stream, _) = parent_listener.accept().await.expect("accept");

        let init = read_frame(&mut stream).await.expect("init frame");
        assert_eq!(init.code, u32::from(InitCode::PeerInit));
        let init = PeerInit::from_message(&init).expect("decode init");
        assert_eq!(init.username, "me");
        assert_eq!(init.kind.as_str(), "D");

        let level = DistributedBranchLevel { level: 3 };
        write_frame(&mut stream, &level.to_message().expect("encode")).await.expect("level");
        let root = DistributedBranchRoot {
            root: "rootA".to_string(),
        };
        write_frame(&mut stream, &root.to_message().expect("encode")).await.expect("root");

        sleep(Duration::from_secs(2)).await;
    });

    // Server link is never opened: overlay status updates degrade to warnings.
    let client = SoulseekClient::new(test_config("127.0.0.1:1".parse()?));
    client.distributed_manager().set_local_username("me");
    client.peer_manager().set_local_username("me");

    let cancel = CancellationToken::new();
    client
        .distributed_manager()
        .add_parent_connection(
            vec![ParentCandidate {
                username: "parentA".to_string(),
                ip: std::net::Ipv4Addr::new(127, 0, 0, 1),
                port: parent_addr.port(),
            }],
            &cancel,
        )
        .await?;

    let manager = client.distributed_manager();
    assert!(manager.has_parent());
    assert_eq!(manager.parent_username().as_deref(), Some("parentA"));
    assert_eq!(manager.branch_level(), 4);

    // BranchRoot may land a beat after adoption.
    for _ in 0..20 {
        if manager.branch_root() == "rootA" {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(manager.branch_root(), "rootA");

    parent.await?;
    client.disconnect().await;
    Ok(())
}

/// With no reachable candidates, the node stays an orphan root.
#[tokio::test]
#[serial]
async fn failed_candidates_leave_us_orphaned() -> Result<()> {
    let dead_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await?;
        probe.local_addr()?.port()
    };

    let client = SoulseekClient::new(test_config("127.0.0.1:1".parse()?));
    client.distributed_manager().set_local_username("me");

    let cancel = CancellationToken::new();
    let result = client
        .distributed_manager()
        .add_parent_connection(
            vec![ParentCandidate {
                username: "ghost".to_string(),
                ip: std::net::Ipv4Addr::new(127, 0, 0, 1),
                port: dead_port,
            }],
            &cancel,
        )
        .await;

    assert!(result.is_err());
    let manager = client.distributed_manager();
    assert!(!manager.has_parent());
    assert_eq!(manager.branch_level(), 0);
    assert_eq!(manager.branch_root(), "me");

    client.disconnect().await;
    Ok(())
}
