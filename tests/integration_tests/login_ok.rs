// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::client::SoulseekClient,
    models::codes::ServerCode,
};
use tokio::{net::TcpListener, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{read_frame, serve_login, test_config};

#[tokio::test]
#[serial]
async fn login_ok() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        serve_login(&mut stream).await.expect("login exchange");

        // The client advertises its listen port, share counts, and orphan
        // status right after a successful login.
        let mut advertised = Vec::new();
        for _ in 0..3 {
            let msg = read_frame(&mut stream).await.expect("advertisement");
            advertised.push(msg.code);
        }
        assert!(advertised.contains(&u32::from(ServerCode::SetListenPort)));
        assert!(advertised.contains(&u32::from(ServerCode::SharedFoldersFiles)));
        assert!(advertised.contains(&u32::from(ServerCode::HaveNoParent)));

        sleep(Duration::from_millis(500)).await;
    });

    let client = SoulseekClient::new(test_config(addr));
    let cancel = CancellationToken::new();
    client.connect(&cancel).await?;

    let response = client.login(&cancel).await?;
    assert!(response.success);
    assert_eq!(response.message, "Welcome");
    assert_eq!(response.ip, Some(std::net::Ipv4Addr::new(127, 0, 0, 1)));
    assert!(client.is_logged_in());
    assert_eq!(client.local_username().as_deref(), Some("me"));

    server.await?;
    client.disconnect().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn login_rejected() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let _ = read_frame(&mut stream).await.expect("login request");
        let rejection = soulseek_client_rs::models::frame::MessageBuilder::new()
            .write_code(ServerCode::Login)
            .write_byte(0)
            .write_string("INVALIDPASS")
            .build()
            .expect("build");
        use tokio::io::AsyncWriteExt;
        stream.write_all(&rejection.to_bytes()).await.expect("write");
        sleep(Duration::from_millis(500)).await;
    });

    let client = SoulseekClient::new(test_config(addr));
    let cancel = CancellationToken::new();
    client.connect(&cancel).await?;

    let response = client.login(&cancel).await?;
    assert!(!response.success);
    assert_eq!(response.message, "INVALIDPASS");
    assert!(!client.is_logged_in());

    client.disconnect().await;
    Ok(())
}
