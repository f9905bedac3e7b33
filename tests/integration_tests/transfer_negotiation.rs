// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::client::SoulseekClient,
    models::{
        codes::{InitCode, PeerCode, ServerCode},
        frame::MessageReader,
        init::PeerInit,
        peer::requests::{TransferRequest, TransferResponse},
    },
    state_machine::transfer_states::{TransferCompletion, TransferState},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{
    read_frame, serve_login, serve_peer_address, test_config, write_frame,
};

const FILE_SIZE: usize = 10_000;

fn payload() -> Vec<u8> {
    (0..FILE_SIZE).map(|i| (i % 251) as u8).collect()
}

/// Fake server: login, then answer every address lookup with the fake
/// peer's endpoint.
async fn run_fake_server(listener: TcpListener, peer_addr: std::net::SocketAddr) {
    let (mut stream, _) = listener.accept().await.expect("accept");
    serve_login(&mut stream).await.expect("login exchange");
    loop {
        let Ok(msg) = read_frame(&mut stream).await else { return };
        if msg.code == u32::from(ServerCode::GetPeerAddress) {
            let mut r = MessageReader::new(&msg);
            let username = r.read_string().expect("username");
            assert_eq!(username, "peerB");
            serve_peer_address(&mut stream, "peerB", peer_addr)
                .await
                .expect("address reply");
        }
    }
}

/// Fake peer: negotiates on the message socket, serves bytes on the
/// transfer socket.
async fn run_fake_peer(listener: TcpListener) {
    // First connection: "P", negotiation.
    let (mut message_stream, _) = listener.accept().await.expect("accept P");
    let init = read_frame(&mut message_stream).await.expect("init");
    assert_eq!(init.code, u32::from(InitCode::PeerInit));
    let init = PeerInit::from_message(&init).expect("decode init");
    assert_eq!(init.kind.as_str(), "P");

    let request = read_frame(&mut message_stream).await.expect("transfer request");
    assert_eq!(request.code, u32::from(PeerCode::TransferRequest));
    let request = TransferRequest::from_message(&request).expect("decode request");
    assert_eq!(request.filename, "f.mp3");

    let allow = TransferResponse::allow(request.token, FILE_SIZE as u64);
    write_frame(&mut message_stream, &allow.to_message().expect("encode"))
        .await
        .expect("allow");

    // Second connection: "F", the transfer itself. The downloader sends
    // PeerInit, its token, and the start offset, then reads the file.
    let (mut transfer_stream, _) = listener.accept().await.expect("accept F");
    let init = read_frame(&mut transfer_stream).await.expect("F init");
    let init = PeerInit::from_message(&init).expect("decode F init");
    assert_eq!(init.kind.as_str(), "F");

    let mut token_buf = [0u8; 4];
    transfer_stream.read_exact(&mut token_buf).await.expect("token");
    assert_eq!(u32::from_le_bytes(token_buf), request.token);
    let mut offset_buf = [0u8; 8];
    transfer_stream.read_exact(&mut offset_buf).await.expect("offset");
    assert_eq!(u64::from_le_bytes(offset_buf), 0);

    transfer_stream.write_all(&payload()).await.expect("file bytes");
    transfer_stream.flush().await.expect("flush");
    // Hold both sockets until the download settles.
    sleep(Duration::from_secs(2)).await;
    drop(message_stream);
}

#[tokio::test]
#[serial]
async fn download_negotiation_and_bytes() -> Result<()> {
    let server_listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = server_listener.local_addr()?;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await?;
    let peer_addr = peer_listener.local_addr()?;

    tokio::spawn(run_fake_server(server_listener, peer_addr));
    let peer = tokio::spawn(run_fake_peer(peer_listener));

    let client = SoulseekClient::new(test_config(server_addr));
    let cancel = CancellationToken::new();
    client.connect(&cancel).await?;
    assert!(client.login(&cancel).await?.success);

    let mut sink: Vec<u8> = Vec::with_capacity(FILE_SIZE);
    let record = client
        .download("peerB", "f.mp3", &mut sink, &cancel)
        .await?;

    assert_eq!(sink, payload());
    assert_eq!(record.size, FILE_SIZE as u64);
    assert_eq!(record.bytes_transferred, FILE_SIZE as u64);
    assert_eq!(
        record.state,
        TransferState::Completed(TransferCompletion::Succeeded)
    );

    peer.await?;
    client.disconnect().await;
    Ok(())
}

/// A remote that refuses outright fails the transfer as rejected.
#[tokio::test]
#[serial]
async fn download_rejection_is_terminal() -> Result<()> {
    let server_listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = server_listener.local_addr()?;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await?;
    let peer_addr = peer_listener.local_addr()?;

    tokio::spawn(run_fake_server(server_listener, peer_addr));
    tokio::spawn(async move {
        let (mut stream, _) = peer_listener.accept().await.expect("accept");
        let _ = read_frame(&mut stream).await.expect("init");
        let request = read_frame(&mut stream).await.expect("request");
        let request = TransferRequest::from_message(&request).expect("decode");
        let refusal = TransferResponse::reject(request.token, "File not shared");
        write_frame(&mut stream, &refusal.to_message().expect("encode"))
            .await
            .expect("refusal");
        sleep(Duration::from_secs(1)).await;
        drop(stream);
    });

    let client = SoulseekClient::new(test_config(server_addr));
    let cancel = CancellationToken::new();
    client.connect(&cancel).await?;
    assert!(client.login(&cancel).await?.success);

    let mut sink: Vec<u8> = Vec::new();
    let err = client
        .download("peerB", "f.mp3", &mut sink, &cancel)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("File not shared"), "got {err:#}");
    assert!(sink.is_empty());

    client.disconnect().await;
    Ok(())
}
