// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::client::SoulseekClient,
    models::{
        codes::{ConnectionKind, ServerCode},
        frame::MessageReader,
        init::PeerInit,
        peer::{
            common::{File, FileAttribute},
            responses::SearchResponse,
        },
    },
    state_machine::search_states::{SearchCompletion, SearchState},
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{read_frame, serve_login, test_config, write_frame};

fn file(name: &str) -> File {
    File {
        code: 1,
        filename: name.to_string(),
        size: 1_000,
        extension: "mp3".to_string(),
        attributes: vec![FileAttribute { kind: 0, value: 320 }],
    }
}

fn peer_response(token: u32, names: &[&str]) -> SearchResponse {
    SearchResponse {
        username: "peer1".to_string(),
        token,
        files: names.iter().map(|n| file(n)).collect(),
        slot_free: true,
        average_speed: 50_000,
        queue_length: 0,
    }
}

#[tokio::test]
#[serial]
async fn search_aggregates_peer_responses() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    // Fake server: login, then wait for the search submission.
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        serve_login(&mut stream).await.expect("login exchange");
        loop {
            let msg = read_frame(&mut stream).await.expect("server frame");
            if msg.code == u32::from(ServerCode::SearchRequest) {
                let mut r = MessageReader::new(&msg);
                let token = r.read_u32().expect("token");
                let query = r.read_string().expect("query");
                assert_eq!(token, 42);
                assert_eq!(query, "hello");
                return stream; // hold the server link open
            }
        }
    });

    let client = SoulseekClient::new(test_config(addr));
    let cancel = CancellationToken::new();
    client.connect(&cancel).await?;
    assert!(client.login(&cancel).await?.success);
    let listen_port = client.listener().bound_port().expect("listener up");

    let mut results = client
        .search_with_token(
            "hello",
            soulseek_client_rs::models::server::requests::SearchScope::Network,
            42,
            None,
            &cancel,
        )
        .await?;
    let _server_stream = server.await?;

    // A fake peer delivers two responses over one "P" connection to the
    // client's listener: 2 files, then 3.
    let mut peer = TcpStream::connect(("127.0.0.1", listen_port)).await?;
    let init = PeerInit::new("peer1", ConnectionKind::Peer, 7);
    write_frame(&mut peer, &init.to_message()?).await?;
    write_frame(&mut peer, &peer_response(42, &["a", "b"]).to_message()?).await?;
    write_frame(&mut peer, &peer_response(42, &["c", "d", "e"]).to_message()?).await?;

    let first = results.next().await.expect("first response");
    assert_eq!(first.files.len(), 2);
    let second = results.next().await.expect("second response");
    assert_eq!(second.files.len(), 3);

    // Stream ends once the inactivity window closes the session.
    assert!(results.next().await.is_none());
    let session = results.session();
    assert_eq!(session.response_count(), 2);
    assert_eq!(session.file_count(), 5);
    assert_eq!(
        session.state(),
        SearchState::Completed(SearchCompletion::Success)
    );

    // Nothing is delivered after completion.
    write_frame(&mut peer, &peer_response(42, &["late"]).to_message()?).await?;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(session.file_count(), 5);

    client.disconnect().await;
    Ok(())
}
