// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::client::SoulseekClient,
    models::{
        codes::ServerCode,
        frame::MessageReader,
        init::PierceFirewall,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{
    read_frame, serve_login, serve_peer_address, test_config, write_frame,
};

/// Direct connect fails against a dead endpoint; the server-mediated
/// pierce-back wins, and exactly one connection exists for the peer.
#[tokio::test]
#[serial]
async fn indirect_connect_wins_when_direct_fails() -> Result<()> {
    // A port that refuses connections: bind, note the port, drop.
    let dead_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await?;
        probe.local_addr()?.port()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let client = SoulseekClient::new(test_config(addr));
    let cancel = CancellationToken::new();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        serve_login(&mut stream).await.expect("login exchange");

        let mut client_listen_port = None;
        loop {
            let msg = read_frame(&mut stream).await.expect("server frame");
            match ServerCode::from_u32(msg.code) {
                Some(ServerCode::SetListenPort) => {
                    let mut r = MessageReader::new(&msg);
                    client_listen_port = Some(r.read_u32().expect("port") as u16);
                },
                Some(ServerCode::GetPeerAddress) => {
                    serve_peer_address(
                        &mut stream,
                        "peerA",
                        format!("127.0.0.1:{dead_port}").parse().expect("addr"),
                    )
                    .await
                    .expect("peer address reply");
                },
                Some(ServerCode::ConnectToPeer) => {
                    // The solicitation: grab the token and pierce back.
                    let mut r = MessageReader::new(&msg);
                    let token = r.read_u32().expect("token");
                    assert_eq!(r.read_string().expect("username"), "peerA");
                    assert_eq!(r.read_string().expect("kind"), "P");

                    let port = client_listen_port.expect("listen port seen");
                    let mut peer =
                        TcpStream::connect(("127.0.0.1", port)).await.expect("dial");
                    write_frame(
                        &mut peer,
                        &PierceFirewall::new(token).to_message().expect("encode"),
                    )
                    .await
                    .expect("pierce");
                    // Keep the pierced link alive for the assertion phase.
                    sleep(Duration::from_secs(2)).await;
                    return;
                },
                _ => {},
            }
        }
    });

    client.connect(&cancel).await?;
    assert!(client.login(&cancel).await?.success);

    let conn = client.peer_connection("peerA", &cancel).await?;
    assert!(conn.is_connected());
    assert_eq!(conn.username().as_deref(), Some("peerA"));
    assert_eq!(client.peer_manager().len(), 1);

    server.await?;
    client.disconnect().await;
    Ok(())
}
