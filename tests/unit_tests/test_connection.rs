// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use soulseek_client_rs::{
    cfg::config::ConnectionOptions,
    client::connection::{Connection, ConnectionState},
    error::ConnectionError,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

fn opts() -> ConnectionOptions {
    ConnectionOptions {
        buffer_size: 4,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(1),
    }
}

type Transitions = Arc<Mutex<Vec<(ConnectionState, ConnectionState, String)>>>;

fn track_transitions(conn: &Arc<Connection>) -> Transitions {
    let log: Transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    conn.set_on_state_change(Box::new(move |prev, next, msg| {
        sink.lock().expect("log lock").push((prev, next, msg.to_string()));
    }));
    log
}

#[tokio::test]
async fn test_connect_read_write_round_trip() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.expect("server read");
        assert_eq!(&buf, b"hello");
        stream.write_all(b"0123456789").await.expect("server write");
        // Keep the socket open until the client is done.
        sleep(Duration::from_millis(200)).await;
    });

    let conn = Connection::new("127.0.0.1", addr.port(), opts());
    let cancel = CancellationToken::new();

    let events: Arc<Mutex<Vec<(usize, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    conn.set_on_data_read(Box::new(move |chunk, cumulative, total| {
        sink.lock().expect("events lock").push((chunk, cumulative, total));
    }));

    conn.connect(&cancel).await?;
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.write(b"hello", &cancel).await?;
    let bytes = conn.read(10, &cancel).await?;
    assert_eq!(&bytes[..], b"0123456789");

    // buffer_size = 4 → progress at most 4 bytes per chunk, cumulative
    // monotone, total constant.
    let events = events.lock().expect("events lock").clone();
    assert!(!events.is_empty());
    let mut cumulative = 0u64;
    for (chunk, cum, total) in &events {
        assert!(*chunk <= 4);
        cumulative += *chunk as u64;
        assert_eq!(*cum, cumulative);
        assert_eq!(*total, 10);
    }
    assert_eq!(cumulative, 10);

    conn.disconnect("test done").await;
    server.await?;
    Ok(())
}

#[tokio::test]
async fn test_remote_close_disconnects_once() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        drop(stream); // immediate FIN
    });

    let conn = Connection::new("127.0.0.1", addr.port(), opts());
    let log = track_transitions(&conn);
    let cancel = CancellationToken::new();
    conn.connect(&cancel).await?;

    let err = conn.read(4, &cancel).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Closed(_)));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    // A second disconnect is a no-op.
    conn.disconnect("again").await;
    conn.disconnect("and again").await;

    let log = log.lock().expect("log lock").clone();
    let terminal = log
        .iter()
        .filter(|(_, next, _)| *next == ConnectionState::Disconnected)
        .count();
    assert_eq!(terminal, 1, "exactly one terminal transition: {log:?}");
    Ok(())
}

#[tokio::test]
async fn test_inactivity_timeout_disconnects() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        // Say nothing, keep the socket open well past the read timeout.
        sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let conn = Connection::new("127.0.0.1", addr.port(), opts());
    let log = track_transitions(&conn);
    let cancel = CancellationToken::new();
    conn.connect(&cancel).await?;

    // read_timeout is 1s; wait out the timer.
    sleep(Duration::from_millis(1600)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let log = log.lock().expect("log lock").clone();
    assert!(
        log.iter().any(|(_, _, msg)| msg.contains("inactivity")),
        "expected an inactivity reason in {log:?}"
    );
    Ok(())
}

#[tokio::test]
async fn test_connect_cancelled() -> Result<()> {
    let conn = Connection::new("127.0.0.1", 1, opts());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = conn.connect(&cancel).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Cancelled { .. }));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_connect_rejects_wrong_state() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        sleep(Duration::from_millis(500)).await;
        drop(stream);
    });

    let conn = Connection::new("127.0.0.1", addr.port(), opts());
    let cancel = CancellationToken::new();
    conn.connect(&cancel).await?;

    let err = conn.connect(&cancel).await.unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidState { state: "Connected" }));
    conn.disconnect("done").await;
    Ok(())
}

#[tokio::test]
async fn test_write_after_disconnect_fails() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = listener.accept().await;
        sleep(Duration::from_millis(300)).await;
    });

    let conn = Connection::new("127.0.0.1", addr.port(), opts());
    let cancel = CancellationToken::new();
    conn.connect(&cancel).await?;
    conn.disconnect("bye").await;

    let err = conn.write(b"late", &cancel).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Closed(_)));
    Ok(())
}
