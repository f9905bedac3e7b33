// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use soulseek_client_rs::{
    cfg::config::SearchOptions,
    client::search::SearchSession,
    models::peer::{
        common::{File, FileAttribute},
        responses::SearchResponse,
    },
    state_machine::search_states::{SearchCompletion, SearchState},
};
use tokio::time::sleep;

fn file(name: &str, ext: &str) -> File {
    File {
        code: 1,
        filename: name.to_string(),
        size: 1000,
        extension: ext.to_string(),
        attributes: vec![FileAttribute { kind: 0, value: 320 }],
    }
}

fn response(username: &str, token: u32, files: Vec<File>) -> SearchResponse {
    SearchResponse {
        username: username.to_string(),
        token,
        files,
        slot_free: true,
        average_speed: 100_000,
        queue_length: 0,
    }
}

fn options() -> SearchOptions {
    SearchOptions {
        search_timeout: Duration::from_secs(30),
        response_timeout: Duration::from_secs(30),
        ..SearchOptions::default()
    }
}

#[tokio::test]
async fn test_responses_accumulate_in_receipt_order() -> Result<()> {
    let (session, mut results) = SearchSession::new(42, "hello", options());

    assert!(session.on_response(response("p1", 42, vec![file("a", "mp3"), file("b", "mp3")])));
    assert!(session.on_response(response("p2", 42, vec![
        file("c", "mp3"),
        file("d", "mp3"),
        file("e", "mp3"),
    ])));
    assert_eq!(session.state(), SearchState::InProgress);
    assert_eq!(session.response_count(), 2);
    assert_eq!(session.file_count(), 5);

    let first = results.next().await.expect("first response");
    assert_eq!(first.username, "p1");
    let second = results.next().await.expect("second response");
    assert_eq!(second.username, "p2");
    Ok(())
}

#[tokio::test]
async fn test_wrong_token_is_ignored() {
    let (session, _results) = SearchSession::new(42, "hello", options());
    assert!(!session.on_response(response("p1", 99, vec![file("a", "mp3")])));
    assert_eq!(session.response_count(), 0);
}

#[tokio::test]
async fn test_response_limit_completes_session() {
    let opts = SearchOptions {
        response_limit: 2,
        ..options()
    };
    let (session, _results) = SearchSession::new(1, "q", opts);

    assert!(session.on_response(response("p1", 1, vec![file("a", "mp3")])));
    assert!(session.on_response(response("p2", 1, vec![file("b", "mp3")])));
    assert_eq!(
        session.state(),
        SearchState::Completed(SearchCompletion::ResponseLimit)
    );
    // Late arrivals are dropped after completion.
    assert!(!session.on_response(response("p3", 1, vec![file("c", "mp3")])));
    assert_eq!(session.response_count(), 2);
}

#[tokio::test]
async fn test_file_limit_completes_session() {
    let opts = SearchOptions {
        file_limit: 3,
        ..options()
    };
    let (session, _results) = SearchSession::new(1, "q", opts);

    assert!(session.on_response(response("p1", 1, vec![file("a", "mp3"), file("b", "mp3")])));
    assert!(session.on_response(response("p2", 1, vec![file("c", "mp3"), file("d", "mp3")])));
    assert_eq!(
        session.state(),
        SearchState::Completed(SearchCompletion::FileLimit)
    );
}

#[tokio::test]
async fn test_ignored_extensions_are_stripped() {
    let opts = SearchOptions {
        ignored_file_extensions: vec!["exe".to_string()],
        ..options()
    };
    let (session, mut results) = SearchSession::new(1, "q", opts);

    // Only the exe: nothing left, response dropped entirely.
    assert!(!session.on_response(response("p1", 1, vec![file("virus", "exe")])));
    // Mixed: the exe is stripped, the mp3 survives.
    assert!(session.on_response(response("p2", 1, vec![file("virus", "exe"), file("song", "mp3")])));

    let kept = results.next().await.expect("response");
    assert_eq!(kept.files.len(), 1);
    assert_eq!(kept.files[0].filename, "song");
    assert_eq!(session.file_count(), 1);
}

#[tokio::test]
async fn test_response_filters() {
    let opts = SearchOptions {
        minimum_response_file_count: 2,
        minimum_peer_upload_speed: 50_000,
        maximum_peer_queue_length: 10,
        ..options()
    };
    let (session, _results) = SearchSession::new(1, "q", opts);

    // Too few files.
    assert!(!session.on_response(response("p1", 1, vec![file("a", "mp3")])));

    // Too slow.
    let mut slow = response("p2", 1, vec![file("a", "mp3"), file("b", "mp3")]);
    slow.average_speed = 10;
    assert!(!session.on_response(slow));

    // Queue too long.
    let mut busy = response("p3", 1, vec![file("a", "mp3"), file("b", "mp3")]);
    busy.queue_length = 100;
    assert!(!session.on_response(busy));

    // Healthy peer passes.
    assert!(session.on_response(response("p4", 1, vec![file("a", "mp3"), file("b", "mp3")])));
}

#[tokio::test]
async fn test_search_timeout_without_responses_is_timed_out() {
    let opts = SearchOptions {
        search_timeout: Duration::from_millis(100),
        response_timeout: Duration::from_secs(30),
        ..SearchOptions::default()
    };
    let (session, mut results) = SearchSession::new(1, "q", opts);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        session.state(),
        SearchState::Completed(SearchCompletion::TimedOut)
    );
    assert!(results.next().await.is_none());
}

#[tokio::test]
async fn test_response_inactivity_completes_successfully() {
    let opts = SearchOptions {
        search_timeout: Duration::from_secs(30),
        response_timeout: Duration::from_millis(150),
        ..SearchOptions::default()
    };
    let (session, _results) = SearchSession::new(1, "q", opts);

    assert!(session.on_response(response("p1", 1, vec![file("a", "mp3")])));
    sleep(Duration::from_millis(400)).await;
    assert_eq!(
        session.state(),
        SearchState::Completed(SearchCompletion::Success)
    );
}

#[tokio::test]
async fn test_cancel_ends_stream() {
    let (session, mut results) = SearchSession::new(1, "q", options());
    assert!(session.on_response(response("p1", 1, vec![file("a", "mp3")])));
    session.cancel();
    assert_eq!(
        session.state(),
        SearchState::Completed(SearchCompletion::Cancelled)
    );

    // The buffered response drains, then the stream ends.
    assert!(results.next().await.is_some());
    assert!(results.next().await.is_none());
}
