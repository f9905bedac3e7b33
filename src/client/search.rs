// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicU32, Ordering},
};

use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::SearchOptions,
    models::peer::responses::SearchResponse,
    state_machine::search_states::{SearchCompletion, SearchState},
};

/// One outstanding network search: accumulates peer responses under the
/// configured limits and filters, and completes at the first of
/// search-timeout, response-inactivity, response-count limit, file-count
/// limit, or cancel. Responses arriving after completion are dropped.
pub struct SearchSession {
    token: u32,
    query: String,
    options: SearchOptions,
    started_at: Instant,

    state: StdMutex<SearchState>,
    response_count: AtomicU32,
    file_count: AtomicU32,
    last_response: StdMutex<Instant>,

    sink: StdMutex<Option<mpsc::UnboundedSender<SearchResponse>>>,
    /// Fires once on completion; the deadline task and the registry hang off
    /// this.
    done: CancellationToken,
}

impl std::fmt::Debug for SearchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSession")
            .field("token", &self.token)
            .field("query", &self.query)
            .field("state", &self.state())
            .field("responses", &self.response_count())
            .field("files", &self.file_count())
            .finish()
    }
}

/// Lazily consumed stream of responses for one search.
pub struct SearchResults {
    session: Arc<SearchSession>,
    rx: mpsc::UnboundedReceiver<SearchResponse>,
}

impl SearchResults {
    /// Next response, or `None` once the session has completed and the
    /// buffer is drained.
    pub async fn next(&mut self) -> Option<SearchResponse> {
        self.rx.recv().await
    }

    pub fn session(&self) -> &Arc<SearchSession> {
        &self.session
    }
}

impl SearchSession {
    pub fn new(
        token: u32,
        query: impl Into<String>,
        options: SearchOptions,
    ) -> (Arc<Self>, SearchResults) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            token,
            query: query.into(),
            options,
            started_at: Instant::now(),
            state: StdMutex::new(SearchState::Requested),
            response_count: AtomicU32::new(0),
            file_count: AtomicU32::new(0),
            last_response: StdMutex::new(Instant::now()),
            sink: StdMutex::new(Some(tx)),
            done: CancellationToken::new(),
        });
        session.spawn_deadline_task();
        let results = SearchResults {
            session: Arc::clone(&session),
            rx,
        };
        (session, results)
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn state(&self) -> SearchState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn response_count(&self) -> u32 {
        self.response_count.load(Ordering::Relaxed)
    }

    pub fn file_count(&self) -> u32 {
        self.file_count.load(Ordering::Relaxed)
    }

    /// Resolves when the session is complete.
    pub fn completed(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn cancel(&self) {
        self.complete(SearchCompletion::Cancelled);
    }

    /// Feed one inbound response through the filters and into the sink.
    /// Returns whether it was accepted.
    pub fn on_response(&self, mut response: SearchResponse) -> bool {
        if response.token != self.token {
            return false;
        }
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                SearchState::Completed(_) => return false,
                SearchState::Requested => *state = SearchState::InProgress,
                SearchState::InProgress => {},
            }
        }

        if self.options.filter_files {
            self.strip_ignored_files(&mut response);
        }
        if self.options.filter_responses && !self.response_passes(&response) {
            debug!("search {}: response from {} filtered", self.token, response.username);
            return false;
        }
        if response.files.is_empty() {
            return false;
        }

        *self
            .last_response
            .lock()
            .expect("last_response lock poisoned") = Instant::now();

        let files = response.files.len() as u32;
        let sent = {
            let sink = self.sink.lock().expect("sink lock poisoned");
            match sink.as_ref() {
                Some(tx) => tx.send(response).is_ok(),
                None => false,
            }
        };
        if !sent {
            return false;
        }

        let responses = self.response_count.fetch_add(1, Ordering::Relaxed) + 1;
        let total_files = self.file_count.fetch_add(files, Ordering::Relaxed) + files;

        if responses >= self.options.response_limit {
            self.complete(SearchCompletion::ResponseLimit);
        } else if total_files >= self.options.file_limit {
            self.complete(SearchCompletion::FileLimit);
        }
        true
    }

    fn strip_ignored_files(&self, response: &mut SearchResponse) {
        let ignored = &self.options.ignored_file_extensions;
        if ignored.is_empty() {
            return;
        }
        response.files.retain(|file| {
            let ext = if file.extension.is_empty() {
                file.filename.rsplit('.').next().unwrap_or("")
            } else {
                &file.extension
            };
            !ignored.iter().any(|ign| ign.eq_ignore_ascii_case(ext))
        });
    }

    fn response_passes(&self, response: &SearchResponse) -> bool {
        let o = &self.options;
        if (response.files.len() as u32) < o.minimum_response_file_count {
            return false;
        }
        if response.average_speed < o.minimum_peer_upload_speed {
            return false;
        }
        if o.minimum_peer_free_upload_slots > 0 && !response.slot_free {
            return false;
        }
        if response.queue_length > o.maximum_peer_queue_length {
            return false;
        }
        if response.queue_length < o.minimum_peer_queue_length {
            return false;
        }
        true
    }

    /// First completion wins; closes the sink so the results stream ends
    /// after the buffered responses.
    pub fn complete(&self, reason: SearchCompletion) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if state.is_terminal() {
                return;
            }
            *state = SearchState::Completed(reason);
        }
        debug!("search {} completed: {reason:?}", self.token);
        *self.sink.lock().expect("sink lock poisoned") = None;
        self.done.cancel();
    }

    /// Watches the overall deadline and the response-inactivity window.
    fn spawn_deadline_task(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let hard_deadline = session.started_at + session.options.search_timeout;
            loop {
                let idle_deadline = *session
                    .last_response
                    .lock()
                    .expect("last_response lock poisoned")
                    + session.options.response_timeout;
                let next = hard_deadline.min(idle_deadline);

                tokio::select! {
                    _ = session.done.cancelled() => return,
                    _ = sleep_until(next) => {},
                }

                let now = Instant::now();
                if now >= hard_deadline {
                    // Responses arrived but the window closed: that is a
                    // successful, full-length search.
                    let reason = if session.response_count() > 0 {
                        SearchCompletion::Success
                    } else {
                        SearchCompletion::TimedOut
                    };
                    session.complete(reason);
                    return;
                }
                let idle = *session
                    .last_response
                    .lock()
                    .expect("last_response lock poisoned")
                    + session.options.response_timeout;
                if now >= idle {
                    let reason = if session.response_count() > 0 {
                        SearchCompletion::Success
                    } else {
                        SearchCompletion::TimedOut
                    };
                    session.complete(reason);
                    return;
                }
            }
        });
    }
}
