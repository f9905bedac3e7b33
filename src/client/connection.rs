// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::Mutex,
    time::{Instant, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{cfg::config::ConnectionOptions, error::ConnectionError};

/// What a connection is for. The server uplink is a role of its own; the
/// other three correspond to the wire kind letters "P", "F" and "D".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Server,
    Peer,
    Transfer,
    Distributed,
}

impl From<crate::models::codes::ConnectionKind> for ConnectionRole {
    fn from(kind: crate::models::codes::ConnectionKind) -> Self {
        match kind {
            crate::models::codes::ConnectionKind::Peer => ConnectionRole::Peer,
            crate::models::codes::ConnectionKind::Transfer => ConnectionRole::Transfer,
            crate::models::codes::ConnectionKind::Distributed => ConnectionRole::Distributed,
        }
    }
}

/// Lifecycle of a single TCP session. Transitions only move forward;
/// `Disconnected` is terminal for the session (a fresh `connect` starts a
/// new one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Pending => "Pending",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Disconnected => "Disconnected",
        }
    }
}

/// Invoked exactly once per state transition with `(previous, next, message)`.
pub type StateChangeCallback =
    Box<dyn Fn(ConnectionState, ConnectionState, &str) + Send + Sync>;

/// Invoked after every read chunk with `(chunk_len, cumulative, total)` for
/// the current read call.
pub type DataReadCallback = Box<dyn Fn(usize, u64, u64) + Send + Sync>;

/// Period of the watchdog that notices a socket the OS tore down underneath
/// us.
const WATCHDOG_PERIOD: Duration = Duration::from_millis(250);

/// A single TCP session with bounded reads, serialized writes, an
/// inactivity timer and a socket watchdog.
///
/// The two halves of the stream live behind fair async mutexes, so
/// concurrent writers queue FIFO and a single logical reader owns the read
/// side (the read-loop task of the framed variants).
pub struct Connection {
    host: String,
    port: u16,
    opts: ConnectionOptions,

    state: StdMutex<ConnectionState>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    peer_addr: StdMutex<Option<SocketAddr>>,

    /// Torn down with the session; regenerated by `connect`.
    cancel: StdMutex<CancellationToken>,
    /// Read-progress deadline; the inactivity task disconnects past it.
    inactivity_deadline: StdMutex<Instant>,
    inactivity_enabled: StdMutex<bool>,

    on_state_change: StdMutex<Option<StateChangeCallback>>,
    on_data_read: StdMutex<Option<DataReadCallback>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, opts: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            port,
            opts,
            state: StdMutex::new(ConnectionState::Pending),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            peer_addr: StdMutex::new(None),
            cancel: StdMutex::new(CancellationToken::new()),
            inactivity_deadline: StdMutex::new(Instant::now()),
            inactivity_enabled: StdMutex::new(true),
            on_state_change: StdMutex::new(None),
            on_data_read: StdMutex::new(None),
        })
    }

    /// Adopt an already-accepted inbound socket. The connection starts out
    /// `Connected` with timers armed.
    pub fn from_stream(
        stream: TcpStream,
        opts: ConnectionOptions,
    ) -> Result<Arc<Self>, ConnectionError> {
        let peer = stream
            .peer_addr()
            .map_err(|e| ConnectionError::Closed(format!("no peer address: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();

        let conn = Arc::new(Self {
            host: peer.ip().to_string(),
            port: peer.port(),
            opts,
            state: StdMutex::new(ConnectionState::Connected),
            reader: Mutex::new(Some(r)),
            writer: Mutex::new(Some(w)),
            peer_addr: StdMutex::new(Some(peer)),
            cancel: StdMutex::new(CancellationToken::new()),
            inactivity_deadline: StdMutex::new(Instant::now() + opts.read_timeout),
            inactivity_enabled: StdMutex::new(true),
            on_state_change: StdMutex::new(None),
            on_data_read: StdMutex::new(None),
        });
        conn.spawn_timers();
        Ok(conn)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.opts
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().expect("peer_addr lock poisoned")
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Token that fires when this session is torn down.
    pub fn session_token(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel lock poisoned").clone()
    }

    pub fn set_on_state_change(&self, cb: StateChangeCallback) {
        *self
            .on_state_change
            .lock()
            .expect("on_state_change lock poisoned") = Some(cb);
    }

    pub fn set_on_data_read(&self, cb: DataReadCallback) {
        *self
            .on_data_read
            .lock()
            .expect("on_data_read lock poisoned") = Some(cb);
    }

    /// Long-lived mostly-idle links (the server uplink) opt out of the
    /// inactivity watchdog.
    pub fn disable_inactivity_timeout(&self) {
        *self
            .inactivity_enabled
            .lock()
            .expect("inactivity_enabled lock poisoned") = false;
    }

    /// Move to `next` unless already there; fires the state callback once.
    fn transition(&self, next: ConnectionState, message: &str) -> bool {
        let prev = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == next {
                return false;
            }
            let prev = *state;
            *state = next;
            prev
        };
        trace!(
            "{}:{} {} -> {} ({message})",
            self.host,
            self.port,
            prev.as_str(),
            next.as_str()
        );
        if let Some(cb) = self
            .on_state_change
            .lock()
            .expect("on_state_change lock poisoned")
            .as_ref()
        {
            cb(prev, next, message);
        }
        true
    }

    /// Establish the TCP session, racing the socket connect against the
    /// configured deadline and the caller's cancellation.
    pub async fn connect(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Pending | ConnectionState::Disconnected => {},
            s => {
                return Err(ConnectionError::InvalidState { state: s.as_str() });
            },
        }

        if cancel.is_cancelled() {
            self.transition(ConnectionState::Disconnected, "connect cancelled");
            return Err(ConnectionError::Cancelled { what: "connect" });
        }

        // Fresh token for the new session; prior timers died with the old one.
        {
            let mut tok = self.cancel.lock().expect("cancel lock poisoned");
            *tok = CancellationToken::new();
        }

        self.transition(ConnectionState::Connecting, "connecting");

        let attempt = TcpStream::connect((self.host.as_str(), self.port));
        let stream = select! {
            _ = cancel.cancelled() => {
                self.transition(ConnectionState::Disconnected, "connect cancelled");
                return Err(ConnectionError::Cancelled { what: "connect" });
            },
            res = timeout(self.opts.connect_timeout, attempt) => match res {
                Err(_) => {
                    self.transition(ConnectionState::Disconnected, "connect timeout");
                    return Err(ConnectionError::Timeout { what: "connect" });
                },
                Ok(Err(e)) => {
                    self.transition(
                        ConnectionState::Disconnected,
                        "connect failed",
                    );
                    return Err(ConnectionError::Closed(format!("connect failed: {e}")));
                },
                Ok(Ok(s)) => s,
            },
        };

        let _ = stream.set_nodelay(true);
        *self.peer_addr.lock().expect("peer_addr lock poisoned") = stream.peer_addr().ok();

        let (r, w) = stream.into_split();
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);

        self.touch_inactivity();
        self.transition(ConnectionState::Connected, "connected");
        self.spawn_timers();

        Ok(())
    }

    fn spawn_timers(self: &Arc<Self>) {
        let token = self.session_token();

        // Watchdog: notices the OS dropping the socket under us.
        let conn = Arc::clone(self);
        let watchdog_token = token.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCHDOG_PERIOD);
            loop {
                select! {
                    _ = watchdog_token.cancelled() => return,
                    _ = tick.tick() => {},
                }
                let gone = match conn.writer.try_lock() {
                    Ok(guard) => match guard.as_ref() {
                        Some(w) => w.peer_addr().is_err(),
                        None => true,
                    },
                    // Writer busy means the socket is in use; skip the tick.
                    Err(_) => false,
                };
                if gone {
                    conn.disconnect("socket closed").await;
                    return;
                }
            }
        });

        // Inactivity: disconnects after `read_timeout` with no read progress.
        if *self
            .inactivity_enabled
            .lock()
            .expect("inactivity_enabled lock poisoned")
        {
            let conn = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    let deadline = *conn
                        .inactivity_deadline
                        .lock()
                        .expect("inactivity_deadline lock poisoned");
                    select! {
                        _ = token.cancelled() => return,
                        _ = sleep_until(deadline) => {},
                    }
                    let current = *conn
                        .inactivity_deadline
                        .lock()
                        .expect("inactivity_deadline lock poisoned");
                    if Instant::now() >= current {
                        conn.disconnect("inactivity timeout").await;
                        return;
                    }
                }
            });
        }
    }

    fn touch_inactivity(&self) {
        *self
            .inactivity_deadline
            .lock()
            .expect("inactivity_deadline lock poisoned") =
            Instant::now() + self.opts.read_timeout;
    }

    fn emit_data_read(&self, chunk: usize, cumulative: u64, total: u64) {
        if let Some(cb) = self
            .on_data_read
            .lock()
            .expect("on_data_read lock poisoned")
            .as_ref()
        {
            cb(chunk, cumulative, total);
        }
    }

    /// Read exactly `n` bytes, in chunks of at most `buffer_size`. Each
    /// chunk resets the inactivity deadline and fires the data-read event.
    pub async fn read(
        &self,
        n: usize,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed("not connected".into()));
        }
        let session = self.session_token();

        let mut out = BytesMut::with_capacity(n);
        let mut buf = vec![0u8; (self.opts.buffer_size as usize).min(n.max(1))];
        let total = n as u64;

        let result = {
            let mut guard = self.reader.lock().await;
            let Some(reader) = guard.as_mut() else {
                return Err(ConnectionError::Closed("not connected".into()));
            };

            loop {
                if out.len() >= n {
                    break Ok(());
                }
                let want = buf.len().min(n - out.len());
                let read = select! {
                    _ = cancel.cancelled() => {
                        break Err(ConnectionError::Cancelled { what: "read" });
                    },
                    _ = session.cancelled() => {
                        break Err(ConnectionError::Closed("disconnected".into()));
                    },
                    res = reader.read(&mut buf[..want]) => match res {
                        Ok(0) => break Err(ConnectionError::Closed(
                            "remote closed connection".into(),
                        )),
                        Ok(m) => m,
                        Err(e) => break Err(ConnectionError::Read(e)),
                    },
                };
                out.extend_from_slice(&buf[..read]);
                self.touch_inactivity();
                self.emit_data_read(read, out.len() as u64, total);
            }
        };

        match result {
            Ok(()) => Ok(out.freeze()),
            Err(ConnectionError::Cancelled { what }) => {
                // Caller cancellation leaves the session up.
                Err(ConnectionError::Cancelled { what })
            },
            Err(e) => {
                self.disconnect(&format!("read failed: {e}")).await;
                Err(e)
            },
        }
    }

    /// Write all of `bytes`. Submissions from concurrent writers are FIFO
    /// through the fair writer mutex.
    pub async fn write(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed("not connected".into()));
        }
        let session = self.session_token();

        let result = {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(ConnectionError::Closed("not connected".into()));
            };
            select! {
                _ = cancel.cancelled() => {
                    Err(ConnectionError::Cancelled { what: "write" })
                },
                _ = session.cancelled() => {
                    Err(ConnectionError::Closed("disconnected".into()))
                },
                res = writer.write_all(bytes) => {
                    res.map_err(ConnectionError::Write)
                },
            }
        };

        match result {
            Ok(()) => {
                self.touch_inactivity();
                Ok(())
            },
            Err(ConnectionError::Cancelled { what }) => {
                Err(ConnectionError::Cancelled { what })
            },
            Err(e) => {
                self.disconnect(&format!("write failed: {e}")).await;
                Err(e)
            },
        }
    }

    /// Tear the session down. Idempotent: the first caller wins, later
    /// calls (and re-entrant ones from the timers) return immediately.
    pub async fn disconnect(&self, reason: &str) {
        let prev = {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                ConnectionState::Disconnecting | ConnectionState::Disconnected => return,
                s => {
                    *state = ConnectionState::Disconnecting;
                    s
                },
            }
        };
        debug!("{}:{} disconnecting: {reason}", self.host, self.port);
        if let Some(cb) = self
            .on_state_change
            .lock()
            .expect("on_state_change lock poisoned")
            .as_ref()
        {
            cb(prev, ConnectionState::Disconnecting, reason);
        }

        // Stop timers and unblock any reader/writer select.
        self.session_token().cancel();

        if let Some(mut w) = self.writer.lock().await.take() {
            if let Err(e) = w.shutdown().await {
                trace!("shutdown after disconnect: {e}");
            }
        }
        *self.reader.lock().await = None;

        let fired = self.transition(ConnectionState::Disconnected, reason);
        if !fired {
            warn!("duplicate terminal transition suppressed");
        }
    }
}
