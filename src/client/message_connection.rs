// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    client::connection::{Connection, ConnectionRole},
    error::ConnectionError,
    models::frame::{CODE_LEN, LENGTH_PREFIX_LEN, Message},
};

/// Async message callback, run inline on the reader task so per-connection
/// delivery stays sequential.
pub type MessageCallback = Arc<
    dyn Fn(Arc<MessageConnection>, Message) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Framed variant of [`Connection`]: a background task reassembles whole
/// messages off the wire and hands them to `on_message`; outbound messages
/// are serialized FIFO through the connection's write path.
pub struct MessageConnection {
    conn: Arc<Connection>,
    role: ConnectionRole,
    username: StdMutex<Option<String>>,
    on_message: StdMutex<Option<MessageCallback>>,
}

impl std::fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConnection")
            .field("conn", &self.conn)
            .field("role", &self.role)
            .field("username", &self.username())
            .finish()
    }
}

impl MessageConnection {
    pub fn new(conn: Arc<Connection>, role: ConnectionRole) -> Arc<Self> {
        Arc::new(Self {
            conn,
            role,
            username: StdMutex::new(None),
            on_message: StdMutex::new(None),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn username(&self) -> Option<String> {
        self.username.lock().expect("username lock poisoned").clone()
    }

    /// Record the remote identity once the handshake reveals it.
    pub fn set_username(&self, username: impl Into<String>) {
        *self.username.lock().expect("username lock poisoned") = Some(username.into());
    }

    pub fn set_on_message(&self, cb: MessageCallback) {
        *self.on_message.lock().expect("on_message lock poisoned") = Some(cb);
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub async fn disconnect(&self, reason: &str) {
        self.conn.disconnect(reason).await;
    }

    /// Send one framed message. FIFO with respect to other senders on this
    /// connection.
    pub async fn send_message(
        &self,
        msg: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        trace!(
            "SEND code={} len={} to {}:{}",
            msg.code,
            msg.payload.len(),
            self.conn.host(),
            self.conn.port()
        );
        self.conn.write(&msg.to_bytes(), cancel).await
    }

    /// Spawn the read loop. While the session is up it reads
    /// `4 (length) + 4 (code) + (length - 4)` bytes, reassembles the
    /// message, and awaits the callback before reading on. Any read error
    /// tears the session down and ends the loop.
    pub fn start_read_loop(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let session = self.conn.session_token();
        tokio::spawn(async move {
            loop {
                match me.read_message(&session).await {
                    Ok(msg) => {
                        let cb = me
                            .on_message
                            .lock()
                            .expect("on_message lock poisoned")
                            .clone();
                        if let Some(cb) = cb {
                            cb(Arc::clone(&me), msg).await;
                        }
                    },
                    Err(e) => {
                        debug!(
                            "read loop for {}:{} ended: {e}",
                            me.conn.host(),
                            me.conn.port()
                        );
                        return;
                    },
                }
            }
        });
    }

    /// Read a single whole message.
    pub async fn read_message(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Message, ConnectionError> {
        read_frame(&self.conn, cancel).await
    }
}

/// Read one framed message off a bare connection. The listener uses this
/// for the init message on a fresh inbound socket, before the connection
/// has a role or a read loop.
pub async fn read_frame(
    conn: &Arc<Connection>,
    cancel: &CancellationToken,
) -> Result<Message, ConnectionError> {
    let len_bytes = conn.read(LENGTH_PREFIX_LEN, cancel).await?;
    let declared =
        u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
    if declared < CODE_LEN {
        conn.disconnect("invalid frame length").await;
        return Err(ConnectionError::Closed(format!(
            "frame length {declared} below code size"
        )));
    }

    let code_bytes = conn.read(CODE_LEN, cancel).await?;
    let code = u32::from_le_bytes([
        code_bytes[0],
        code_bytes[1],
        code_bytes[2],
        code_bytes[3],
    ]);

    let payload = conn.read(declared - CODE_LEN, cancel).await?;
    Ok(Message::new(code, payload))
}
