// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicU64, Ordering},
};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{client::connection::Connection, error::ConnectionError};

/// Invoked after each chunk with `(cumulative, total)` for the transfer.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Raw-byte variant of [`Connection`] used for file transfers: no framing,
/// bulk chunked reads into an external sink, raw writes from an external
/// source. The expected byte count is supplied by the negotiation.
pub struct TransferConnection {
    conn: Arc<Connection>,
    /// Expected byte count. Solicited sockets are opened before the size is
    /// negotiated, so this is settable until the transfer starts.
    total: AtomicU64,
    transferred: AtomicU64,
    on_progress: StdMutex<Option<ProgressCallback>>,
}

impl std::fmt::Debug for TransferConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferConnection")
            .field("conn", &self.conn)
            .field("total", &self.total.load(Ordering::Relaxed))
            .field("transferred", &self.transferred.load(Ordering::Relaxed))
            .finish()
    }
}

impl TransferConnection {
    pub fn new(conn: Arc<Connection>, total: u64) -> Arc<Self> {
        Arc::new(Self {
            conn,
            total: AtomicU64::new(total),
            transferred: AtomicU64::new(0),
            on_progress: StdMutex::new(None),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn set_on_progress(&self, cb: ProgressCallback) {
        *self.on_progress.lock().expect("on_progress lock poisoned") = Some(cb);
    }

    pub async fn disconnect(&self, reason: &str) {
        self.conn.disconnect(reason).await;
    }

    fn bump(&self, n: u64) {
        let cumulative = self.transferred.fetch_add(n, Ordering::Relaxed) + n;
        if let Some(cb) = self
            .on_progress
            .lock()
            .expect("on_progress lock poisoned")
            .as_ref()
        {
            cb(cumulative, self.total());
        }
    }

    /// First 4 bytes on a solicited transfer socket: the remote's token.
    pub async fn read_token(
        &self,
        cancel: &CancellationToken,
    ) -> Result<u32, ConnectionError> {
        let bytes = self.conn.read(4, cancel).await?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub async fn write_token(
        &self,
        token: u32,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.conn.write(&token.to_le_bytes(), cancel).await
    }

    /// Announce the starting offset for the remote to seek to.
    pub async fn write_offset(
        &self,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.conn.write(&offset.to_le_bytes(), cancel).await
    }

    /// Pull `n` bytes off the socket into `sink`, chunked by the
    /// connection's buffer size, reporting progress per chunk.
    pub async fn read_to<W>(
        &self,
        sink: &mut W,
        n: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, ConnectionError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let chunk_size = self.conn.options().buffer_size as u64;
        let mut remaining = n;
        while remaining > 0 {
            let want = remaining.min(chunk_size) as usize;
            let bytes = self.conn.read(want, cancel).await?;
            sink.write_all(&bytes)
                .await
                .map_err(ConnectionError::Write)?;
            remaining -= bytes.len() as u64;
            self.bump(bytes.len() as u64);
        }
        Ok(n - remaining)
    }

    /// Push raw bytes to the socket, counting them toward progress.
    pub async fn write_from(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.conn.write(bytes, cancel).await?;
        self.bump(bytes.len() as u64);
        Ok(())
    }
}
