// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex as StdMutex, Weak},
    time::Instant,
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::{ConnectionOptions, PeerConfig},
    client::{
        connection::{Connection, ConnectionRole, ConnectionState},
        message_connection::{MessageCallback, MessageConnection},
        transfer_connection::TransferConnection,
        waiter::{WaitKey, Waiter},
    },
    models::{
        codes::ConnectionKind,
        init::{PeerInit, PierceFirewall},
        server::responses::ConnectToPeerResponse,
    },
    utils::next_token,
};

/// Identity of a pooled peer message connection. Equality and hashing are
/// structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub kind: ConnectionKind,
}

impl ConnectionKey {
    pub fn peer(username: impl Into<String>, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            username: username.into(),
            ip,
            port,
            kind: ConnectionKind::Peer,
        }
    }
}

#[derive(Debug)]
struct PeerEntry {
    conn: Arc<MessageConnection>,
    last_active: StdMutex<Instant>,
}

/// Directory of per-peer message connections with the direct/indirect
/// handshake and transfer-socket acquisition.
///
/// Invariants: at most one live entry per [`ConnectionKey`]; a dead entry is
/// removed before any new attempt to the same key; past the configured cap
/// the least-recently-used entry is evicted. Transfer connections are never
/// pooled.
pub struct PeerConnectionManager {
    connections: DashMap<ConnectionKey, Arc<PeerEntry>>,
    cfg: PeerConfig,
    opts: ConnectionOptions,
    waiter: Arc<Waiter>,
    local_username: StdMutex<String>,
    /// Peer-message handler, installed on every pooled connection.
    message_callback: OnceCell<MessageCallback>,
    self_weak: OnceCell<Weak<Self>>,
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("connections", &self.connections.len())
            .field("limit", &self.cfg.concurrent_message_connections)
            .finish()
    }
}

impl PeerConnectionManager {
    pub fn new(cfg: PeerConfig, opts: ConnectionOptions, waiter: Arc<Waiter>) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            cfg,
            opts,
            waiter,
            local_username: StdMutex::new(String::new()),
            message_callback: OnceCell::new(),
            self_weak: OnceCell::new(),
        })
    }

    /// Must be called once after creating the Arc.
    pub fn attach_self(self: &Arc<Self>) {
        let _ = self.self_weak.set(Arc::downgrade(self));
    }

    pub fn set_local_username(&self, username: impl Into<String>) {
        *self
            .local_username
            .lock()
            .expect("local_username lock poisoned") = username.into();
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        let _ = self.message_callback.set(cb);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<MessageConnection>> {
        self.connections.get(key).map(|e| e.conn.clone())
    }

    /// Live pooled connection for `username`, regardless of endpoint.
    pub fn find_by_username(&self, username: &str) -> Option<Arc<MessageConnection>> {
        self.connections
            .iter()
            .find(|e| e.key().username == username && e.value().conn.is_connected())
            .map(|e| e.value().conn.clone())
    }

    fn local_username(&self) -> String {
        self.local_username
            .lock()
            .expect("local_username lock poisoned")
            .clone()
    }

    /// Return the pooled connection for `key`, or dial a new one and run
    /// the `PeerInit` handshake. The loser of a concurrent create for the
    /// same key is disconnected.
    pub async fn get_or_add_message_connection(
        self: &Arc<Self>,
        username: &str,
        ip: Ipv4Addr,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>> {
        let key = ConnectionKey::peer(username, ip, port);

        if let Some(existing) = self.get_live(&key) {
            return Ok(existing);
        }

        self.evict_for_capacity().await;

        let conn = Connection::new(ip.to_string(), port, self.opts);
        let mc = MessageConnection::new(conn, ConnectionRole::Peer);
        mc.set_username(username);
        self.wire_connection(&key, &mc);

        mc.connection().connect(cancel).await?;

        let init = PeerInit::new(self.local_username(), ConnectionKind::Peer, next_token());
        mc.send_message(&init.to_message()?, cancel).await?;
        mc.start_read_loop();

        Ok(self.insert_or_adopt(key, mc).await)
    }

    /// Adopt an inbound "P" connection whose `PeerInit` the listener already
    /// consumed.
    pub async fn add_inbound_connection(
        self: &Arc<Self>,
        init: &PeerInit,
        mc: Arc<MessageConnection>,
    ) -> Arc<MessageConnection> {
        let (ip, port) = match mc.connection().peer_addr() {
            Some(std::net::SocketAddr::V4(v4)) => (*v4.ip(), v4.port()),
            _ => (Ipv4Addr::UNSPECIFIED, mc.connection().port()),
        };
        let key = ConnectionKey::peer(&init.username, ip, port);

        mc.set_username(&init.username);
        self.wire_connection(&key, &mc);
        mc.start_read_loop();

        self.evict_for_capacity().await;
        let adopted = self.insert_or_adopt(key, mc).await;

        // A freshly pierced link may be the answer to a pending indirect
        // solicitation for this user.
        let wait_key = WaitKey::IndirectConnect {
            username: init.username.clone(),
            token: init.token,
        };
        self.waiter.complete(&wait_key, adopted.clone());

        adopted
    }

    /// Race a direct dial against a server-mediated indirect connect.
    ///
    /// The `IndirectConnect` wait is registered before `solicit` sends the
    /// `ConnectToPeer`, so even an instant pierce-back is caught. Whichever
    /// side completes first wins; the loser is torn down.
    pub async fn connect_with_fallback(
        self: &Arc<Self>,
        username: &str,
        ip: Ipv4Addr,
        port: u16,
        token: u32,
        solicit: impl Future<Output = Result<()>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>> {
        let indirect_key = WaitKey::IndirectConnect {
            username: username.to_string(),
            token,
        };

        let direct_cancel = cancel.child_token();
        let mut indirect = std::pin::pin!(self.waiter.wait::<Arc<MessageConnection>>(
            indirect_key.clone(),
            Some(self.opts.connect_timeout * 2),
            cancel,
        ));

        solicit.await.context("indirect solicitation failed")?;

        let mut direct = std::pin::pin!(
            self.get_or_add_message_connection(username, ip, port, &direct_cancel)
        );

        select! {
            direct = &mut direct => match direct {
                Ok(conn) => {
                    // Direct won; abandon the solicitation.
                    self.waiter.abandon(&indirect_key);
                    Ok(conn)
                },
                Err(e) => {
                    debug!("direct connect to {username} failed, awaiting pierce: {e}");
                    Ok(indirect.await?)
                },
            },
            indirect = &mut indirect => {
                direct_cancel.cancel();
                let conn = indirect?;
                Ok(conn)
            },
        }
    }

    /// Open the transfer socket a `ConnectToPeer("F")` solicitation names:
    /// dial back, answer with the pierce token, and read the remote token
    /// off the first 4 bytes.
    pub async fn get_transfer_connection(
        &self,
        response: &ConnectToPeerResponse,
        cancel: &CancellationToken,
    ) -> Result<(Arc<TransferConnection>, u32)> {
        if response.kind != ConnectionKind::Transfer {
            bail!("expected an F solicitation, got {}", response.kind);
        }

        let conn = Connection::new(response.ip.to_string(), response.port, self.opts);
        conn.connect(cancel).await?;

        let tc = TransferConnection::new(conn, 0);
        let pierce = PierceFirewall::new(response.token);
        tc.connection()
            .write(&pierce.to_message()?.to_bytes(), cancel)
            .await?;

        let remote_token = tc.read_token(cancel).await?;
        Ok((tc, remote_token))
    }

    /// Drop a pooled entry; the waiter resolves that user's pending waits
    /// with `Disconnected`.
    pub fn remove(&self, key: &ConnectionKey) {
        if self.connections.remove(key).is_some() {
            self.waiter.disconnect_user(&key.username);
        }
    }

    pub async fn disconnect_all(&self, reason: &str) {
        let entries: Vec<_> = self
            .connections
            .iter()
            .map(|e| (e.key().clone(), e.value().conn.clone()))
            .collect();
        for (key, conn) in entries {
            conn.disconnect(reason).await;
            self.connections.remove(&key);
        }
    }

    fn get_live(&self, key: &ConnectionKey) -> Option<Arc<MessageConnection>> {
        let entry = self.connections.get(key)?;
        if entry.conn.is_connected() {
            *entry
                .last_active
                .lock()
                .expect("last_active lock poisoned") = Instant::now();
            return Some(entry.conn.clone());
        }
        drop(entry);
        // Dead entries leave the map before any new attempt on the key.
        self.connections.remove(key);
        None
    }

    /// Install the removal hook and the peer-message handler.
    fn wire_connection(self: &Arc<Self>, key: &ConnectionKey, mc: &Arc<MessageConnection>) {
        if let Some(cb) = self.message_callback.get() {
            mc.set_on_message(cb.clone());
        }

        let weak = Arc::downgrade(self);
        let key = key.clone();
        mc.connection()
            .set_on_state_change(Box::new(move |_prev, next, msg| {
                if next == ConnectionState::Disconnected
                    && let Some(mgr) = weak.upgrade()
                {
                    debug!("peer connection {key:?} closed: {msg}");
                    mgr.remove(&key);
                }
            }));
    }

    /// Insert the new connection unless a concurrent creator won the race,
    /// in which case ours is disconnected and the existing one returned.
    async fn insert_or_adopt(
        &self,
        key: ConnectionKey,
        mc: Arc<MessageConnection>,
    ) -> Arc<MessageConnection> {
        let existing = {
            match self.connections.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                    if occ.get().conn.is_connected() {
                        Some(occ.get().conn.clone())
                    } else {
                        occ.insert(Arc::new(PeerEntry {
                            conn: mc.clone(),
                            last_active: StdMutex::new(Instant::now()),
                        }));
                        None
                    }
                },
                dashmap::mapref::entry::Entry::Vacant(vac) => {
                    vac.insert(Arc::new(PeerEntry {
                        conn: mc.clone(),
                        last_active: StdMutex::new(Instant::now()),
                    }));
                    None
                },
            }
        };

        match existing {
            Some(winner) => {
                mc.disconnect("lost connection race").await;
                winner
            },
            None => mc,
        }
    }

    /// Disconnect and drop least-recently-used entries until below the cap.
    async fn evict_for_capacity(&self) {
        let limit = self.cfg.concurrent_message_connections as usize;
        while self.connections.len() >= limit {
            let oldest = self
                .connections
                .iter()
                .min_by_key(|e| {
                    *e.value()
                        .last_active
                        .lock()
                        .expect("last_active lock poisoned")
                })
                .map(|e| (e.key().clone(), e.value().conn.clone()));

            let Some((key, conn)) = oldest else { return };
            warn!("peer pool at capacity; evicting {key:?}");
            conn.disconnect("evicted (pool at capacity)").await;
            self.connections.remove(&key);
        }
    }
}
