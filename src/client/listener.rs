// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Inbound accept loop.
//!
//! Every peer socket opens with an init message that decides its fate:
//! `PeerInit("P")` joins the peer pool, `PeerInit("D")` becomes an overlay
//! child, `PeerInit("F")` and `PierceFirewall` answer pending transfer or
//! connect solicitations through the waiter.

use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::{ConnectionOptions, ListenerConfig},
    client::{
        client::SoulseekClient,
        connection::{Connection, ConnectionRole},
        message_connection::{MessageConnection, read_frame},
        transfer_connection::TransferConnection,
        waiter::WaitKey,
    },
    events::DiagnosticLevel,
    models::{
        codes::ConnectionKind,
        init::{InitMessage, PeerInit},
    },
};

pub struct Listener {
    cfg: ListenerConfig,
    opts: ConnectionOptions,
    bound_port: StdMutex<Option<u16>>,
    cancel: StdMutex<Option<CancellationToken>>,
    client: OnceCell<Weak<SoulseekClient>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("configured_port", &self.cfg.listen_port)
            .field("bound_port", &self.bound_port())
            .finish()
    }
}

impl Listener {
    pub fn new(cfg: ListenerConfig, opts: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            opts,
            bound_port: StdMutex::new(None),
            cancel: StdMutex::new(None),
            client: OnceCell::new(),
        })
    }

    pub fn attach_client(&self, client: Weak<SoulseekClient>) {
        let _ = self.client.set(client);
    }

    /// Port actually bound (differs from the configured one when that was 0).
    pub fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock().expect("bound_port lock poisoned")
    }

    /// Bind and spawn the accept loop. Returns the bound port.
    pub async fn start(self: &Arc<Self>) -> Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", self.cfg.listen_port))
            .await
            .with_context(|| format!("failed to bind listen port {}", self.cfg.listen_port))?;
        let port = listener.local_addr().context("listener has no local addr")?.port();
        *self.bound_port.lock().expect("bound_port lock poisoned") = Some(port);

        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = Some(token.clone());

        let me = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let stream = select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!("inbound connection from {addr}");
                            stream
                        },
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        },
                    },
                };
                let me = Arc::clone(&me);
                tokio::spawn(async move {
                    if let Err(e) = me.handle_inbound(stream).await {
                        debug!("inbound connection dropped: {e}");
                    }
                });
            }
        });

        Ok(port)
    }

    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().expect("cancel lock poisoned").take() {
            token.cancel();
        }
    }

    async fn handle_inbound(&self, stream: tokio::net::TcpStream) -> Result<()> {
        let Some(client) = self.client.get().and_then(Weak::upgrade) else {
            return Ok(());
        };

        let conn = Connection::from_stream(stream, self.opts)?;
        let session = conn.session_token();
        let msg = read_frame(&conn, &session).await?;
        let init = match InitMessage::from_message(&msg) {
            Ok(init) => init,
            Err(e) => {
                client.events().diagnostic(
                    DiagnosticLevel::Warning,
                    format!("undecodable init message: {e}"),
                );
                conn.disconnect("bad init message").await;
                return Err(e);
            },
        };

        match init {
            InitMessage::PeerInit(init) => match init.kind {
                ConnectionKind::Peer => {
                    let mc = MessageConnection::new(conn, ConnectionRole::Peer);
                    client
                        .peer_manager()
                        .add_inbound_connection(&init, mc)
                        .await;
                },
                ConnectionKind::Distributed => {
                    let mc = MessageConnection::new(conn, ConnectionRole::Distributed);
                    client
                        .distributed_manager()
                        .add_child_from_init(&init, mc)
                        .await?;
                },
                ConnectionKind::Transfer => {
                    self.resolve_transfer_socket(&client, conn, &init.username, init.token)
                        .await?;
                },
            },
            InitMessage::PierceFirewall(pierce) => {
                self.resolve_pierce(&client, conn, pierce.token).await?;
            },
        }
        Ok(())
    }

    /// An inbound "F" socket answers the oldest transfer solicitation for
    /// this `(username, token)`.
    async fn resolve_transfer_socket(
        &self,
        client: &Arc<SoulseekClient>,
        conn: Arc<Connection>,
        username: &str,
        token: u32,
    ) -> Result<()> {
        let key = client.waiter().find_key(|key| {
            matches!(
                key,
                WaitKey::IndirectTransfer { username: u, token: t, .. }
                    if u == username && *t == token
            )
        });
        match key {
            Some(key) => {
                let tc = TransferConnection::new(conn, 0);
                client.waiter().complete(&key, tc);
                Ok(())
            },
            None => {
                conn.disconnect("unsolicited transfer socket").await;
                anyhow::bail!("no pending transfer for {username} token {token}");
            },
        }
    }

    /// A pierce answers whichever solicitation registered its token: a
    /// message connection or a transfer socket.
    async fn resolve_pierce(
        &self,
        client: &Arc<SoulseekClient>,
        conn: Arc<Connection>,
        token: u32,
    ) -> Result<()> {
        let key = client.waiter().find_key(|key| match key {
            WaitKey::IndirectConnect { token: t, .. } => *t == token,
            WaitKey::IndirectTransfer { token: t, .. } => *t == token,
            _ => false,
        });

        match key {
            Some(WaitKey::IndirectConnect { username, token }) => {
                let mc = MessageConnection::new(conn, ConnectionRole::Peer);
                let init = PeerInit::new(username, ConnectionKind::Peer, token);
                client.peer_manager().add_inbound_connection(&init, mc).await;
                Ok(())
            },
            Some(key @ WaitKey::IndirectTransfer { .. }) => {
                let tc = TransferConnection::new(conn, 0);
                client.waiter().complete(&key, tc);
                Ok(())
            },
            _ => {
                conn.disconnect("unsolicited pierce").await;
                anyhow::bail!("no pending solicitation for token {token}");
            },
        }
    }
}
