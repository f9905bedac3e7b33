// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Weak};

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    client::{
        client::SoulseekClient,
        message_connection::{MessageCallback, MessageConnection},
        waiter::WaitKey,
    },
    error::ProtocolError,
    events::DiagnosticLevel,
    models::{
        codes::DistributedCode,
        distributed::{
            DistributedBranchLevel, DistributedBranchRoot, DistributedChildDepth,
            DistributedPing, DistributedSearchRequest,
        },
        frame::Message,
        server::responses::ServerSearchRequest,
    },
};

/// Decodes overlay messages: branch bookkeeping from the parent, pings from
/// children, and the search requests fanning down the tree.
pub struct DistributedMessageHandler {
    client: Weak<SoulseekClient>,
}

impl DistributedMessageHandler {
    pub fn new(client: Weak<SoulseekClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }

    /// Wrap the handler for a connection's read loop. Failures become
    /// `Warning` diagnostics and never reach the reader.
    pub fn callback(self: &Arc<Self>) -> MessageCallback {
        let handler = Arc::clone(self);
        Arc::new(move |conn, msg| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let code = msg.code;
                if let Err(e) = handler.handle_message_read(conn, msg).await
                    && let Some(client) = handler.client.upgrade()
                {
                    client.events().diagnostic(
                        DiagnosticLevel::Warning,
                        format!("distributed message {code} failed: {e:#}"),
                    );
                }
            })
        })
    }

    pub async fn handle_message_read(
        &self,
        conn: Arc<MessageConnection>,
        msg: Message,
    ) -> Result<()> {
        let Some(client) = self.client.upgrade() else {
            return Ok(());
        };
        let Some(code) = DistributedCode::from_u32(msg.code) else {
            bail!(ProtocolError::UnknownCode {
                namespace: "distributed",
                code: msg.code,
            });
        };

        match code {
            DistributedCode::Ping => {
                let ping = DistributedPing::from_message(&msg)?;
                trace!("distributed ping from {:?}", conn.username());
                let cancel = CancellationToken::new();
                conn.send_message(&ping.to_message()?, &cancel).await?;
            },
            DistributedCode::BranchLevel => {
                let level = DistributedBranchLevel::from_message(&msg)?.level;
                let Some(username) = conn.username() else {
                    bail!(ProtocolError::Unexpected(
                        "BranchLevel on an unidentified connection".into()
                    ));
                };
                let key = WaitKey::DistributedLevel {
                    username: username.clone(),
                };
                // During the parent handshake the race consumes the level;
                // afterwards a renewed level from the parent reshapes the
                // branch.
                if !client.waiter().complete(&key, level)
                    && client.distributed_manager().parent_username().as_deref()
                        == Some(username.as_str())
                {
                    client.distributed_manager().set_branch_level(level).await;
                }
            },
            DistributedCode::BranchRoot => {
                let root = DistributedBranchRoot::from_message(&msg)?.root;
                let Some(username) = conn.username() else {
                    bail!(ProtocolError::Unexpected(
                        "BranchRoot on an unidentified connection".into()
                    ));
                };
                client
                    .distributed_manager()
                    .note_branch_root(&username, root)
                    .await;
            },
            DistributedCode::ChildDepth => {
                let depth = DistributedChildDepth::from_message(&msg)?.depth;
                client.distributed_manager().set_child_depth(depth).await;
            },
            DistributedCode::SearchRequest => {
                let request = DistributedSearchRequest::from_message(&msg)?;
                client
                    .handle_distributed_search(ServerSearchRequest {
                        username: request.username,
                        token: request.token,
                        query: request.query,
                    })
                    .await;
            },
            // The server-relayed variant carries the same fields; it is
            // re-encoded as a child-facing SearchRequest by dissemination.
            DistributedCode::ServerSearchRequest => {
                let request = ServerSearchRequest::from_message(&msg)?;
                client.handle_distributed_search(request).await;
            },
        }
        Ok(())
    }
}
