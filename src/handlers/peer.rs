// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Weak};

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    client::{
        client::SoulseekClient,
        message_connection::{MessageCallback, MessageConnection},
        waiter::WaitKey,
    },
    error::ProtocolError,
    events::{ClientEvent, DiagnosticLevel},
    models::{
        codes::PeerCode,
        frame::Message,
        peer::{
            common::TransferDirection,
            requests::{
                PeerSearchRequest, QueueDownloadRequest, QueueFailedResponse,
                TransferRequest, TransferResponse, UploadFailedResponse,
            },
            responses::{BrowseResponse, InfoResponse, SearchResponse},
        },
    },
    state_machine::transfer_states::QueuedTransferOutcome,
};

/// Decodes messages arriving on "P" connections and completes the waits
/// keyed by the remote peer.
pub struct PeerMessageHandler {
    client: Weak<SoulseekClient>,
}

impl PeerMessageHandler {
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
                        format!("peer message {code} failed: {e:#}"),
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
        let Some(code) = PeerCode::from_u32(msg.code) else {
            bail!(ProtocolError::UnknownCode {
                namespace: "peer",
                code: msg.code,
            });
        };
        let Some(username) = conn.username() else {
            bail!(ProtocolError::Unexpected(format!(
                "peer message {code:?} on a connection with no identity"
            )));
        };

        match code {
            PeerCode::BrowseRequest => {
                client.answer_browse_request(&conn).await?;
            },
            PeerCode::BrowseResponse => {
                let response = BrowseResponse::from_message(&msg)?;
                let key = WaitKey::PeerReply {
                    code,
                    username: username.clone(),
                };
                client.waiter().complete(&key, response);
            },
            PeerCode::InfoRequest => {
                client.answer_info_request(&conn).await?;
            },
            PeerCode::InfoResponse => {
                let response = InfoResponse::from_message(&msg)?;
                let key = WaitKey::PeerReply {
                    code,
                    username: username.clone(),
                };
                client.waiter().complete(&key, response);
            },
            PeerCode::SearchRequest => {
                let request = PeerSearchRequest::from_message(&msg)?;
                client
                    .answer_peer_search(&conn, request.token, &request.query)
                    .await?;
            },
            PeerCode::SearchResponse => {
                let response = SearchResponse::from_message(&msg)?;
                client.route_search_response(response);
            },
            PeerCode::TransferRequest => {
                let request = TransferRequest::from_message(&msg)?;
                self.handle_transfer_request(&client, &conn, &username, request)
                    .await?;
            },
            PeerCode::TransferResponse => {
                let response = TransferResponse::from_message(&msg)?;
                let key = WaitKey::TransferResponse {
                    username: username.clone(),
                    token: response.token,
                };
                client.waiter().complete(&key, response);
            },
            PeerCode::QueueDownload => {
                let request = QueueDownloadRequest::from_message(&msg)?;
                // No upload pipeline behind the resolver yet; decline
                // honestly rather than leaving the remote queued forever.
                client.events().emit(ClientEvent::TransferRequested {
                    username: username.clone(),
                    request: TransferRequest {
                        direction: TransferDirection::Download,
                        token: 0,
                        filename: request.filename.clone(),
                        file_size: None,
                    },
                });
                let refusal = QueueFailedResponse {
                    filename: request.filename,
                    reason: "Cancelled".into(),
                };
                let cancel = CancellationToken::new();
                conn.send_message(&refusal.to_message()?, &cancel).await?;
            },
            PeerCode::QueueFailed => {
                let failed = QueueFailedResponse::from_message(&msg)?;
                debug!(
                    "{username} failed our queued transfer of {}: {}",
                    failed.filename, failed.reason
                );
                let key = WaitKey::TransferQueued {
                    username: username.clone(),
                    filename: failed.filename.clone(),
                };
                client
                    .waiter()
                    .complete(&key, QueuedTransferOutcome::Failed(failed));
            },
            PeerCode::UploadFailed => {
                let failed = UploadFailedResponse::from_message(&msg)?;
                let key = WaitKey::TransferQueued {
                    username: username.clone(),
                    filename: failed.filename.clone(),
                };
                client.waiter().complete(
                    &key,
                    QueuedTransferOutcome::Failed(QueueFailedResponse {
                        filename: failed.filename,
                        reason: "upload failed".into(),
                    }),
                );
            },
        }
        Ok(())
    }

    /// An inbound transfer negotiation. An upload offer matching one of our
    /// queued downloads resumes that download; anything else is surfaced as
    /// an event and declined.
    async fn handle_transfer_request(
        &self,
        client: &Arc<SoulseekClient>,
        conn: &Arc<MessageConnection>,
        username: &str,
        request: TransferRequest,
    ) -> Result<()> {
        match request.direction {
            TransferDirection::Upload => {
                let key = WaitKey::TransferQueued {
                    username: username.to_string(),
                    filename: request.filename.clone(),
                };
                let resumed = client
                    .waiter()
                    .complete(&key, QueuedTransferOutcome::Request(request.clone()));
                if !resumed {
                    client.events().emit(ClientEvent::TransferRequested {
                        username: username.to_string(),
                        request: request.clone(),
                    });
                    let refusal = TransferResponse::reject(request.token, "Cancelled");
                    let cancel = CancellationToken::new();
                    conn.send_message(&refusal.to_message()?, &cancel).await?;
                }
            },
            TransferDirection::Download => {
                // The remote wants a file from us; uploads are the
                // application's call, so raise the event and decline.
                client.events().emit(ClientEvent::TransferRequested {
                    username: username.to_string(),
                    request: request.clone(),
                });
                let refusal = TransferResponse::reject(request.token, "Cancelled");
                let cancel = CancellationToken::new();
                conn.send_message(&refusal.to_message()?, &cancel).await?;
            },
        }
        Ok(())
    }
}
