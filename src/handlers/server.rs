// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Weak};

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::{
    client::{
        client::SoulseekClient,
        distributed_manager::ParentCandidate,
        message_connection::{MessageCallback, MessageConnection},
        waiter::WaitKey,
    },
    error::ProtocolError,
    events::{ClientEvent, DiagnosticLevel},
    models::{
        codes::ServerCode,
        frame::{Message, MessageReader},
        server::{
            requests::AcknowledgeNotifyPrivilegesRequest,
            responses::{
                AddUserResponse, ConnectToPeerResponse, LoginResponse, NetInfoResponse,
                NotifyPrivilegesResponse, ParentMinSpeedResponse, ParentSpeedRatioResponse,
                PeerAddressResponse, PrivateMessageResponse, PrivilegedUsersResponse,
                RoomJoinedResponse, RoomListResponse, RoomMessageResponse, StatusResponse,
                UserJoinedRoomResponse, UserLeftRoomResponse, WishlistIntervalResponse,
            },
        },
    },
};

/// Decodes server messages, completes the matching waits, raises domain
/// events, and routes `ConnectToPeer` to the appropriate manager.
pub struct ServerMessageHandler {
    client: Weak<SoulseekClient>,
}

impl ServerMessageHandler {
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
                        format!("server message {code} failed: {e:#}"),
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
        let Some(code) = ServerCode::from_u32(msg.code) else {
            bail!(ProtocolError::UnknownCode {
                namespace: "server",
                code: msg.code,
            });
        };

        match code {
            ServerCode::Login => {
                let response = LoginResponse::from_message(&msg)?;
                client
                    .waiter()
                    .complete(&WaitKey::ServerReply(ServerCode::Login), response);
            },
            ServerCode::GetPeerAddress => {
                let response = PeerAddressResponse::from_message(&msg)?;
                let key = WaitKey::ServerUser {
                    code,
                    username: response.username.clone(),
                };
                client.waiter().complete(&key, response);
            },
            ServerCode::AddUser => {
                let response = AddUserResponse::from_message(&msg)?;
                let key = WaitKey::ServerUser {
                    code,
                    username: response.username.clone(),
                };
                client.waiter().complete(&key, response);
            },
            ServerCode::GetStatus => {
                let response = StatusResponse::from_message(&msg)?;
                let key = WaitKey::ServerUser {
                    code,
                    username: response.username.clone(),
                };
                client.events().emit(ClientEvent::UserStatusChanged(response.clone()));
                client.waiter().complete(&key, response);
            },
            ServerCode::ParentMinSpeed => {
                let response = ParentMinSpeedResponse::from_message(&msg)?;
                client.waiter().complete(&WaitKey::ServerReply(code), response);
            },
            ServerCode::ParentSpeedRatio => {
                let response = ParentSpeedRatioResponse::from_message(&msg)?;
                client.waiter().complete(&WaitKey::ServerReply(code), response);
            },
            ServerCode::WishlistInterval => {
                let response = WishlistIntervalResponse::from_message(&msg)?;
                client.waiter().complete(&WaitKey::ServerReply(code), response);
            },
            ServerCode::PrivilegedUsers => {
                let response = PrivilegedUsersResponse::from_message(&msg)?;
                client.waiter().complete(&WaitKey::ServerReply(code), response);
            },
            ServerCode::RoomList => {
                let response = RoomListResponse::from_message(&msg)?;
                client.waiter().complete(&WaitKey::ServerReply(code), response);
            },
            ServerCode::Ping => {
                client.waiter().complete(&WaitKey::ServerReply(code), ());
            },
            ServerCode::ConnectToPeer => {
                let response = ConnectToPeerResponse::from_message(&msg)?;
                debug!(
                    "connect-to-peer: {} wants a {} connection",
                    response.username, response.kind
                );
                client.handle_connect_to_peer(response);
            },
            ServerCode::PrivateMessage => {
                let response = PrivateMessageResponse::from_message(&msg)?;
                let id = response.id;
                client.events().emit(ClientEvent::PrivateMessage(response));
                if client.auto_acknowledge_private_messages()
                    && let Err(e) = client.acknowledge_private_message(id).await
                {
                    warn!("failed to acknowledge private message {id}: {e}");
                }
            },
            ServerCode::SayInChatRoom => {
                let response = RoomMessageResponse::from_message(&msg)?;
                client.events().emit(ClientEvent::RoomMessage(response));
            },
            ServerCode::JoinRoom => {
                let response = RoomJoinedResponse::from_message(&msg)?;
                let key = WaitKey::ServerRoom {
                    code,
                    room: response.room.clone(),
                };
                client.events().emit(ClientEvent::RoomJoined(response.clone()));
                client.waiter().complete(&key, response);
            },
            ServerCode::LeaveRoom => {
                let mut r = MessageReader::new(&msg);
                let room = r.read_string()?;
                let key = WaitKey::ServerRoom {
                    code,
                    room: room.clone(),
                };
                client.events().emit(ClientEvent::RoomLeft { room: room.clone() });
                client.waiter().complete(&key, room);
            },
            ServerCode::UserJoinedRoom => {
                let response = UserJoinedRoomResponse::from_message(&msg)?;
                client.events().emit(ClientEvent::UserJoinedRoom(response));
            },
            ServerCode::UserLeftRoom => {
                let response = UserLeftRoomResponse::from_message(&msg)?;
                client.events().emit(ClientEvent::UserLeftRoom(response));
            },
            ServerCode::Relogged => {
                warn!("kicked from server: logged in elsewhere");
                client.events().emit(ClientEvent::KickedFromServer);
            },
            ServerCode::NotifyPrivileges => {
                let response = NotifyPrivilegesResponse::from_message(&msg)?;
                let token = response.token;
                client
                    .events()
                    .emit(ClientEvent::PrivilegeNotification(response));
                if client.auto_acknowledge_privilege_notifications() {
                    let ack = AcknowledgeNotifyPrivilegesRequest { token };
                    if let Err(e) = client.send_server_message(&ack.to_message()?).await {
                        warn!("failed to acknowledge privilege notification: {e}");
                    }
                }
            },
            ServerCode::NetInfo => {
                let response = NetInfoResponse::from_message(&msg)?;
                let candidates: Vec<ParentCandidate> = response
                    .candidates
                    .into_iter()
                    .map(|(username, ip, port)| ParentCandidate { username, ip, port })
                    .collect();
                let manager = Arc::clone(client.distributed_manager());
                tokio::spawn(async move {
                    let cancel = tokio_util::sync::CancellationToken::new();
                    if let Err(e) = manager.add_parent_connection(candidates, &cancel).await {
                        debug!("parent adoption failed: {e}");
                    }
                });
            },
            // Search fan-out arrives with a distributed-space code; hand the
            // frame to the distributed handler untouched.
            ServerCode::SearchRequest => {
                if let Some(handler) = client.distributed_handler() {
                    handler.handle_message_read(conn, msg).await?;
                }
            },
            other => {
                bail!(ProtocolError::Unexpected(format!(
                    "server sent client-only code {other:?}"
                )));
            },
        }
        Ok(())
    }
}
