// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-to-server messages.
//!
//! Each request owns its fields and encodes itself with
//! [`MessageBuilder`]; field order is the wire order.

use crate::{
    error::CodecError,
    models::{
        codes::{ConnectionKind, ServerCode},
        frame::{Message, MessageBuilder},
    },
    utils::md5_hex,
};

/// Protocol version advertised at login.
pub const LOGIN_VERSION: u32 = 181;
/// Minor version advertised at login.
pub const LOGIN_MINOR_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn to_message(&self) -> Result<Message, CodecError> {
        let proof = md5_hex(&format!("{}{}", self.username, self.password));
        MessageBuilder::new()
            .write_code(ServerCode::Login)
            .write_string(&self.username)
            .write_string(&self.password)
            .write_u32(LOGIN_VERSION)
            .write_string(&proof)
            .write_u32(LOGIN_MINOR_VERSION)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetListenPortRequest {
    pub port: u16,
}

impl SetListenPortRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::SetListenPort)
            .write_u32(self.port as u32)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct GetPeerAddressRequest {
    pub username: String,
}

impl GetPeerAddressRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::GetPeerAddress)
            .write_string(&self.username)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct AddUserRequest {
    pub username: String,
}

impl AddUserRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::AddUser)
            .write_string(&self.username)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct GetStatusRequest {
    pub username: String,
}

impl GetStatusRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::GetStatus)
            .write_string(&self.username)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct SayInChatRoomRequest {
    pub room: String,
    pub message: String,
}

impl SayInChatRoomRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::SayInChatRoom)
            .write_string(&self.room)
            .write_string(&self.message)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct JoinRoomRequest {
    pub room: String,
}

impl JoinRoomRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::JoinRoom)
            .write_string(&self.room)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct LeaveRoomRequest {
    pub room: String,
}

impl LeaveRoomRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::LeaveRoom)
            .write_string(&self.room)
            .build()
    }
}

/// Ask the server to have `username` connect back to us because a direct
/// attempt is not (or may not be) routable.
#[derive(Debug, Clone)]
pub struct ConnectToPeerRequest {
    pub token: u32,
    pub username: String,
    pub kind: ConnectionKind,
}

impl ConnectToPeerRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::ConnectToPeer)
            .write_u32(self.token)
            .write_string(&self.username)
            .write_string(self.kind.as_str())
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct PrivateMessageRequest {
    pub username: String,
    pub message: String,
}

impl PrivateMessageRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::PrivateMessage)
            .write_string(&self.username)
            .write_string(&self.message)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcknowledgePrivateMessageRequest {
    pub id: u32,
}

impl AcknowledgePrivateMessageRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::AcknowledgePrivateMessage)
            .write_u32(self.id)
            .build()
    }
}

/// Advertise the size of the local share after login.
#[derive(Debug, Clone, Copy)]
pub struct SharedFoldersFilesRequest {
    pub directories: u32,
    pub files: u32,
}

impl SharedFoldersFilesRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::SharedFoldersFiles)
            .write_u32(self.directories)
            .write_u32(self.files)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RoomListRequest;

impl RoomListRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new().write_code(ServerCode::RoomList).build()
    }
}

/// Where a search is sent: the whole network through the overlay, one
/// room's members, or a single user's share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SearchScope {
    #[default]
    Network,
    Room(String),
    User(String),
}

/// Search submission. The scope picks the server message: a network search
/// fans out through the overlay, room and user searches go straight to the
/// named targets.
#[derive(Debug, Clone)]
pub struct FileSearchRequest {
    pub scope: SearchScope,
    pub token: u32,
    pub query: String,
}

impl FileSearchRequest {
    pub fn network(token: u32, query: impl Into<String>) -> Self {
        Self {
            scope: SearchScope::Network,
            token,
            query: query.into(),
        }
    }

    pub fn to_message(&self) -> Result<Message, CodecError> {
        match &self.scope {
            SearchScope::Network => MessageBuilder::new()
                .write_code(ServerCode::SearchRequest)
                .write_u32(self.token)
                .write_string(&self.query)
                .build(),
            SearchScope::Room(room) => MessageBuilder::new()
                .write_code(ServerCode::RoomSearch)
                .write_string(room)
                .write_u32(self.token)
                .write_string(&self.query)
                .build(),
            SearchScope::User(username) => MessageBuilder::new()
                .write_code(ServerCode::UserSearch)
                .write_string(username)
                .write_u32(self.token)
                .write_string(&self.query)
                .build(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PingRequest;

impl PingRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new().write_code(ServerCode::Ping).build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HaveNoParentRequest {
    pub have_no_parent: bool,
}

impl HaveNoParentRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::HaveNoParent)
            .write_byte(self.have_no_parent as u8)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcceptChildrenRequest {
    pub accept: bool,
}

impl AcceptChildrenRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::AcceptChildren)
            .write_byte(self.accept as u8)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BranchLevelRequest {
    pub level: u32,
}

impl BranchLevelRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::BranchLevel)
            .write_u32(self.level)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct BranchRootRequest {
    pub root: String,
}

impl BranchRootRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::BranchRoot)
            .write_string(&self.root)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChildDepthRequest {
    pub depth: u32,
}

impl ChildDepthRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::ChildDepth)
            .write_u32(self.depth)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcknowledgeNotifyPrivilegesRequest {
    pub token: u32,
}

impl AcknowledgeNotifyPrivilegesRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(ServerCode::AcknowledgeNotifyPrivileges)
            .write_u32(self.token)
            .build()
    }
}
