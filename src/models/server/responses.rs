// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-to-client messages.
//!
//! Decoders are lenient about trailing fields: the server has grown the tail
//! of several replies over the years, so anything after the documented core
//! is read only when present.

use std::net::Ipv4Addr;

use anyhow::Result;

use crate::models::{
    codes::ConnectionKind,
    frame::{Message, MessageReader},
};

/// Online state reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

impl UserStatus {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Away,
            2 => Self::Online,
            _ => Self::Offline,
        }
    }
}

/// Aggregate share statistics attached to several user replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserStats {
    pub average_speed: u32,
    pub upload_count: u64,
    pub file_count: u32,
    pub directory_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub name: String,
    pub user_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub success: bool,
    /// Greeting on success, rejection reason on failure.
    pub message: String,
    pub ip: Option<Ipv4Addr>,
    pub is_supporter: bool,
}

impl LoginResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let success = r.read_bool()?;
        let message = r.read_string()?;
        let mut ip = None;
        let mut is_supporter = false;
        if success && r.has_more() {
            ip = Some(r.read_ip()?);
            // Old servers stop here; newer ones add the password proof and
            // the supporter flag.
            if r.has_more() {
                let _password_proof = r.read_string()?;
            }
            if r.has_more() {
                is_supporter = r.read_bool()?;
            }
        }
        Ok(Self {
            success,
            message,
            ip,
            is_supporter,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddressResponse {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddressResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            username: r.read_string()?,
            ip: r.read_ip()?,
            port: r.read_u32()? as u16,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddUserResponse {
    pub username: String,
    pub exists: bool,
    pub status: Option<UserStatus>,
    pub stats: Option<UserStats>,
}

impl AddUserResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let username = r.read_string()?;
        let exists = r.read_bool()?;
        let mut status = None;
        let mut stats = None;
        if exists && r.has_more() {
            status = Some(UserStatus::from_u32(r.read_u32()?));
            if r.has_more() {
                stats = Some(UserStats {
                    average_speed: r.read_u32()?,
                    upload_count: r.read_u64()?,
                    file_count: r.read_u32()?,
                    directory_count: r.read_u32()?,
                });
            }
        }
        Ok(Self {
            username,
            exists,
            status,
            stats,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub username: String,
    pub status: UserStatus,
    pub privileged: bool,
}

impl StatusResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let username = r.read_string()?;
        let status = UserStatus::from_u32(r.read_u32()?);
        let privileged = if r.has_more() { r.read_bool()? } else { false };
        Ok(Self {
            username,
            status,
            privileged,
        })
    }
}

/// The server's side of the indirect handshake: `username` asked us to open
/// a `kind` connection to the given endpoint, authorized by `token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToPeerResponse {
    pub username: String,
    pub kind: ConnectionKind,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub token: u32,
    pub privileged: bool,
}

impl ConnectToPeerResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let username = r.read_string()?;
        let kind_str = r.read_string()?;
        let kind = ConnectionKind::from_letter(&kind_str)
            .ok_or_else(|| anyhow::anyhow!("ConnectToPeer: invalid kind {kind_str:?}"))?;
        let ip = r.read_ip()?;
        let port = r.read_u32()? as u16;
        let token = r.read_u32()?;
        let privileged = if r.has_more() { r.read_bool()? } else { false };
        Ok(Self {
            username,
            kind,
            ip,
            port,
            token,
            privileged,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessageResponse {
    pub id: u32,
    pub timestamp: u32,
    pub username: String,
    pub message: String,
    pub is_admin: bool,
}

impl PrivateMessageResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let id = r.read_u32()?;
        let timestamp = r.read_u32()?;
        let username = r.read_string()?;
        let message = r.read_string()?;
        let is_admin = if r.has_more() { r.read_bool()? } else { false };
        Ok(Self {
            id,
            timestamp,
            username,
            message,
            is_admin,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomListResponse {
    pub rooms: Vec<Room>,
}

impl RoomListResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let count = r.read_u32()? as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(r.read_string()?);
        }
        let count_counts = r.read_u32()? as usize;
        let mut rooms = Vec::with_capacity(count);
        for (i, name) in names.into_iter().enumerate() {
            let user_count = if i < count_counts { r.read_u32()? } else { 0 };
            rooms.push(Room { name, user_count });
        }
        Ok(Self { rooms })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedUsersResponse {
    pub users: Vec<String>,
}

impl PrivilegedUsersResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let count = r.read_u32()? as usize;
        let mut users = Vec::with_capacity(count);
        for _ in 0..count {
            users.push(r.read_string()?);
        }
        Ok(Self { users })
    }
}

macro_rules! u32_reply {
    ($name:ident, $field:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub $field: u32,
        }

        impl $name {
            pub fn from_message(msg: &Message) -> Result<Self> {
                let mut r = MessageReader::new(msg);
                Ok(Self {
                    $field: r.read_u32()?,
                })
            }
        }
    };
}

u32_reply!(ParentMinSpeedResponse, speed);
u32_reply!(ParentSpeedRatioResponse, ratio);
u32_reply!(WishlistIntervalResponse, seconds);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomJoinedResponse {
    pub room: String,
    pub users: Vec<String>,
}

impl RoomJoinedResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let room = r.read_string()?;
        let count = r.read_u32()? as usize;
        let mut users = Vec::with_capacity(count);
        for _ in 0..count {
            users.push(r.read_string()?);
        }
        // Status/stats blocks follow; nothing downstream consumes them.
        Ok(Self { room, users })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserJoinedRoomResponse {
    pub room: String,
    pub username: String,
}

impl UserJoinedRoomResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            room: r.read_string()?,
            username: r.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLeftRoomResponse {
    pub room: String,
    pub username: String,
}

impl UserLeftRoomResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            room: r.read_string()?,
            username: r.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessageResponse {
    pub room: String,
    pub username: String,
    pub message: String,
}

impl RoomMessageResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            room: r.read_string()?,
            username: r.read_string()?,
            message: r.read_string()?,
        })
    }
}

/// A search the server asks this client to run and fan out through the
/// overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSearchRequest {
    pub username: String,
    pub token: u32,
    pub query: String,
}

impl ServerSearchRequest {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            username: r.read_string()?,
            token: r.read_u32()?,
            query: r.read_string()?,
        })
    }
}

/// Parent candidates for the distributed overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfoResponse {
    pub candidates: Vec<(String, Ipv4Addr, u16)>,
}

impl NetInfoResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let count = r.read_u32()? as usize;
        let mut candidates = Vec::with_capacity(count);
        for _ in 0..count {
            let username = r.read_string()?;
            let ip = r.read_ip()?;
            let port = r.read_u32()? as u16;
            candidates.push((username, ip, port));
        }
        Ok(Self { candidates })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPrivilegesResponse {
    pub token: u32,
    pub username: String,
}

impl NotifyPrivilegesResponse {
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            token: r.read_u32()?,
            username: r.read_string()?,
        })
    }
}
