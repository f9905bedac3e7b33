// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Message code namespaces.
//!
//! The wire reuses the same numeric space for server, peer and distributed
//! messages; the role of the carrying connection decides which enum applies.
//! Each enum serializes its native value, bit-exact to the protocol.

use core::fmt;

use thiserror::Error;

/// Returned when a code has no variant in the selected namespace.
#[derive(Debug, Error)]
#[error("unknown {namespace} code {code}")]
pub struct UnknownCode {
    pub namespace: &'static str,
    pub code: u32,
}

/// Role of a connection, carried as a one-letter string in the `PeerInit`
/// and `ConnectToPeer` handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Peer messaging ("P").
    Peer,
    /// File transfer ("F").
    Transfer,
    /// Distributed overlay ("D").
    Distributed,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Peer => "P",
            ConnectionKind::Transfer => "F",
            ConnectionKind::Distributed => "D",
        }
    }

    pub fn from_letter(s: &str) -> Option<Self> {
        match s {
            "P" => Some(ConnectionKind::Peer),
            "F" => Some(ConnectionKind::Transfer),
            "D" => Some(ConnectionKind::Distributed),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server namespace.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerCode {
    Login = 1,
    GetPeerAddress = 3,
    AddUser = 5,
    GetStatus = 7,
    SayInChatRoom = 13,
    JoinRoom = 14,
    LeaveRoom = 15,
    UserJoinedRoom = 16,
    UserLeftRoom = 17,
    ConnectToPeer = 18,
    PrivateMessage = 22,
    AcknowledgePrivateMessage = 26,
    SetListenPort = 28,
    SharedFoldersFiles = 35,
    Relogged = 41,
    UserSearch = 42,
    RoomList = 64,
    PrivilegedUsers = 69,
    HaveNoParent = 71,
    ParentMinSpeed = 83,
    ParentSpeedRatio = 84,
    SearchRequest = 93,
    AcceptChildren = 100,
    NetInfo = 102,
    WishlistInterval = 104,
    RoomSearch = 120,
    NotifyPrivileges = 124,
    AcknowledgeNotifyPrivileges = 125,
    BranchLevel = 126,
    BranchRoot = 127,
    ChildDepth = 129,
    Ping = 133,
}

impl ServerCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Login,
            3 => Self::GetPeerAddress,
            5 => Self::AddUser,
            7 => Self::GetStatus,
            13 => Self::SayInChatRoom,
            14 => Self::JoinRoom,
            15 => Self::LeaveRoom,
            16 => Self::UserJoinedRoom,
            17 => Self::UserLeftRoom,
            18 => Self::ConnectToPeer,
            22 => Self::PrivateMessage,
            26 => Self::AcknowledgePrivateMessage,
            28 => Self::SetListenPort,
            35 => Self::SharedFoldersFiles,
            41 => Self::Relogged,
            42 => Self::UserSearch,
            64 => Self::RoomList,
            69 => Self::PrivilegedUsers,
            71 => Self::HaveNoParent,
            83 => Self::ParentMinSpeed,
            84 => Self::ParentSpeedRatio,
            93 => Self::SearchRequest,
            100 => Self::AcceptChildren,
            102 => Self::NetInfo,
            104 => Self::WishlistInterval,
            120 => Self::RoomSearch,
            124 => Self::NotifyPrivileges,
            125 => Self::AcknowledgeNotifyPrivileges,
            126 => Self::BranchLevel,
            127 => Self::BranchRoot,
            129 => Self::ChildDepth,
            133 => Self::Ping,
            _ => return None,
        })
    }
}

impl TryFrom<u32> for ServerCode {
    type Error = UnknownCode;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Self::from_u32(v).ok_or(UnknownCode {
            namespace: "server",
            code: v,
        })
    }
}

impl From<ServerCode> for u32 {
    fn from(c: ServerCode) -> u32 {
        c as u32
    }
}

/// Peer namespace.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerCode {
    BrowseRequest = 4,
    BrowseResponse = 5,
    SearchRequest = 8,
    SearchResponse = 9,
    InfoRequest = 15,
    InfoResponse = 16,
    TransferRequest = 40,
    TransferResponse = 41,
    QueueDownload = 43,
    UploadFailed = 46,
    QueueFailed = 50,
}

impl PeerCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            4 => Self::BrowseRequest,
            5 => Self::BrowseResponse,
            8 => Self::SearchRequest,
            9 => Self::SearchResponse,
            15 => Self::InfoRequest,
            16 => Self::InfoResponse,
            40 => Self::TransferRequest,
            41 => Self::TransferResponse,
            43 => Self::QueueDownload,
            46 => Self::UploadFailed,
            50 => Self::QueueFailed,
            _ => return None,
        })
    }
}

impl TryFrom<u32> for PeerCode {
    type Error = UnknownCode;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Self::from_u32(v).ok_or(UnknownCode {
            namespace: "peer",
            code: v,
        })
    }
}

impl From<PeerCode> for u32 {
    fn from(c: PeerCode) -> u32 {
        c as u32
    }
}

/// Distributed overlay namespace.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributedCode {
    Ping = 0,
    SearchRequest = 3,
    BranchLevel = 4,
    BranchRoot = 5,
    ChildDepth = 7,
    ServerSearchRequest = 93,
}

impl DistributedCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Ping,
            3 => Self::SearchRequest,
            4 => Self::BranchLevel,
            5 => Self::BranchRoot,
            7 => Self::ChildDepth,
            93 => Self::ServerSearchRequest,
            _ => return None,
        })
    }
}

impl TryFrom<u32> for DistributedCode {
    type Error = UnknownCode;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Self::from_u32(v).ok_or(UnknownCode {
            namespace: "distributed",
            code: v,
        })
    }
}

impl From<DistributedCode> for u32 {
    fn from(c: DistributedCode) -> u32 {
        c as u32
    }
}

/// Initialization namespace: the first message on any freshly opened peer
/// socket, before the connection has a role.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitCode {
    PierceFirewall = 0,
    PeerInit = 1,
}

impl InitCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::PierceFirewall,
            1 => Self::PeerInit,
            _ => return None,
        })
    }
}

impl TryFrom<u32> for InitCode {
    type Error = UnknownCode;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Self::from_u32(v).ok_or(UnknownCode {
            namespace: "init",
            code: v,
        })
    }
}

impl From<InitCode> for u32 {
    fn from(c: InitCode) -> u32 {
        c as u32
    }
}
