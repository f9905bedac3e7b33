// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Handshake messages opening a fresh peer socket.
//!
//! `PeerInit` announces who is connecting and for what role; `PierceFirewall`
//! answers an indirect solicitation by echoing the token the server relayed.

use anyhow::{Result, bail};

use crate::{
    error::CodecError,
    models::{
        codes::{ConnectionKind, InitCode},
        frame::{Message, MessageBuilder, MessageReader},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInit {
    pub username: String,
    pub kind: ConnectionKind,
    pub token: u32,
}

impl PeerInit {
    pub fn new(username: impl Into<String>, kind: ConnectionKind, token: u32) -> Self {
        Self {
            username: username.into(),
            kind,
            token,
        }
    }

    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(InitCode::PeerInit)
            .write_string(&self.username)
            .write_string(self.kind.as_str())
            .write_u32(self.token)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let username = r.read_string()?;
        let kind_str = r.read_string()?;
        let token = r.read_u32()?;
        let Some(kind) = ConnectionKind::from_letter(&kind_str) else {
            bail!("PeerInit: invalid connection kind {kind_str:?}");
        };
        Ok(Self {
            username,
            kind,
            token,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PierceFirewall {
    pub token: u32,
}

impl PierceFirewall {
    pub fn new(token: u32) -> Self {
        Self { token }
    }

    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(InitCode::PierceFirewall)
            .write_u32(self.token)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            token: r.read_u32()?,
        })
    }
}

/// Either of the two possible opening messages on an inbound socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitMessage {
    PeerInit(PeerInit),
    PierceFirewall(PierceFirewall),
}

impl InitMessage {
    pub fn from_message(msg: &Message) -> Result<Self> {
        match InitCode::from_u32(msg.code) {
            Some(InitCode::PeerInit) => Ok(Self::PeerInit(PeerInit::from_message(msg)?)),
            Some(InitCode::PierceFirewall) => {
                Ok(Self::PierceFirewall(PierceFirewall::from_message(msg)?))
            },
            None => bail!("not an init message: code {}", msg.code),
        }
    }
}
