// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Messages exchanged over the distributed overlay ("D" connections).

use anyhow::Result;

use crate::{
    error::CodecError,
    models::{
        codes::DistributedCode,
        frame::{Message, MessageBuilder, MessageReader},
    },
};

/// Overlay keep-alive. Old peers send a bare ping; newer ones attach a token
/// that must be echoed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedPing {
    pub token: Option<u32>,
}

impl DistributedPing {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        let mut b = MessageBuilder::new().write_code(DistributedCode::Ping);
        if let Some(token) = self.token {
            b = b.write_u32(token);
        }
        b.build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let token = if r.has_more() { Some(r.read_u32()?) } else { None };
        Ok(Self { token })
    }
}

/// A search traveling down the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSearchRequest {
    pub username: String,
    pub token: u32,
    pub query: String,
}

impl DistributedSearchRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(DistributedCode::SearchRequest)
            .write_string(&self.username)
            .write_u32(self.token)
            .write_string(&self.query)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            username: r.read_string()?,
            token: r.read_u32()?,
            query: r.read_string()?,
        })
    }
}

/// Distance of the sender from the overlay root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedBranchLevel {
    pub level: u32,
}

impl DistributedBranchLevel {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(DistributedCode::BranchLevel)
            .write_u32(self.level)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            level: r.read_u32()?,
        })
    }
}

/// Username of the root of the sender's branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedBranchRoot {
    pub root: String,
}

impl DistributedBranchRoot {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(DistributedCode::BranchRoot)
            .write_string(&self.root)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            root: r.read_string()?,
        })
    }
}

/// Depth of the subtree below a child, reported upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedChildDepth {
    pub depth: u32,
}

impl DistributedChildDepth {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(DistributedCode::ChildDepth)
            .write_u32(self.depth)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            depth: r.read_u32()?,
        })
    }
}
