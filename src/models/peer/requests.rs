// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer-to-peer requests sent over "P" connections.

use anyhow::Result;

use crate::{
    error::CodecError,
    models::{
        codes::PeerCode,
        frame::{Message, MessageBuilder, MessageReader},
        peer::common::TransferDirection,
    },
};

#[derive(Debug, Clone, Copy)]
pub struct BrowseRequest;

impl BrowseRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(PeerCode::BrowseRequest)
            .build()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InfoRequest;

impl InfoRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new().write_code(PeerCode::InfoRequest).build()
    }
}

#[derive(Debug, Clone)]
pub struct PeerSearchRequest {
    pub token: u32,
    pub query: String,
}

impl PeerSearchRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(PeerCode::SearchRequest)
            .write_u32(self.token)
            .write_string(&self.query)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            token: r.read_u32()?,
            query: r.read_string()?,
        })
    }
}

/// Start of the transfer negotiation. A download request carries no size;
/// an upload request advertises the file size up front.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub token: u32,
    pub filename: String,
    pub file_size: Option<u64>,
}

impl TransferRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        let mut b = MessageBuilder::new()
            .write_code(PeerCode::TransferRequest)
            .write_u32(self.direction.as_u32())
            .write_u32(self.token)
            .write_string(&self.filename);
        if self.direction == TransferDirection::Upload {
            b = b.write_u64(self.file_size.unwrap_or(0));
        }
        b.build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let raw_direction = r.read_u32()?;
        let direction = TransferDirection::from_u32(raw_direction)
            .ok_or_else(|| anyhow::anyhow!("TransferRequest: bad direction {raw_direction}"))?;
        let token = r.read_u32()?;
        let filename = r.read_string()?;
        let file_size = if r.has_more() { Some(r.read_u64()?) } else { None };
        Ok(Self {
            direction,
            token,
            filename,
            file_size,
        })
    }
}

/// Answer to a [`TransferRequest`]. When allowed, an upload answer carries
/// the file size; a rejection carries the reason string instead.
#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub token: u32,
    pub allowed: bool,
    pub file_size: Option<u64>,
    pub reason: Option<String>,
}

impl TransferResponse {
    pub fn allow(token: u32, file_size: u64) -> Self {
        Self {
            token,
            allowed: true,
            file_size: Some(file_size),
            reason: None,
        }
    }

    pub fn reject(token: u32, reason: impl Into<String>) -> Self {
        Self {
            token,
            allowed: false,
            file_size: None,
            reason: Some(reason.into()),
        }
    }

    pub fn to_message(&self) -> Result<Message, CodecError> {
        let mut b = MessageBuilder::new()
            .write_code(PeerCode::TransferResponse)
            .write_u32(self.token)
            .write_byte(self.allowed as u8);
        if self.allowed {
            if let Some(size) = self.file_size {
                b = b.write_u64(size);
            }
        } else if let Some(reason) = &self.reason {
            b = b.write_string(reason);
        }
        b.build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let token = r.read_u32()?;
        let allowed = r.read_bool()?;
        let mut file_size = None;
        let mut reason = None;
        if allowed {
            if r.has_more() {
                file_size = Some(r.read_u64()?);
            }
        } else if r.has_more() {
            reason = Some(r.read_string()?);
        }
        Ok(Self {
            token,
            allowed,
            file_size,
            reason,
        })
    }
}

/// Ask the remote to queue `filename` for upload to us.
#[derive(Debug, Clone)]
pub struct QueueDownloadRequest {
    pub filename: String,
}

impl QueueDownloadRequest {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(PeerCode::QueueDownload)
            .write_string(&self.filename)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            filename: r.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueFailedResponse {
    pub filename: String,
    pub reason: String,
}

impl QueueFailedResponse {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(PeerCode::QueueFailed)
            .write_string(&self.filename)
            .write_string(&self.reason)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            filename: r.read_string()?,
            reason: r.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadFailedResponse {
    pub filename: String,
}

impl UploadFailedResponse {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        MessageBuilder::new()
            .write_code(PeerCode::UploadFailed)
            .write_string(&self.filename)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        Ok(Self {
            filename: r.read_string()?,
        })
    }
}
