// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer-to-peer replies.
//!
//! `SearchResponse` and `BrowseResponse` travel zlib-compressed on the wire;
//! both sides of each are implemented because the client answers browse,
//! info and search queries through its resolver callbacks.

use anyhow::Result;

use crate::{
    error::CodecError,
    models::{
        codes::PeerCode,
        frame::{Message, MessageBuilder, MessageReader},
        peer::common::{Directory, File},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub username: String,
    pub token: u32,
    pub files: Vec<File>,
    pub slot_free: bool,
    pub average_speed: u32,
    pub queue_length: u64,
}

impl SearchResponse {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn to_message(&self) -> Result<Message, CodecError> {
        let mut b = MessageBuilder::new()
            .write_code(PeerCode::SearchResponse)
            .write_string(&self.username)
            .write_u32(self.token)
            .write_u32(self.files.len() as u32);
        for file in &self.files {
            b = file.write_to(b);
        }
        b.write_byte(self.slot_free as u8)
            .write_u32(self.average_speed)
            .write_u64(self.queue_length)
            .compress()
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        r.decompress()?;
        let username = r.read_string()?;
        let token = r.read_u32()?;
        let file_count = r.read_u32()? as usize;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            files.push(File::read_from(&mut r)?);
        }
        let slot_free = r.read_bool()?;
        let average_speed = r.read_u32()?;
        let queue_length = r.read_u64()?;
        Ok(Self {
            username,
            token,
            files,
            slot_free,
            average_speed,
            queue_length,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowseResponse {
    pub directories: Vec<Directory>,
}

impl BrowseResponse {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        let mut b = MessageBuilder::new()
            .write_code(PeerCode::BrowseResponse)
            .write_u32(self.directories.len() as u32);
        for dir in &self.directories {
            b = dir.write_to(b);
        }
        b.compress().build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        r.decompress()?;
        let dir_count = r.read_u32()? as usize;
        let mut directories = Vec::with_capacity(dir_count);
        for _ in 0..dir_count {
            directories.push(Directory::read_from(&mut r)?);
        }
        Ok(Self { directories })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoResponse {
    pub description: String,
    pub picture: Option<Vec<u8>>,
    pub total_upload_slots: u32,
    pub queue_length: u32,
    pub has_free_slots: bool,
}

impl InfoResponse {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        let mut b = MessageBuilder::new()
            .write_code(PeerCode::InfoResponse)
            .write_string(&self.description);
        match &self.picture {
            Some(pic) => {
                b = b
                    .write_byte(1)
                    .write_u32(pic.len() as u32)
                    .write_bytes(pic);
            },
            None => b = b.write_byte(0),
        }
        b.write_u32(self.total_upload_slots)
            .write_u32(self.queue_length)
            .write_byte(self.has_free_slots as u8)
            .build()
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut r = MessageReader::new(msg);
        let description = r.read_string()?;
        let picture = if r.read_bool()? {
            let len = r.read_u32()? as usize;
            Some(r.read_bytes(len)?.to_vec())
        } else {
            None
        };
        let total_upload_slots = r.read_u32()?;
        let queue_length = r.read_u32()?;
        let has_free_slots = r.read_bool()?;
        Ok(Self {
            description,
            picture,
            total_upload_slots,
            queue_length,
            has_free_slots,
        })
    }
}
