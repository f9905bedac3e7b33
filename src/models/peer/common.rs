// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Records shared by several peer messages.

use crate::{
    error::CodecError,
    models::frame::{MessageBuilder, MessageReader},
};

/// Who moves the bytes: `Download` means the requester receives the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    pub fn as_u32(&self) -> u32 {
        match self {
            TransferDirection::Download => 0,
            TransferDirection::Upload => 1,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TransferDirection::Download),
            1 => Some(TransferDirection::Upload),
            _ => None,
        }
    }
}

/// One `(kind, value)` attribute pair attached to a shared file, e.g.
/// bitrate or duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttribute {
    pub kind: u32,
    pub value: u32,
}

/// A single shared file as carried in search and browse replies.
///
/// Sizes are `u64` in the API; the wire carries them as `i64` LE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub code: u8,
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

impl File {
    pub fn write_to(&self, b: MessageBuilder) -> MessageBuilder {
        let mut b = b
            .write_byte(self.code)
            .write_string(&self.filename)
            .write_u64(self.size)
            .write_string(&self.extension)
            .write_u32(self.attributes.len() as u32);
        for attr in &self.attributes {
            b = b.write_u32(attr.kind).write_u32(attr.value);
        }
        b
    }

    pub fn read_from(r: &mut MessageReader) -> Result<Self, CodecError> {
        let code = r.read_byte()?;
        let filename = r.read_string()?;
        let size = r.read_u64()?;
        let extension = r.read_string()?;
        let attr_count = r.read_u32()? as usize;
        let mut attributes = Vec::with_capacity(attr_count);
        for _ in 0..attr_count {
            attributes.push(FileAttribute {
                kind: r.read_u32()?,
                value: r.read_u32()?,
            });
        }
        Ok(Self {
            code,
            filename,
            size,
            extension,
            attributes,
        })
    }
}

/// A shared directory in a browse reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub name: String,
    pub files: Vec<File>,
}

impl Directory {
    pub fn write_to(&self, b: MessageBuilder) -> MessageBuilder {
        let mut b = b
            .write_string(&self.name)
            .write_u32(self.files.len() as u32);
        for file in &self.files {
            b = file.write_to(b);
        }
        b
    }

    pub fn read_from(r: &mut MessageReader) -> Result<Self, CodecError> {
        let name = r.read_string()?;
        let file_count = r.read_u32()? as usize;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            files.push(File::read_from(r)?);
        }
        Ok(Self { name, files })
    }
}
