// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Failures while reading fields out of a message payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A fixed-width field extends past the end of the payload.
    #[error("truncated {what} at offset {offset} (payload is {len} bytes)")]
    TruncatedField {
        what: &'static str,
        offset: usize,
        len: usize,
    },

    /// A string length prefix points beyond the end of the payload.
    #[error("string of {declared} bytes at offset {offset} overruns payload of {len} bytes")]
    StringOverrun {
        declared: i64,
        offset: usize,
        len: usize,
    },

    /// zlib inflation of a compressed payload failed.
    #[error("failed to decompress payload: {0}")]
    Decompress(#[source] std::io::Error),

    /// zlib deflation of an outgoing payload failed.
    #[error("failed to compress payload: {0}")]
    Compress(#[source] std::io::Error),

    /// `seek` was asked to move outside the payload.
    #[error("seek to {pos} outside payload of {len} bytes")]
    SeekOutOfBounds { pos: usize, len: usize },
}

/// Fatal errors for a single TCP connection. Any of these leaves the
/// connection in the `Disconnected` state.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("{what} timed out")]
    Timeout { what: &'static str },

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The remote closed the socket, or the connection is already down.
    #[error("connection closed: {0}")]
    Closed(String),

    #[error("operation not permitted in state {state}")]
    InvalidState { state: &'static str },

    #[error("{what} cancelled")]
    Cancelled { what: &'static str },
}

/// Outcomes delivered to a caller awaiting a registered wait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaiterError {
    #[error("wait timed out")]
    TimedOut,

    #[error("wait cancelled")]
    Cancelled,

    #[error("connection disconnected while waiting")]
    Disconnected,

    /// The wait was completed with a value of a different type than the
    /// caller registered for.
    #[error("wait completed with an unexpected value type")]
    TypeMismatch,
}

/// Handler-level protocol violations. Reported as diagnostics, never fatal
/// for the reader loop.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected message: {0}")]
    Unexpected(String),

    #[error("request rejected by remote: {0}")]
    Rejected(String),

    #[error("unknown {namespace} message code {code}")]
    UnknownCode { namespace: &'static str, code: u32 },
}

/// Public API precondition failures.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation invalid in the current state: {0}")]
    InvalidState(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("token {0} is already in use")]
    DuplicateToken(u32),
}
