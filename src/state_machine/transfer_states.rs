// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transfer lifecycle.
//!
//! ```text
//! Requested → Queued → Initializing → InProgress → Completed/*
//! ```
//!
//! Transitions only move forward; every `Completed` flavor is terminal.
//! Intermediate stages may be skipped (a transfer allowed immediately never
//! passes through `Queued`) but never revisited.

use crate::{
    error::OperationError,
    models::peer::{
        common::TransferDirection,
        requests::{QueueFailedResponse, TransferRequest},
    },
};

/// Why a transfer reached `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCompletion {
    Succeeded,
    Errored,
    Cancelled,
    TimedOut,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Queued,
    Initializing,
    InProgress,
    Completed(TransferCompletion),
}

impl TransferState {
    fn rank(&self) -> u8 {
        match self {
            TransferState::Requested => 0,
            TransferState::Queued => 1,
            TransferState::Initializing => 2,
            TransferState::InProgress => 3,
            TransferState::Completed(_) => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed(_))
    }

    /// Forward-only: strictly increasing rank, nothing past `Completed`.
    pub fn can_transition_to(&self, next: &TransferState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Book-keeping for one transfer in flight.
#[derive(Debug, Clone)]
pub struct TransferInternal {
    pub direction: TransferDirection,
    pub username: String,
    pub filename: String,
    pub token: u32,
    pub remote_token: Option<u32>,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub size: u64,
}

impl TransferInternal {
    pub fn new(
        direction: TransferDirection,
        username: impl Into<String>,
        filename: impl Into<String>,
        token: u32,
    ) -> Self {
        Self {
            direction,
            username: username.into(),
            filename: filename.into(),
            token,
            remote_token: None,
            state: TransferState::Requested,
            bytes_transferred: 0,
            size: 0,
        }
    }

    /// Apply a forward transition or refuse with `InvalidState`.
    pub fn transition(&mut self, next: TransferState) -> Result<(), OperationError> {
        if !self.state.can_transition_to(&next) {
            return Err(OperationError::InvalidState(format!(
                "transfer {}/{} cannot move {:?} -> {next:?}",
                self.username, self.token, self.state
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// What resolves a `Queued` download: the remote's own transfer request, or
/// its refusal.
#[derive(Debug, Clone)]
pub enum QueuedTransferOutcome {
    Request(TransferRequest),
    Failed(QueueFailedResponse),
}
