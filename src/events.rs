// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Diagnostic and domain event streams.
//!
//! Both streams are broadcast channels: subscription is optional, raising an
//! event with no subscribers is a no-op, and slow subscribers lag rather
//! than block the producer.

use tokio::sync::broadcast;

use crate::models::{
    peer::requests::TransferRequest,
    server::responses::{
        NotifyPrivilegesResponse, PrivateMessageResponse, RoomJoinedResponse,
        RoomMessageResponse, StatusResponse, UserJoinedRoomResponse, UserLeftRoomResponse,
    },
};

/// Severity floor for diagnostic subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    pub level: DiagnosticLevel,
    pub message: String,
}

/// Domain events surfaced to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    PrivateMessage(PrivateMessageResponse),
    RoomJoined(RoomJoinedResponse),
    RoomLeft { room: String },
    RoomMessage(RoomMessageResponse),
    UserJoinedRoom(UserJoinedRoomResponse),
    UserLeftRoom(UserLeftRoomResponse),
    UserStatusChanged(StatusResponse),
    KickedFromServer,
    PrivilegeNotification(NotifyPrivilegesResponse),
    /// A peer opened (or answered) a transfer negotiation with us.
    TransferRequested {
        username: String,
        request: TransferRequest,
    },
}

const CHANNEL_CAPACITY: usize = 256;

/// Shared fan-out point for diagnostics and domain events.
#[derive(Debug)]
pub struct EventBus {
    diagnostics: broadcast::Sender<DiagnosticEvent>,
    events: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (diagnostics, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            diagnostics,
            events,
        }
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.diagnostics.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Raise a diagnostic. Never fails; an absent audience is fine.
    pub fn diagnostic(&self, level: DiagnosticLevel, message: impl Into<String>) {
        let _ = self.diagnostics.send(DiagnosticEvent {
            level,
            message: message.into(),
        });
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
