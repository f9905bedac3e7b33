// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request/response correlation over unsolicited wire traffic.
//!
//! A caller about to send a request registers a [`WaitKey`] and awaits the
//! returned slot; the handler that later decodes the matching reply
//! completes the oldest slot for that key. Slots resolve exactly once: by a
//! matching completion, their deadline, caller cancellation, or a bulk drain
//! when the owning link goes away.

use std::{
    any::Any,
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use tokio::{select, sync::oneshot, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    error::WaiterError,
    models::codes::{PeerCode, ServerCode},
};

/// Correlation key. Equality is structural and order-sensitive: two keys
/// match iff the variant and every element agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    /// Global server replies (login, room list, parent speed knobs, ...).
    ServerReply(ServerCode),
    /// Server replies scoped to a username.
    ServerUser { code: ServerCode, username: String },
    /// Server replies scoped to a room.
    ServerRoom { code: ServerCode, room: String },
    /// Peer replies scoped to the remote username.
    PeerReply { code: PeerCode, username: String },
    /// The remote's answer to our transfer request.
    TransferResponse { username: String, token: u32 },
    /// The remote's own transfer request after we queued a download.
    TransferQueued { username: String, filename: String },
    /// An indirectly solicited message connection piercing our firewall.
    IndirectConnect { username: String, token: u32 },
    /// An indirectly solicited transfer socket.
    IndirectTransfer {
        username: String,
        filename: String,
        token: u32,
    },
    /// The branch level a candidate parent advertises after `PeerInit`.
    DistributedLevel { username: String },
}

impl WaitKey {
    /// Username the key is scoped to, if any; used to fail a peer's waits
    /// when that peer's link dies.
    pub fn username(&self) -> Option<&str> {
        match self {
            WaitKey::ServerReply(_) => None,
            WaitKey::ServerRoom { .. } => None,
            WaitKey::ServerUser { username, .. }
            | WaitKey::PeerReply { username, .. }
            | WaitKey::TransferResponse { username, .. }
            | WaitKey::TransferQueued { username, .. }
            | WaitKey::IndirectConnect { username, .. }
            | WaitKey::IndirectTransfer { username, .. }
            | WaitKey::DistributedLevel { username } => Some(username),
        }
    }
}

type BoxedValue = Box<dyn Any + Send>;

struct Slot {
    id: u64,
    tx: oneshot::Sender<Result<BoxedValue, WaiterError>>,
}

/// Keyed FIFO registry of pending waits.
pub struct Waiter {
    waits: DashMap<WaitKey, VecDeque<Slot>>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending_keys", &self.waits.len())
            .finish()
    }
}

impl Waiter {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            waits: DashMap::new(),
            next_id: AtomicU64::new(0),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of pending slots across all keys.
    pub fn pending(&self) -> usize {
        self.waits.iter().map(|e| e.value().len()).sum()
    }

    /// Register a wait and return the future resolving it.
    ///
    /// The slot is registered before this returns, so a completion arriving
    /// between registration and the first poll is not lost. The expected
    /// value type is fixed by the caller; a completion carrying anything
    /// else resolves to [`WaiterError::TypeMismatch`].
    pub fn wait<'a, T: Any + Send>(
        &'a self,
        key: WaitKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<T, WaiterError>> + Send + use<'a, T> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waits
            .entry(key.clone())
            .or_default()
            .push_back(Slot { id, tx });
        trace!("wait registered: {key:?} (id {id})");

        let deadline = timeout.unwrap_or(self.default_timeout);
        let cancel = cancel.clone();
        async move {
            let outcome = select! {
                res = rx => match res {
                    Ok(res) => res,
                    // Sender dropped without completing; treat as a drain.
                    Err(_) => Err(WaiterError::Disconnected),
                },
                _ = sleep(deadline) => {
                    self.remove_slot(&key, id);
                    Err(WaiterError::TimedOut)
                },
                _ = cancel.cancelled() => {
                    self.remove_slot(&key, id);
                    Err(WaiterError::Cancelled)
                },
            };

            outcome.and_then(|boxed| {
                boxed
                    .downcast::<T>()
                    .map(|v| *v)
                    .map_err(|_| WaiterError::TypeMismatch)
            })
        }
    }

    /// Drop an abandoned registration (e.g. the losing side of a race).
    pub fn abandon(&self, key: &WaitKey) {
        self.throw_all(key, WaiterError::Cancelled);
    }

    fn remove_slot(&self, key: &WaitKey, id: u64) {
        if let Some(mut entry) = self.waits.get_mut(key) {
            entry.retain(|slot| slot.id != id);
        }
        self.waits.remove_if(key, |_, q| q.is_empty());
    }

    /// Resolve the oldest pending wait for `key`. Returns whether a slot
    /// was completed.
    pub fn complete<T: Any + Send>(&self, key: &WaitKey, value: T) -> bool {
        let slot = self.waits.get_mut(key).and_then(|mut q| q.pop_front());
        self.waits.remove_if(key, |_, q| q.is_empty());
        match slot {
            Some(slot) => {
                trace!("wait completed: {key:?} (id {})", slot.id);
                let _ = slot.tx.send(Ok(Box::new(value)));
                true
            },
            None => false,
        }
    }

    /// Resolve every pending wait for `key` with clones of `value`.
    pub fn complete_all<T: Any + Send + Clone>(&self, key: &WaitKey, value: T) -> usize {
        let slots = match self.waits.remove(key) {
            Some((_, q)) => q,
            None => return 0,
        };
        let n = slots.len();
        for slot in slots {
            let _ = slot.tx.send(Ok(Box::new(value.clone())));
        }
        n
    }

    /// Fail the oldest pending wait for `key`.
    pub fn throw(&self, key: &WaitKey, err: WaiterError) -> bool {
        let slot = self.waits.get_mut(key).and_then(|mut q| q.pop_front());
        self.waits.remove_if(key, |_, q| q.is_empty());
        match slot {
            Some(slot) => {
                let _ = slot.tx.send(Err(err));
                true
            },
            None => false,
        }
    }

    /// Fail every pending wait for `key`.
    pub fn throw_all(&self, key: &WaitKey, err: WaiterError) -> usize {
        let slots = match self.waits.remove(key) {
            Some((_, q)) => q,
            None => return 0,
        };
        let n = slots.len();
        for slot in slots {
            let _ = slot.tx.send(Err(err.clone()));
        }
        n
    }

    /// Fail every outstanding wait; used on client shutdown.
    pub fn cancel_all(&self) {
        self.drain_with(WaiterError::Cancelled, |_| true);
    }

    /// Resolve every outstanding wait with `Disconnected`; used when the
    /// server link is lost.
    pub fn disconnect_all(&self) {
        self.drain_with(WaiterError::Disconnected, |_| true);
    }

    /// Resolve every wait scoped to `username` with `Disconnected`; used
    /// when a peer link is lost.
    pub fn disconnect_user(&self, username: &str) {
        self.drain_with(WaiterError::Disconnected, |key| {
            key.username() == Some(username)
        });
    }

    /// First registered key satisfying `pred`. A pierce-firewall only
    /// carries a token, so its handler looks the full key up by predicate.
    pub fn find_key(&self, pred: impl Fn(&WaitKey) -> bool) -> Option<WaitKey> {
        self.waits
            .iter()
            .map(|e| e.key().clone())
            .find(|key| pred(key))
    }

    fn drain_with(&self, err: WaiterError, matches: impl Fn(&WaitKey) -> bool) {
        let keys: Vec<WaitKey> = self
            .waits
            .iter()
            .filter(|e| matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, slots)) = self.waits.remove(&key) {
                for slot in slots {
                    let _ = slot.tx.send(Err(err.clone()));
                }
            }
        }
    }
}
