// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{
        Arc, Mutex as StdMutex, Weak,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::{ConnectionOptions, DistributedConfig},
    client::{
        client::SoulseekClient,
        connection::{Connection, ConnectionRole, ConnectionState},
        message_connection::{MessageCallback, MessageConnection},
        waiter::{WaitKey, Waiter},
    },
    models::{
        codes::ConnectionKind,
        distributed::{
            DistributedBranchLevel, DistributedBranchRoot, DistributedSearchRequest,
        },
        frame::Message,
        init::{PeerInit, PierceFirewall},
        server::{
            requests::{
                AcceptChildrenRequest, BranchLevelRequest, BranchRootRequest,
                ChildDepthRequest, HaveNoParentRequest,
            },
            responses::ConnectToPeerResponse,
        },
    },
    utils::next_token,
};

/// How long a `(username, token, query)` triple suppresses an identical
/// re-broadcast.
const SEARCH_DEDUP_WINDOW: Duration = Duration::from_millis(500);

/// A parent candidate advertised by the server.
#[derive(Debug, Clone)]
pub struct ParentCandidate {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug)]
struct ParentLink {
    username: String,
    conn: Arc<MessageConnection>,
}

/// Membership in the distributed search tree: at most one parent uplink,
/// up to `child_limit` child downlinks, and the branch level/root bookkeeping
/// the overlay needs (`level = parent level + 1`; an orphan is its own root
/// at level 0).
pub struct DistributedConnectionManager {
    cfg: DistributedConfig,
    opts: ConnectionOptions,
    waiter: Arc<Waiter>,

    local_username: StdMutex<String>,
    parent: StdMutex<Option<ParentLink>>,
    children: DashMap<String, Arc<MessageConnection>>,
    branch_level: AtomicU32,
    branch_root: StdMutex<String>,

    recent_searches: StdMutex<VecDeque<((String, u32, String), Instant)>>,
    /// Roots advertised by candidates whose handshake has not finished yet.
    candidate_roots: DashMap<String, String>,

    /// Distributed-message handler, installed on every overlay connection.
    message_callback: OnceCell<MessageCallback>,
    client: OnceCell<Weak<SoulseekClient>>,
    self_weak: OnceCell<Weak<Self>>,
}

impl std::fmt::Debug for DistributedConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedConnectionManager")
            .field("parent", &self.parent_username())
            .field("children", &self.children.len())
            .field("branch_level", &self.branch_level())
            .field("branch_root", &self.branch_root())
            .finish()
    }
}

impl DistributedConnectionManager {
    pub fn new(
        cfg: DistributedConfig,
        opts: ConnectionOptions,
        waiter: Arc<Waiter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            opts,
            waiter,
            local_username: StdMutex::new(String::new()),
            parent: StdMutex::new(None),
            children: DashMap::new(),
            branch_level: AtomicU32::new(0),
            branch_root: StdMutex::new(String::new()),
            recent_searches: StdMutex::new(VecDeque::new()),
            candidate_roots: DashMap::new(),
            message_callback: OnceCell::new(),
            client: OnceCell::new(),
            self_weak: OnceCell::new(),
        })
    }

    /// Must be called once after creating the Arc.
    pub fn attach_self(self: &Arc<Self>) {
        let _ = self.self_weak.set(Arc::downgrade(self));
    }

    pub fn attach_client(&self, client: Weak<SoulseekClient>) {
        let _ = self.client.set(client);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        let _ = self.message_callback.set(cb);
    }

    /// Also resets the branch root: an unparented node is its own root.
    pub fn set_local_username(&self, username: impl Into<String>) {
        let username = username.into();
        *self
            .local_username
            .lock()
            .expect("local_username lock poisoned") = username.clone();
        let mut root = self.branch_root.lock().expect("branch_root lock poisoned");
        if root.is_empty() {
            *root = username;
        }
    }

    pub fn has_parent(&self) -> bool {
        self.parent.lock().expect("parent lock poisoned").is_some()
    }

    pub fn parent_username(&self) -> Option<String> {
        self.parent
            .lock()
            .expect("parent lock poisoned")
            .as_ref()
            .map(|p| p.username.clone())
    }

    pub fn branch_level(&self) -> u32 {
        self.branch_level.load(Ordering::Relaxed)
    }

    pub fn branch_root(&self) -> String {
        self.branch_root
            .lock()
            .expect("branch_root lock poisoned")
            .clone()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn local_username(&self) -> String {
        self.local_username
            .lock()
            .expect("local_username lock poisoned")
            .clone()
    }

    /// Race connection attempts to every candidate; the first to finish the
    /// `PeerInit` + `BranchLevel` exchange becomes the parent, the rest are
    /// closed.
    pub async fn add_parent_connection(
        self: &Arc<Self>,
        candidates: Vec<ParentCandidate>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.has_parent() {
            return Ok(());
        }
        if candidates.is_empty() {
            bail!("no parent candidates offered");
        }

        let race = cancel.child_token();
        let mut attempts: JoinSet<Result<(ParentCandidate, Arc<MessageConnection>, u32)>> =
            JoinSet::new();
        for candidate in candidates {
            let mgr = Arc::clone(self);
            let token = race.clone();
            attempts.spawn(async move { mgr.try_parent(candidate, &token).await });
        }

        let mut adopted = false;
        while let Some(joined) = attempts.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("parent attempt task failed: {e}");
                    continue;
                },
            };
            match outcome {
                Ok((candidate, conn, level)) if !adopted => {
                    self.adopt_parent(&candidate, conn, level).await;
                    adopted = true;
                    race.cancel();
                },
                Ok((candidate, conn, _)) => {
                    // A slower candidate also finished; close it.
                    debug!("closing losing parent candidate {}", candidate.username);
                    conn.disconnect("lost parent race").await;
                },
                Err(e) => debug!("parent candidate failed: {e}"),
            }
        }

        if !adopted {
            self.notify_server_orphaned().await;
            bail!("every parent candidate failed");
        }
        Ok(())
    }

    async fn try_parent(
        self: Arc<Self>,
        candidate: ParentCandidate,
        cancel: &CancellationToken,
    ) -> Result<(ParentCandidate, Arc<MessageConnection>, u32)> {
        let conn = Connection::new(candidate.ip.to_string(), candidate.port, self.opts);
        let mc = MessageConnection::new(conn, ConnectionRole::Distributed);
        mc.set_username(&candidate.username);
        if let Some(cb) = self.message_callback.get() {
            mc.set_on_message(cb.clone());
        }

        let attempt = async {
            mc.connection().connect(cancel).await?;

            // Register for the parent's BranchLevel before it can arrive.
            let level_wait = self.waiter.wait::<u32>(
                WaitKey::DistributedLevel {
                    username: candidate.username.clone(),
                },
                Some(self.opts.connect_timeout),
                cancel,
            );

            let init = PeerInit::new(
                self.local_username(),
                ConnectionKind::Distributed,
                next_token(),
            );
            mc.send_message(&init.to_message()?, cancel).await?;
            mc.start_read_loop();

            let level = level_wait.await?;
            Ok::<u32, anyhow::Error>(level)
        };

        match attempt.await {
            Ok(level) => Ok((candidate, mc, level)),
            Err(e) => {
                mc.disconnect("parent attempt failed").await;
                Err(e)
            },
        }
    }

    async fn adopt_parent(
        self: &Arc<Self>,
        candidate: &ParentCandidate,
        conn: Arc<MessageConnection>,
        parent_level: u32,
    ) {
        info!(
            "adopted parent {} at level {parent_level}",
            candidate.username
        );

        // Parent loss demotes us back to a root.
        let weak = Arc::downgrade(self);
        let parent_name = candidate.username.clone();
        conn.connection()
            .set_on_state_change(Box::new(move |_prev, next, msg| {
                if next == ConnectionState::Disconnected
                    && let Some(mgr) = weak.upgrade()
                {
                    debug!("parent {parent_name} lost: {msg}");
                    let parent_name = parent_name.clone();
                    tokio::spawn(async move { mgr.handle_parent_loss(&parent_name).await });
                }
            }));

        {
            let mut parent = self.parent.lock().expect("parent lock poisoned");
            *parent = Some(ParentLink {
                username: candidate.username.clone(),
                conn,
            });
        }

        self.apply_branch_level(parent_level).await;
        if let Some((_, root)) = self.candidate_roots.remove(&candidate.username) {
            self.set_branch_root(root).await;
        }
        self.candidate_roots.clear();
        self.notify_server_adopted().await;
    }

    /// A `BranchRoot` from the current parent applies immediately; one from
    /// a candidate mid-handshake is stashed until adoption.
    pub async fn note_branch_root(self: &Arc<Self>, username: &str, root: String) {
        if self.parent_username().as_deref() == Some(username) {
            self.set_branch_root(root).await;
        } else {
            self.candidate_roots.insert(username.to_string(), root);
        }
    }

    async fn handle_parent_loss(self: &Arc<Self>, username: &str) {
        {
            let mut parent = self.parent.lock().expect("parent lock poisoned");
            match parent.as_ref() {
                Some(link) if link.username == username => *parent = None,
                _ => return,
            }
        }
        self.branch_level.store(0, Ordering::Relaxed);
        *self.branch_root.lock().expect("branch_root lock poisoned") =
            self.local_username();

        self.broadcast_branch_state().await;
        self.notify_server_orphaned().await;
    }

    /// The parent advertised level `n`; ours becomes `n + 1` and every child
    /// hears about it before any other write to them.
    pub async fn set_branch_level(self: &Arc<Self>, level: u32) {
        self.apply_branch_level(level).await;
        self.send_to_server(
            BranchLevelRequest {
                level: self.branch_level(),
            }
            .to_message(),
        )
        .await;
    }

    async fn apply_branch_level(self: &Arc<Self>, parent_level: u32) {
        let own = parent_level + 1;
        self.branch_level.store(own, Ordering::Relaxed);
        if let Ok(msg) = (DistributedBranchLevel { level: own }).to_message() {
            self.broadcast_message(&msg).await;
        }
    }

    /// The parent advertised its branch root; propagate to children.
    pub async fn set_branch_root(self: &Arc<Self>, root: impl Into<String>) {
        let root = root.into();
        *self.branch_root.lock().expect("branch_root lock poisoned") = root.clone();
        if let Ok(msg) = (DistributedBranchRoot { root: root.clone() }).to_message() {
            self.broadcast_message(&msg).await;
        }
        self.send_to_server(BranchRootRequest { root }.to_message()).await;
    }

    async fn broadcast_branch_state(self: &Arc<Self>) {
        let level = self.branch_level();
        let root = self.branch_root();
        if let Ok(msg) = (DistributedBranchLevel { level }).to_message() {
            self.broadcast_message(&msg).await;
        }
        if let Ok(msg) = (DistributedBranchRoot { root }).to_message() {
            self.broadcast_message(&msg).await;
        }
    }

    /// Depth reported by a child; forwarded upward as our depth + 1.
    pub async fn set_child_depth(self: &Arc<Self>, depth: u32) {
        self.send_to_server(ChildDepthRequest { depth: depth + 1 }.to_message())
            .await;
    }

    /// Accept an inbound "D" connection as a child. Over-limit or disabled
    /// children are turned away.
    pub async fn add_child_from_init(
        self: &Arc<Self>,
        init: &PeerInit,
        mc: Arc<MessageConnection>,
    ) -> Result<()> {
        if !self.accepts_children() {
            mc.disconnect("not accepting children").await;
            bail!("rejected child {}: not accepting children", init.username);
        }

        mc.set_username(&init.username);
        if let Some(cb) = self.message_callback.get() {
            mc.set_on_message(cb.clone());
        }
        self.wire_child(&init.username, &mc);
        mc.start_read_loop();
        self.push_branch_state(&mc).await?;
        self.children.insert(init.username.clone(), mc);
        debug!("added child {} ({} total)", init.username, self.children.len());
        Ok(())
    }

    /// Dial back a "D" solicitation and adopt the remote as a child.
    pub async fn add_child_connection(
        self: &Arc<Self>,
        response: &ConnectToPeerResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.accepts_children() {
            bail!(
                "rejected child {}: not accepting children",
                response.username
            );
        }

        let conn = Connection::new(response.ip.to_string(), response.port, self.opts);
        let mc = MessageConnection::new(conn, ConnectionRole::Distributed);
        mc.set_username(&response.username);
        if let Some(cb) = self.message_callback.get() {
            mc.set_on_message(cb.clone());
        }

        mc.connection().connect(cancel).await?;
        let pierce = PierceFirewall::new(response.token);
        mc.send_message(&pierce.to_message()?, cancel).await?;

        self.wire_child(&response.username, &mc);
        mc.start_read_loop();
        self.push_branch_state(&mc).await?;
        self.children.insert(response.username.clone(), mc);
        Ok(())
    }

    fn accepts_children(&self) -> bool {
        self.cfg.accept_children && self.children.len() < self.cfg.child_limit as usize
    }

    fn wire_child(self: &Arc<Self>, username: &str, mc: &Arc<MessageConnection>) {
        let weak = Arc::downgrade(self);
        let username = username.to_string();
        mc.connection()
            .set_on_state_change(Box::new(move |_prev, next, msg| {
                if next == ConnectionState::Disconnected
                    && let Some(mgr) = weak.upgrade()
                {
                    debug!("child {username} closed: {msg}");
                    mgr.children.remove(&username);
                }
            }));
    }

    /// Current level and root, in that order, as the child's first two
    /// messages.
    async fn push_branch_state(&self, mc: &Arc<MessageConnection>) -> Result<()> {
        let cancel = CancellationToken::new();
        let level = DistributedBranchLevel {
            level: self.branch_level(),
        };
        mc.send_message(&level.to_message()?, &cancel).await?;
        let root = DistributedBranchRoot {
            root: self.branch_root(),
        };
        mc.send_message(&root.to_message()?, &cancel).await?;
        Ok(())
    }

    /// Write `msg` to every child; a child that fails to take the write is
    /// disconnected and dropped.
    pub async fn broadcast_message(&self, msg: &Message) {
        let children: Vec<(String, Arc<MessageConnection>)> = self
            .children
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let cancel = CancellationToken::new();
        for (username, child) in children {
            if let Err(e) = child.send_message(msg, &cancel).await {
                warn!("dropping child {username}: broadcast failed: {e}");
                child.disconnect("broadcast failed").await;
                self.children.remove(&username);
            }
        }
    }

    /// Fan a search out to the children. Returns `false` when the triple
    /// was already seen within the dedup window and was suppressed.
    pub async fn disseminate_search(
        self: &Arc<Self>,
        request: &DistributedSearchRequest,
    ) -> Result<bool> {
        if self.cfg.deduplicate_search_requests && !self.remember_search(request) {
            return Ok(false);
        }
        let msg = request.to_message()?;
        self.broadcast_message(&msg).await;
        Ok(true)
    }

    /// Sliding-window dedup over `(username, token, query)`.
    fn remember_search(&self, request: &DistributedSearchRequest) -> bool {
        let key = (
            request.username.clone(),
            request.token,
            request.query.clone(),
        );
        let now = Instant::now();
        let mut recent = self
            .recent_searches
            .lock()
            .expect("recent_searches lock poisoned");
        while let Some((_, seen)) = recent.front() {
            if now.duration_since(*seen) > SEARCH_DEDUP_WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
        if recent.iter().any(|(k, _)| *k == key) {
            return false;
        }
        recent.push_back((key, now));
        true
    }

    pub async fn disconnect_all(&self, reason: &str) {
        let parent = {
            let mut parent = self.parent.lock().expect("parent lock poisoned");
            parent.take()
        };
        if let Some(link) = parent {
            link.conn.disconnect(reason).await;
        }
        let children: Vec<_> = self
            .children
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (username, child) in children {
            child.disconnect(reason).await;
            self.children.remove(&username);
        }
    }

    async fn notify_server_adopted(&self) {
        self.send_to_server(
            BranchLevelRequest {
                level: self.branch_level(),
            }
            .to_message(),
        )
        .await;
        self.send_to_server(
            BranchRootRequest {
                root: self.branch_root(),
            }
            .to_message(),
        )
        .await;
        self.send_to_server(
            HaveNoParentRequest {
                have_no_parent: false,
            }
            .to_message(),
        )
        .await;
        self.send_to_server(
            AcceptChildrenRequest {
                accept: self.cfg.accept_children,
            }
            .to_message(),
        )
        .await;
    }

    async fn notify_server_orphaned(&self) {
        self.send_to_server(
            HaveNoParentRequest {
                have_no_parent: true,
            }
            .to_message(),
        )
        .await;
        self.send_to_server(BranchLevelRequest { level: 0 }.to_message())
            .await;
        self.send_to_server(
            BranchRootRequest {
                root: self.branch_root(),
            }
            .to_message(),
        )
        .await;
    }

    async fn send_to_server(&self, msg: Result<Message, crate::error::CodecError>) {
        let Ok(msg) = msg else { return };
        let Some(client) = self.client.get().and_then(Weak::upgrade) else {
            debug!("no client attached; skipping server status update");
            return;
        };
        if let Err(e) = client.send_server_message(&msg).await {
            warn!("server status update failed: {e}");
        }
    }
}
