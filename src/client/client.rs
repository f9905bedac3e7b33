// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex as StdMutex, Weak},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::{Config, SearchOptions},
    client::{
        connection::{Connection, ConnectionRole, ConnectionState},
        distributed_manager::DistributedConnectionManager,
        listener::Listener,
        message_connection::MessageConnection,
        peer_manager::PeerConnectionManager,
        search::{SearchResults, SearchSession},
        transfer_connection::TransferConnection,
        waiter::{WaitKey, Waiter},
    },
    error::{OperationError, ProtocolError, WaiterError},
    events::{ClientEvent, DiagnosticEvent, DiagnosticLevel, EventBus},
    handlers::{
        distributed::DistributedMessageHandler, peer::PeerMessageHandler,
        server::ServerMessageHandler,
    },
    models::{
        codes::{ConnectionKind, ServerCode},
        frame::Message,
        init::{PeerInit, PierceFirewall},
        peer::{
            common::TransferDirection,
            requests::{
                BrowseRequest, InfoRequest, TransferRequest, TransferResponse,
            },
            responses::{BrowseResponse, InfoResponse, SearchResponse},
        },
        server::{
            requests::{
                AcknowledgePrivateMessageRequest, AddUserRequest, ConnectToPeerRequest,
                FileSearchRequest, GetPeerAddressRequest, GetStatusRequest,
                HaveNoParentRequest, JoinRoomRequest, LeaveRoomRequest, LoginRequest,
                PingRequest, PrivateMessageRequest, RoomListRequest,
                SayInChatRoomRequest, SearchScope, SetListenPortRequest,
                SharedFoldersFilesRequest,
            },
            responses::{
                AddUserResponse, ConnectToPeerResponse, LoginResponse,
                PeerAddressResponse, RoomJoinedResponse, RoomListResponse,
                ServerSearchRequest, StatusResponse,
            },
        },
    },
    state_machine::{
        search_states::SearchCompletion,
        transfer_states::{
            QueuedTransferOutcome, TransferCompletion, TransferInternal, TransferState,
        },
    },
    utils::next_token,
};

/// Default bound for a registered wait when the caller gives none.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
/// A queued download may sit in the remote's queue for a while.
const QUEUED_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Answers an inbound search with local results; `None` or an empty
/// response stays silent.
pub type SearchResolver =
    Box<dyn Fn(&str, u32, &str) -> Option<SearchResponse> + Send + Sync>;
/// Answers an inbound browse with the local share listing.
pub type BrowseResolver = Box<dyn Fn() -> BrowseResponse + Send + Sync>;
/// Answers an inbound user-info request.
pub type InfoResolver = Box<dyn Fn() -> InfoResponse + Send + Sync>;

#[derive(Default)]
struct Resolvers {
    search: StdMutex<Option<SearchResolver>>,
    browse: StdMutex<Option<BrowseResolver>>,
    info: StdMutex<Option<InfoResolver>>,
}

/// The client: owns the server uplink, the waiter, both connection
/// managers, the inbound listener, and the search/transfer registries.
///
/// Managers and handlers reach back through `Weak` handles installed by
/// [`SoulseekClient::new`], so dropping the last external `Arc` tears the
/// whole object graph down.
pub struct SoulseekClient {
    cfg: Config,
    server_host: String,
    server_port: u16,

    events: Arc<EventBus>,
    waiter: Arc<Waiter>,
    server: Arc<MessageConnection>,
    peer_manager: Arc<PeerConnectionManager>,
    distributed_manager: Arc<DistributedConnectionManager>,
    listener: Arc<Listener>,

    searches: DashMap<u32, Arc<SearchSession>>,
    transfers: DashMap<(String, u32), Arc<StdMutex<TransferInternal>>>,

    logged_in: StdMutex<Option<String>>,
    resolvers: Resolvers,

    server_handler: OnceCell<Arc<ServerMessageHandler>>,
    peer_handler: OnceCell<Arc<PeerMessageHandler>>,
    distributed_handler: OnceCell<Arc<DistributedMessageHandler>>,
    self_weak: OnceCell<Weak<Self>>,
}

impl std::fmt::Debug for SoulseekClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoulseekClient")
            .field("server", &format!("{}:{}", self.server_host, self.server_port))
            .field("logged_in", &self.local_username())
            .field("peers", &self.peer_manager.len())
            .field("searches", &self.searches.len())
            .finish()
    }
}

impl SoulseekClient {
    pub fn new(cfg: Config) -> Arc<Self> {
        let (server_host, server_port) = split_address(&cfg.server.address);

        let events = Arc::new(EventBus::new());
        let waiter = Arc::new(Waiter::new(DEFAULT_WAIT_TIMEOUT));

        let server_conn = Connection::new(server_host.clone(), server_port, cfg.connection);
        server_conn.disable_inactivity_timeout();
        let server = MessageConnection::new(server_conn, ConnectionRole::Server);

        let peer_manager =
            PeerConnectionManager::new(cfg.peer, cfg.connection, Arc::clone(&waiter));
        peer_manager.attach_self();
        let distributed_manager = DistributedConnectionManager::new(
            cfg.distributed,
            cfg.connection,
            Arc::clone(&waiter),
        );
        distributed_manager.attach_self();
        let listener = Listener::new(cfg.listener.clone(), cfg.connection);

        let client = Arc::new(Self {
            cfg,
            server_host,
            server_port,
            events,
            waiter,
            server,
            peer_manager,
            distributed_manager,
            listener,
            searches: DashMap::new(),
            transfers: DashMap::new(),
            logged_in: StdMutex::new(None),
            resolvers: Resolvers::default(),
            server_handler: OnceCell::new(),
            peer_handler: OnceCell::new(),
            distributed_handler: OnceCell::new(),
            self_weak: OnceCell::new(),
        });
        client.wire(&client);
        client
    }

    /// Install the weak back-references and the three handlers.
    fn wire(&self, strong: &Arc<Self>) {
        let weak = Arc::downgrade(strong);
        let _ = self.self_weak.set(weak.clone());

        self.listener.attach_client(weak.clone());
        self.distributed_manager.attach_client(weak.clone());

        let server_handler = ServerMessageHandler::new(weak.clone());
        self.server.set_on_message(server_handler.callback());
        let _ = self.server_handler.set(server_handler);

        let peer_handler = PeerMessageHandler::new(weak.clone());
        self.peer_manager.set_message_callback(peer_handler.callback());
        let _ = self.peer_handler.set(peer_handler);

        let distributed_handler = DistributedMessageHandler::new(weak);
        self.distributed_manager
            .set_message_callback(distributed_handler.callback());
        let _ = self.distributed_handler.set(distributed_handler);

        // A dead server link drains every outstanding wait.
        let weak = Arc::downgrade(strong);
        self.server
            .connection()
            .set_on_state_change(Box::new(move |_prev, next, msg| {
                if next == ConnectionState::Disconnected
                    && let Some(client) = weak.upgrade()
                {
                    warn!("server connection lost: {msg}");
                    *client.logged_in.lock().expect("logged_in lock poisoned") = None;
                    client.waiter.disconnect_all();
                    client.events.diagnostic(
                        DiagnosticLevel::Warning,
                        format!("server connection lost: {msg}"),
                    );
                }
            }));
    }

    fn weak(&self) -> Weak<Self> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    // ── accessors ──────────────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    pub fn peer_manager(&self) -> &Arc<PeerConnectionManager> {
        &self.peer_manager
    }

    pub fn distributed_manager(&self) -> &Arc<DistributedConnectionManager> {
        &self.distributed_manager
    }

    pub fn listener(&self) -> &Arc<Listener> {
        &self.listener
    }

    pub(crate) fn distributed_handler(&self) -> Option<&Arc<DistributedMessageHandler>> {
        self.distributed_handler.get()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ClientEvent> {
        self.events.subscribe_events()
    }

    pub fn subscribe_diagnostics(
        &self,
    ) -> tokio::sync::broadcast::Receiver<DiagnosticEvent> {
        self.events.subscribe_diagnostics()
    }

    pub fn local_username(&self) -> Option<String> {
        self.logged_in
            .lock()
            .expect("logged_in lock poisoned")
            .clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.local_username().is_some()
    }

    fn require_login(&self) -> Result<String> {
        self.local_username()
            .ok_or_else(|| OperationError::NotLoggedIn.into())
    }

    pub fn set_search_resolver(&self, resolver: SearchResolver) {
        *self
            .resolvers
            .search
            .lock()
            .expect("search resolver lock poisoned") = Some(resolver);
    }

    pub fn set_browse_resolver(&self, resolver: BrowseResolver) {
        *self
            .resolvers
            .browse
            .lock()
            .expect("browse resolver lock poisoned") = Some(resolver);
    }

    pub fn set_info_resolver(&self, resolver: InfoResolver) {
        *self
            .resolvers
            .info
            .lock()
            .expect("info resolver lock poisoned") = Some(resolver);
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    /// Open the server uplink and, when configured, the inbound listener.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        self.server.connection().connect(cancel).await?;
        self.server.start_read_loop();
        info!("connected to {}:{}", self.server_host, self.server_port);

        if self.cfg.listener.enabled {
            let port = self.listener.start().await?;
            debug!("listening for peers on port {port}");
        }
        Ok(())
    }

    /// Log in with the configured credentials. A rejected login is returned
    /// as `Ok` with `success == false`; the caller decides whether that is
    /// fatal.
    pub async fn login(&self, cancel: &CancellationToken) -> Result<LoginResponse> {
        if !self.server.is_connected() {
            bail!(OperationError::InvalidState(
                "not connected to server".into()
            ));
        }

        let wait = self.waiter.wait::<LoginResponse>(
            WaitKey::ServerReply(ServerCode::Login),
            None,
            cancel,
        );
        let request = LoginRequest::new(
            self.cfg.server.username.clone(),
            self.cfg.server.password.clone(),
        );
        self.server
            .send_message(&request.to_message()?, cancel)
            .await?;
        let response = wait.await?;

        if response.success {
            info!("logged in as {}", self.cfg.server.username);
            *self.logged_in.lock().expect("logged_in lock poisoned") =
                Some(self.cfg.server.username.clone());
            self.peer_manager
                .set_local_username(&self.cfg.server.username);
            self.distributed_manager
                .set_local_username(&self.cfg.server.username);
            self.advertise(cancel).await;
        } else {
            warn!("login rejected: {}", response.message);
        }
        Ok(response)
    }

    /// Post-login status the server expects from every client.
    async fn advertise(&self, cancel: &CancellationToken) {
        let port = self
            .listener
            .bound_port()
            .unwrap_or(self.cfg.listener.listen_port);
        let (dirs, files) = self.share_counts();

        let messages = [
            SetListenPortRequest { port }.to_message(),
            SharedFoldersFilesRequest {
                directories: dirs,
                files,
            }
            .to_message(),
            HaveNoParentRequest {
                have_no_parent: true,
            }
            .to_message(),
        ];
        for msg in messages {
            let Ok(msg) = msg else { continue };
            if let Err(e) = self.server.send_message(&msg, cancel).await {
                warn!("post-login advertisement failed: {e}");
                return;
            }
        }
    }

    fn share_counts(&self) -> (u32, u32) {
        let browse = self
            .resolvers
            .browse
            .lock()
            .expect("browse resolver lock poisoned");
        match browse.as_ref() {
            Some(resolver) => {
                let shares = resolver();
                let files = shares.directories.iter().map(|d| d.files.len()).sum::<usize>();
                (shares.directories.len() as u32, files as u32)
            },
            None => (0, 0),
        }
    }

    /// Tear everything down; outstanding waits resolve with `Disconnected`
    /// and running searches cancel.
    pub async fn disconnect(&self) {
        self.listener.stop();
        for entry in self.searches.iter() {
            entry.value().complete(SearchCompletion::Cancelled);
        }
        self.searches.clear();
        self.distributed_manager.disconnect_all("client shutdown").await;
        self.peer_manager.disconnect_all("client shutdown").await;
        self.server.disconnect("client shutdown").await;
        self.waiter.disconnect_all();
        *self.logged_in.lock().expect("logged_in lock poisoned") = None;
    }

    // ── server RPCs ────────────────────────────────────────────────────

    pub async fn send_server_message(&self, msg: &Message) -> Result<()> {
        let cancel = CancellationToken::new();
        self.server.send_message(msg, &cancel).await?;
        Ok(())
    }

    pub async fn get_peer_address(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<PeerAddressResponse> {
        let wait = self.waiter.wait::<PeerAddressResponse>(
            WaitKey::ServerUser {
                code: ServerCode::GetPeerAddress,
                username: username.to_string(),
            },
            None,
            cancel,
        );
        let request = GetPeerAddressRequest {
            username: username.to_string(),
        };
        self.server.send_message(&request.to_message()?, cancel).await?;
        Ok(wait.await?)
    }

    pub async fn add_user(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<AddUserResponse> {
        let wait = self.waiter.wait::<AddUserResponse>(
            WaitKey::ServerUser {
                code: ServerCode::AddUser,
                username: username.to_string(),
            },
            None,
            cancel,
        );
        let request = AddUserRequest {
            username: username.to_string(),
        };
        self.server.send_message(&request.to_message()?, cancel).await?;
        Ok(wait.await?)
    }

    pub async fn get_status(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<StatusResponse> {
        let wait = self.waiter.wait::<StatusResponse>(
            WaitKey::ServerUser {
                code: ServerCode::GetStatus,
                username: username.to_string(),
            },
            None,
            cancel,
        );
        let request = GetStatusRequest {
            username: username.to_string(),
        };
        self.server.send_message(&request.to_message()?, cancel).await?;
        Ok(wait.await?)
    }

    pub async fn room_list(&self, cancel: &CancellationToken) -> Result<RoomListResponse> {
        let wait = self.waiter.wait::<RoomListResponse>(
            WaitKey::ServerReply(ServerCode::RoomList),
            None,
            cancel,
        );
        self.server
            .send_message(&RoomListRequest.to_message()?, cancel)
            .await?;
        Ok(wait.await?)
    }

    pub async fn join_room(
        &self,
        room: &str,
        cancel: &CancellationToken,
    ) -> Result<RoomJoinedResponse> {
        let wait = self.waiter.wait::<RoomJoinedResponse>(
            WaitKey::ServerRoom {
                code: ServerCode::JoinRoom,
                room: room.to_string(),
            },
            None,
            cancel,
        );
        let request = JoinRoomRequest {
            room: room.to_string(),
        };
        self.server.send_message(&request.to_message()?, cancel).await?;
        Ok(wait.await?)
    }

    pub async fn leave_room(&self, room: &str, cancel: &CancellationToken) -> Result<()> {
        let wait = self.waiter.wait::<String>(
            WaitKey::ServerRoom {
                code: ServerCode::LeaveRoom,
                room: room.to_string(),
            },
            None,
            cancel,
        );
        let request = LeaveRoomRequest {
            room: room.to_string(),
        };
        self.server.send_message(&request.to_message()?, cancel).await?;
        let _ = wait.await?;
        Ok(())
    }

    pub async fn say_in_room(
        &self,
        room: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = SayInChatRoomRequest {
            room: room.to_string(),
            message: message.to_string(),
        };
        self.server.send_message(&request.to_message()?, cancel).await?;
        Ok(())
    }

    pub async fn private_message(
        &self,
        username: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = PrivateMessageRequest {
            username: username.to_string(),
            message: message.to_string(),
        };
        self.server.send_message(&request.to_message()?, cancel).await?;
        Ok(())
    }

    pub async fn acknowledge_private_message(&self, id: u32) -> Result<()> {
        self.send_server_message(&AcknowledgePrivateMessageRequest { id }.to_message()?)
            .await
    }

    /// Round-trip liveness probe against the server.
    pub async fn server_ping(&self, cancel: &CancellationToken) -> Result<()> {
        let wait = self.waiter.wait::<()>(
            WaitKey::ServerReply(ServerCode::Ping),
            None,
            cancel,
        );
        self.server
            .send_message(&PingRequest.to_message()?, cancel)
            .await?;
        wait.await?;
        Ok(())
    }

    // ── search ─────────────────────────────────────────────────────────

    /// Start a network-wide search and return the lazy response stream.
    pub async fn search(
        &self,
        query: &str,
        options: Option<SearchOptions>,
        cancel: &CancellationToken,
    ) -> Result<SearchResults> {
        self.search_scoped(query, SearchScope::Network, options, cancel)
            .await
    }

    /// Start a search restricted to `scope`.
    pub async fn search_scoped(
        &self,
        query: &str,
        scope: SearchScope,
        options: Option<SearchOptions>,
        cancel: &CancellationToken,
    ) -> Result<SearchResults> {
        self.require_login()?;
        let token = next_token();
        self.search_with_token(query, scope, token, options, cancel)
            .await
    }

    /// As [`SoulseekClient::search_scoped`], with a caller-chosen token.
    pub async fn search_with_token(
        &self,
        query: &str,
        scope: SearchScope,
        token: u32,
        options: Option<SearchOptions>,
        cancel: &CancellationToken,
    ) -> Result<SearchResults> {
        if self.searches.contains_key(&token) {
            bail!(OperationError::DuplicateToken(token));
        }

        let options = options.unwrap_or_else(|| self.cfg.search.clone());
        let (session, results) = SearchSession::new(token, query, options);
        self.searches.insert(token, Arc::clone(&session));

        // Registry cleanup once the session resolves, however it resolves.
        let weak = self.weak();
        let done = session.completed();
        tokio::spawn(async move {
            done.cancelled().await;
            if let Some(client) = weak.upgrade() {
                client.searches.remove(&token);
            }
        });

        let request = FileSearchRequest {
            scope,
            token,
            query: query.to_string(),
        };
        if let Err(e) = self.server.send_message(&request.to_message()?, cancel).await {
            session.complete(SearchCompletion::Cancelled);
            return Err(e.into());
        }
        Ok(results)
    }

    /// Feed an inbound peer search response to its session, if any is still
    /// listening.
    pub fn route_search_response(&self, response: SearchResponse) {
        match self.searches.get(&response.token) {
            Some(session) => {
                session.on_response(response);
            },
            None => {
                debug!(
                    "dropping search response for unknown token {}",
                    response.token
                );
            },
        }
    }

    // ── peer RPCs ──────────────────────────────────────────────────────

    /// Live message connection to `username`, going through the address
    /// lookup and the direct/indirect race when none is pooled.
    pub async fn peer_connection(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>> {
        if let Some(existing) = self.peer_manager.find_by_username(username) {
            return Ok(existing);
        }

        let address = self
            .get_peer_address(username, cancel)
            .await
            .with_context(|| format!("no address for {username}"))?;

        let token = next_token();
        let solicit = async {
            let request = ConnectToPeerRequest {
                token,
                username: username.to_string(),
                kind: ConnectionKind::Peer,
            };
            self.send_server_message(&request.to_message()?).await
        };
        self.peer_manager
            .connect_with_fallback(username, address.ip, address.port, token, solicit, cancel)
            .await
    }

    pub async fn browse(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<BrowseResponse> {
        self.require_login()?;
        let conn = self.peer_connection(username, cancel).await?;
        let wait = self.waiter.wait::<BrowseResponse>(
            WaitKey::PeerReply {
                code: crate::models::codes::PeerCode::BrowseResponse,
                username: username.to_string(),
            },
            Some(Duration::from_secs(60)),
            cancel,
        );
        conn.send_message(&BrowseRequest.to_message()?, cancel).await?;
        Ok(wait.await?)
    }

    pub async fn user_info(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<InfoResponse> {
        self.require_login()?;
        let conn = self.peer_connection(username, cancel).await?;
        let wait = self.waiter.wait::<InfoResponse>(
            WaitKey::PeerReply {
                code: crate::models::codes::PeerCode::InfoResponse,
                username: username.to_string(),
            },
            None,
            cancel,
        );
        conn.send_message(&InfoRequest.to_message()?, cancel).await?;
        Ok(wait.await?)
    }

    // ── transfers ──────────────────────────────────────────────────────

    /// Snapshot of a tracked transfer.
    pub fn transfer(&self, username: &str, token: u32) -> Option<TransferInternal> {
        self.transfers
            .get(&(username.to_string(), token))
            .map(|t| t.lock().expect("transfer lock poisoned").clone())
    }

    fn update_transfer(
        &self,
        username: &str,
        token: u32,
        apply: impl FnOnce(&mut TransferInternal),
    ) {
        if let Some(entry) = self.transfers.get(&(username.to_string(), token)) {
            apply(&mut entry.lock().expect("transfer lock poisoned"));
        }
    }

    /// Download `filename` from `username` into `sink`. Returns the final
    /// transfer record after `Completed/Succeeded`.
    pub async fn download<W>(
        &self,
        username: &str,
        filename: &str,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferInternal>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.require_login()?;
        let token = next_token();
        let record = Arc::new(StdMutex::new(TransferInternal::new(
            TransferDirection::Download,
            username,
            filename,
            token,
        )));
        self.transfers
            .insert((username.to_string(), token), Arc::clone(&record));

        let result = self
            .download_inner(username, filename, token, sink, cancel)
            .await;

        if let Err(e) = &result {
            let reason = completion_for_error(e);
            self.update_transfer(username, token, |t| {
                if !t.state.is_terminal() {
                    let _ = t.transition(TransferState::Completed(reason));
                }
            });
        }
        result
    }

    async fn download_inner<W>(
        &self,
        username: &str,
        filename: &str,
        token: u32,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferInternal>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let conn = self.peer_connection(username, cancel).await?;

        // Negotiate. The remote either allows immediately, queues us, or
        // rejects.
        let wait = self.waiter.wait::<TransferResponse>(
            WaitKey::TransferResponse {
                username: username.to_string(),
                token,
            },
            None,
            cancel,
        );
        let request = TransferRequest {
            direction: TransferDirection::Download,
            token,
            filename: filename.to_string(),
            file_size: None,
        };
        conn.send_message(&request.to_message()?, cancel).await?;
        let response = wait.await?;

        let (remote_token, size) = if response.allowed {
            (token, response.file_size.unwrap_or(0))
        } else if response.reason.as_deref() == Some("Queued") {
            self.update_transfer(username, token, |t| {
                let _ = t.transition(TransferState::Queued);
            });
            let outcome = self
                .waiter
                .wait::<QueuedTransferOutcome>(
                    WaitKey::TransferQueued {
                        username: username.to_string(),
                        filename: filename.to_string(),
                    },
                    Some(QUEUED_TRANSFER_TIMEOUT),
                    cancel,
                )
                .await?;
            match outcome {
                QueuedTransferOutcome::Request(their_request) => {
                    let accept = TransferResponse::allow(
                        their_request.token,
                        their_request.file_size.unwrap_or(0),
                    );
                    conn.send_message(&accept.to_message()?, cancel).await?;
                    (their_request.token, their_request.file_size.unwrap_or(0))
                },
                QueuedTransferOutcome::Failed(failed) => {
                    self.update_transfer(username, token, |t| {
                        let _ = t.transition(TransferState::Completed(
                            TransferCompletion::Rejected,
                        ));
                    });
                    bail!(ProtocolError::Rejected(failed.reason));
                },
            }
        } else {
            let reason = response.reason.unwrap_or_else(|| "refused".into());
            self.update_transfer(username, token, |t| {
                let _ = t.transition(TransferState::Completed(TransferCompletion::Rejected));
            });
            bail!(ProtocolError::Rejected(reason));
        };

        self.update_transfer(username, token, |t| {
            t.remote_token = Some(remote_token);
            t.size = size;
            let _ = t.transition(TransferState::Initializing);
        });

        let tc = self
            .transfer_socket(username, filename, remote_token, cancel)
            .await?;
        tc.set_total(size);

        // Mirror socket progress into the transfer record.
        let weak = self.weak();
        let owner = username.to_string();
        tc.set_on_progress(Box::new(move |cumulative, _total| {
            if let Some(client) = weak.upgrade() {
                client.update_transfer(&owner, token, |t| {
                    t.bytes_transferred = cumulative;
                });
            }
        }));

        self.update_transfer(username, token, |t| {
            let _ = t.transition(TransferState::InProgress);
        });

        let received = tc.read_to(sink, size, cancel).await?;
        sink.flush().await.ok();
        tc.disconnect("transfer complete").await;

        self.update_transfer(username, token, |t| {
            t.bytes_transferred = received;
            let _ = t.transition(TransferState::Completed(TransferCompletion::Succeeded));
        });
        self.transfer(username, token)
            .context("transfer record vanished")
    }

    /// Obtain the raw transfer socket: direct dial first, server-mediated
    /// solicitation as the fallback. The wait is registered up front so a
    /// fast remote cannot slip past it.
    async fn transfer_socket(
        &self,
        username: &str,
        filename: &str,
        remote_token: u32,
        cancel: &CancellationToken,
    ) -> Result<Arc<TransferConnection>> {
        let wait_key = WaitKey::IndirectTransfer {
            username: username.to_string(),
            filename: filename.to_string(),
            token: remote_token,
        };
        let mut solicited = std::pin::pin!(self.waiter.wait::<Arc<TransferConnection>>(
            wait_key.clone(),
            Some(self.cfg.connection.connect_timeout * 4),
            cancel,
        ));

        match self.direct_transfer_socket(username, remote_token, cancel).await {
            Ok(tc) => {
                self.waiter.abandon(&wait_key);
                Ok(tc)
            },
            Err(e) => {
                debug!("direct transfer socket to {username} failed: {e}");
                let request = ConnectToPeerRequest {
                    token: remote_token,
                    username: username.to_string(),
                    kind: ConnectionKind::Transfer,
                };
                self.send_server_message(&request.to_message()?).await?;
                let tc = solicited.as_mut().await?;
                // The handshake already consumed the pierce bytes; announce
                // where to start.
                tc.write_offset(0, cancel).await?;
                Ok(tc)
            },
        }
    }

    async fn direct_transfer_socket(
        &self,
        username: &str,
        remote_token: u32,
        cancel: &CancellationToken,
    ) -> Result<Arc<TransferConnection>> {
        let me = self.require_login()?;
        let address = self.get_peer_address(username, cancel).await?;

        let conn = Connection::new(address.ip.to_string(), address.port, self.cfg.connection);
        conn.connect(cancel).await?;
        let tc = TransferConnection::new(conn, 0);

        let init = PeerInit::new(me, ConnectionKind::Transfer, remote_token);
        tc.connection()
            .write(&init.to_message()?.to_bytes(), cancel)
            .await?;
        tc.write_token(remote_token, cancel).await?;
        tc.write_offset(0, cancel).await?;
        Ok(tc)
    }

    // ── inbound dispatch (called from handlers) ────────────────────────

    /// Server-relayed request that we dial a peer back.
    pub fn handle_connect_to_peer(&self, response: ConnectToPeerResponse) {
        let weak = self.weak();
        tokio::spawn(async move {
            let Some(client) = weak.upgrade() else { return };
            let cancel = CancellationToken::new();
            let result = match response.kind {
                ConnectionKind::Peer => client.dial_back_peer(&response, &cancel).await,
                ConnectionKind::Distributed => client
                    .distributed_manager
                    .add_child_connection(&response, &cancel)
                    .await,
                ConnectionKind::Transfer => {
                    client.dial_back_transfer(&response, &cancel).await
                },
            };
            if let Err(e) = result {
                client.events.diagnostic(
                    DiagnosticLevel::Warning,
                    format!(
                        "connect-to-peer {} ({}) failed: {e}",
                        response.username, response.kind
                    ),
                );
            }
        });
    }

    async fn dial_back_peer(
        &self,
        response: &ConnectToPeerResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let conn = Connection::new(response.ip.to_string(), response.port, self.cfg.connection);
        conn.connect(cancel).await?;
        let mc = MessageConnection::new(conn, ConnectionRole::Peer);
        let pierce = PierceFirewall::new(response.token);
        mc.send_message(&pierce.to_message()?, cancel).await?;

        let init = PeerInit::new(
            response.username.clone(),
            ConnectionKind::Peer,
            response.token,
        );
        self.peer_manager.add_inbound_connection(&init, mc).await;
        Ok(())
    }

    async fn dial_back_transfer(
        &self,
        response: &ConnectToPeerResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (tc, remote_token) = self
            .peer_manager
            .get_transfer_connection(response, cancel)
            .await?;

        let key = self.waiter.find_key(|key| {
            matches!(
                key,
                WaitKey::IndirectTransfer { username, token, .. }
                    if *username == response.username && *token == remote_token
            )
        });
        match key {
            Some(key) => {
                self.waiter.complete(&key, tc);
                Ok(())
            },
            None => {
                tc.disconnect("unsolicited transfer").await;
                bail!(
                    "no pending transfer for {} token {remote_token}",
                    response.username
                );
            },
        }
    }

    /// A search traveling through us: fan out to the children and answer
    /// from the local share if the resolver has anything.
    pub async fn handle_distributed_search(&self, request: ServerSearchRequest) {
        let distributed = crate::models::distributed::DistributedSearchRequest {
            username: request.username.clone(),
            token: request.token,
            query: request.query.clone(),
        };
        match self.distributed_manager.disseminate_search(&distributed).await {
            Ok(true) => {},
            Ok(false) => return, // duplicate within the window
            Err(e) => {
                self.events.diagnostic(
                    DiagnosticLevel::Warning,
                    format!("search dissemination failed: {e}"),
                );
                return;
            },
        }

        let reply = {
            let resolver = self
                .resolvers
                .search
                .lock()
                .expect("search resolver lock poisoned");
            resolver
                .as_ref()
                .and_then(|r| r(&request.username, request.token, &request.query))
        };
        let Some(mut reply) = reply else { return };
        if reply.is_empty() {
            return;
        }
        if let Some(me) = self.local_username() {
            reply.username = me;
        }
        reply.token = request.token;

        let weak = self.weak();
        let target = request.username.clone();
        tokio::spawn(async move {
            let Some(client) = weak.upgrade() else { return };
            let cancel = CancellationToken::new();
            let result = async {
                let conn = client.peer_connection(&target, &cancel).await?;
                conn.send_message(&reply.to_message()?, &cancel).await?;
                Ok::<(), anyhow::Error>(())
            }
            .await;
            if let Err(e) = result {
                client.events.diagnostic(
                    DiagnosticLevel::Debug,
                    format!("search reply to {target} failed: {e}"),
                );
            }
        });
    }

    /// Answer an inbound browse request from the local share listing.
    pub async fn answer_browse_request(&self, conn: &Arc<MessageConnection>) -> Result<()> {
        let shares = {
            let resolver = self
                .resolvers
                .browse
                .lock()
                .expect("browse resolver lock poisoned");
            resolver.as_ref().map(|r| r()).unwrap_or_default()
        };
        let cancel = CancellationToken::new();
        conn.send_message(&shares.to_message()?, &cancel).await?;
        Ok(())
    }

    /// Answer an inbound user-info request.
    pub async fn answer_info_request(&self, conn: &Arc<MessageConnection>) -> Result<()> {
        let info = {
            let resolver = self
                .resolvers
                .info
                .lock()
                .expect("info resolver lock poisoned");
            resolver.as_ref().map(|r| r()).unwrap_or_default()
        };
        let cancel = CancellationToken::new();
        conn.send_message(&info.to_message()?, &cancel).await?;
        Ok(())
    }

    /// Answer a search asked over a direct peer link.
    pub async fn answer_peer_search(
        &self,
        conn: &Arc<MessageConnection>,
        token: u32,
        query: &str,
    ) -> Result<()> {
        let username = conn.username().unwrap_or_default();
        let reply = {
            let resolver = self
                .resolvers
                .search
                .lock()
                .expect("search resolver lock poisoned");
            resolver.as_ref().and_then(|r| r(&username, token, query))
        };
        let Some(mut reply) = reply else { return Ok(()) };
        if reply.is_empty() {
            return Ok(());
        }
        if let Some(me) = self.local_username() {
            reply.username = me;
        }
        reply.token = token;
        let cancel = CancellationToken::new();
        conn.send_message(&reply.to_message()?, &cancel).await?;
        Ok(())
    }

    pub fn auto_acknowledge_private_messages(&self) -> bool {
        self.cfg.server.auto_acknowledge_private_messages
    }

    pub fn auto_acknowledge_privilege_notifications(&self) -> bool {
        self.cfg.server.auto_acknowledge_privilege_notifications
    }
}

/// Map a failure to the completion flavor recorded on the transfer.
fn completion_for_error(e: &anyhow::Error) -> TransferCompletion {
    match e.downcast_ref::<WaiterError>() {
        Some(WaiterError::TimedOut) => TransferCompletion::TimedOut,
        Some(WaiterError::Cancelled) => TransferCompletion::Cancelled,
        Some(_) => TransferCompletion::Errored,
        None => match e.downcast_ref::<ProtocolError>() {
            Some(ProtocolError::Rejected(_)) => TransferCompletion::Rejected,
            _ => TransferCompletion::Errored,
        },
    }
}

/// `host:port`, defaulting to the historical server port when none given.
fn split_address(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), 2242),
        },
        None => (address.to_string(), 2242),
    }
}
