// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Central server endpoint and account credentials.
    pub server: ServerConfig,
    /// Inbound listener settings.
    pub listener: ListenerConfig,
    /// Per-connection socket tuning.
    #[serde(default)]
    pub connection: ConnectionOptions,
    /// Peer connection directory limits.
    #[serde(default)]
    pub peer: PeerConfig,
    /// Distributed overlay membership settings.
    #[serde(default)]
    pub distributed: DistributedConfig,
    /// Default search session options.
    #[serde(default)]
    pub search: SearchOptions,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(rename = "Address")]
    /// `host:port` of the central server.
    pub address: String,

    #[serde(rename = "Username")]
    pub username: String,

    #[serde(rename = "Password")]
    pub password: String,

    #[serde(default = "default_true", rename = "AutoAcknowledgePrivateMessages")]
    /// Acknowledge private messages as they arrive so the server stops
    /// re-delivering them.
    pub auto_acknowledge_private_messages: bool,

    #[serde(default = "default_true", rename = "AutoAcknowledgePrivilegeNotifications")]
    pub auto_acknowledge_privilege_notifications: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ListenerConfig {
    #[serde(rename = "ListenPort")]
    /// Port advertised to the server for inbound peer connections.
    /// 0 binds an ephemeral port.
    pub listen_port: u16,

    #[serde(default = "default_true", rename = "Enabled")]
    pub enabled: bool,
}

/// Socket tuning shared by every connection role.
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
pub struct ConnectionOptions {
    #[serde(default = "default_buffer_size", rename = "BufferSize")]
    /// Chunk size for reads; progress events fire per chunk.
    pub buffer_size: u32,

    #[serde(default = "default_connect_timeout", rename = "ConnectTimeout", with = "serde_secs")]
    pub connect_timeout: Duration,

    #[serde(default = "default_read_timeout", rename = "ReadTimeout", with = "serde_secs")]
    /// Inactivity bound: a connection with no read progress for this long
    /// is torn down.
    pub read_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
pub struct PeerConfig {
    #[serde(default = "default_concurrent_connections", rename = "ConcurrentMessageConnections")]
    /// Cap on simultaneously pooled peer message connections; the
    /// least-recently-used idle entry is evicted past this.
    pub concurrent_message_connections: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            concurrent_message_connections: default_concurrent_connections(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
pub struct DistributedConfig {
    #[serde(default = "default_true", rename = "AcceptChildren")]
    pub accept_children: bool,

    #[serde(default = "default_child_limit", rename = "ChildLimit")]
    pub child_limit: u32,

    #[serde(default = "default_true", rename = "DeduplicateSearchRequests")]
    /// Suppress repeated `(username, token, query)` triples within a short
    /// window to avoid request storms.
    pub deduplicate_search_requests: bool,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            accept_children: true,
            child_limit: default_child_limit(),
            deduplicate_search_requests: true,
        }
    }
}

/// Limits and filters for one search session. The config carries the
/// defaults; `SoulseekClient::search` accepts a per-call override.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SearchOptions {
    #[serde(default = "default_response_limit", rename = "ResponseLimit")]
    pub response_limit: u32,

    #[serde(default = "default_file_limit", rename = "FileLimit")]
    pub file_limit: u32,

    #[serde(default = "default_search_timeout", rename = "SearchTimeout", with = "serde_secs")]
    pub search_timeout: Duration,

    #[serde(default = "default_response_timeout", rename = "ResponseTimeout", with = "serde_secs")]
    /// Completes the search after this long without a new response.
    pub response_timeout: Duration,

    #[serde(default = "default_true", rename = "FilterResponses")]
    pub filter_responses: bool,

    #[serde(default = "default_true", rename = "FilterFiles")]
    pub filter_files: bool,

    #[serde(default, rename = "MinimumResponseFileCount")]
    pub minimum_response_file_count: u32,

    #[serde(default, rename = "MinimumPeerUploadSpeed")]
    pub minimum_peer_upload_speed: u32,

    #[serde(default, rename = "MinimumPeerFreeUploadSlots")]
    pub minimum_peer_free_upload_slots: u32,

    #[serde(default = "default_max_queue", rename = "MaximumPeerQueueLength")]
    pub maximum_peer_queue_length: u64,

    #[serde(default, rename = "MinimumPeerQueueLength")]
    pub minimum_peer_queue_length: u64,

    #[serde(default, rename = "IgnoredFileExtensions")]
    pub ignored_file_extensions: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            response_limit: default_response_limit(),
            file_limit: default_file_limit(),
            search_timeout: default_search_timeout(),
            response_timeout: default_response_timeout(),
            filter_responses: true,
            filter_files: true,
            minimum_response_file_count: 0,
            minimum_peer_upload_speed: 0,
            minimum_peer_free_upload_slots: 0,
            maximum_peer_queue_length: default_max_queue(),
            minimum_peer_queue_length: 0,
            ignored_file_extensions: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> u32 {
    4096
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_concurrent_connections() -> u32 {
    500
}

fn default_child_limit() -> u32 {
    25
}

fn default_response_limit() -> u32 {
    250
}

fn default_file_limit() -> u32 {
    10_000
}

fn default_search_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_queue() -> u64 {
    1_000_000
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.server.address.is_empty(),
            "Server.Address must not be empty"
        );
        ensure!(
            !self.server.username.is_empty(),
            "Server.Username must not be empty"
        );

        ensure!(
            self.connection.buffer_size >= 1,
            "Connection.BufferSize must be >= 1"
        );
        ensure!(
            !self.connection.connect_timeout.is_zero(),
            "Connection.ConnectTimeout must be > 0"
        );
        ensure!(
            !self.connection.read_timeout.is_zero(),
            "Connection.ReadTimeout must be > 0"
        );

        ensure!(
            self.peer.concurrent_message_connections >= 1,
            "Peer.ConcurrentMessageConnections must be >= 1"
        );

        ensure!(
            self.search.response_limit >= 1,
            "Search.ResponseLimit must be >= 1"
        );
        ensure!(self.search.file_limit >= 1, "Search.FileLimit must be >= 1");

        // Extension filters compare case-insensitively; normalize once.
        for ext in &mut self.search.ignored_file_extensions {
            *ext = ext.trim_start_matches('.').to_ascii_lowercase();
        }

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
pub(crate) mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
