//! Connection context and the process-wide connection registry
//!
//! NIST 800-53: AC-10 (Concurrent Session Control), AC-12 (Session Termination)
//! STIG: V-222601 - The application must terminate sessions after organization-defined conditions
//! Implementation: Tracks authenticated connections, enforces the per-user session cap
//! and exposes forced close for administrative tooling and the idle sweep

use chrono::{DateTime, Utc};
use homeport_core::User;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transfer::{TransferRegistry, TransferStatus};

/// Sub-protocol currently served on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// No channel has selected a protocol yet
    None,
    /// SFTP subsystem
    Sftp,
    /// Legacy copy command
    Scp,
    /// Interactive shell
    Shell,
    /// Remote command execution
    Exec,
}

impl Protocol {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Protocol::Sftp,
            2 => Protocol::Scp,
            3 => Protocol::Shell,
            4 => Protocol::Exec,
            _ => Protocol::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Protocol::None => 0,
            Protocol::Sftp => 1,
            Protocol::Scp => 2,
            Protocol::Shell => 3,
            Protocol::Exec => 4,
        }
    }

    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::None => "none",
            Protocol::Sftp => "sftp",
            Protocol::Scp => "scp",
            Protocol::Shell => "shell",
            Protocol::Exec => "exec",
        }
    }
}

/// One authenticated transport connection
pub struct Connection {
    /// Unique connection identifier
    pub id: Uuid,
    /// User snapshot taken at authentication
    pub user: Arc<User>,
    client_version: OnceLock<String>,
    /// Remote socket address
    pub remote_addr: Option<SocketAddr>,
    /// Time of authentication
    pub started_at: DateTime<Utc>,
    last_activity: AtomicI64,
    protocol: AtomicU8,
    fs_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("username", &self.user.username)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection context for an authenticated user
    pub fn new(user: User, client_version: String, remote_addr: Option<SocketAddr>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user: Arc::new(user),
            client_version: if client_version.is_empty() {
                OnceLock::new()
            } else {
                OnceLock::from(client_version)
            },
            remote_addr,
            started_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            protocol: AtomicU8::new(Protocol::None.as_u8()),
            fs_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Client identification string, empty until known
    pub fn client_version(&self) -> &str {
        self.client_version.get().map_or("", String::as_str)
    }

    /// Record the client identification once the transport reports it
    pub fn set_client_version(&self, version: impl Into<String>) {
        let _ = self.client_version.set(version.into());
    }

    /// Record activity now
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time of the last recorded activity
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.started_at)
    }

    /// Protocol in use
    pub fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.protocol.load(Ordering::Relaxed))
    }

    /// Switch the protocol label
    pub fn set_protocol(&self, protocol: Protocol) {
        self.protocol.store(protocol.as_u8(), Ordering::Relaxed);
    }

    /// Serialize stat-then-act sequences on this connection
    pub async fn lock_fs(&self) -> MutexGuard<'_, ()> {
        self.fs_lock.lock().await
    }

    /// Token cancelled when the connection closes
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Force the connection and every dependent task to unwind
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection was closed
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Seconds since authentication
    pub fn duration_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
    }
}

/// Snapshot of an active connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Connection identifier
    pub id: Uuid,
    /// Authenticated username
    pub username: String,
    /// Client identification string
    pub client_version: String,
    /// Remote address
    pub remote_addr: Option<SocketAddr>,
    /// Protocol in use
    pub protocol: Protocol,
    /// Time of authentication
    pub connected_at: DateTime<Utc>,
    /// Last recorded activity
    pub last_activity: DateTime<Utc>,
    /// Transfers in progress
    pub transfers: Vec<TransferStatus>,
}

/// Returned when a user already holds the maximum number of sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimitReached {
    /// Sessions currently open for the user
    pub current: usize,
    /// Configured maximum
    pub max: u32,
}

/// Process-wide registry of authenticated connections
///
/// NIST 800-53: AC-10 (Concurrent Session Control)
/// Implementation: The session cap is checked and the connection inserted
/// under a single lock acquisition
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Uuid, Arc<Connection>>>,
    transfers: Arc<TransferRegistry>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(transfers: Arc<TransferRegistry>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            transfers,
        }
    }

    /// Transfer registry used for status snapshots
    pub fn transfers(&self) -> &Arc<TransferRegistry> {
        &self.transfers
    }

    /// Register a connection unless its user already holds `max_sessions` sessions
    ///
    /// # NIST 800-53: AC-10 (Concurrent Session Control)
    pub async fn try_add(&self, connection: Arc<Connection>) -> Result<(), SessionLimitReached> {
        let mut connections = self.connections.lock().await;
        let user = &connection.user;
        if user.has_session_limit() {
            let current = connections
                .values()
                .filter(|c| c.user.username == user.username)
                .count();
            if current >= user.max_sessions as usize {
                warn!(
                    username = %user.username,
                    current,
                    max = user.max_sessions,
                    "Rejecting connection, session limit reached"
                );
                return Err(SessionLimitReached {
                    current,
                    max: user.max_sessions,
                });
            }
        }

        debug!(
            connection_id = %connection.id,
            username = %user.username,
            "Connection registered"
        );
        connections.insert(connection.id, connection);
        Ok(())
    }

    /// Remove a connection
    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Connection>> {
        let removed = self.connections.lock().await.remove(id);
        if let Some(connection) = &removed {
            debug!(
                connection_id = %id,
                username = %connection.user.username,
                "Connection unregistered"
            );
        }
        removed
    }

    /// Look up a connection
    pub async fn get(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.lock().await.get(id).cloned()
    }

    /// Whether a connection is registered
    pub async fn contains(&self, id: &Uuid) -> bool {
        self.connections.lock().await.contains_key(id)
    }

    /// Sessions currently open for `username`
    pub async fn count_for(&self, username: &str) -> usize {
        self.connections
            .lock()
            .await
            .values()
            .filter(|c| c.user.username == username)
            .count()
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Whether no connection is registered
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Status of every connection, oldest first
    pub async fn list(&self) -> Vec<ConnectionStatus> {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().await.values().cloned().collect();

        let mut list = Vec::with_capacity(connections.len());
        for connection in connections {
            list.push(ConnectionStatus {
                id: connection.id,
                username: connection.user.username.clone(),
                client_version: connection.client_version().to_string(),
                remote_addr: connection.remote_addr,
                protocol: connection.protocol(),
                connected_at: connection.started_at,
                last_activity: connection.last_activity(),
                transfers: self.transfers.for_connection(&connection.id).await,
            });
        }
        list.sort_by_key(|s| s.connected_at);
        list
    }

    /// Force-close a connection. Returns false if it is not registered.
    ///
    /// # NIST 800-53: AC-12 (Session Termination)
    pub async fn close(&self, id: &Uuid) -> bool {
        match self.get(id).await {
            Some(connection) => {
                info!(
                    connection_id = %id,
                    username = %connection.user.username,
                    "Closing connection"
                );
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Connections inactive for longer than `threshold`
    pub async fn idle(&self, threshold: chrono::Duration) -> Vec<Arc<Connection>> {
        let now = Utc::now();
        self.connections
            .lock()
            .await
            .values()
            .filter(|c| now.signed_duration_since(c.last_activity()) > threshold)
            .cloned()
            .collect()
    }
}
