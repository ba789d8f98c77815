//! SSH server and per-connection session handling
//!
//! This module accepts TCP connections, runs the SSH transport (RFC 4251-4254)
//! on each, authenticates users and hands session channels to the router.
//!
//! NIST 800-53: AC-17 (Remote Access), IA-2 (Identification and Authentication),
//! AC-12 (Session Termination)
//! STIG: V-222601
//! Implementation: One handler per transport; all connection-scoped state is
//! released when the transport ends, whatever ended it

use homeport_core::{MemoryUserStore, Permission, UserStore};
use russh::keys::PrivateKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::ActionRunner;
use crate::audit::AuditEvent;
use crate::auth::Authenticator;
use crate::config::{Config, StorageBackend, UserStoreKind};
use crate::connection::{Connection, ConnectionRegistry};
use crate::forward::{connect_direct, pipe, ForwardManager};
use crate::idle::IdleSweeper;
use crate::quota::{QuotaManager, QuotaScanRegistry};
use crate::router::{ChannelRouter, RouterOptions};
use crate::transfer::{TransferEnv, TransferRegistry};
use crate::vfs::local::{FsOptions, LocalFileSystem};
use crate::vfs::FileSystem;
use crate::{Error, Result};

/// Delay before answering a failed authentication
///
/// NIST 800-53: AC-7 (Unsuccessful Logon Attempts)
const AUTH_REJECTION_TIME: Duration = Duration::from_secs(1);

/// Open the user store selected by `config`
///
/// # Errors
///
/// Store open failures; the server cannot start without a store.
pub async fn open_user_store(config: &Config) -> Result<Arc<dyn UserStore>> {
    let track_quota = config.user_store.track_quota;
    let store: Arc<dyn UserStore> = match &config.user_store.kind {
        UserStoreKind::Sqlite { path } => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            Arc::new(
                homeport_db::Database::new(path)
                    .await?
                    .with_quota_tracking(track_quota),
            )
        }
        UserStoreKind::Memory { users_file } => {
            Arc::new(MemoryUserStore::from_file(users_file, track_quota).await?)
        }
    };
    Ok(store)
}

/// Process-wide state shared by every connection
pub struct ServerState {
    /// Server configuration
    pub config: Arc<Config>,
    /// User store
    pub store: Arc<dyn UserStore>,
    /// Active connections
    pub connections: Arc<ConnectionRegistry>,
    /// Active transfers
    pub transfers: Arc<TransferRegistry>,
    /// Running quota scans
    pub quota_scans: Arc<QuotaScanRegistry>,
    /// Quota accounting
    pub quota: QuotaManager,
    /// Post-operation commands
    pub actions: Arc<ActionRunner>,
    /// Credential checks and session admission
    pub authenticator: Authenticator,
    /// Filesystem options applied to every connection
    pub fs_options: FsOptions,
    /// Channel feature switches
    pub router_options: RouterOptions,
}

impl ServerState {
    /// Build the shared state
    ///
    /// # Errors
    ///
    /// `Config` when the configuration does not validate.
    pub fn new(config: Config, store: Arc<dyn UserStore>) -> Result<Self> {
        config.validate()?;
        let transfers = Arc::new(TransferRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new(transfers.clone()));
        let authenticator = Authenticator::new(
            store.clone(),
            connections.clone(),
            config.system_account_key.clone(),
        );
        let fs_options = FsOptions {
            umask: config.umask_bits()?,
            upload_mode: config.upload_mode,
        };
        let router_options = RouterOptions {
            enable_scp: config.enable_scp,
            full_functionality: config.full_functionality,
        };

        Ok(Self {
            actions: Arc::new(ActionRunner::new(&config.actions)),
            quota: QuotaManager::new(store.clone()),
            config: Arc::new(config),
            store,
            connections,
            transfers,
            quota_scans: Arc::new(QuotaScanRegistry::new()),
            authenticator,
            fs_options,
            router_options,
        })
    }

    /// Dependencies handed to every transfer
    pub fn transfer_env(&self) -> TransferEnv {
        TransferEnv {
            quota: self.quota.clone(),
            actions: self.actions.clone(),
            registry: self.transfers.clone(),
        }
    }

    /// Filesystem backend for one connection
    pub fn filesystem(&self, connection: Arc<Connection>) -> Arc<dyn FileSystem> {
        match self.config.storage.backend {
            StorageBackend::Local => Arc::new(LocalFileSystem::new(
                connection,
                self.transfer_env(),
                self.fs_options,
            )),
        }
    }
}

/// SSH file server
pub struct Server {
    state: Arc<ServerState>,
    ssh_config: Arc<russh::server::Config>,
}

impl Server {
    /// Create a server, loading or generating host keys
    ///
    /// # Errors
    ///
    /// `Config` when the configuration is invalid or a host key cannot be loaded.
    pub fn new(config: Config, store: Arc<dyn UserStore>) -> Result<Self> {
        let keys = load_host_keys(&config)?;
        let state = Arc::new(ServerState::new(config, store)?);

        let config = &state.config;
        let mut ssh_config = russh::server::Config {
            server_id: russh::SshId::Standard(config.server_id()),
            methods: MethodSet::from(&[MethodKind::Password, MethodKind::PublicKey][..]),
            auth_rejection_time: AUTH_REJECTION_TIME,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys,
            window_size: config.window_size,
            maximum_packet_size: config.max_packet_size,
            ..Default::default()
        };
        // NIST 800-53: AC-7 - zero keeps the transport default
        if config.max_auth_tries > 0 {
            ssh_config.max_auth_attempts = config.max_auth_tries as usize;
        }

        Ok(Self {
            state,
            ssh_config: Arc::new(ssh_config),
        })
    }

    /// Shared state, for administrative tooling
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Bind the configured address and serve until `shutdown` fires
    ///
    /// # Errors
    ///
    /// `ListenerBind` when the address cannot be bound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.state.config.bind_address, self.state.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::ListenerBind(format!("{}: {}", addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections accepted on `listener` until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns an error only when the listener cannot report its address.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            address = %listener.local_addr()?,
            banner = %self.state.config.server_id(),
            "File server listening"
        );

        let sweeper = self.state.config.idle_threshold().map(|threshold| {
            IdleSweeper::new(self.state.connections.clone(), threshold).spawn(shutdown.clone())
        });

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };
            debug!(peer = %peer, "TCP connection accepted");
            tokio::spawn(serve_transport(
                self.state.clone(),
                self.ssh_config.clone(),
                stream,
                peer,
            ));
        }

        info!("Shutting down, closing active connections");
        for status in self.state.connections.list().await {
            self.state.connections.close(&status.id).await;
        }
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        Ok(())
    }
}

/// Load every configured host key, or generate an ephemeral Ed25519 key
///
/// NIST 800-53: IA-5 (Authenticator Management), SC-12 (Cryptographic Key Establishment)
fn load_host_keys(config: &Config) -> Result<Vec<PrivateKey>> {
    if config.host_keys.is_empty() {
        warn!("No host keys configured, generating an ephemeral Ed25519 key");
        let key = PrivateKey::random(
            &mut russh::keys::ssh_key::rand_core::OsRng,
            russh::keys::ssh_key::Algorithm::Ed25519,
        )
        .map_err(|e| Error::Config(format!("Failed to generate host key: {}", e)))?;
        return Ok(vec![key]);
    }

    config
        .host_keys
        .iter()
        .map(|path| {
            russh::keys::load_secret_key(path, None).map_err(|e| {
                Error::Config(format!("Failed to load host key {}: {}", path.display(), e))
            })
        })
        .collect()
}

/// Connection-scoped state shared between the handler and the transport task
///
/// NIST 800-53: AC-12 (Session Termination)
struct ConnectionScope {
    peer: SocketAddr,
    connection: Mutex<Option<Arc<Connection>>>,
    forwards: Mutex<Option<Arc<ForwardManager>>>,
    disconnect: CancellationToken,
}

impl ConnectionScope {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            connection: Mutex::new(None),
            forwards: Mutex::new(None),
            disconnect: CancellationToken::new(),
        }
    }

    /// Release everything the connection owns
    async fn teardown(&self, state: &ServerState) {
        if let Some(forwards) = self.forwards.lock().await.take() {
            forwards.close_all().await;
        }
        let Some(connection) = self.connection.lock().await.take() else {
            debug!(peer = %self.peer, "Unauthenticated transport closed");
            return;
        };
        connection.close();
        state.connections.remove(&connection.id).await;

        info!(
            connection_id = %connection.id,
            username = %connection.user.username,
            duration_secs = connection.duration_secs(),
            "Connection closed"
        );
        AuditEvent::ConnectionClosed {
            connection_id: connection.id.to_string(),
            username: connection.user.username.clone(),
            timestamp: chrono::Utc::now(),
            duration_secs: connection.duration_secs(),
        }
        .log();
    }
}

/// Run one SSH transport to completion
async fn serve_transport(
    state: Arc<ServerState>,
    ssh_config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let scope = Arc::new(ConnectionScope::new(peer));
    let handler = SessionHandler::new(state.clone(), scope.clone());

    let session = match russh::server::run_stream(ssh_config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            debug!(peer = %peer, error = %e, "SSH handshake failed");
            return;
        }
    };
    let handle = session.handle();
    tokio::pin!(session);

    tokio::select! {
        result = &mut session => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "SSH session ended with error");
            }
        }
        () = scope.disconnect.cancelled() => {
            debug!(peer = %peer, "Disconnecting closed connection");
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "connection closed by server".to_string(),
                    "en".to_string(),
                )
                .await;
            let _ = (&mut session).await;
        }
    }

    scope.teardown(&state).await;
}

/// russh handler for one transport
///
/// NIST 800-53: AC-3 (Access Enforcement), AC-17 (Remote Access)
/// Implementation: Nothing but authentication is served before a connection
/// has been admitted
struct SessionHandler {
    state: Arc<ServerState>,
    scope: Arc<ConnectionScope>,
    connection: Option<Arc<Connection>>,
    router: Option<ChannelRouter>,
    forwards: Option<Arc<ForwardManager>>,
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from(
            &[MethodKind::Password, MethodKind::PublicKey][..],
        )),
        partial_success: false,
    }
}

impl SessionHandler {
    fn new(state: Arc<ServerState>, scope: Arc<ConnectionScope>) -> Self {
        Self {
            state,
            scope,
            connection: None,
            router: None,
            forwards: None,
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.scope.peer)
    }

    /// Register an authenticated user and build the connection's backends
    async fn admit(&mut self, user: homeport_core::User) -> Auth {
        let connection = match self
            .state
            .authenticator
            .admit(user, String::new(), self.peer())
            .await
        {
            Ok(connection) => connection,
            Err(_) => return reject(),
        };

        // Closing the connection from anywhere ends the transport
        let token = connection.cancel_token().clone();
        let disconnect = self.scope.disconnect.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => disconnect.cancel(),
                () = disconnect.cancelled() => {}
            }
        });

        let forwards = Arc::new(ForwardManager::for_connection(connection.clone()));
        let fs = self.state.filesystem(connection.clone());
        self.router = Some(ChannelRouter::new(
            connection.clone(),
            fs,
            self.state.router_options,
        ));
        *self.scope.connection.lock().await = Some(connection.clone());
        *self.scope.forwards.lock().await = Some(forwards.clone());
        self.forwards = Some(forwards);
        self.connection = Some(connection);
        Auth::Accept
    }

    /// Whether TCP forwarding is allowed for this connection
    fn forwarding_allowed(&self) -> bool {
        self.state.config.full_functionality
            && self
                .connection
                .as_ref()
                .is_some_and(|c| c.user.has_perm(Permission::TcpForward))
    }

    fn reply(session: &mut Session, channel: ChannelId, ok: bool) {
        let _ = if ok {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        };
    }
}

impl Handler for SessionHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        if self.connection.is_some() {
            return Ok(reject());
        }
        match self
            .state
            .authenticator
            .password(user, password, self.peer())
            .await
        {
            Ok(user) => Ok(self.admit(user).await),
            Err(_) => Ok(reject()),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth> {
        if self.connection.is_some() {
            return Ok(reject());
        }
        let Ok(openssh) = public_key.to_openssh() else {
            return Ok(reject());
        };
        match self
            .state
            .authenticator
            .public_key(user, &openssh, self.peer())
            .await
        {
            Ok(user) => Ok(self.admit(user).await),
            Err(_) => Ok(reject()),
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<()> {
        let Some(connection) = &self.connection else {
            return Ok(());
        };
        let version = String::from_utf8_lossy(session.remote_sshid()).into_owned();
        connection.set_client_version(version.clone());

        info!(
            connection_id = %connection.id,
            username = %connection.user.username,
            client_version = %version,
            "Connection established"
        );
        AuditEvent::ConnectionEstablished {
            connection_id: connection.id.to_string(),
            client_addr: connection.remote_addr,
            username: connection.user.username.clone(),
            client_version: version,
            timestamp: chrono::Utc::now(),
        }
        .log();
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        let Some(router) = self.router.as_mut() else {
            return Ok(false);
        };
        router.open_session(channel);
        Ok(true)
    }

    /// NIST 800-53: AC-4 (Information Flow Enforcement)
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        let Some(connection) = self.connection.clone() else {
            return Ok(false);
        };
        if !self.forwarding_allowed() {
            crate::audit::AuditLogger::log_security_event(
                connection.remote_addr,
                Some(connection.user.username.clone()),
                "channel_request_denied",
                format!("direct-tcpip to {}:{} not permitted", host_to_connect, port_to_connect),
            );
            return Ok(false);
        }

        let limit = self.state.config.connect_timeout();
        let socket = match connect_direct(host_to_connect, port_to_connect, limit).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(connection_id = %connection.id, error = %e, "Direct forward connect failed");
                return Ok(false);
            }
        };
        info!(
            connection_id = %connection.id,
            target = %format!("{}:{}", host_to_connect, port_to_connect),
            origin = %format!("{}:{}", originator_address, originator_port),
            "Direct forward opened"
        );
        connection.touch();
        tokio::spawn(pipe(
            channel.into_stream(),
            socket,
            connection.cancel_token().child_token(),
            Some(connection.clone()),
        ));
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        let ok = self
            .router
            .as_mut()
            .is_some_and(|r| r.pty_request(channel, term, col_width, row_height));
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<()> {
        if let Some(router) = self.router.as_mut() {
            router.window_change(channel, col_width, row_height).await;
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<()> {
        debug!(channel = ?channel, name = %variable_name, "Ignoring environment variable");
        Self::reply(session, channel, self.router.is_some());
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<()> {
        debug!(channel = ?channel, "X11 forwarding refused");
        Self::reply(session, channel, false);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let handle = session.handle();
        let ok = self
            .router
            .as_mut()
            .is_some_and(|r| r.exec(channel, data, handle));
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let handle = session.handle();
        let ok = self
            .router
            .as_mut()
            .is_some_and(|r| r.subsystem(channel, name, handle));
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        let handle = session.handle();
        let ok = self
            .router
            .as_mut()
            .is_some_and(|r| r.shell(channel, handle));
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(router) = self.router.as_mut() {
            router.close(channel).await;
        }
        Ok(())
    }

    /// NIST 800-53: AC-4 (Information Flow Enforcement), SC-7 (Boundary Protection)
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool> {
        let Some(forwards) = self.forwards.clone() else {
            return Ok(false);
        };
        if !self.forwarding_allowed() {
            if let Some(connection) = &self.connection {
                crate::audit::AuditLogger::log_security_event(
                    connection.remote_addr,
                    Some(connection.user.username.clone()),
                    "channel_request_denied",
                    format!("tcpip-forward on {}:{} not permitted", address, port),
                );
            }
            return Ok(false);
        }

        match forwards.listen(address, *port, Arc::new(session.handle())).await {
            Ok(bound) => {
                *port = bound;
                Ok(true)
            }
            Err(e) => {
                warn!(address = %address, port = *port, error = %e, "Remote forward refused");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        match &self.forwards {
            Some(forwards) => Ok(forwards.cancel(address, port).await),
            None => Ok(false),
        }
    }
}
