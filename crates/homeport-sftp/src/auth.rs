//! Authentication and session admission
//!
//! NIST 800-53: AC-2 (Account Management), IA-2 (Identification and Authentication),
//! AC-10 (Concurrent Session Control)
//! STIG: V-222601
//! Implementation: Credentials are checked against the user store; accepted
//! users are admitted as a registered connection only while under their
//! session limit

use homeport_core::{public_keys_match, User, UserStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLogger};
use crate::connection::{Connection, ConnectionRegistry};
use crate::{Error, Result};

/// Verifies credentials and registers connections
pub struct Authenticator {
    store: Arc<dyn UserStore>,
    registry: Arc<ConnectionRegistry>,
    system_account_key: Option<String>,
}

impl Authenticator {
    /// Create an authenticator
    ///
    /// `system_account_key` is the OpenSSH public key that may log in as the
    /// fixed system account without consulting the store.
    pub fn new(
        store: Arc<dyn UserStore>,
        registry: Arc<ConnectionRegistry>,
        system_account_key: Option<String>,
    ) -> Self {
        Self {
            store,
            registry,
            system_account_key,
        }
    }

    /// Check a password
    ///
    /// # NIST 800-53: IA-2, AC-7 (Unsuccessful Logon Attempts)
    /// # Implementation: Empty passwords and the system account are always refused
    ///
    /// # Errors
    ///
    /// `Authentication` on any failure; the reason is only logged.
    pub async fn password(
        &self,
        username: &str,
        password: &str,
        peer: Option<SocketAddr>,
    ) -> Result<User> {
        let result = if username == homeport_core::SYSTEM_ACCOUNT {
            Err(Error::Authentication("system account requires a key".into()))
        } else if password.is_empty() {
            Err(Error::Authentication("empty password".into()))
        } else {
            self.store
                .validate_password(username, password)
                .await
                .map_err(|e| Error::Authentication(e.to_string()))
        };
        Self::audit(peer, username, "password", &result);
        result
    }

    /// Check a public key given in OpenSSH format
    ///
    /// # NIST 800-53: IA-2, IA-5 (Authenticator Management)
    ///
    /// # Errors
    ///
    /// `Authentication` on any failure.
    pub async fn public_key(
        &self,
        username: &str,
        public_key: &str,
        peer: Option<SocketAddr>,
    ) -> Result<User> {
        let result = if username == homeport_core::SYSTEM_ACCOUNT {
            match &self.system_account_key {
                Some(key) if public_keys_match(key, public_key) => Ok(User::system_account()),
                _ => Err(Error::Authentication("system account key mismatch".into())),
            }
        } else {
            self.store
                .validate_public_key(username, public_key)
                .await
                .map_err(|e| Error::Authentication(e.to_string()))
        };
        Self::audit(peer, username, "publickey", &result);
        result
    }

    fn audit(peer: Option<SocketAddr>, username: &str, method: &str, result: &Result<User>) {
        match result {
            Ok(_) => info!(username = %username, method = %method, "Authentication succeeded"),
            Err(e) => warn!(username = %username, method = %method, error = %e, "Authentication failed"),
        }
        AuditLogger::log_auth(
            peer,
            username,
            method,
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
        );
    }

    /// Turn an authenticated user into a registered connection
    ///
    /// # NIST 800-53: AC-10 (Concurrent Session Control)
    /// # STIG: V-222601
    /// # Implementation: The session count check and registration happen under
    /// # one registry lock
    ///
    /// # Errors
    ///
    /// `Authentication` when the user is at their session limit or the home
    /// directory cannot be prepared.
    pub async fn admit(
        &self,
        user: User,
        client_version: String,
        peer: Option<SocketAddr>,
    ) -> Result<Arc<Connection>> {
        if !user.is_system_account() {
            prepare_home(&user).await.map_err(|e| {
                warn!(username = %user.username, error = %e, "Unable to prepare home directory");
                Error::Authentication("home directory unavailable".into())
            })?;
        }

        let username = user.username.clone();
        let max_sessions = user.max_sessions;
        let connection = Arc::new(Connection::new(user, client_version, peer));
        if let Err(limit) = self.registry.try_add(connection.clone()).await {
            warn!(
                username = %username,
                current = limit.current,
                max = limit.max,
                "Session limit reached"
            );
            AuditEvent::SessionLimitReached {
                username,
                current_sessions: limit.current,
                max_sessions,
                timestamp: chrono::Utc::now(),
            }
            .log();
            return Err(Error::Authentication("too many sessions".into()));
        }
        debug!(connection_id = %connection.id, username = %connection.user.username, "Connection admitted");
        Ok(connection)
    }
}

/// Create the user's home directory when missing
async fn prepare_home(user: &User) -> Result<()> {
    let home = user.home();
    if tokio::fs::metadata(home).await.is_ok() {
        return Ok(());
    }
    tokio::fs::create_dir_all(home).await?;
    #[cfg(unix)]
    if user.uid != 0 || user.gid != 0 {
        if let Err(e) = std::os::unix::fs::chown(home, Some(user.uid), Some(user.gid)) {
            debug!(path = %home.display(), error = %e, "Unable to set home owner");
        }
    }
    info!(username = %user.username, path = %home.display(), "Created home directory");
    Ok(())
}
