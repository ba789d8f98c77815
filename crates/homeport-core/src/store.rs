//! User store boundary
//!
//! Every credential check and quota counter goes through [`UserStore`]. The
//! server never mutates quota counters itself; it asks the store to apply a
//! delta, and the store guarantees the increment is atomic.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{HomeportError, Result};
use crate::password::verify_password;
use crate::types::{QuotaUsage, User};

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up a user by username and cleartext password.
    async fn validate_password(&self, username: &str, password: &str) -> Result<User>;

    /// Look up a user by username and an OpenSSH-encoded public key.
    async fn validate_public_key(&self, username: &str, public_key: &str) -> Result<User>;

    /// Current used quota. Fails with `MethodDisabled` when quota tracking is off.
    async fn used_quota(&self, username: &str) -> Result<QuotaUsage>;

    /// Apply a quota delta, or overwrite the counters when `reset` is set.
    async fn update_quota(&self, username: &str, files: i64, size: i64, reset: bool)
    -> Result<()>;
}

/// Compare two OpenSSH public keys by algorithm and key body, ignoring comments.
pub fn public_keys_match(a: &str, b: &str) -> bool {
    let mut a = a.split_whitespace();
    let mut b = b.split_whitespace();
    match (a.next(), a.next(), b.next(), b.next()) {
        (Some(alg_a), Some(body_a), Some(alg_b), Some(body_b)) => {
            alg_a == alg_b && body_a == body_b
        }
        _ => false,
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<User>,
}

/// In-process user store, optionally seeded from a TOML users file
///
/// ```toml
/// [[users]]
/// username = "alice"
/// password = "sha256$..."
/// home_dir = "/srv/alice"
/// permissions = ["*"]
/// ```
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, User>>,
    track_quota: bool,
}

impl MemoryUserStore {
    pub fn new(track_quota: bool) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            track_quota,
        }
    }

    pub fn with_users(users: Vec<User>, track_quota: bool) -> Self {
        let users = users
            .into_iter()
            .map(|u| (u.username.clone(), u))
            .collect();
        Self {
            users: Mutex::new(users),
            track_quota,
        }
    }

    pub async fn from_file(path: &Path, track_quota: bool) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let file: UsersFile = toml::from_str(&contents)
            .map_err(|e| HomeportError::Parse(format!("Failed to parse users file: {}", e)))?;
        for user in &file.users {
            user.validate()?;
        }
        debug!(users = file.users.len(), path = %path.display(), "Loaded users file");
        Ok(Self::with_users(file.users, track_quota))
    }

    pub async fn add_user(&self, user: User) -> Result<()> {
        user.validate()?;
        let mut users = self.users.lock().await;
        if users.contains_key(&user.username) {
            return Err(HomeportError::AlreadyExists(user.username));
        }
        users.insert(user.username.clone(), user);
        Ok(())
    }

    pub async fn get_user(&self, username: &str) -> Option<User> {
        self.users.lock().await.get(username).cloned()
    }

    pub async fn remove_user(&self, username: &str) -> Option<User> {
        self.users.lock().await.remove(username)
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn validate_password(&self, username: &str, password: &str) -> Result<User> {
        if username.is_empty() || password.is_empty() {
            return Err(HomeportError::InvalidCredentials(username.to_string()));
        }
        let users = self.users.lock().await;
        let user = users
            .get(username)
            .ok_or_else(|| HomeportError::UserNotFound(username.to_string()))?;
        match &user.password {
            Some(hash) if verify_password(password, hash) => Ok(user.clone()),
            _ => Err(HomeportError::InvalidCredentials(username.to_string())),
        }
    }

    async fn validate_public_key(&self, username: &str, public_key: &str) -> Result<User> {
        if username.is_empty() || public_key.is_empty() {
            return Err(HomeportError::InvalidCredentials(username.to_string()));
        }
        let users = self.users.lock().await;
        let user = users
            .get(username)
            .ok_or_else(|| HomeportError::UserNotFound(username.to_string()))?;
        if user
            .public_keys
            .iter()
            .any(|k| public_keys_match(k, public_key))
        {
            Ok(user.clone())
        } else {
            Err(HomeportError::InvalidCredentials(username.to_string()))
        }
    }

    async fn used_quota(&self, username: &str) -> Result<QuotaUsage> {
        if !self.track_quota {
            return Err(HomeportError::MethodDisabled(
                "quota tracking is disabled".into(),
            ));
        }
        let users = self.users.lock().await;
        let user = users
            .get(username)
            .ok_or_else(|| HomeportError::UserNotFound(username.to_string()))?;
        Ok(QuotaUsage {
            files: user.used_quota_files,
            size: user.used_quota_size,
        })
    }

    async fn update_quota(
        &self,
        username: &str,
        files: i64,
        size: i64,
        reset: bool,
    ) -> Result<()> {
        if !self.track_quota {
            return Ok(());
        }
        let mut users = self.users.lock().await;
        let user = users
            .get_mut(username)
            .ok_or_else(|| HomeportError::UserNotFound(username.to_string()))?;
        if reset {
            user.used_quota_files = files;
            user.used_quota_size = size;
        } else {
            user.used_quota_files += files;
            user.used_quota_size += size;
        }
        user.last_quota_update = Some(Utc::now());
        debug!(
            username = %username,
            files = files,
            size = size,
            reset = reset,
            "Quota updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::hash_password;
    use crate::types::Permission;
    use std::sync::Arc;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ alice@laptop";

    fn create_test_user() -> User {
        let mut user = User::new("alice", "/srv/alice");
        user.password = Some(hash_password("wonderland"));
        user.public_keys = vec![KEY.to_string()];
        user.permissions = vec![Permission::Any];
        user
    }

    #[tokio::test]
    async fn test_password_lookup() {
        let store = MemoryUserStore::with_users(vec![create_test_user()], true);

        assert!(store.validate_password("alice", "wonderland").await.is_ok());
        assert!(matches!(
            store.validate_password("alice", "nope").await,
            Err(HomeportError::InvalidCredentials(_))
        ));
        assert!(matches!(
            store.validate_password("alice", "").await,
            Err(HomeportError::InvalidCredentials(_))
        ));
        assert!(matches!(
            store.validate_password("mallory", "x").await,
            Err(HomeportError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_public_key_lookup_ignores_comment() {
        let store = MemoryUserStore::with_users(vec![create_test_user()], true);
        let without_comment = KEY.rsplit_once(' ').unwrap().0;

        assert!(store.validate_public_key("alice", without_comment).await.is_ok());
        assert!(
            store
                .validate_public_key("alice", "ssh-ed25519 AAAAother")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_quota_disabled_reports_method_disabled() {
        let store = MemoryUserStore::with_users(vec![create_test_user()], false);
        let err = store.used_quota("alice").await.unwrap_err();
        assert!(err.is_method_disabled());
    }

    #[tokio::test]
    async fn test_quota_update_and_reset() {
        let store = MemoryUserStore::with_users(vec![create_test_user()], true);

        store.update_quota("alice", 2, 100, false).await.unwrap();
        store.update_quota("alice", -1, -40, false).await.unwrap();
        assert_eq!(
            store.used_quota("alice").await.unwrap(),
            QuotaUsage { files: 1, size: 60 }
        );

        store.update_quota("alice", 7, 700, true).await.unwrap();
        assert_eq!(
            store.used_quota("alice").await.unwrap(),
            QuotaUsage { files: 7, size: 700 }
        );
        assert!(store.get_user("alice").await.unwrap().last_quota_update.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryUserStore::with_users(vec![create_test_user()], true));
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.update_quota("alice", 1, 10, false).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(
            store.used_quota("alice").await.unwrap(),
            QuotaUsage { files: 50, size: 500 }
        );
    }

    #[tokio::test]
    async fn test_users_file_loading() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("users.toml");
        let hash = hash_password("pw");
        tokio::fs::write(
            &path,
            format!(
                "[[users]]\nusername = \"bob\"\npassword = \"{}\"\nhome_dir = \"/srv/bob\"\npermissions = [\"list\", \"download\"]\nquota_size = 1024\n",
                hash
            ),
        )
        .await
        .unwrap();

        let store = MemoryUserStore::from_file(&path, true).await.unwrap();
        let bob = store.validate_password("bob", "pw").await.unwrap();
        assert_eq!(bob.quota_size, 1024);
        assert!(bob.has_perm(Permission::Download));
        assert!(!bob.has_perm(Permission::Upload));
    }

    #[test]
    fn test_public_keys_match() {
        assert!(public_keys_match("ssh-rsa AAA c1", "ssh-rsa AAA c2"));
        assert!(!public_keys_match("ssh-rsa AAA", "ssh-ed25519 AAA"));
        assert!(!public_keys_match("garbage", "garbage"));
    }
}
