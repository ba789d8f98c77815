use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HomeportError, Result};

/// Username of the fixed system account bound to the server's own key.
pub const SYSTEM_ACCOUNT: &str = "_base_";

/// Capability granted to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Wildcard: every other permission
    #[serde(rename = "*")]
    Any,
    List,
    Download,
    Upload,
    Delete,
    Rename,
    CreateDirs,
    CreateSymlinks,
    Shell,
    TcpForward,
}

impl Permission {
    pub const ALL: [Permission; 10] = [
        Permission::Any,
        Permission::List,
        Permission::Download,
        Permission::Upload,
        Permission::Delete,
        Permission::Rename,
        Permission::CreateDirs,
        Permission::CreateSymlinks,
        Permission::Shell,
        Permission::TcpForward,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Any => "*",
            Permission::List => "list",
            Permission::Download => "download",
            Permission::Upload => "upload",
            Permission::Delete => "delete",
            Permission::Rename => "rename",
            Permission::CreateDirs => "create_dirs",
            Permission::CreateSymlinks => "create_symlinks",
            Permission::Shell => "shell",
            Permission::TcpForward => "tcp_forward",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = HomeportError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| HomeportError::Parse(format!("Unknown permission: {}", s)))
    }
}

/// Used quota counters as reported by the user store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub files: i64,
    pub size: i64,
}

/// A file server account
///
/// Limits use `0` (or any non-positive value for quotas) as "unlimited".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    pub username: String,
    /// Password hash in `sha256$<salt>$<hex>` form
    #[serde(default)]
    pub password: Option<String>,
    /// Authorized keys in OpenSSH format
    #[serde(default)]
    pub public_keys: Vec<String>,
    pub home_dir: PathBuf,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub max_sessions: u32,
    #[serde(default)]
    pub quota_size: i64,
    #[serde(default)]
    pub quota_files: i64,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub used_quota_size: i64,
    #[serde(default)]
    pub used_quota_files: i64,
    #[serde(default)]
    pub last_quota_update: Option<DateTime<Utc>>,
    /// Upload cap in bytes per second
    #[serde(default)]
    pub upload_bandwidth: u64,
    /// Download cap in bytes per second
    #[serde(default)]
    pub download_bandwidth: u64,
}

impl User {
    /// New account with no credentials, no limits and no permissions
    pub fn new(username: impl Into<String>, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: 0,
            username: username.into(),
            password: None,
            public_keys: Vec::new(),
            home_dir: home_dir.into(),
            uid: 0,
            gid: 0,
            max_sessions: 0,
            quota_size: 0,
            quota_files: 0,
            permissions: Vec::new(),
            used_quota_size: 0,
            used_quota_files: 0,
            last_quota_update: None,
            upload_bandwidth: 0,
            download_bandwidth: 0,
        }
    }

    /// The built-in account used by internal tooling
    pub fn system_account() -> Self {
        let mut user = Self::new(SYSTEM_ACCOUNT, "/");
        user.permissions = vec![Permission::Any];
        user
    }

    pub fn is_system_account(&self) -> bool {
        self.username == SYSTEM_ACCOUNT
    }

    pub fn has_perm(&self, permission: Permission) -> bool {
        self.permissions
            .iter()
            .any(|p| *p == Permission::Any || *p == permission)
    }

    pub fn home(&self) -> &Path {
        &self.home_dir
    }

    pub fn has_quota_size_limit(&self) -> bool {
        self.quota_size > 0
    }

    pub fn has_quota_files_limit(&self) -> bool {
        self.quota_files > 0
    }

    pub fn has_session_limit(&self) -> bool {
        self.max_sessions > 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(HomeportError::Validation("username is mandatory".into()));
        }
        if !self.home_dir.is_absolute() {
            return Err(HomeportError::Validation(format!(
                "home_dir must be an absolute path, actual value: {}",
                self.home_dir.display()
            )));
        }
        if !self.is_system_account() && self.password.is_none() && self.public_keys.is_empty() {
            return Err(HomeportError::Validation(
                "please set a password or at least a public key".into(),
            ));
        }
        if self.permissions.is_empty() {
            return Err(HomeportError::Validation(
                "please grant some permissions to this user".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_parsing() {
        assert_eq!("*".parse::<Permission>().unwrap(), Permission::Any);
        assert_eq!("create_dirs".parse::<Permission>().unwrap(), Permission::CreateDirs);
        assert_eq!("tcp-forward".parse::<Permission>().unwrap(), Permission::TcpForward);
        assert!("format_disk".parse::<Permission>().is_err());
    }

    #[test]
    fn test_permission_serde_names() {
        let json = serde_json::to_string(&vec![Permission::Any, Permission::CreateSymlinks]).unwrap();
        assert_eq!(json, r#"["*","create_symlinks"]"#);
    }

    #[test]
    fn test_wildcard_grants_everything() {
        let user = User::system_account();
        assert!(user.has_perm(Permission::Shell));
        assert!(user.has_perm(Permission::Delete));

        let mut limited = User::new("bob", "/home/bob");
        limited.permissions = vec![Permission::Download];
        assert!(limited.has_perm(Permission::Download));
        assert!(!limited.has_perm(Permission::Upload));
    }

    #[test]
    fn test_validate_requires_absolute_home() {
        let mut user = User::new("bob", "relative/home");
        user.password = Some("sha256$x$y".into());
        user.permissions = vec![Permission::List];
        assert!(user.validate().is_err());

        user.home_dir = PathBuf::from("/srv/bob");
        assert!(user.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut user = User::new("bob", "/srv/bob");
        user.permissions = vec![Permission::List];
        assert!(user.validate().is_err());
        assert!(User::system_account().validate().is_ok());
    }
}
