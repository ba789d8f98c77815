//! Quota enforcement and background quota scans
//!
//! NIST 800-53: SC-6 (Resource Availability), AU-12 (Audit Generation)
//! Implementation: Usage counters live in the user store; this module decides
//! whether an upload may start and applies deltas at well-defined points

use chrono::{DateTime, Utc};
use homeport_core::{User, UserStore};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::AuditEvent;
use crate::Result;

/// Space left for a new upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Headroom {
    /// No byte limit applies
    Unlimited,
    /// Bytes that may still be written
    Bytes(u64),
}

impl Headroom {
    /// Add bytes released by a truncated file
    pub fn plus(self, bytes: u64) -> Self {
        match self {
            Headroom::Unlimited => Headroom::Unlimited,
            Headroom::Bytes(n) => Headroom::Bytes(n.saturating_add(bytes)),
        }
    }

    /// Byte cap, `None` when unlimited
    pub fn limit(self) -> Option<u64> {
        match self {
            Headroom::Unlimited => None,
            Headroom::Bytes(n) => Some(n),
        }
    }
}

/// Quota checks and updates against the user store
#[derive(Clone)]
pub struct QuotaManager {
    store: Arc<dyn UserStore>,
}

impl QuotaManager {
    /// Create a quota manager backed by `store`
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Whether the user may add data, and how much
    ///
    /// Returns `None` when the quota is exhausted or the store cannot be read.
    /// When the store reports quota tracking as disabled, space is assumed
    /// available and the decision is logged.
    pub async fn headroom(&self, user: &User, check_files: bool) -> Option<Headroom> {
        let files_limited = check_files && user.has_quota_files_limit();
        if !files_limited && !user.has_quota_size_limit() {
            return Some(Headroom::Unlimited);
        }

        let usage = match self.store.used_quota(&user.username).await {
            Ok(usage) => usage,
            Err(e) if e.is_method_disabled() => {
                warn!(
                    event = "quota_fail_open",
                    username = %user.username,
                    "Quota tracking unavailable for user, allowing upload"
                );
                return Some(Headroom::Unlimited);
            }
            Err(e) => {
                warn!(
                    username = %user.username,
                    error = %e,
                    "Unable to read used quota, denying upload"
                );
                return None;
            }
        };

        if files_limited && usage.files >= user.quota_files {
            debug!(
                username = %user.username,
                used = usage.files,
                limit = user.quota_files,
                "File count quota exhausted"
            );
            return None;
        }
        if user.has_quota_size_limit() {
            if usage.size >= user.quota_size {
                debug!(
                    username = %user.username,
                    used = usage.size,
                    limit = user.quota_size,
                    "Size quota exhausted"
                );
                return None;
            }
            let left = u64::try_from(user.quota_size - usage.size).unwrap_or(0);
            return Some(Headroom::Bytes(left));
        }
        Some(Headroom::Unlimited)
    }

    /// Whether the user has room for more data
    pub async fn has_space(&self, user: &User, check_files: bool) -> bool {
        self.headroom(user, check_files).await.is_some()
    }

    /// Apply a usage delta; failures are logged, never surfaced to the client
    pub async fn update(&self, user: &User, files: i64, size: i64) {
        if user.is_system_account() || (files == 0 && size == 0) {
            return;
        }
        if let Err(e) = self
            .store
            .update_quota(&user.username, files, size, false)
            .await
        {
            warn!(
                username = %user.username,
                files,
                size,
                error = %e,
                "Quota update failed"
            );
        }
    }

    /// Overwrite the stored usage with a scan result
    pub async fn reset(&self, user: &User, scan: &ScanResult) -> Result<()> {
        self.store
            .update_quota(&user.username, scan.files, scan.size, true)
            .await?;
        Ok(())
    }
}

/// Regular files found under a directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Number of regular files
    pub files: i64,
    /// Sum of their sizes
    pub size: i64,
    /// Their paths
    pub paths: Vec<PathBuf>,
}

impl ScanResult {
    /// Count one regular file; totals saturate instead of wrapping
    pub fn add_file(&mut self, path: PathBuf, len: u64) {
        self.files = self.files.saturating_add(1);
        self.size = self
            .size
            .saturating_add(i64::try_from(len).unwrap_or(i64::MAX));
        self.paths.push(path);
    }
}

/// Count regular files and bytes under `root` without following symlinks
pub async fn scan_dir(root: &Path) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| crate::Error::from_io(e, dir.display().to_string()))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let meta = entry.metadata().await?;
                result.add_file(entry.path(), meta.len());
            }
        }
    }

    Ok(result)
}

/// Users with a quota scan in progress
///
/// A username's presence is a mutual-exclusion marker for scans.
#[derive(Debug, Default)]
pub struct QuotaScanRegistry {
    scans: Mutex<HashMap<String, DateTime<Utc>>>,
}

/// An active quota scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveQuotaScan {
    /// Scanned user
    pub username: String,
    /// When the scan started
    pub start_time: DateTime<Utc>,
}

impl QuotaScanRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a scan active. Returns false if one is already running for `username`.
    pub async fn add(&self, username: &str) -> bool {
        let mut scans = self.scans.lock().await;
        if scans.contains_key(username) {
            return false;
        }
        scans.insert(username.to_string(), Utc::now());
        true
    }

    /// Clear the marker for `username`
    pub async fn remove(&self, username: &str) -> bool {
        self.scans.lock().await.remove(username).is_some()
    }

    /// Whether a scan is running for `username`
    pub async fn contains(&self, username: &str) -> bool {
        self.scans.lock().await.contains_key(username)
    }

    /// Active scans, ordered by username
    pub async fn list(&self) -> Vec<ActiveQuotaScan> {
        let scans = self.scans.lock().await;
        let mut list: Vec<ActiveQuotaScan> = scans
            .iter()
            .map(|(username, start_time)| ActiveQuotaScan {
                username: username.clone(),
                start_time: *start_time,
            })
            .collect();
        list.sort_by(|a, b| a.username.cmp(&b.username));
        list
    }
}

/// Walk the user's home and overwrite the stored usage
pub async fn run_quota_scan(quota: &QuotaManager, user: &User) -> Result<ScanResult> {
    let result = scan_dir(user.home()).await;
    let outcome = match result {
        Ok(scan) => quota.reset(user, &scan).await.map(|()| scan),
        Err(e) => Err(e),
    };

    let (files, size) = outcome
        .as_ref()
        .map(|s| (s.files, s.size))
        .unwrap_or_default();
    AuditEvent::QuotaScan {
        username: user.username.clone(),
        files,
        size,
        success: outcome.is_ok(),
        timestamp: Utc::now(),
    }
    .log();
    outcome
}

/// Start a background scan for `user`
///
/// Returns false without doing anything if a scan for that user is already
/// running. The marker is cleared when the scan ends, whatever the outcome.
pub async fn start_quota_scan(
    quota: QuotaManager,
    registry: Arc<QuotaScanRegistry>,
    user: User,
) -> bool {
    if !registry.add(&user.username).await {
        debug!(username = %user.username, "Quota scan already running");
        return false;
    }

    info!(username = %user.username, "Starting quota scan");
    tokio::spawn(async move {
        if let Err(e) = run_quota_scan(&quota, &user).await {
            warn!(username = %user.username, error = %e, "Quota scan failed");
        }
        registry.remove(&user.username).await;
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeport_core::{MemoryUserStore, Permission};
    use tempfile::TempDir;

    fn create_test_user(home: &Path) -> User {
        let mut user = User::new("alice", home);
        user.password = Some(homeport_core::password::hash_password("secret"));
        user.permissions = vec![Permission::Any];
        user
    }

    #[tokio::test]
    async fn test_scan_counts_regular_files_only() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"12345").unwrap();
        std::fs::write(dir.path().join("a/b/deep.txt"), b"123").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("link")).unwrap();

        let scan = scan_dir(dir.path()).await.unwrap();
        assert_eq!(scan.files, 2);
        assert_eq!(scan.size, 8);
        assert_eq!(scan.paths.len(), 2);
    }

    #[test]
    fn test_scan_totals_saturate() {
        let mut scan = ScanResult::default();
        scan.add_file(PathBuf::from("/a"), u64::MAX);
        scan.add_file(PathBuf::from("/b"), 10);
        assert_eq!(scan.files, 2);
        assert_eq!(scan.size, i64::MAX);
        assert_eq!(scan.paths.len(), 2);
    }

    #[tokio::test]
    async fn test_headroom() {
        let dir = TempDir::new().unwrap();
        let mut user = create_test_user(dir.path());
        user.quota_size = 100;
        user.quota_files = 2;
        let store = Arc::new(MemoryUserStore::with_users(vec![user.clone()], true));
        let quota = QuotaManager::new(store.clone());

        assert_eq!(quota.headroom(&user, true).await, Some(Headroom::Bytes(100)));

        store.update_quota("alice", 2, 40, false).await.unwrap();
        assert_eq!(quota.headroom(&user, true).await, None);
        assert_eq!(quota.headroom(&user, false).await, Some(Headroom::Bytes(60)));

        store.update_quota("alice", 0, 60, false).await.unwrap();
        assert!(!quota.has_space(&user, false).await);
    }

    #[tokio::test]
    async fn test_tracking_disabled_fails_open() {
        let dir = TempDir::new().unwrap();
        let mut user = create_test_user(dir.path());
        user.quota_size = 1;
        let store = Arc::new(MemoryUserStore::with_users(vec![user.clone()], false));
        let quota = QuotaManager::new(store);
        assert_eq!(quota.headroom(&user, true).await, Some(Headroom::Unlimited));
    }

    #[tokio::test]
    async fn test_single_flight_registry() {
        let registry = QuotaScanRegistry::new();
        assert!(registry.add("alice").await);
        assert!(!registry.add("alice").await);
        assert!(registry.add("bob").await);
        assert_eq!(registry.list().await.len(), 2);

        assert!(registry.remove("alice").await);
        assert!(registry.add("alice").await);
    }

    #[tokio::test]
    async fn test_background_scan_clears_marker() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        let user = create_test_user(dir.path());
        let store = Arc::new(MemoryUserStore::with_users(vec![user.clone()], true));
        let registry = Arc::new(QuotaScanRegistry::new());

        assert!(start_quota_scan(QuotaManager::new(store.clone()), registry.clone(), user.clone()).await);

        for _ in 0..100 {
            if !registry.contains("alice").await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!registry.contains("alice").await);
        let usage = store.used_quota("alice").await.unwrap();
        assert_eq!((usage.files, usage.size), (1, 3));
    }

    #[tokio::test]
    async fn test_failed_scan_clears_marker() {
        let mut user = create_test_user(Path::new("/"));
        user.home_dir = PathBuf::from("/nonexistent/homeport/home");
        let store = Arc::new(MemoryUserStore::with_users(vec![user.clone()], true));
        let registry = Arc::new(QuotaScanRegistry::new());

        assert!(start_quota_scan(QuotaManager::new(store), registry.clone(), user).await);
        for _ in 0..100 {
            if !registry.contains("alice").await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(registry.add("alice").await);
    }
}
