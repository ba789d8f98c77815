//! In-flight file transfers
//!
//! NIST 800-53: SC-6 (Resource Availability), AU-12 (Audit Generation)
//! Implementation: A transfer owns the open file, paces reads and writes to the
//! user's bandwidth cap, enforces the byte headroom captured at open, and
//! finalizes quota and atomic renames exactly once on close

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::actions::{ActionOperation, ActionRunner};
use crate::audit::AuditEvent;
use crate::connection::{Connection, Protocol};
use crate::quota::QuotaManager;
use crate::{Error, Result};

/// Prefix of the hidden sibling used by atomic uploads
pub const ATOMIC_UPLOAD_PREFIX: &str = ".homeport-upload";

/// Hidden temporary sibling of `destination` for an atomic upload
pub fn atomic_temp_path(destination: &Path, id: &Uuid) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_name = format!("{}.{}.{}", ATOMIC_UPLOAD_PREFIX, id.simple(), name);
    destination
        .parent()
        .map_or_else(|| PathBuf::from(&file_name), |p| p.join(&file_name))
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to server
    Upload,
    /// Server to client
    Download,
}

impl Direction {
    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// Collaborators shared by every transfer of a connection
#[derive(Clone)]
pub struct TransferEnv {
    /// Quota updates
    pub quota: QuotaManager,
    /// Notification actions
    pub actions: Arc<ActionRunner>,
    /// Process-wide transfer registry
    pub registry: Arc<TransferRegistry>,
}

/// Upload bookkeeping decided when the file was opened
#[derive(Debug, Clone, Default)]
pub struct UploadPlan {
    /// Hidden sibling written instead of the destination (atomic mode)
    pub temp_path: Option<PathBuf>,
    /// Destination did not exist before the upload
    pub is_new: bool,
    /// Size of the replaced file, already subtracted from the quota
    pub old_size: i64,
    /// Maximum bytes the upload may write
    pub limit: Option<u64>,
}

/// Snapshot of a transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    /// Transfer identifier
    pub id: Uuid,
    /// Owning connection
    pub connection_id: Uuid,
    /// Owning user
    pub username: String,
    /// Destination or source path
    pub path: PathBuf,
    /// Direction
    pub direction: Direction,
    /// Protocol label
    pub protocol: Protocol,
    /// Bytes transferred so far
    pub size: u64,
    /// Start time
    pub start_time: DateTime<Utc>,
    /// Last read or write
    pub last_activity: DateTime<Utc>,
}

/// An open upload or download
pub struct Transfer {
    id: Uuid,
    connection: Arc<Connection>,
    path: PathBuf,
    direction: Direction,
    protocol: Protocol,
    file: Mutex<Option<File>>,
    start_time: DateTime<Utc>,
    started: Instant,
    last_activity: AtomicI64,
    bytes: AtomicU64,
    extent: AtomicU64,
    plan: UploadPlan,
    bandwidth: u64,
    error: Mutex<Option<String>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    env: TransferEnv,
}

impl Transfer {
    /// Register a download of `path` through `file`
    pub async fn download(
        connection: Arc<Connection>,
        path: PathBuf,
        file: File,
        protocol: Protocol,
        env: TransferEnv,
    ) -> Arc<Self> {
        let bandwidth = connection.user.download_bandwidth;
        Self::register(
            connection,
            path,
            file,
            Direction::Download,
            protocol,
            UploadPlan::default(),
            bandwidth,
            env,
        )
        .await
    }

    /// Register an upload to `path` through `file`
    pub async fn upload(
        connection: Arc<Connection>,
        path: PathBuf,
        file: File,
        protocol: Protocol,
        plan: UploadPlan,
        env: TransferEnv,
    ) -> Arc<Self> {
        let bandwidth = connection.user.upload_bandwidth;
        Self::register(
            connection,
            path,
            file,
            Direction::Upload,
            protocol,
            plan,
            bandwidth,
            env,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn register(
        connection: Arc<Connection>,
        path: PathBuf,
        file: File,
        direction: Direction,
        protocol: Protocol,
        plan: UploadPlan,
        bandwidth: u64,
        env: TransferEnv,
    ) -> Arc<Self> {
        let now = Utc::now();
        let cancel = connection.cancel_token().child_token();
        let transfer = Arc::new(Self {
            id: Uuid::new_v4(),
            connection,
            path,
            direction,
            protocol,
            file: Mutex::new(Some(file)),
            start_time: now,
            started: Instant::now(),
            last_activity: AtomicI64::new(now.timestamp_millis()),
            bytes: AtomicU64::new(0),
            extent: AtomicU64::new(0),
            plan,
            bandwidth,
            error: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel,
            env,
        });
        transfer.env.registry.add(transfer.clone()).await;
        debug!(
            transfer_id = %transfer.id,
            connection_id = %transfer.connection.id,
            direction = transfer.direction.as_str(),
            path = %transfer.path.display(),
            "Transfer started"
        );
        transfer
    }

    /// Transfer identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Destination or source path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the destination did not exist before this upload
    pub fn is_new(&self) -> bool {
        self.plan.is_new
    }

    /// Bytes read or written so far
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Last read or write
    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.start_time)
    }

    /// Snapshot
    pub fn status(&self) -> TransferStatus {
        TransferStatus {
            id: self.id,
            connection_id: self.connection.id,
            username: self.connection.user.username.clone(),
            path: self.path.clone(),
            direction: self.direction,
            protocol: self.protocol,
            size: self.bytes_transferred(),
            start_time: self.start_time,
            last_activity: self.last_activity(),
        }
    }

    /// Abort the transfer; blocked reads, writes and throttling return an error
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Record a failure so close discards the upload
    pub async fn fail(&self, reason: impl Into<String>) {
        let mut error = self.error.lock().await;
        if error.is_none() {
            *error = Some(reason.into());
        }
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.connection.touch();
    }

    /// Read up to `len` bytes at `offset`
    ///
    /// # Errors
    ///
    /// `Eof` at end of file, `ChannelClosed` if the transfer was aborted.
    pub async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        if self.direction != Direction::Download {
            return Err(Error::invalid_handle("handle not open for reading"));
        }
        let data = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::channel_closed("transfer aborted")),
            result = self.read_inner(offset, len) => result?,
        };
        if data.is_empty() {
            return Err(Error::Eof);
        }
        self.account(data.len() as u64).await?;
        Ok(data)
    }

    async fn read_inner(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| Error::invalid_handle("transfer closed"))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write `data` at `offset`
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` when the write would pass the headroom captured at open.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.direction != Direction::Upload {
            return Err(Error::invalid_handle("handle not open for writing"));
        }
        let end = offset.saturating_add(data.len() as u64);
        if let Some(limit) = self.plan.limit {
            if end > limit {
                self.fail("quota exceeded").await;
                return Err(Error::QuotaExceeded(format!(
                    "{}: write past {} bytes",
                    self.path.display(),
                    limit
                )));
            }
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::channel_closed("transfer aborted")),
            result = self.write_inner(offset, data) => result,
        };
        if let Err(e) = result {
            self.fail(e.to_string()).await;
            return Err(e);
        }
        self.extent.fetch_max(end, Ordering::Relaxed);
        self.account(data.len() as u64).await
    }

    async fn write_inner(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| Error::invalid_handle("transfer closed"))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    /// Count bytes and pace to the bandwidth cap
    async fn account(&self, bytes: u64) -> Result<()> {
        self.touch();
        let total = self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if self.bandwidth == 0 {
            return Ok(());
        }
        let wanted = Duration::from_millis(total.saturating_mul(1000) / self.bandwidth);
        let elapsed = self.started.elapsed();
        if wanted > elapsed {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::channel_closed("transfer aborted")),
                _ = tokio::time::sleep(wanted - elapsed) => {}
            }
        }
        Ok(())
    }

    /// Finish the transfer: flush, rename, apply quota, fire actions
    ///
    /// Only the first call does anything; later calls return `Ok`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut outcome = match self.error.lock().await.take() {
            Some(reason) => Err(Error::Other(reason)),
            None if self.cancel.is_cancelled() => Err(Error::channel_closed("transfer aborted")),
            None => Ok(()),
        };

        if let Some(mut file) = self.file.lock().await.take() {
            if self.direction == Direction::Upload && outcome.is_ok() {
                if let Err(e) = file.flush().await {
                    outcome = Err(e.into());
                }
            }
            drop(file);
        }

        let outcome = match self.direction {
            Direction::Download => {
                if outcome.is_ok() {
                    self.env.actions.execute(
                        ActionOperation::Download,
                        &self.connection.user.username,
                        &self.path,
                        None,
                    );
                }
                outcome
            }
            Direction::Upload => self.finish_upload(outcome).await,
        };

        self.env.registry.remove(&self.id).await;

        AuditEvent::Transfer {
            connection_id: self.connection.id.to_string(),
            username: self.connection.user.username.clone(),
            direction: self.direction.as_str().to_string(),
            protocol: self.protocol.as_str().to_string(),
            path: self.path.display().to_string(),
            bytes: self.bytes_transferred(),
            duration_ms: i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            timestamp: Utc::now(),
        }
        .log();

        outcome
    }

    async fn finish_upload(&self, outcome: Result<()>) -> Result<()> {
        let user = &self.connection.user;
        let quota = &self.env.quota;
        let plan = &self.plan;

        match outcome {
            Ok(()) => {
                if let Some(temp) = &plan.temp_path {
                    if let Err(e) = tokio::fs::rename(temp, &self.path).await {
                        warn!(
                            temp = %temp.display(),
                            path = %self.path.display(),
                            error = %e,
                            "Atomic upload rename failed"
                        );
                        remove_quietly(temp).await;
                        if !plan.is_new {
                            quota.update(user, 0, plan.old_size).await;
                        }
                        return Err(e.into());
                    }
                }
                let size = i64::try_from(self.extent.load(Ordering::Relaxed)).unwrap_or(i64::MAX);
                quota
                    .update(user, i64::from(plan.is_new), size)
                    .await;
                self.env.actions.execute(
                    ActionOperation::Upload,
                    &user.username,
                    &self.path,
                    None,
                );
                Ok(())
            }
            Err(e) => {
                match &plan.temp_path {
                    Some(temp) => {
                        // The original file was never touched
                        remove_quietly(temp).await;
                        if !plan.is_new {
                            quota.update(user, 0, plan.old_size).await;
                        }
                    }
                    None => {
                        remove_quietly(&self.path).await;
                        if !plan.is_new {
                            quota.update(user, -1, 0).await;
                        }
                    }
                }
                Err(e)
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Unable to remove incomplete upload");
        }
    }
}

/// Process-wide registry of in-flight transfers
#[derive(Default)]
pub struct TransferRegistry {
    transfers: Mutex<HashMap<Uuid, Arc<Transfer>>>,
}

impl TransferRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer
    pub async fn add(&self, transfer: Arc<Transfer>) {
        self.transfers.lock().await.insert(transfer.id, transfer);
    }

    /// Remove a transfer
    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Transfer>> {
        self.transfers.lock().await.remove(id)
    }

    /// Number of transfers in flight
    pub async fn len(&self) -> usize {
        self.transfers.lock().await.len()
    }

    /// Whether no transfer is in flight
    pub async fn is_empty(&self) -> bool {
        self.transfers.lock().await.is_empty()
    }

    /// Status of every transfer
    pub async fn list(&self) -> Vec<TransferStatus> {
        self.transfers
            .lock()
            .await
            .values()
            .map(|t| t.status())
            .collect()
    }

    /// Transfers owned by one connection
    pub async fn for_connection(&self, connection_id: &Uuid) -> Vec<TransferStatus> {
        self.transfers
            .lock()
            .await
            .values()
            .filter(|t| t.connection.id == *connection_id)
            .map(|t| t.status())
            .collect()
    }

    /// Transfers without activity for longer than `threshold`
    pub async fn idle(&self, threshold: chrono::Duration) -> Vec<Arc<Transfer>> {
        let now = Utc::now();
        self.transfers
            .lock()
            .await
            .values()
            .filter(|t| now.signed_duration_since(t.last_activity()) > threshold)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_temp_path_is_hidden_sibling() {
        let id = Uuid::new_v4();
        let temp = atomic_temp_path(Path::new("/srv/alice/docs/report.pdf"), &id);
        assert_eq!(temp.parent(), Some(Path::new("/srv/alice/docs")));
        let name = temp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".homeport-upload."));
        assert!(name.ends_with(".report.pdf"));
        assert!(name.contains(&id.simple().to_string()));
    }
}
