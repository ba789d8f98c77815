//! Local filesystem backend
//!
//! NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege), SC-6 (Resource Availability)
//! STIG: V-222396, V-222596
//! Implementation: Confinement, permission and quota checks run before any
//! storage call; stat-then-act sequences hold the connection's filesystem lock

use async_trait::async_trait;
use filetime::FileTime;
use homeport_core::Permission;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Command, DirEntry, FileSystem, ListMethod, Listing, ReadHandle};
use crate::actions::ActionOperation;
use crate::audit::AuditLogger;
use crate::config::UploadMode;
use crate::confine::{self, ResolvedPath};
use crate::connection::Connection;
use crate::protocol::{FileAttrs, OpenFlags};
use crate::quota::scan_dir;
use crate::transfer::{atomic_temp_path, Transfer, TransferEnv, UploadPlan};
use crate::{Error, Result};

/// Run a blocking metadata call off the async workers
async fn blocking<F>(call: F) -> Result<()>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| Error::Other(format!("metadata task failed: {}", e)))?
        .map_err(Error::from)
}

/// Behaviour switches for the local backend
#[derive(Debug, Clone, Copy)]
pub struct FsOptions {
    /// Bits removed from the mode of created files and directories
    pub umask: u32,
    /// Upload visibility mode
    pub upload_mode: UploadMode,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            umask: 0o022,
            upload_mode: UploadMode::Standard,
        }
    }
}

/// Filesystem rooted at the connection user's home directory
pub struct LocalFileSystem {
    connection: Arc<Connection>,
    env: TransferEnv,
    options: FsOptions,
}

impl LocalFileSystem {
    /// Bind a local filesystem to `connection`
    pub fn new(connection: Arc<Connection>, env: TransferEnv, options: FsOptions) -> Self {
        Self {
            connection,
            env,
            options,
        }
    }

    fn home(&self) -> &Path {
        self.connection.user.home()
    }

    fn username(&self) -> &str {
        &self.connection.user.username
    }

    fn require(&self, permission: Permission, operation: &str, path: &str) -> Result<()> {
        if self.connection.user.has_perm(permission) {
            return Ok(());
        }
        AuditLogger::log_security_event(
            self.connection.remote_addr,
            Some(self.username().to_string()),
            "permission_denied",
            format!("{} {} requires {}", operation, path, permission),
        );
        Err(Error::denied(format!("{} {}", operation, path)))
    }

    async fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        confine::resolve(self.home(), path).await
    }

    /// Give a created path to the user's uid/gid when configured
    async fn set_owner(&self, path: &Path) {
        let user = &self.connection.user;
        if user.uid == 0 && user.gid == 0 {
            return;
        }
        #[cfg(unix)]
        {
            let (uid, gid) = (user.uid, user.gid);
            let target = path.to_path_buf();
            if let Err(e) =
                blocking(move || std::os::unix::fs::lchown(target, Some(uid), Some(gid))).await
            {
                debug!(
                    path = %path.display(),
                    uid,
                    gid,
                    error = %e,
                    "Unable to set owner"
                );
            }
        }
    }

    async fn create_dir(&self, path: &Path) -> std::io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o777 & !self.options.umask);
        builder.create(path).await?;
        self.set_owner(path).await;
        Ok(())
    }

    async fn create_missing_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
        for dir in dirs {
            match self.create_dir(dir).await {
                Ok(()) => debug!(path = %dir.display(), "Created missing directory"),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn create_file(&self, path: &Path) -> Result<tokio::fs::File> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o666 & !self.options.umask);
        let file = options.open(path).await?;
        self.set_owner(path).await;
        Ok(file)
    }

    fn temp_for(&self, destination: &Path) -> Option<PathBuf> {
        match self.options.upload_mode {
            UploadMode::Atomic => Some(atomic_temp_path(destination, &Uuid::new_v4())),
            UploadMode::Standard => None,
        }
    }

    async fn handle_new_file(&self, resolved: ResolvedPath) -> Result<Arc<Transfer>> {
        let user = &self.connection.user;
        let headroom = self.env.quota.headroom(user, true).await.ok_or_else(|| {
            Error::QuotaExceeded(format!("{}: no space left", self.username()))
        })?;

        if !resolved.missing_dirs.is_empty() {
            self.require(
                Permission::CreateDirs,
                "create parent directories for",
                &resolved.path.display().to_string(),
            )?;
            self.create_missing_dirs(&resolved.missing_dirs).await?;
        }

        let temp_path = self.temp_for(&resolved.path);
        let file = self
            .create_file(temp_path.as_deref().unwrap_or(&resolved.path))
            .await?;

        Ok(Transfer::upload(
            self.connection.clone(),
            resolved.path,
            file,
            self.connection.protocol(),
            UploadPlan {
                temp_path,
                is_new: true,
                old_size: 0,
                limit: headroom.limit(),
            },
            self.env.clone(),
        )
        .await)
    }

    async fn handle_existing_file(
        &self,
        resolved: ResolvedPath,
        flags: OpenFlags,
        old_size: u64,
    ) -> Result<Arc<Transfer>> {
        let user = &self.connection.user;
        let headroom = self.env.quota.headroom(user, false).await.ok_or_else(|| {
            Error::QuotaExceeded(format!("{}: no space left", self.username()))
        })?;

        if !flags.has_trunc() {
            return Err(Error::NotSupported(format!(
                "{}: resume is not supported",
                resolved.path.display()
            )));
        }

        let temp_path = self.temp_for(&resolved.path);
        let file = match &temp_path {
            Some(temp) => self.create_file(temp).await?,
            None => {
                tokio::fs::OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(&resolved.path)
                    .await?
            }
        };

        let old_size = i64::try_from(old_size).unwrap_or(i64::MAX);
        self.env.quota.update(user, 0, -old_size).await;

        Ok(Transfer::upload(
            self.connection.clone(),
            resolved.path,
            file,
            self.connection.protocol(),
            UploadPlan {
                temp_path,
                is_new: false,
                old_size,
                limit: headroom
                    .plus(u64::try_from(old_size).unwrap_or(0))
                    .limit(),
            },
            self.env.clone(),
        )
        .await)
    }

    async fn rename(&self, source: &Path, target: &Path) -> Result<()> {
        let user = &self.connection.user;
        let replaced = match tokio::fs::symlink_metadata(target).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        };
        tokio::fs::rename(source, target)
            .await
            .map_err(|e| Error::from_io(e, source.display().to_string()))?;
        if let Some(size) = replaced {
            self.env
                .quota
                .update(user, -1, -i64::try_from(size).unwrap_or(i64::MAX))
                .await;
        }
        info!(
            username = %user.username,
            source = %source.display(),
            target = %target.display(),
            "Renamed"
        );
        self.env.actions.execute(
            ActionOperation::Rename,
            &user.username,
            source,
            Some(target),
        );
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| Error::from_io(e, path.display().to_string()))?;
        if !meta.is_dir() {
            return Err(Error::Other(format!("{} is not a directory", path.display())));
        }
        if path == self.home() {
            return Err(Error::denied("removing the home directory"));
        }

        let scan = scan_dir(path).await?;
        tokio::fs::remove_dir_all(path).await?;
        self.env
            .quota
            .update(&self.connection.user, -scan.files, -scan.size)
            .await;
        for removed in &scan.paths {
            self.env.actions.execute(
                ActionOperation::Delete,
                self.username(),
                removed,
                None,
            );
        }
        info!(
            username = %self.username(),
            path = %path.display(),
            files = scan.files,
            size = scan.size,
            "Removed directory"
        );
        Ok(())
    }

    async fn mkdir(&self, resolved: &ResolvedPath) -> Result<()> {
        self.create_missing_dirs(&resolved.missing_dirs).await?;
        self.create_dir(&resolved.path)
            .await
            .map_err(|e| Error::from_io(e, resolved.path.display().to_string()))
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        if tokio::fs::symlink_metadata(link).await.is_ok() {
            return Err(Error::NotSupported(format!(
                "{} already exists",
                link.display()
            )));
        }
        #[cfg(unix)]
        {
            tokio::fs::symlink(target, link).await?;
            self.set_owner(link).await;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            Err(Error::NotSupported("symbolic links".into()))
        }
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| Error::from_io(e, path.display().to_string()))?;
        if meta.is_dir() {
            return Err(Error::Other(format!("{} is a directory", path.display())));
        }
        tokio::fs::remove_file(path).await?;
        if !meta.file_type().is_symlink() {
            self.env
                .quota
                .update(
                    &self.connection.user,
                    -1,
                    -i64::try_from(meta.len()).unwrap_or(i64::MAX),
                )
                .await;
        }
        self.env
            .actions
            .execute(ActionOperation::Delete, self.username(), path, None);
        Ok(())
    }

    async fn setstat(&self, path: &Path, attrs: &FileAttrs) -> Result<()> {
        if tokio::fs::symlink_metadata(path).await.is_err() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
        if let Some(mode) = attrs.permissions {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
                    .await?;
            }
            #[cfg(not(unix))]
            let _ = mode;
        }
        if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
            #[cfg(unix)]
            {
                let target = path.to_path_buf();
                blocking(move || std::os::unix::fs::chown(target, Some(uid), Some(gid))).await?;
            }
            #[cfg(not(unix))]
            let _ = (uid, gid);
        }
        if let (Some(atime), Some(mtime)) = (attrs.atime, attrs.mtime) {
            let target = path.to_path_buf();
            blocking(move || {
                filetime::set_file_times(
                    target,
                    FileTime::from_unix_time(i64::from(atime), 0),
                    FileTime::from_unix_time(i64::from(mtime), 0),
                )
            })
            .await?;
        }
        if attrs.size.is_some() {
            debug!(path = %path.display(), "Ignoring size in setstat");
        }
        Ok(())
    }

    async fn run_command(&self, command: &Command) -> Result<()> {
        let path = command.path();
        let resolved = self.resolve(path).await?;
        let target = match command.target() {
            Some(target) => Some(self.resolve(target).await.map_err(|e| {
                debug!(target = %target, error = %e, "Invalid command target");
                Error::NotSupported(format!("invalid target {}", target))
            })?),
            None => None,
        };

        match command {
            Command::Rename { .. } => {
                self.require(Permission::Rename, "rename", path)?;
                let target = target.ok_or_else(|| Error::Protocol("missing target".into()))?;
                let _guard = self.connection.lock_fs().await;
                self.rename(&resolved.path, &target.path).await?;
                self.set_owner(&target.path).await;
            }
            Command::Rmdir { .. } => {
                self.require(Permission::Delete, "rmdir", path)?;
                self.rmdir(&resolved.path).await?;
            }
            Command::Mkdir { .. } => {
                self.require(Permission::CreateDirs, "mkdir", path)?;
                let _guard = self.connection.lock_fs().await;
                self.mkdir(&resolved).await?;
            }
            Command::Symlink { .. } => {
                self.require(Permission::CreateSymlinks, "symlink", path)?;
                let link = target.ok_or_else(|| Error::Protocol("missing link".into()))?;
                if !resolved.exists().await {
                    return Err(Error::FileNotFound(path.to_string()));
                }
                let _guard = self.connection.lock_fs().await;
                self.symlink(&resolved.path, &link.path).await?;
            }
            Command::Remove { .. } => {
                self.require(Permission::Delete, "remove", path)?;
                self.remove(&resolved.path).await?;
            }
            Command::Setstat { attrs, .. } => {
                self.setstat(&resolved.path, attrs).await?;
            }
        }
        Ok(())
    }

    fn entry_from(name: String, meta: &std::fs::Metadata) -> DirEntry {
        DirEntry {
            name,
            attrs: FileAttrs::from_metadata(meta),
        }
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map_or_else(|| "/".to_string(), |n| n.to_string_lossy().to_string())
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    async fn read(&self, path: &str) -> Result<ReadHandle> {
        let resolved = self.resolve(path).await?;
        self.require(Permission::Download, "download", path)?;
        let meta = tokio::fs::metadata(&resolved.path)
            .await
            .map_err(|e| Error::from_io(e, path.to_string()))?;
        if meta.is_dir() {
            return Err(Error::Other(format!("{} is a directory", path)));
        }
        let file = tokio::fs::File::open(&resolved.path)
            .await
            .map_err(|e| Error::from_io(e, path.to_string()))?;

        let transfer = Transfer::download(
            self.connection.clone(),
            resolved.path,
            file,
            self.connection.protocol(),
            self.env.clone(),
        )
        .await;
        Ok(ReadHandle {
            transfer,
            attrs: FileAttrs::from_metadata(&meta),
        })
    }

    async fn write(&self, path: &str, flags: OpenFlags) -> Result<Arc<Transfer>> {
        let resolved = self.resolve(path).await?;
        self.require(Permission::Upload, "upload", path)?;

        let _guard = self.connection.lock_fs().await;
        match tokio::fs::metadata(&resolved.path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.handle_new_file(resolved).await
            }
            Err(e) => Err(e.into()),
            Ok(meta) if meta.is_dir() => Err(Error::NotSupported(format!(
                "{} is a directory",
                path
            ))),
            Ok(meta) => self.handle_existing_file(resolved, flags, meta.len()).await,
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        let result = self.run_command(&command).await;
        if let Err(e) = &result {
            if !matches!(e, Error::PermissionDenied(_)) {
                warn!(
                    username = %self.username(),
                    operation = command.name(),
                    path = %command.path(),
                    error = %e,
                    "File command failed"
                );
            }
        }
        AuditLogger::log_command(
            self.username(),
            command.name(),
            command.path(),
            command.target(),
            &result,
        );
        result
    }

    async fn list(&self, method: ListMethod, path: &str) -> Result<Listing> {
        let resolved = self.resolve(path).await?;
        self.require(Permission::List, "list", path)?;
        let not_found = |e| Error::from_io(e, path.to_string());

        match method {
            ListMethod::List => {
                let mut entries = Vec::new();
                let mut dir = tokio::fs::read_dir(&resolved.path).await.map_err(not_found)?;
                while let Some(entry) = dir.next_entry().await? {
                    let Ok(meta) = entry.metadata().await else {
                        continue;
                    };
                    entries.push(Self::entry_from(
                        entry.file_name().to_string_lossy().to_string(),
                        &meta,
                    ));
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(Listing::new(entries))
            }
            ListMethod::Stat => {
                let meta = tokio::fs::metadata(&resolved.path).await.map_err(not_found)?;
                Ok(Listing::new(vec![Self::entry_from(
                    Self::file_name(&resolved.path),
                    &meta,
                )]))
            }
            ListMethod::Lstat => {
                let meta = tokio::fs::symlink_metadata(&resolved.path)
                    .await
                    .map_err(not_found)?;
                Ok(Listing::new(vec![Self::entry_from(
                    Self::file_name(&resolved.path),
                    &meta,
                )]))
            }
            ListMethod::Readlink => {
                let target = tokio::fs::read_link(&resolved.path)
                    .await
                    .map_err(not_found)?;
                let name = if target.is_absolute() {
                    if !target.starts_with(self.home()) {
                        return Err(Error::EscapesHome(path.to_string()));
                    }
                    confine::virtual_path(self.home(), &target)
                } else {
                    target.to_string_lossy().to_string()
                };
                Ok(Listing::new(vec![DirEntry {
                    name,
                    attrs: FileAttrs::default(),
                }]))
            }
        }
    }

    async fn realpath(&self, path: &str) -> Result<String> {
        let resolved = self.resolve(path).await?;
        self.require(Permission::List, "realpath", path)?;
        Ok(confine::virtual_path(self.home(), &resolved.path))
    }
}
