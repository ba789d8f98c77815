//! Virtual filesystem
//!
//! NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege)
//! Implementation: The wire engines only talk to [`FileSystem`]; every call
//! resolves its paths inside the user's home and checks the user's permissions
//! before touching storage

use async_trait::async_trait;
use std::sync::Arc;

use crate::connection::Connection;
use crate::protocol::{FileAttrs, OpenFlags};
use crate::transfer::Transfer;
use crate::Result;

pub mod local;

pub use local::{FsOptions, LocalFileSystem};

/// Path-changing operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Move `source` to `target`
    Rename {
        /// Existing path
        source: String,
        /// New path
        target: String,
    },
    /// Remove a directory and everything below it
    Rmdir {
        /// Directory path
        path: String,
    },
    /// Create a directory and any missing parents
    Mkdir {
        /// Directory path
        path: String,
    },
    /// Create `link` pointing at `target`
    Symlink {
        /// Existing path the link points at
        target: String,
        /// New link path
        link: String,
    },
    /// Remove a file or symbolic link
    Remove {
        /// File path
        path: String,
    },
    /// Change mode, ownership or times
    Setstat {
        /// File path
        path: String,
        /// Attributes to apply; absent fields are left alone
        attrs: FileAttrs,
    },
}

impl Command {
    /// Operation name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Rename { .. } => "rename",
            Command::Rmdir { .. } => "rmdir",
            Command::Mkdir { .. } => "mkdir",
            Command::Symlink { .. } => "symlink",
            Command::Remove { .. } => "remove",
            Command::Setstat { .. } => "setstat",
        }
    }

    /// Primary path
    pub fn path(&self) -> &str {
        match self {
            Command::Rename { source, .. } => source,
            Command::Symlink { target, .. } => target,
            Command::Rmdir { path }
            | Command::Mkdir { path }
            | Command::Remove { path }
            | Command::Setstat { path, .. } => path,
        }
    }

    /// Second path for rename and symlink
    pub fn target(&self) -> Option<&str> {
        match self {
            Command::Rename { target, .. } => Some(target),
            Command::Symlink { link, .. } => Some(link),
            _ => None,
        }
    }
}

/// Listing variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMethod {
    /// Directory contents
    List,
    /// Single entry, following symlinks
    Stat,
    /// Single entry, not following symlinks
    Lstat,
    /// Target of a symbolic link
    Readlink,
}

/// One listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (or link target for readlink)
    pub name: String,
    /// Attributes
    pub attrs: FileAttrs,
}

/// Finite directory listing read by offset
#[derive(Debug, Clone, Default)]
pub struct Listing {
    entries: Vec<DirEntry>,
}

impl Listing {
    /// Wrap entries
    pub fn new(entries: Vec<DirEntry>) -> Self {
        Self { entries }
    }

    /// Up to `max` entries starting at `offset`; empty once past the end
    pub fn list_at(&self, offset: usize, max: usize) -> &[DirEntry] {
        if offset >= self.entries.len() {
            return &[];
        }
        let end = offset.saturating_add(max).min(self.entries.len());
        &self.entries[offset..end]
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the listing is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }
}

/// A file opened for download
pub struct ReadHandle {
    /// The registered transfer
    pub transfer: Arc<Transfer>,
    /// Attributes captured at open
    pub attrs: FileAttrs,
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}

/// Storage backend contract shared by every protocol engine
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Connection this filesystem is bound to
    fn connection(&self) -> &Arc<Connection>;

    /// Open `path` for download
    async fn read(&self, path: &str) -> Result<ReadHandle>;

    /// Open `path` for upload
    async fn write(&self, path: &str, flags: OpenFlags) -> Result<Arc<Transfer>>;

    /// Run a path-changing command
    async fn command(&self, command: Command) -> Result<()>;

    /// Stat, list or read a link
    async fn list(&self, method: ListMethod, path: &str) -> Result<Listing>;

    /// Canonical client-visible form of `path`
    async fn realpath(&self, path: &str) -> Result<String>;
}
