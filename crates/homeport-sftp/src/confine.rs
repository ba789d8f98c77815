//! Home directory confinement
//!
//! NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege)
//! STIG: V-222396 - The application must enforce approved authorizations for logical access
//! Implementation: Every client path is joined to the home directory, cleaned, and checked
//! against the symlink-resolved home at the last existing point of the path

use std::path::{Component, Path, PathBuf};
use tracing::warn;

use crate::{Error, Result};

/// A client path resolved inside a home directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Absolute path under the home directory, not symlink-resolved
    pub path: PathBuf,
    /// Ancestors of `path` that do not exist yet, outermost first
    pub missing_dirs: Vec<PathBuf>,
}

impl ResolvedPath {
    /// Whether the path itself exists
    pub async fn exists(&self) -> bool {
        tokio::fs::symlink_metadata(&self.path).await.is_ok()
    }
}

/// Lexically normalize a path: drop `.`, apply `..` without touching the filesystem
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Join a client path onto the home directory and clean it
pub fn join(home: &Path, requested: &str) -> PathBuf {
    let relative = requested.trim_start_matches('/');
    clean(&home.join(relative))
}

/// Resolve a client-supplied path to a location guaranteed to be inside `home`
///
/// # NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation)
/// # STIG: V-222396
/// # Implementation: Symlinks are evaluated at the deepest existing ancestor,
/// # so a link inside the home pointing outside it is caught even when the
/// # final component does not exist yet
///
/// # Errors
///
/// `EscapesHome` when the path leaves the home directory, `FileNotFound`
/// when the home is missing or the deepest existing ancestor is not a directory.
pub async fn resolve(home: &Path, requested: &str) -> Result<ResolvedPath> {
    let home_real = tokio::fs::canonicalize(home)
        .await
        .map_err(|e| Error::from_io(e, format!("home directory {}", home.display())))?;
    let path = join(home, requested);

    match tokio::fs::canonicalize(&path).await {
        Ok(real) => {
            ensure_inside(&home_real, &real, requested)?;
            Ok(ResolvedPath {
                path,
                missing_dirs: Vec::new(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Ok(meta) = tokio::fs::symlink_metadata(&path).await {
                if meta.file_type().is_symlink() {
                    check_dangling_link(&home_real, &path, requested).await?;
                }
            }
            let missing_dirs = check_missing(&home_real, &path, requested).await?;
            Ok(ResolvedPath { path, missing_dirs })
        }
        Err(e) => Err(Error::from_io(e, requested.to_string())),
    }
}

/// Translate an absolute path under `home` back into the client's view, rooted at `/`
pub fn virtual_path(home: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(home).unwrap_or(Path::new(""));
    let mut out = String::from("/");
    out.push_str(&relative.to_string_lossy());
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn ensure_inside(home_real: &Path, real: &Path, requested: &str) -> Result<()> {
    if real.starts_with(home_real) {
        Ok(())
    } else {
        warn!(
            event = "path_escape",
            requested = %requested,
            home = %home_real.display(),
            "Path resolves outside home directory"
        );
        Err(Error::EscapesHome(requested.to_string()))
    }
}

/// Walk up from the parent of a missing path to the first existing ancestor
/// and check it. Returns the missing ancestors, outermost first.
async fn check_missing(home_real: &Path, path: &Path, requested: &str) -> Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut current = path.parent();

    while let Some(dir) = current {
        match tokio::fs::symlink_metadata(dir).await {
            Ok(_) => {
                let real = tokio::fs::canonicalize(dir)
                    .await
                    .map_err(|e| Error::from_io(e, requested.to_string()))?;
                ensure_inside(home_real, &real, requested)?;
                let meta = tokio::fs::metadata(&real)
                    .await
                    .map_err(|e| Error::from_io(e, requested.to_string()))?;
                if !meta.is_dir() {
                    return Err(Error::FileNotFound(format!(
                        "{}: ancestor is not a directory",
                        requested
                    )));
                }
                missing.reverse();
                return Ok(missing);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                missing.push(dir.to_path_buf());
                current = dir.parent();
            }
            Err(e) => return Err(Error::from_io(e, requested.to_string())),
        }
    }

    Err(Error::EscapesHome(requested.to_string()))
}

/// A link whose target does not exist must still point inside the home,
/// otherwise creating the target would write outside it
async fn check_dangling_link(home_real: &Path, link: &Path, requested: &str) -> Result<()> {
    let target = tokio::fs::read_link(link)
        .await
        .map_err(|e| Error::from_io(e, requested.to_string()))?;
    let parent = link.parent().unwrap_or(Path::new("/"));
    let target = clean(&parent.join(target));
    if tokio::fs::symlink_metadata(&target).await.is_ok() {
        // Chain of links ending in a missing file; refuse rather than follow
        return Err(Error::EscapesHome(requested.to_string()));
    }
    check_missing(home_real, &target, requested).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(clean(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }

    #[test]
    fn test_join_strips_leading_slash() {
        let home = Path::new("/srv/alice");
        assert_eq!(join(home, "/docs/a.txt"), PathBuf::from("/srv/alice/docs/a.txt"));
        assert_eq!(join(home, "docs"), PathBuf::from("/srv/alice/docs"));
        assert_eq!(join(home, "/"), PathBuf::from("/srv/alice"));
        assert_eq!(join(home, "../../etc/passwd"), PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_virtual_path() {
        let home = Path::new("/srv/alice");
        assert_eq!(virtual_path(home, Path::new("/srv/alice")), "/");
        assert_eq!(virtual_path(home, Path::new("/srv/alice/docs/a")), "/docs/a");
        assert_eq!(virtual_path(home, Path::new("/etc")), "/");
    }
}
