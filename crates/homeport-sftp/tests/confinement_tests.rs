//! Home directory confinement tests
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation)
//! STIG: V-222396
//! Implementation: Lexical escapes, symlink escapes and missing intermediates

use homeport_sftp::confine::resolve;
use homeport_sftp::Error;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper: a home directory and a sibling directory outside it
fn create_test_home() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().unwrap();
    let home = dir.path().join("home");
    let outside = dir.path().join("outside");
    std::fs::create_dir_all(&home).unwrap();
    std::fs::create_dir_all(&outside).unwrap();
    std::fs::write(outside.join("secret.txt"), b"secret").unwrap();
    (dir, home, outside)
}

#[tokio::test]
async fn test_plain_paths_stay_inside() {
    let (_dir, home, _) = create_test_home();
    std::fs::write(home.join("a.txt"), b"a").unwrap();

    let resolved = resolve(&home, "/a.txt").await.unwrap();
    assert_eq!(resolved.path, home.join("a.txt"));
    assert!(resolved.missing_dirs.is_empty());

    let relative = resolve(&home, "a.txt").await.unwrap();
    assert_eq!(relative.path, resolved.path);
}

/// NIST 800-53: SI-10 - Dot-dot sequences cannot climb out of the home
#[tokio::test]
async fn test_dot_dot_escape_rejected() {
    let (_dir, home, _) = create_test_home();

    let result = resolve(&home, "/../outside/secret.txt").await;
    assert!(matches!(result, Err(Error::EscapesHome(_))));

    // Climbing and coming back is fine
    let back = resolve(&home, "/sub/../a.txt").await.unwrap();
    assert_eq!(back.path, home.join("a.txt"));
}

/// Missing intermediate directories are reported outermost first
#[tokio::test]
async fn test_missing_intermediates_listed() {
    let (_dir, home, _) = create_test_home();

    let resolved = resolve(&home, "/x/y/z.txt").await.unwrap();
    assert_eq!(resolved.path, home.join("x/y/z.txt"));
    assert_eq!(resolved.missing_dirs, vec![home.join("x"), home.join("x/y")]);
    assert!(!resolved.exists().await);
}

/// A file in the middle of the path is not a directory
#[tokio::test]
async fn test_file_as_ancestor() {
    let (_dir, home, _) = create_test_home();
    std::fs::write(home.join("file"), b"f").unwrap();

    let result = resolve(&home, "/file/child").await;
    assert!(matches!(result, Err(Error::FileNotFound(_))));
}

/// NIST 800-53: AC-3 - A link inside the home pointing outside is caught
#[tokio::test]
#[cfg(unix)]
async fn test_symlink_escape_rejected() {
    let (_dir, home, outside) = create_test_home();
    std::os::unix::fs::symlink(&outside, home.join("escape")).unwrap();

    let existing = resolve(&home, "/escape/secret.txt").await;
    assert!(matches!(existing, Err(Error::EscapesHome(_))));

    // Also when the final component does not exist yet
    let missing = resolve(&home, "/escape/new/file.txt").await;
    assert!(matches!(missing, Err(Error::EscapesHome(_))));
}

/// A dangling link may not point at a spot outside the home
#[tokio::test]
#[cfg(unix)]
async fn test_dangling_symlink_escape_rejected() {
    let (_dir, home, outside) = create_test_home();
    std::os::unix::fs::symlink(outside.join("planted.txt"), home.join("dangling")).unwrap();

    let result = resolve(&home, "/dangling").await;
    assert!(matches!(result, Err(Error::EscapesHome(_))));
}

/// Links that stay inside the home resolve normally
#[tokio::test]
#[cfg(unix)]
async fn test_internal_symlink_allowed() {
    let (_dir, home, _) = create_test_home();
    std::fs::create_dir(home.join("real")).unwrap();
    std::os::unix::fs::symlink(home.join("real"), home.join("alias")).unwrap();

    let resolved = resolve(&home, "/alias/new.txt").await.unwrap();
    assert_eq!(resolved.path, home.join("alias/new.txt"));
    assert!(resolved.missing_dirs.is_empty());
}

/// The home itself must exist
#[tokio::test]
async fn test_missing_home() {
    let dir = TempDir::new().unwrap();
    let result = resolve(&dir.path().join("nobody"), "/a").await;
    assert!(matches!(result, Err(Error::FileNotFound(_))));
}
