//! SQLite user store integration tests

use homeport_core::password::hash_password;
use homeport_core::{HomeportError, Permission, QuotaUsage, User, UserStore};
use homeport_db::Database;
use std::sync::Arc;
use tempfile::TempDir;

const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ";

/// Helper to create a database in a temporary directory
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("homeport.db")).await.unwrap();
    (db, temp_dir)
}

fn create_test_user(name: &str) -> User {
    let mut user = User::new(name, format!("/srv/{}", name));
    user.password = Some(hash_password("secret"));
    user.public_keys = vec![format!("{} {}@host", KEY, name)];
    user.permissions = vec![Permission::List, Permission::Download];
    user.quota_size = 4096;
    user.max_sessions = 2;
    user
}

#[tokio::test]
async fn test_create_and_fetch_user() {
    let (db, _dir) = create_test_db().await;
    let id = db.create_user(&create_test_user("alice")).await.unwrap();
    assert!(id > 0);

    let alice = db.get_user("alice").await.unwrap().unwrap();
    assert_eq!(alice.home_dir.to_str(), Some("/srv/alice"));
    assert_eq!(alice.permissions, vec![Permission::List, Permission::Download]);
    assert_eq!(alice.quota_size, 4096);
    assert_eq!(alice.max_sessions, 2);
    assert!(alice.last_quota_update.is_none());
}

#[tokio::test]
async fn test_duplicate_username_rejected() {
    let (db, _dir) = create_test_db().await;
    db.create_user(&create_test_user("alice")).await.unwrap();
    let err = db.create_user(&create_test_user("alice")).await.unwrap_err();
    assert!(matches!(err, HomeportError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_credentials() {
    let (db, _dir) = create_test_db().await;
    db.create_user(&create_test_user("alice")).await.unwrap();

    assert!(db.validate_password("alice", "secret").await.is_ok());
    assert!(db.validate_password("alice", "wrong").await.is_err());
    assert!(db.validate_password("alice", "").await.is_err());
    assert!(db.validate_public_key("alice", KEY).await.is_ok());
    assert!(db.validate_public_key("alice", "").await.is_err());
    assert!(matches!(
        db.validate_password("nobody", "secret").await,
        Err(HomeportError::UserNotFound(_))
    ));
}

#[tokio::test]
async fn test_quota_updates_are_atomic() {
    let (db, _dir) = create_test_db().await;
    db.create_user(&create_test_user("alice")).await.unwrap();
    let db = Arc::new(db);

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            db.update_quota("alice", 1, 100, false).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(
        db.used_quota("alice").await.unwrap(),
        QuotaUsage { files: 20, size: 2000 }
    );

    db.update_quota("alice", 3, 30, true).await.unwrap();
    assert_eq!(
        db.used_quota("alice").await.unwrap(),
        QuotaUsage { files: 3, size: 30 }
    );
    assert!(db.get_user("alice").await.unwrap().unwrap().last_quota_update.is_some());
}

#[tokio::test]
async fn test_quota_tracking_disabled() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("homeport.db"))
        .await
        .unwrap()
        .with_quota_tracking(false);
    db.create_user(&create_test_user("alice")).await.unwrap();

    assert!(db.used_quota("alice").await.unwrap_err().is_method_disabled());
    assert!(db.update_quota("alice", 1, 1, false).await.is_ok());
}

#[tokio::test]
async fn test_list_and_delete() {
    let (db, _dir) = create_test_db().await;
    db.create_user(&create_test_user("bob")).await.unwrap();
    db.create_user(&create_test_user("alice")).await.unwrap();

    let names: Vec<String> = db
        .list_users()
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.username)
        .collect();
    assert_eq!(names, vec!["alice", "bob"]);

    assert!(db.delete_user("bob").await.unwrap());
    assert!(!db.delete_user("bob").await.unwrap());
    assert!(matches!(
        db.update_quota("bob", 1, 1, false).await,
        Err(HomeportError::UserNotFound(_))
    ));
}
