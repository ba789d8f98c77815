use anyhow::{Context, Result};
use homeport_core::password::hash_password;
use homeport_core::{Permission, User};
use homeport_db::Database;
use std::path::Path;

use crate::commands::open_database;
use crate::{config, UserCommands};

pub async fn handle(config_path: &Path, command: UserCommands) -> Result<()> {
    let config = config::load_config(config_path).await?;
    let db = open_database(&config).await?;

    match command {
        UserCommands::List => list(&db).await?,
        UserCommands::Create {
            username,
            home,
            password,
            keys,
            permissions,
            max_sessions,
            quota_size,
            quota_files,
            uid,
            gid,
            upload_bandwidth,
            download_bandwidth,
        } => {
            let mut user = User::new(username, home);
            user.password = password.as_deref().map(hash_password);
            user.public_keys = keys;
            user.permissions = parse_permissions(&permissions)?;
            user.max_sessions = max_sessions;
            user.quota_size = quota_size;
            user.quota_files = quota_files;
            user.uid = uid;
            user.gid = gid;
            user.upload_bandwidth = upload_bandwidth;
            user.download_bandwidth = download_bandwidth;
            create(&db, &user).await?;
        }
        UserCommands::Info { username } => info(&db, &username).await?,
        UserCommands::Remove { username } => remove(&db, &username).await?,
    }

    Ok(())
}

fn parse_permissions(values: &[String]) -> Result<Vec<Permission>> {
    let mut permissions = Vec::with_capacity(values.len());
    for value in values.iter().flat_map(|v| v.split(',')) {
        let permission: Permission = value
            .parse()
            .with_context(|| format!("Invalid permission '{}'", value))?;
        if !permissions.contains(&permission) {
            permissions.push(permission);
        }
    }
    Ok(permissions)
}

async fn list(db: &Database) -> Result<()> {
    let users = db.list_users().await?;

    if users.is_empty() {
        println!("No users registered.");
        return Ok(());
    }

    println!(
        "\n{:<20} {:<40} {:<10} {:<30}",
        "Username", "Home", "Sessions", "Permissions"
    );
    println!("{}", "-".repeat(100));

    for user in users {
        let sessions = if user.has_session_limit() {
            user.max_sessions.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<20} {:<40} {:<10} {:<30}",
            user.username,
            user.home_dir.display(),
            sessions,
            join_permissions(&user.permissions)
        );
    }

    println!();
    Ok(())
}

fn join_permissions(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

async fn create(db: &Database, user: &User) -> Result<()> {
    let id = db.create_user(user).await?;
    println!("User '{}' created (id {})", user.username, id);
    Ok(())
}

async fn info(db: &Database, username: &str) -> Result<()> {
    let user = db
        .get_user(username)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User not found"))?;

    println!("\nUser Information:");
    println!("  Username: {}", user.username);
    println!("  Home: {}", user.home_dir.display());
    println!("  Owner: {}:{}", user.uid, user.gid);
    println!("  Password: {}", if user.password.is_some() { "set" } else { "none" });
    println!("  Public keys: {}", user.public_keys.len());
    println!("  Permissions: {}", join_permissions(&user.permissions));
    if user.has_session_limit() {
        println!("  Max sessions: {}", user.max_sessions);
    }

    let limit = |value: i64| {
        if value > 0 {
            value.to_string()
        } else {
            "unlimited".to_string()
        }
    };
    println!(
        "  Quota: {} / {} bytes, {} / {} files",
        user.used_quota_size,
        limit(user.quota_size),
        user.used_quota_files,
        limit(user.quota_files)
    );
    if user.upload_bandwidth > 0 || user.download_bandwidth > 0 {
        println!(
            "  Bandwidth: up {} B/s, down {} B/s",
            limit(i64::try_from(user.upload_bandwidth).unwrap_or(i64::MAX)),
            limit(i64::try_from(user.download_bandwidth).unwrap_or(i64::MAX))
        );
    }
    if let Some(updated) = user.last_quota_update {
        println!("  Quota updated: {}", updated.format("%Y-%m-%d %H:%M:%S"));
    }

    println!();
    Ok(())
}

async fn remove(db: &Database, username: &str) -> Result<()> {
    if db.delete_user(username).await? {
        println!("User '{}' removed", username);
        Ok(())
    } else {
        anyhow::bail!("User not found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_permissions() {
        let parsed = parse_permissions(&["list,download".into(), "upload".into(), "list".into()])
            .unwrap();
        assert_eq!(
            parsed,
            vec![Permission::List, Permission::Download, Permission::Upload]
        );
        assert!(parse_permissions(&["teleport".into()]).is_err());
    }

    #[test]
    fn test_join_permissions() {
        assert_eq!(
            join_permissions(&[Permission::Any, Permission::Shell]),
            "*,shell"
        );
    }
}
