//! SQLite-backed user store.

use async_trait::async_trait;
use chrono::Utc;
use homeport_core::password::verify_password;
use homeport_core::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

pub struct Database {
    pool: SqlitePool,
    track_quota: bool,
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            track_quota: true,
        };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Turn quota tracking on or off. When off, `used_quota` reports `MethodDisabled`.
    pub fn with_quota_tracking(mut self, enabled: bool) -> Self {
        self.track_quota = enabled;
        self
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password TEXT,
                public_keys TEXT NOT NULL DEFAULT '[]',
                home_dir TEXT NOT NULL,
                uid INTEGER NOT NULL DEFAULT 0,
                gid INTEGER NOT NULL DEFAULT 0,
                max_sessions INTEGER NOT NULL DEFAULT 0,
                quota_size INTEGER NOT NULL DEFAULT 0,
                quota_files INTEGER NOT NULL DEFAULT 0,
                permissions TEXT NOT NULL DEFAULT '[]',
                used_quota_size INTEGER NOT NULL DEFAULT 0,
                used_quota_files INTEGER NOT NULL DEFAULT 0,
                last_quota_update TEXT,
                upload_bandwidth INTEGER NOT NULL DEFAULT 0,
                download_bandwidth INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // User operations
    pub async fn create_user(&self, user: &User) -> Result<i64> {
        user.validate()?;
        if self.get_user(&user.username).await?.is_some() {
            return Err(HomeportError::AlreadyExists(user.username.clone()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO users (username, password, public_keys, home_dir, uid, gid, max_sessions,
                quota_size, quota_files, permissions, used_quota_size, used_quota_files,
                last_quota_update, upload_bandwidth, download_bandwidth)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, NULL, ?, ?)
            "#,
        )
        .bind(&user.username)
        .bind(&user.password)
        .bind(serde_json::to_string(&user.public_keys).map_err(anyhow::Error::from)?)
        .bind(user.home_dir.to_string_lossy().to_string())
        .bind(i64::from(user.uid))
        .bind(i64::from(user.gid))
        .bind(i64::from(user.max_sessions))
        .bind(user.quota_size)
        .bind(user.quota_files)
        .bind(serde_json::to_string(&user.permissions).map_err(anyhow::Error::from)?)
        .bind(i64::try_from(user.upload_bandwidth).unwrap_or(i64::MAX))
        .bind(i64::try_from(user.download_bandwidth).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        row.map(User::try_from).transpose().map_err(HomeportError::from)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().filter_map(|r| r.try_into().ok()).collect())
    }

    pub async fn delete_user(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn require_user(&self, username: &str) -> Result<User> {
        self.get_user(username)
            .await?
            .ok_or_else(|| HomeportError::UserNotFound(username.to_string()))
    }
}

#[async_trait]
impl UserStore for Database {
    async fn validate_password(&self, username: &str, password: &str) -> Result<User> {
        if username.is_empty() || password.is_empty() {
            return Err(HomeportError::InvalidCredentials(username.to_string()));
        }
        let user = self.require_user(username).await?;
        match &user.password {
            Some(hash) if verify_password(password, hash) => Ok(user),
            _ => Err(HomeportError::InvalidCredentials(username.to_string())),
        }
    }

    async fn validate_public_key(&self, username: &str, public_key: &str) -> Result<User> {
        if username.is_empty() || public_key.is_empty() {
            return Err(HomeportError::InvalidCredentials(username.to_string()));
        }
        let user = self.require_user(username).await?;
        if user
            .public_keys
            .iter()
            .any(|k| public_keys_match(k, public_key))
        {
            Ok(user)
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
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT used_quota_files, used_quota_size FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        let (files, size) = row.ok_or_else(|| HomeportError::UserNotFound(username.to_string()))?;
        Ok(QuotaUsage { files, size })
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
        // Single statement so concurrent transfers never lose an update
        let sql = if reset {
            "UPDATE users SET used_quota_files = ?, used_quota_size = ?, last_quota_update = ? WHERE username = ?"
        } else {
            "UPDATE users SET used_quota_files = used_quota_files + ?, used_quota_size = used_quota_size + ?, last_quota_update = ? WHERE username = ?"
        };
        let result = sqlx::query(sql)
            .bind(files)
            .bind(size)
            .bind(Utc::now().to_rfc3339())
            .bind(username)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(HomeportError::UserNotFound(username.to_string()));
        }
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

// Row structures for SQLite
#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password: Option<String>,
    public_keys: String,
    home_dir: String,
    uid: i64,
    gid: i64,
    max_sessions: i64,
    quota_size: i64,
    quota_files: i64,
    permissions: String,
    used_quota_size: i64,
    used_quota_files: i64,
    last_quota_update: Option<String>,
    upload_bandwidth: i64,
    download_bandwidth: i64,
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> std::result::Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            username: row.username,
            password: row.password,
            public_keys: serde_json::from_str(&row.public_keys)?,
            home_dir: row.home_dir.into(),
            uid: u32::try_from(row.uid)?,
            gid: u32::try_from(row.gid)?,
            max_sessions: u32::try_from(row.max_sessions)?,
            quota_size: row.quota_size,
            quota_files: row.quota_files,
            permissions: serde_json::from_str(&row.permissions)?,
            used_quota_size: row.used_quota_size,
            used_quota_files: row.used_quota_files,
            last_quota_update: row
                .last_quota_update
                .map(|dt| chrono::DateTime::parse_from_rfc3339(&dt))
                .transpose()?
                .map(|dt| dt.with_timezone(&chrono::Utc)),
            upload_bandwidth: u64::try_from(row.upload_bandwidth)?,
            download_bandwidth: u64::try_from(row.download_bandwidth)?,
        })
    }
}
