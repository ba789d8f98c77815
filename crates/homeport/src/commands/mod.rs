pub mod quota;
pub mod server;
pub mod user;

use anyhow::{bail, Context, Result};
use homeport_db::Database;
use homeport_sftp::config::{Config, UserStoreKind};

/// Open the SQLite user store named by `config`
pub async fn open_database(config: &Config) -> Result<Database> {
    match &config.user_store.kind {
        UserStoreKind::Sqlite { path } => Ok(Database::new(path)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?
            .with_quota_tracking(config.user_store.track_quota)),
        UserStoreKind::Memory { users_file } => bail!(
            "accounts are read from {}; edit that file instead",
            users_file.display()
        ),
    }
}
