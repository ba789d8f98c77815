use anyhow::Result;
use homeport_core::UserStore;
use homeport_sftp::quota::{run_quota_scan, QuotaManager};
use std::path::Path;
use std::sync::Arc;

use crate::commands::open_database;
use crate::{config, QuotaCommands};

pub async fn handle(config_path: &Path, command: QuotaCommands) -> Result<()> {
    let config = config::load_config(config_path).await?;
    let db = open_database(&config).await?;

    match command {
        QuotaCommands::Scan { username } => {
            let user = db
                .get_user(&username)
                .await?
                .ok_or_else(|| anyhow::anyhow!("User not found"))?;
            let store: Arc<dyn UserStore> = Arc::new(db);
            let scan = run_quota_scan(&QuotaManager::new(store), &user).await?;
            println!(
                "Quota for '{}' reset to {} files, {} bytes",
                user.username, scan.files, scan.size
            );
        }
    }

    Ok(())
}
