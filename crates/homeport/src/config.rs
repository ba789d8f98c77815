use anyhow::{Context, Result};
use homeport_sftp::Config;
use std::path::Path;
use tokio::fs;

pub async fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .await
        .context("Failed to read configuration file")?;

    let config: Config =
        toml::from_str(&contents).context("Failed to parse configuration file")?;
    config.validate()?;

    Ok(config)
}

pub async fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents = config.to_toml()?;

    fs::write(path, contents)
        .await
        .context("Failed to write configuration file")?;

    Ok(())
}

/// Write the default configuration to `path`
pub async fn init_config(path: &Path) -> Result<()> {
    save_config(path, &Config::default()).await?;
    println!("Configuration file created at: {}", path.display());
    println!("\nPlease review and edit the configuration before starting the server.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/homeport.toml");
        let mut config = Config::default();
        config.port = 2200;
        save_config(&path, &config).await.unwrap();

        let loaded = load_config(&path).await.unwrap();
        assert_eq!(loaded.port, 2200);
    }
}
