//! Configuration for the file server

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identification string, sent as `SSH-2.0-<banner>`
    #[serde(default = "default_banner")]
    pub banner: String,

    /// Maximum authentication attempts per connection (0 = transport default)
    #[serde(default)]
    pub max_auth_tries: u32,

    /// Idle timeout in minutes (0 disables the idle sweep)
    /// NIST 800-53: AC-12 (Session Termination)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds allowed for a direct-tcpip dial before the channel is refused
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Octal umask applied to created files and directories
    #[serde(default = "default_umask")]
    pub umask: String,

    /// How uploads become visible
    #[serde(default)]
    pub upload_mode: UploadMode,

    /// Accept the legacy `scp -t` / `scp -f` copy command
    #[serde(default)]
    pub enable_scp: bool,

    /// Allow shell, exec and TCP forwarding for users holding the permission
    #[serde(default)]
    pub full_functionality: bool,

    /// OpenSSH public key bound to the built-in system account
    #[serde(default)]
    pub system_account_key: Option<String>,

    /// Host private keys (OpenSSH format). Empty means an ephemeral key.
    #[serde(default)]
    pub host_keys: Vec<PathBuf>,

    /// Maximum packet size (RFC 4254 recommends 32768 bytes minimum)
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Window size for flow control
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Notification actions
    #[serde(default)]
    pub actions: ActionsConfig,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// User store
    #[serde(default)]
    pub user_store: UserStoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upload visibility mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Write directly to the destination
    #[default]
    Standard,
    /// Write to a hidden sibling and rename on successful close
    Atomic,
}

/// Commands run after completed operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Operations that trigger the command: download, upload, delete, rename
    pub execute_on: Vec<String>,
    /// Program invoked as `<command> <operation> <username> <path> [<target>]`
    pub command: Option<PathBuf>,
}

/// Storage backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackend,
}

/// Available storage backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local filesystem
    #[default]
    Local,
}

/// User store selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStoreConfig {
    /// Backend kind
    #[serde(flatten)]
    pub kind: UserStoreKind,
    /// Keep used quota counters; when off the store reports enforcement unavailable
    #[serde(default = "default_true")]
    pub track_quota: bool,
}

/// User store backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UserStoreKind {
    /// SQLite database
    Sqlite {
        /// Database file
        path: PathBuf,
    },
    /// TOML users file loaded into memory
    Memory {
        /// Users file
        users_file: PathBuf,
    },
}

impl Default for UserStoreConfig {
    fn default() -> Self {
        Self {
            kind: UserStoreKind::Sqlite {
                path: PathBuf::from("/var/lib/homeport/homeport.db"),
            },
            track_quota: true,
        }
    }
}

/// Logging configuration
///
/// NIST 800-53: AU-2 (Audit Events), AU-9 (Protection of Audit Information), AU-12 (Audit Generation)
/// STIG: V-222648 (Audit Records)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base `EnvFilter` level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Daily-rotated log file; stderr when absent
    pub file: Option<PathBuf>,
    /// Emit structured audit records
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

/// Log format options
///
/// NIST 800-53: AU-9 (Protection of Audit Information)
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            banner: default_banner(),
            max_auth_tries: 0,
            idle_timeout: default_idle_timeout(),
            connect_timeout: default_connect_timeout(),
            umask: default_umask(),
            upload_mode: UploadMode::default(),
            enable_scp: false,
            full_functionality: false,
            system_account_key: None,
            host_keys: Vec::new(),
            max_packet_size: default_max_packet_size(),
            window_size: default_window_size(),
            actions: ActionsConfig::default(),
            storage: StorageConfig::default(),
            user_store: UserStoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("cannot read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("invalid TOML in {}: {}", path, e)))
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.umask_bits()?;

        if self.banner.trim().is_empty() || self.banner.contains(['\r', '\n']) {
            return Err(crate::Error::Config(
                "banner must be a non-empty single line".to_string(),
            ));
        }

        if self.connect_timeout == 0 {
            return Err(crate::Error::Config(
                "connect_timeout must be at least one second".to_string(),
            ));
        }

        if self.max_packet_size < 32768 {
            return Err(crate::Error::Config(
                "max_packet_size must be at least 32768 bytes (RFC 4254)".to_string(),
            ));
        }

        for operation in &self.actions.execute_on {
            if !matches!(operation.as_str(), "download" | "upload" | "delete" | "rename") {
                return Err(crate::Error::Config(format!(
                    "Unknown action operation: {}",
                    operation
                )));
            }
        }

        Ok(())
    }

    /// Parsed umask
    pub fn umask_bits(&self) -> crate::Result<u32> {
        u32::from_str_radix(self.umask.trim(), 8)
            .ok()
            .filter(|bits| *bits <= 0o777)
            .ok_or_else(|| crate::Error::Config(format!("Invalid umask: {}", self.umask)))
    }

    /// Server identification string
    pub fn server_id(&self) -> String {
        format!("SSH-2.0-{}", self.banner)
    }

    /// Dial limit for direct-tcpip channels
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout)
    }

    /// Idle threshold, `None` when disabled
    pub fn idle_threshold(&self) -> Option<std::time::Duration> {
        (self.idle_timeout > 0).then(|| std::time::Duration::from_secs(self.idle_timeout * 60))
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2022
}

fn default_banner() -> String {
    "Homeport".to_string()
}

// NIST 800-53: AC-12 (Session Termination)
// Default: 15 minutes
fn default_idle_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_umask() -> String {
    "0022".to_string()
}

fn default_max_packet_size() -> u32 {
    32768 // RFC 4254 minimum
}

fn default_window_size() -> u32 {
    2097152 // 2MB
}

fn default_true() -> bool {
    true
}
