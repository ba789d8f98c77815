mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "homeport")]
#[command(about = "SSH file server with per-user home confinement", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/homeport/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the file server
    Server,

    /// Configuration file helpers
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Manage accounts in the SQLite user store
    #[command(subcommand)]
    User(UserCommands),

    /// Quota maintenance
    #[command(subcommand)]
    Quota(QuotaCommands),
}

#[derive(Subcommand)]
enum UserCommands {
    /// List all accounts
    List,

    /// Create an account
    Create {
        /// Username
        username: String,

        /// Absolute home directory
        #[arg(long)]
        home: PathBuf,

        /// Cleartext password, stored hashed
        #[arg(long)]
        password: Option<String>,

        /// Authorized OpenSSH public key (repeatable)
        #[arg(long = "public-key")]
        keys: Vec<String>,

        /// Granted permission (repeatable): list, download, upload, delete,
        /// rename, create_dirs, create_symlinks, shell, tcp_forward or *
        #[arg(long = "permission", required = true)]
        permissions: Vec<String>,

        /// Maximum concurrent sessions (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_sessions: u32,

        /// Size quota in bytes (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        quota_size: i64,

        /// File-count quota (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        quota_files: i64,

        /// Owner uid for created files
        #[arg(long, default_value_t = 0)]
        uid: u32,

        /// Owner gid for created files
        #[arg(long, default_value_t = 0)]
        gid: u32,

        /// Upload cap in bytes per second (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        upload_bandwidth: u64,

        /// Download cap in bytes per second (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        download_bandwidth: u64,
    },

    /// Show account details
    Info {
        /// Username
        username: String,
    },

    /// Remove an account
    Remove {
        /// Username
        username: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Destination path
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum QuotaCommands {
    /// Recount a user's files and bytes and overwrite the stored counters
    Scan {
        /// Username
        username: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "homeport=info,homeport_sftp=info,russh=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server => {
            commands::server::run(&cli.config).await?;
        }
        Commands::Config(ConfigCommands::Init { path }) => {
            config::init_config(&path).await?;
        }
        Commands::User(cmd) => {
            commands::user::handle(&cli.config, cmd).await?;
        }
        Commands::Quota(cmd) => {
            commands::quota::handle(&cli.config, cmd).await?;
        }
    }

    Ok(())
}
