//! Homeport file server binary
//!
//! NIST 800-53: AU-2 (Audit Events), AU-9 (Protection of Audit Information), AU-12 (Audit Generation)
//! STIG: V-222648 (Audit Records)
//! Implementation: Text or JSON logs to stderr or a daily-rotated file; audit
//! records are a separate `audit` target that can be switched off
//!
//! Run with: cargo run --bin homeport-server

use anyhow::Context;
use clap::Parser;
use homeport_sftp::config::LoggingConfig;
use homeport_sftp::{open_user_store, Config, LogFormat, Server, UploadMode};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Host key path (repeatable)
    #[arg(long = "host-key")]
    host_keys: Vec<PathBuf>,

    /// Upload mode
    #[arg(long)]
    upload_mode: Option<UploadMode>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_config(args: Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if !args.host_keys.is_empty() {
        config.host_keys = args.host_keys;
    }
    if let Some(mode) = args.upload_mode {
        config.upload_mode = mode;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(file) = args.log_file {
        config.logging.file = Some(file);
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    Ok(config)
}

fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    let mut directives = format!("{},russh=warn", logging.level);
    // NIST 800-53: AU-2 - audit records are opt-out
    if !logging.audit_enabled {
        directives.push_str(",audit=off");
    }
    EnvFilter::new(directives)
}

/// Install the global subscriber
///
/// NIST 800-53: AU-9 (Protection of Audit Information), AU-12 (Audit Generation)
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let Some(log_file) = &logging.file else {
        match logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter(logging))
                .with_current_span(true)
                .with_span_list(true)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(env_filter(logging))
                .init(),
        }
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_file
        .file_name()
        .context("log file must name a file")?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("creating log directory {}", directory.display()))?;

    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter(logging))
            .with_writer(non_blocking)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter(logging))
            .with_writer(non_blocking)
            .with_ansi(false)
            .init(),
    }
    Ok(Some(guard))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            std::process::exit(1);
        }
    };

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Homeport file server"
    );

    if let Err(e) = config.validate() {
        error!(
            event = "configuration_validation_failed",
            error = %e,
            "Configuration validation failed"
        );
        std::process::exit(1);
    }

    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port = config.port,
        upload_mode = ?config.upload_mode,
        enable_scp = config.enable_scp,
        full_functionality = config.full_functionality,
        idle_timeout_mins = config.idle_timeout,
        log_format = ?config.logging.format,
        audit_enabled = config.logging.audit_enabled,
        "Server configuration"
    );

    let store = match open_user_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!(event = "user_store_failed", error = %e, "Failed to open user store");
            std::process::exit(1);
        }
    };

    let server = match Server::new(config, store) {
        Ok(server) => server,
        Err(e) => {
            error!(event = "server_creation_failed", error = %e, "Failed to create server");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "shutdown_requested", "Interrupt received");
        }
        signal.cancel();
    });

    if let Err(e) = server.run(shutdown).await {
        error!(event = "server_error", error = %e, "Server encountered an error");
        std::process::exit(1);
    }

    info!(event = "server_shutdown", "Homeport file server shutdown complete");
}
