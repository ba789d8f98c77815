//! # Homeport SFTP
//!
//! SSH file server confining each user to a home directory.
//!
//! This crate implements the server side of:
//! - RFC 4251-4254: SSH architecture, authentication, transport and connection protocols
//! - draft-ietf-secsh-filexfer-02: SSH File Transfer Protocol version 3
//! - The legacy `scp -t` / `scp -f` copy protocol
//!
//! ## Features
//!
//! - Per-user home confinement with symlink resolution
//! - Size and file-count quotas with background rescans
//! - Atomic or direct uploads
//! - Optional shell, exec and TCP forwarding
//! - Per-user session limits and an idle sweep

pub mod actions;
pub mod audit;
pub mod auth;
pub mod config;
pub mod confine;
pub mod connection;
pub mod error;
pub mod forward;
pub mod idle;
pub mod protocol;
pub mod quota;
pub mod router;
pub mod scp;
pub mod server;
pub mod sftp;
pub mod terminal;
pub mod transfer;
pub mod vfs;

pub use config::{Config, LogFormat, UploadMode};
pub use connection::{Connection, ConnectionRegistry, Protocol};
pub use error::{Error, Result};
pub use server::{open_user_store, Server, ServerState};
pub use transfer::{Transfer, TransferRegistry};
pub use vfs::FileSystem;
