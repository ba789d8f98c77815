//! Error types for file server operations
//!
//! NIST 800-53: SI-11 (Error Handling), AU-3 (Content of Audit Records)
//! STIG: V-222566 - The application must generate error messages that provide information
//! necessary for corrective actions without revealing information that could be exploited
//! Implementation: Every failure maps to exactly one client-visible SFTP status code

use homeport_core::HomeportError;
use thiserror::Error;

use crate::protocol::StatusCode;

/// Result alias used across the server crate
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while serving a connection
///
/// NIST 800-53: SI-11 (Error Handling)
/// STIG: V-222566
/// Implementation: Variants carry host-side context; clients only see `sanitized_message`
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the storage backend
    ///
    /// NIST 800-53: SI-11
    /// Implementation: Surfaced as `Failure`, logged with full context
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport error
    ///
    /// NIST 800-53: SI-11, SC-8 (Transmission Confidentiality)
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Wire protocol violation (SFTP or SCP framing)
    ///
    /// NIST 800-53: SI-10 (Input Validation), SI-11
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    ///
    /// NIST 800-53: IA-2 (Identification and Authentication), SI-11
    /// STIG: V-222566
    /// Implementation: Rejected before any connection context exists
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// File or directory does not exist
    ///
    /// NIST 800-53: SI-11
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Resolved path falls outside the user's home directory
    ///
    /// NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege)
    /// STIG: V-222396
    /// Implementation: Reported to the client exactly like a missing file
    #[error("Path escapes home directory: {0}")]
    EscapesHome(String),

    /// Capability missing from the user's permission set
    ///
    /// NIST 800-53: AC-3 (Access Enforcement), SI-11
    /// STIG: V-222596, V-222566
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// File count or byte quota exhausted
    ///
    /// NIST 800-53: SC-6 (Resource Availability)
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Operation not supported (resume, directory overwrite, target collision)
    ///
    /// NIST 800-53: SI-11
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Invalid or closed file handle
    ///
    /// NIST 800-53: SI-11
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// End of file or end of directory listing
    #[error("End of file")]
    Eof,

    /// User store failure
    ///
    /// NIST 800-53: AC-2 (Account Management), SI-11
    #[error("User store error: {0}")]
    Store(#[from] HomeportError),

    /// Forwarding listener could not be bound
    ///
    /// NIST 800-53: SC-7 (Boundary Protection)
    #[error("Listener bind failed: {0}")]
    ListenerBind(String),

    /// Configuration error
    ///
    /// NIST 800-53: CM-6 (Configuration Settings), SI-11
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    ///
    /// NIST 800-53: SC-8 (Transmission Confidentiality), SI-11
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel closed
    ///
    /// NIST 800-53: SC-8, SI-11
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Pseudo-terminal allocation or I/O failure
    #[error("Terminal error: {0}")]
    Pty(String),

    /// Generic error
    ///
    /// NIST 800-53: SI-11
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Failures caused by the request itself
    ///
    /// # NIST 800-53: SI-10 (Input Validation), SI-11
    /// # Implementation: Identifies failures the client can correct
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::FileNotFound(_)
                | Error::EscapesHome(_)
                | Error::PermissionDenied(_)
                | Error::QuotaExceeded(_)
                | Error::InvalidHandle(_)
                | Error::NotSupported(_)
                | Error::Protocol(_)
        )
    }

    /// Failures that belong in the security audit trail
    ///
    /// # NIST 800-53: AU-2 (Audit Events), SI-11
    /// # STIG: V-222566
    /// # Implementation: Denials and confinement escapes are logged with the user
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::PermissionDenied(_) | Error::EscapesHome(_)
        )
    }

    /// SFTP status code for this error
    ///
    /// # NIST 800-53: SI-11
    /// # Implementation: Only Ok, NoSuchFile, PermissionDenied, Failure and
    /// # OpUnsupported are produced, plus Eof as the end-of-data marker
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Error::FileNotFound(_) | Error::EscapesHome(_) => StatusCode::NoSuchFile,
            Error::PermissionDenied(_) => StatusCode::PermissionDenied,
            Error::NotSupported(_) => StatusCode::OpUnsupported,
            Error::Eof => StatusCode::Eof,
            _ => StatusCode::Failure,
        }
    }

    /// Client-facing status text
    ///
    /// # NIST 800-53: SI-11 (Error Handling)
    /// # STIG: V-222566
    /// # Implementation: Host paths and backend details never reach the client
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::Authentication(_) => "Authentication failed".to_string(),
            Error::PermissionDenied(_) => "Permission denied".to_string(),
            Error::FileNotFound(_) | Error::EscapesHome(_) => "No such file".to_string(),
            Error::QuotaExceeded(_) => "Quota exceeded".to_string(),
            Error::NotSupported(_) => "Operation unsupported".to_string(),
            Error::Eof => "End of file".to_string(),
            Error::InvalidHandle(_) => "Invalid handle".to_string(),
            _ => "Failure".to_string(),
        }
    }

    /// Map an I/O error from the storage backend, keeping not-found distinct
    pub fn from_io(err: std::io::Error, context: impl Into<String>) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory => {
                Error::FileNotFound(context.into())
            }
            _ => Error::Io(err),
        }
    }

    /// Shorthand for `PermissionDenied`
    pub fn denied(context: impl Into<String>) -> Self {
        Error::PermissionDenied(context.into())
    }

    /// Shorthand for `InvalidHandle`
    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Error::InvalidHandle(context.into())
    }

    /// Shorthand for `ChannelClosed`
    pub fn channel_closed(context: impl Into<String>) -> Self {
        Error::ChannelClosed(context.into())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}
