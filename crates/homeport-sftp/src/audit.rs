//! Audit trail
//!
//! NIST 800-53: AU-2 (Audit Events), AU-3 (Content of Audit Records), AU-12 (Audit Generation)
//! STIG: V-222648 (Audit Records), V-222566 (Monitoring)
//! Implementation: Audit records are emitted on the `audit` tracing target so they
//! can be routed or switched off independently of operational logs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{info, warn};

/// Tracing target carrying audit records
pub const AUDIT_TARGET: &str = "audit";

/// Records written to the audit trail
///
/// NIST 800-53: AU-2 (Audit Events)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Connection authenticated and registered
    ConnectionEstablished {
        connection_id: String,
        client_addr: Option<SocketAddr>,
        username: String,
        /// Client identification string
        client_version: String,
        timestamp: DateTime<Utc>,
    },
    /// Connection closed
    ConnectionClosed {
        connection_id: String,
        username: String,
        timestamp: DateTime<Utc>,
        /// Session duration in seconds
        duration_secs: i64,
    },
    /// Authentication attempt
    AuthAttempt {
        client_addr: Option<SocketAddr>,
        username: String,
        /// password or publickey
        method: String,
        timestamp: DateTime<Utc>,
        success: bool,
        reason: Option<String>,
    },
    /// Session limit reached
    ///
    /// NIST 800-53: AC-10 (Concurrent Session Control)
    SessionLimitReached {
        /// Username that hit the limit
        username: String,
        current_sessions: usize,
        max_sessions: u32,
        timestamp: DateTime<Utc>,
    },
    /// Upload or download finished
    Transfer {
        connection_id: String,
        username: String,
        /// upload or download
        direction: String,
        /// sftp or scp
        protocol: String,
        /// File path
        path: String,
        /// Bytes transferred
        bytes: u64,
        /// Elapsed time in milliseconds
        duration_ms: i64,
        /// Whether the transfer completed
        success: bool,
        /// Error message if failed
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Rename, remove, mkdir, rmdir, symlink or setstat
    FileCommand {
        username: String,
        /// Operation name
        operation: String,
        /// Source path
        path: String,
        /// Target path for rename and symlink
        target: Option<String>,
        /// Whether the operation succeeded
        success: bool,
        /// Error message if failed
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Remote forwarding listener opened or closed
    ///
    /// NIST 800-53: SC-7 (Boundary Protection)
    ForwardListener {
        /// Owning user
        username: String,
        /// Listener address
        address: String,
        /// true when opened, false when closed
        opened: bool,
        timestamp: DateTime<Utc>,
    },
    /// Quota recomputation finished
    QuotaScan {
        /// Scanned user
        username: String,
        /// Files counted
        files: i64,
        /// Bytes counted
        size: i64,
        /// Whether the scan and the store update succeeded
        success: bool,
        timestamp: DateTime<Utc>,
    },
    /// Security event
    SecurityEvent {
        client_addr: Option<SocketAddr>,
        username: Option<String>,
        /// Security event type
        event: String,
        /// Event details
        details: String,
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Emit the record on the audit target
    ///
    /// NIST 800-53: AU-12 (Audit Generation)
    /// Implementation: Failures and denials go out at warn, the rest at info
    pub fn log(&self) {
        match self {
            AuditEvent::ConnectionEstablished {
                connection_id,
                username,
                client_addr,
                ..
            } => {
                info!(
                    target: AUDIT_TARGET,
                    event = "connection_established",
                    connection_id = %connection_id,
                    username = %username,
                    client_addr = ?client_addr,
                    "Connection established"
                );
            }
            AuditEvent::ConnectionClosed {
                connection_id,
                username,
                duration_secs,
                ..
            } => {
                info!(
                    target: AUDIT_TARGET,
                    event = "connection_closed",
                    connection_id = %connection_id,
                    username = %username,
                    duration_secs,
                    "Connection closed"
                );
            }
            AuditEvent::AuthAttempt {
                username,
                method,
                success,
                reason,
                client_addr,
                ..
            } => {
                if *success {
                    info!(
                        target: AUDIT_TARGET,
                        event = "auth_success",
                        username = %username,
                        method = %method,
                        client_addr = ?client_addr,
                        "Authentication successful"
                    );
                } else {
                    warn!(
                        target: AUDIT_TARGET,
                        event = "auth_failure",
                        username = %username,
                        method = %method,
                        client_addr = ?client_addr,
                        reason = ?reason,
                        "Authentication failed"
                    );
                }
            }
            AuditEvent::SessionLimitReached {
                username,
                current_sessions,
                max_sessions,
                ..
            } => {
                warn!(
                    target: AUDIT_TARGET,
                    event = "session_limit_reached",
                    username = %username,
                    current_sessions,
                    max_sessions,
                    "Session limit reached"
                );
            }
            AuditEvent::Transfer {
                connection_id,
                username,
                direction,
                protocol,
                path,
                bytes,
                duration_ms,
                success,
                error,
                ..
            } => {
                if *success {
                    info!(
                        target: AUDIT_TARGET,
                        event = "transfer_completed",
                        connection_id = %connection_id,
                        username = %username,
                        direction = %direction,
                        protocol = %protocol,
                        path = %path,
                        bytes,
                        duration_ms,
                        "Transfer completed"
                    );
                } else {
                    warn!(
                        target: AUDIT_TARGET,
                        event = "transfer_failed",
                        connection_id = %connection_id,
                        username = %username,
                        direction = %direction,
                        protocol = %protocol,
                        path = %path,
                        bytes,
                        error = ?error,
                        "Transfer failed"
                    );
                }
            }
            AuditEvent::FileCommand {
                username,
                operation,
                path,
                target,
                success,
                error,
                ..
            } => {
                if *success {
                    info!(
                        target: AUDIT_TARGET,
                        event = "file_command",
                        username = %username,
                        operation = %operation,
                        path = %path,
                        target_path = ?target,
                        "File command completed"
                    );
                } else {
                    warn!(
                        target: AUDIT_TARGET,
                        event = "file_command_failed",
                        username = %username,
                        operation = %operation,
                        path = %path,
                        target_path = ?target,
                        error = ?error,
                        "File command failed"
                    );
                }
            }
            AuditEvent::ForwardListener {
                username,
                address,
                opened,
                ..
            } => {
                info!(
                    target: AUDIT_TARGET,
                    event = if *opened { "forward_opened" } else { "forward_closed" },
                    username = %username,
                    address = %address,
                    "Forwarding listener {}",
                    if *opened { "opened" } else { "closed" }
                );
            }
            AuditEvent::QuotaScan {
                username,
                files,
                size,
                success,
                ..
            } => {
                if *success {
                    info!(
                        target: AUDIT_TARGET,
                        event = "quota_scan",
                        username = %username,
                        files,
                        size,
                        "Quota scan completed"
                    );
                } else {
                    warn!(
                        target: AUDIT_TARGET,
                        event = "quota_scan_failed",
                        username = %username,
                        "Quota scan failed"
                    );
                }
            }
            AuditEvent::SecurityEvent {
                username,
                event,
                details,
                client_addr,
                ..
            } => {
                warn!(
                    target: AUDIT_TARGET,
                    event = "security_event",
                    username = ?username,
                    client_addr = ?client_addr,
                    security_event = %event,
                    details = %details,
                    "Security event detected"
                );
            }
        }
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Audit helpers for common events
///
/// NIST 800-53: AU-2 (Audit Events), AU-12 (Audit Generation)
pub struct AuditLogger;

impl AuditLogger {
    /// Log an authentication attempt
    pub fn log_auth(
        client_addr: Option<SocketAddr>,
        username: &str,
        method: &str,
        success: bool,
        reason: Option<String>,
    ) {
        AuditEvent::AuthAttempt {
            client_addr,
            username: username.to_string(),
            method: method.to_string(),
            timestamp: Utc::now(),
            success,
            reason,
        }
        .log();
    }

    /// Log a file command outcome
    pub fn log_command<T>(
        username: &str,
        operation: &str,
        path: &str,
        target: Option<&str>,
        result: &crate::Result<T>,
    ) {
        AuditEvent::FileCommand {
            username: username.to_string(),
            operation: operation.to_string(),
            path: path.to_string(),
            target: target.map(str::to_string),
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            timestamp: Utc::now(),
        }
        .log();
    }

    /// Log a security event
    pub fn log_security_event(
        client_addr: Option<SocketAddr>,
        username: Option<String>,
        event: &str,
        details: String,
    ) {
        AuditEvent::SecurityEvent {
            client_addr,
            username,
            event: event.to_string(),
            details,
            timestamp: Utc::now(),
        }
        .log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_tagged_json() {
        let event = AuditEvent::AuthAttempt {
            client_addr: "127.0.0.1:50000".parse().ok(),
            username: "testuser".to_string(),
            method: "password".to_string(),
            timestamp: Utc::now(),
            success: true,
            reason: None,
        };

        let json = event.to_json().unwrap();
        assert!(json.contains(r#""event_type":"auth_attempt""#));
        assert!(json.contains("testuser"));
    }

    #[test]
    fn test_log_command_records_failure() {
        let result: crate::Result<()> = Err(crate::Error::denied("mkdir"));
        AuditLogger::log_command("alice", "mkdir", "/docs", None, &result);
    }
}
