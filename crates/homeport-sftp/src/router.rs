//! Session channel router
//!
//! NIST 800-53: AC-3 (Access Enforcement), AC-6 (Least Privilege), AC-17 (Remote Access)
//! STIG: V-222596
//! Implementation: Each session channel carries at most one workload (SFTP,
//! SCP, exec or shell). The workload runs in its own task on the channel stream
//! and reports an exit status before the channel is closed

use homeport_core::Permission;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Protocol};
use crate::forward::relay;
use crate::scp::{ScpCommand, ScpSession};
use crate::sftp::SftpServer;
use crate::terminal::{self, ShellCommand, Terminal, TerminalSize};
use crate::vfs::FileSystem;
use crate::{Error, Result};

/// Feature switches consulted by the router
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterOptions {
    /// Accept `scp -t` / `scp -f`
    pub enable_scp: bool,
    /// Allow shell, pty and exec for users holding the shell permission
    pub full_functionality: bool,
}

/// What an exec request turns into
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecAction {
    /// Legacy copy command
    Scp(ScpCommand),
    /// Arbitrary command run through `sh -c`
    Command(String),
    /// Not allowed for this user
    Rejected,
}

/// Decide how to serve an exec request
pub fn parse_exec(command: &str, options: RouterOptions, shell_allowed: bool) -> ExecAction {
    let args: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if options.enable_scp && args.len() >= 2 {
        if let Some(scp) = ScpCommand::parse(&args) {
            return ExecAction::Scp(scp);
        }
    }
    if shell_allowed && !args.is_empty() {
        return ExecAction::Command(command.to_string());
    }
    ExecAction::Rejected
}

#[derive(Default)]
struct ChannelState {
    channel: Option<Channel<Msg>>,
    terminal: Option<Arc<dyn Terminal>>,
    term: String,
}

/// Per-connection table of open session channels
pub struct ChannelRouter {
    connection: Arc<Connection>,
    fs: Arc<dyn FileSystem>,
    options: RouterOptions,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ChannelRouter {
    /// Create a router for `connection`
    pub fn new(connection: Arc<Connection>, fs: Arc<dyn FileSystem>, options: RouterOptions) -> Self {
        Self {
            connection,
            fs,
            options,
            channels: HashMap::new(),
        }
    }

    /// Whether the user may run shells and commands
    pub fn shell_allowed(&self) -> bool {
        self.options.full_functionality && self.connection.user.has_perm(Permission::Shell)
    }

    /// Track a newly opened session channel
    pub fn open_session(&mut self, channel: Channel<Msg>) {
        let id = channel.id();
        debug!(connection_id = %self.connection.id, channel = ?id, "Session channel opened");
        self.channels.insert(
            id,
            ChannelState {
                channel: Some(channel),
                ..Default::default()
            },
        );
    }

    /// Number of tracked channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is tracked
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Allocate a terminal for later shell use
    pub fn pty_request(&mut self, id: ChannelId, term: &str, cols: u32, rows: u32) -> bool {
        if !self.shell_allowed() {
            self.denied("pty-req");
            return false;
        }
        let Some(state) = self.channels.get_mut(&id) else {
            return false;
        };
        match terminal::open(TerminalSize::from_request(cols, rows)) {
            Ok(allocated) => {
                state.terminal = Some(allocated);
                state.term = term.to_string();
                true
            }
            Err(e) => {
                warn!(connection_id = %self.connection.id, error = %e, "Unable to allocate terminal");
                false
            }
        }
    }

    /// Resize the channel's terminal, if any
    pub async fn window_change(&mut self, id: ChannelId, cols: u32, rows: u32) {
        let Some(terminal) = self.channels.get(&id).and_then(|s| s.terminal.clone()) else {
            return;
        };
        if let Err(e) = terminal.resize(TerminalSize::from_request(cols, rows)).await {
            debug!(channel = ?id, error = %e, "Terminal resize failed");
        }
    }

    fn take_channel(&mut self, id: ChannelId) -> Option<Channel<Msg>> {
        self.channels.get_mut(&id)?.channel.take()
    }

    fn denied(&self, request: &str) {
        crate::audit::AuditLogger::log_security_event(
            self.connection.remote_addr,
            Some(self.connection.user.username.clone()),
            "channel_request_denied",
            format!("{} not permitted", request),
        );
    }

    /// Start a subsystem; only `sftp` is served
    pub fn subsystem(&mut self, id: ChannelId, name: &str, handle: Handle) -> bool {
        if name != "sftp" {
            debug!(subsystem = %name, "Unknown subsystem requested");
            return false;
        }
        let Some(channel) = self.take_channel(id) else {
            return false;
        };
        self.connection.set_protocol(Protocol::Sftp);
        info!(
            connection_id = %self.connection.id,
            username = %self.connection.user.username,
            "Starting SFTP subsystem"
        );

        let server = SftpServer::new(self.fs.clone());
        tokio::spawn(async move {
            let code = match server.serve(channel.into_stream()).await {
                Ok(()) => 0,
                Err(e) => {
                    debug!(error = %e, "SFTP session ended with error");
                    1
                }
            };
            finish_channel(&handle, id, code).await;
        });
        true
    }

    /// Start an exec request
    pub fn exec(&mut self, id: ChannelId, data: &[u8], handle: Handle) -> bool {
        let command = String::from_utf8_lossy(data).to_string();
        let action = parse_exec(&command, self.options, self.shell_allowed());
        if action == ExecAction::Rejected {
            self.denied("exec");
            return false;
        }
        let Some(channel) = self.take_channel(id) else {
            return false;
        };

        match action {
            ExecAction::Scp(scp) => {
                self.connection.set_protocol(Protocol::Scp);
                let session = ScpSession::new(self.fs.clone(), scp);
                tokio::spawn(async move {
                    let code = match session.run(channel.into_stream()).await {
                        Ok(()) => 0,
                        Err(_) => 1,
                    };
                    finish_channel(&handle, id, code).await;
                });
            }
            ExecAction::Command(command) => {
                self.connection.set_protocol(Protocol::Exec);
                info!(
                    connection_id = %self.connection.id,
                    username = %self.connection.user.username,
                    command = %command,
                    "Running command"
                );
                let home = self.connection.user.home().to_path_buf();
                let cancel = self.connection.cancel_token().clone();
                let activity = Some(self.connection.clone());
                tokio::spawn(async move {
                    let stream = channel.into_stream();
                    let code = match run_exec(stream, &command, &home, cancel, activity).await {
                        Ok(code) => code,
                        Err(e) => {
                            warn!(command = %command, error = %e, "Command failed");
                            1
                        }
                    };
                    finish_channel(&handle, id, code).await;
                });
            }
            ExecAction::Rejected => return false,
        }
        true
    }

    /// Start an interactive shell on the channel's terminal
    pub fn shell(&mut self, id: ChannelId, handle: Handle) -> bool {
        if !self.shell_allowed() {
            self.denied("shell");
            return false;
        }
        let Some(state) = self.channels.get_mut(&id) else {
            return false;
        };
        let Some(terminal) = state.terminal.clone() else {
            debug!(channel = ?id, "Shell requested without a terminal");
            return false;
        };
        let command = ShellCommand::login(self.connection.user.home().to_path_buf(), &state.term);
        let Some(channel) = state.channel.take() else {
            return false;
        };

        self.connection.set_protocol(Protocol::Shell);
        info!(
            connection_id = %self.connection.id,
            username = %self.connection.user.username,
            shell = %command.program,
            "Starting shell"
        );
        let cancel = self.connection.cancel_token().clone();
        let activity = Some(self.connection.clone());
        tokio::spawn(async move {
            let stream = channel.into_stream();
            let code = match run_shell(stream, terminal, &command, cancel, activity).await {
                Ok(code) => code,
                Err(e) => {
                    warn!(error = %e, "Shell failed");
                    1
                }
            };
            finish_channel(&handle, id, code).await;
        });
        true
    }

    /// Forget a closed channel
    pub async fn close(&mut self, id: ChannelId) {
        if let Some(state) = self.channels.remove(&id) {
            if let Some(terminal) = state.terminal {
                terminal.close().await;
            }
        }
    }

    /// Forget every channel
    pub async fn close_all(&mut self) {
        for (_, state) in self.channels.drain() {
            if let Some(terminal) = state.terminal {
                terminal.close().await;
            }
        }
    }
}

async fn finish_channel(handle: &Handle, id: ChannelId, code: u32) {
    if let Err(e) = handle.exit_status_request(id, code).await {
        debug!(channel = ?id, error = ?e, "Sending exit status failed");
    }
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}

/// Run `command` through `sh -c` in `home`, writing stderr then stdout to `stream`
///
/// A running command keeps `activity` from going idle.
///
/// # Errors
///
/// Spawn failures and stream write failures.
pub async fn run_exec<S>(
    mut stream: S,
    command: &str,
    home: &Path,
    cancel: CancellationToken,
    activity: Option<Arc<Connection>>,
) -> Result<u32>
where
    S: AsyncWrite + Unpin,
{
    let touch = || {
        if let Some(connection) = &activity {
            connection.touch();
        }
    };

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(home)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    let mut output = std::pin::pin!(output);
    let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
    let output = loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::channel_closed("connection closed")),
            output = &mut output => break output?,
            _ = heartbeat.tick() => touch(),
        }
    };

    stream.write_all(&output.stderr).await?;
    stream.write_all(&output.stdout).await?;
    stream.flush().await?;
    touch();
    let _ = stream.shutdown().await;

    Ok(output
        .status
        .code()
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or(1))
}

/// Pump a shell on `terminal` to and from `stream` until either side ends
///
/// # Errors
///
/// Spawn failures on the terminal.
pub async fn run_shell<S>(
    stream: S,
    terminal: Arc<dyn Terminal>,
    command: &ShellCommand,
    cancel: CancellationToken,
    activity: Option<Arc<Connection>>,
) -> Result<u32>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut child = terminal.spawn(command).await?;
    let output = terminal
        .take_reader()
        .ok_or_else(|| Error::Pty("terminal output already in use".into()))?;
    let (mut input, writer) = tokio::io::split(stream);

    let output_task = tokio::spawn(relay(output, writer, activity.clone()));

    let input_terminal = terminal.clone();
    let pump_input = async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), Error>(());
            }
            input_terminal.write(&buf[..n]).await?;
            if let Some(connection) = &activity {
                connection.touch();
            }
        }
    };

    let status = tokio::select! {
        _ = cancel.cancelled() => None,
        status = child.wait() => status.ok(),
        _ = pump_input => None,
    };

    if status.is_none() {
        let _ = child.kill().await;
    }
    terminal.close().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), output_task).await;

    Ok(status
        .and_then(|s| s.code())
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scp::ScpMode;

    fn options(enable_scp: bool) -> RouterOptions {
        RouterOptions {
            enable_scp,
            full_functionality: true,
        }
    }

    #[test]
    fn test_parse_exec_scp() {
        match parse_exec("scp -t /upload", options(true), false) {
            ExecAction::Scp(cmd) => assert_eq!(cmd.mode, ScpMode::Sink),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_exec_scp_disabled_falls_back_to_command() {
        assert_eq!(
            parse_exec("scp -t /upload", options(false), true),
            ExecAction::Command("scp -t /upload".into())
        );
        assert_eq!(
            parse_exec("scp -t /upload", options(false), false),
            ExecAction::Rejected
        );
    }

    #[test]
    fn test_parse_exec_requires_shell() {
        assert_eq!(parse_exec("ls -la", options(true), false), ExecAction::Rejected);
        assert_eq!(
            parse_exec("ls -la", options(true), true),
            ExecAction::Command("ls -la".into())
        );
        assert_eq!(parse_exec("   ", options(true), true), ExecAction::Rejected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_exec_writes_stderr_then_stdout() {
        let home = tempfile::TempDir::new().unwrap();
        let (client, server) = tokio::io::duplex(4096);
        let code = run_exec(
            server,
            "echo out; echo err 1>&2; exit 3",
            home.path(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(code, 3);

        let mut client = client;
        let mut captured = String::new();
        client.read_to_string(&mut captured).await.unwrap();
        assert_eq!(captured, "err\nout\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_exec_counts_as_activity() {
        let home = tempfile::TempDir::new().unwrap();
        let user = homeport_core::User::new("alice", home.path());
        let connection = Arc::new(Connection::new(user, "SSH-2.0-test".into(), None));
        let before = connection.last_activity();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (mut client, server) = tokio::io::duplex(4096);
        let code = run_exec(
            server,
            "echo busy",
            home.path(),
            CancellationToken::new(),
            Some(connection.clone()),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        assert!(connection.last_activity() > before);

        let mut captured = String::new();
        client.read_to_string(&mut captured).await.unwrap();
        assert_eq!(captured, "busy\n");
    }
}
