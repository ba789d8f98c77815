//! Pseudo-terminals for interactive shells
//!
//! The channel router only sees [`Terminal`]; the platform implementation is
//! chosen at build time.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::process::Child;

use crate::Result;

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    /// Columns
    pub cols: u16,
    /// Rows
    pub rows: u16,
}

impl TerminalSize {
    /// Clamp client-supplied dimensions; zero falls back to 80x24
    pub fn from_request(cols: u32, rows: u32) -> Self {
        let clamp = |v: u32, fallback: u16| match u16::try_from(v) {
            Ok(0) => fallback,
            Ok(v) => v,
            Err(_) => u16::MAX,
        };
        Self {
            cols: clamp(cols, 80),
            rows: clamp(rows, 24),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Process to start on a terminal
#[derive(Debug, Clone)]
pub struct ShellCommand {
    /// Program path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory, also exported as `HOME`
    pub home: PathBuf,
    /// `TERM` value
    pub term: String,
}

impl ShellCommand {
    /// Login shell for `home`: `$SHELL`, falling back to `sh`
    pub fn login(home: PathBuf, term: &str) -> Self {
        Self {
            program: std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string()),
            args: Vec::new(),
            home,
            term: if term.is_empty() {
                "xterm".to_string()
            } else {
                term.to_string()
            },
        }
    }
}

/// Output side of a terminal
pub type TerminalReader = Box<dyn AsyncRead + Send + Unpin>;

/// Allocated pseudo-terminal
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Start `command` with the terminal as its controlling tty
    async fn spawn(&self, command: &ShellCommand) -> Result<Child>;

    /// Take the output stream; only the first call returns it
    fn take_reader(&self) -> Option<TerminalReader>;

    /// Write client input
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Change the window size
    async fn resize(&self, size: TerminalSize) -> Result<()>;

    /// Release the terminal
    async fn close(&self);
}

/// Allocate a terminal for the current platform
///
/// # Errors
///
/// `Pty` when allocation fails, `NotSupported` on platforms without terminals.
pub fn open(size: TerminalSize) -> Result<Arc<dyn Terminal>> {
    Ok(Arc::new(PlatformTerminal::open(size)?))
}

#[cfg(unix)]
pub use unix::PtyTerminal as PlatformTerminal;

#[cfg(not(unix))]
pub use unsupported::UnsupportedTerminal as PlatformTerminal;

#[cfg(unix)]
mod unix {
    use super::{ShellCommand, Terminal, TerminalReader, TerminalSize};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use pty_process::{OwnedReadPty, OwnedWritePty, Pts};
    use tokio::io::AsyncWriteExt;
    use tokio::process::Child;
    use tokio::sync::Mutex;

    fn pty_error(e: impl std::fmt::Display) -> Error {
        Error::Pty(e.to_string())
    }

    /// Terminal backed by a Unix pseudo-terminal pair
    pub struct PtyTerminal {
        writer: Mutex<Option<OwnedWritePty>>,
        reader: std::sync::Mutex<Option<OwnedReadPty>>,
        pts: Mutex<Option<Pts>>,
        size: Mutex<TerminalSize>,
    }

    impl PtyTerminal {
        /// Allocate the pty pair
        ///
        /// # Errors
        ///
        /// `Pty` when the system refuses a new terminal.
        pub fn open(size: TerminalSize) -> Result<Self> {
            let (pty, pts) = pty_process::open().map_err(pty_error)?;
            let (reader, writer) = pty.into_split();
            Ok(Self {
                writer: Mutex::new(Some(writer)),
                reader: std::sync::Mutex::new(Some(reader)),
                pts: Mutex::new(Some(pts)),
                size: Mutex::new(size),
            })
        }
    }

    #[async_trait]
    impl Terminal for PtyTerminal {
        async fn spawn(&self, command: &ShellCommand) -> Result<Child> {
            let pts = self.pts.lock().await;
            let pts = pts
                .as_ref()
                .ok_or_else(|| Error::Pty("terminal already closed".into()))?;
            let child = pty_process::Command::new(&command.program)
                .args(&command.args)
                .env_clear()
                .env("TERM", &command.term)
                .env("HOME", &command.home)
                .env("PATH", "/usr/local/bin:/usr/bin:/bin")
                .current_dir(&command.home)
                .kill_on_drop(true)
                .spawn_borrowed(pts)
                .map_err(pty_error)?;

            // Resizing only takes effect once a process holds the terminal
            let size = *self.size.lock().await;
            self.resize(size).await?;
            Ok(child)
        }

        fn take_reader(&self) -> Option<TerminalReader> {
            let reader = self.reader.lock().ok()?.take()?;
            Some(Box::new(reader))
        }

        async fn write(&self, data: &[u8]) -> Result<()> {
            let mut writer = self.writer.lock().await;
            let writer = writer
                .as_mut()
                .ok_or_else(|| Error::Pty("terminal already closed".into()))?;
            writer.write_all(data).await?;
            Ok(())
        }

        async fn resize(&self, size: TerminalSize) -> Result<()> {
            *self.size.lock().await = size;
            if let Some(writer) = self.writer.lock().await.as_ref() {
                writer
                    .resize(pty_process::Size::new(size.rows, size.cols))
                    .map_err(pty_error)?;
            }
            Ok(())
        }

        async fn close(&self) {
            self.writer.lock().await.take();
            self.pts.lock().await.take();
            if let Ok(mut reader) = self.reader.lock() {
                reader.take();
            }
        }
    }
}

#[cfg(not(unix))]
mod unsupported {
    use super::{ShellCommand, Terminal, TerminalReader, TerminalSize};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use tokio::process::Child;

    /// Placeholder for platforms without pseudo-terminals
    pub struct UnsupportedTerminal;

    impl UnsupportedTerminal {
        /// Always fails
        ///
        /// # Errors
        ///
        /// Always `NotSupported`.
        pub fn open(_size: TerminalSize) -> Result<Self> {
            Err(Error::NotSupported("pseudo-terminals".into()))
        }
    }

    #[async_trait]
    impl Terminal for UnsupportedTerminal {
        async fn spawn(&self, _command: &ShellCommand) -> Result<Child> {
            Err(Error::NotSupported("pseudo-terminals".into()))
        }

        fn take_reader(&self) -> Option<TerminalReader> {
            None
        }

        async fn write(&self, _data: &[u8]) -> Result<()> {
            Err(Error::NotSupported("pseudo-terminals".into()))
        }

        async fn resize(&self, _size: TerminalSize) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_from_request() {
        assert_eq!(TerminalSize::from_request(0, 0), TerminalSize::default());
        assert_eq!(
            TerminalSize::from_request(132, 50),
            TerminalSize { cols: 132, rows: 50 }
        );
        assert_eq!(TerminalSize::from_request(100_000, 10).cols, u16::MAX);
    }

    #[test]
    fn test_login_shell_term_default() {
        let cmd = ShellCommand::login(PathBuf::from("/home/alice"), "");
        assert_eq!(cmd.term, "xterm");
        assert_eq!(cmd.home, PathBuf::from("/home/alice"));
    }
}
