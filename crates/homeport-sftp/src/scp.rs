//! SCP sink and source engine
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation)
//! Implementation: Drives the legacy `scp -t` / `scp -f` framing over a channel
//! stream; every file access goes through the same [`FileSystem`] as SFTP

use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, info, warn};

use crate::protocol::{FileAttrs, OpenFlags};
use crate::vfs::{Command, FileSystem, ListMethod};
use crate::{Error, Result};

const SCP_OK: u8 = 0;
const SCP_WARNING: u8 = 1;
const SCP_ERROR: u8 = 2;

/// Chunk size for file data
const BUFFER_SIZE: usize = 32 * 1024;

/// Longest accepted control line
const MAX_LINE_LENGTH: u64 = 8 * 1024;

/// Direction of an SCP invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpMode {
    /// `-f`: the server sends files
    Source,
    /// `-t`: the server receives files
    Sink,
}

impl std::fmt::Display for ScpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScpMode::Source => write!(f, "source"),
            ScpMode::Sink => write!(f, "sink"),
        }
    }
}

/// Parsed `scp` command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpCommand {
    /// Transfer direction
    pub mode: ScpMode,
    /// Client-visible path argument
    pub path: String,
    /// `-r`
    pub recursive: bool,
    /// `-p`
    pub preserve_times: bool,
    /// `-d`
    pub target_is_directory: bool,
}

impl ScpCommand {
    /// Parse `scp [-r] [-p] [-d] (-t|-f) path`
    ///
    /// Returns `None` when the arguments are not an scp invocation.
    pub fn parse(args: &[String]) -> Option<Self> {
        let (program, rest) = args.split_first()?;
        if program != "scp" || rest.is_empty() {
            return None;
        }

        let mut mode = None;
        let mut recursive = false;
        let mut preserve_times = false;
        let mut target_is_directory = false;
        let mut path = None;

        for arg in rest {
            if let Some(flags) = arg.strip_prefix('-').filter(|f| !f.is_empty()) {
                for flag in flags.chars() {
                    match flag {
                        't' => mode = Some(ScpMode::Sink),
                        'f' => mode = Some(ScpMode::Source),
                        'r' => recursive = true,
                        'p' => preserve_times = true,
                        'd' => target_is_directory = true,
                        _ => {}
                    }
                }
            } else if path.is_none() {
                path = Some(arg.clone());
            }
        }

        Some(Self {
            mode: mode?,
            path: path?,
            recursive,
            preserve_times,
            target_is_directory,
        })
    }
}

/// One SCP invocation over a channel stream
pub struct ScpSession {
    fs: Arc<dyn FileSystem>,
    command: ScpCommand,
    times: Option<(u32, u32)>,
}

impl ScpSession {
    /// Bind `command` to a filesystem
    pub fn new(fs: Arc<dyn FileSystem>, command: ScpCommand) -> Self {
        Self {
            fs,
            command,
            times: None,
        }
    }

    /// Run to completion
    ///
    /// # Errors
    ///
    /// Any failure reported to the client is also returned, so the caller can
    /// pick a non-zero exit status.
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let username = self.fs.connection().user.username.clone();
        info!(
            username = %username,
            mode = %self.command.mode,
            path = %self.command.path,
            recursive = self.command.recursive,
            "Starting SCP session"
        );

        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let result = match self.command.mode {
            ScpMode::Sink => self.run_sink(&mut reader, &mut writer).await,
            ScpMode::Source => self.run_source(&mut reader, &mut writer).await,
        };

        if let Err(e) = &result {
            if !matches!(e, Error::ChannelClosed(_)) {
                let _ = send_error(&mut writer, e).await;
            }
            warn!(username = %username, mode = %self.command.mode, error = %e, "SCP session failed");
        }
        let _ = writer.shutdown().await;
        result
    }

    async fn is_dir(&self, path: &str) -> bool {
        match self.fs.list(ListMethod::Stat, path).await {
            Ok(listing) => listing.entries().first().is_some_and(|e| e.attrs.is_dir()),
            Err(_) => false,
        }
    }

    /// Receive files from the client
    async fn run_sink<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let root = self.command.path.clone();
        let root_is_dir = self.is_dir(&root).await;
        if self.command.target_is_directory && !root_is_dir {
            return Err(Error::FileNotFound(root));
        }

        // Directories entered by D lines; empty means "at the command path"
        let mut stack: Vec<String> = Vec::new();
        send_ok(writer).await?;

        while let Some(line) = read_line(reader).await? {
            let Some((&kind, body)) = line.split_first() else {
                continue;
            };
            let body = String::from_utf8_lossy(body).trim_end_matches('\n').to_string();

            match kind {
                b'C' => {
                    let (mode, size, name) = parse_entry_header(&body)?;
                    let destination = match stack.last() {
                        Some(dir) => join(dir, &name),
                        None if root_is_dir => join(&root, &name),
                        None => root.clone(),
                    };
                    self.receive_file(reader, writer, &destination, mode, size)
                        .await?;
                }
                b'D' => {
                    if !self.command.recursive {
                        return Err(Error::NotSupported("directory without -r".into()));
                    }
                    let (mode, _, name) = parse_entry_header(&body)?;
                    let dir = match stack.last() {
                        Some(dir) => join(dir, &name),
                        None if root_is_dir => join(&root, &name),
                        None => root.clone(),
                    };
                    if !self.is_dir(&dir).await {
                        self.fs.command(Command::Mkdir { path: dir.clone() }).await?;
                    }
                    self.apply_times(&dir, mode).await;
                    stack.push(dir);
                    send_ok(writer).await?;
                }
                b'E' => {
                    stack.pop();
                    send_ok(writer).await?;
                }
                b'T' => {
                    self.times = Some(parse_times(&body)?);
                    send_ok(writer).await?;
                }
                SCP_WARNING | SCP_ERROR => {
                    warn!(message = %body, "SCP client reported an error");
                    return Ok(());
                }
                _ => {
                    return Err(Error::Protocol(format!("unknown SCP control line {:?}", body)));
                }
            }
        }
        Ok(())
    }

    async fn receive_file<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        destination: &str,
        mode: u32,
        size: u64,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        debug!(path = %destination, size, mode = format!("{:04o}", mode), "Receiving file");
        let transfer = self.fs.write(destination, OpenFlags::upload()).await?;
        send_ok(writer).await?;

        let mut remaining = size;
        let mut offset = 0u64;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        while remaining > 0 {
            let want = usize::try_from(remaining).unwrap_or(BUFFER_SIZE).min(BUFFER_SIZE);
            let n = reader.read(&mut buffer[..want]).await?;
            if n == 0 {
                transfer.fail("channel closed mid-file").await;
                let _ = transfer.close().await;
                return Err(Error::channel_closed("closed while receiving file"));
            }
            if let Err(e) = transfer.write_at(offset, &buffer[..n]).await {
                let _ = transfer.close().await;
                return Err(e);
            }
            offset += n as u64;
            remaining -= n as u64;
        }

        // Trailing status byte from the client
        let status = reader.read_u8().await?;
        if status != SCP_OK {
            transfer.fail("client reported an error after the data").await;
            let _ = transfer.close().await;
            return Err(Error::Protocol("client aborted the file".into()));
        }

        transfer.close().await?;
        self.apply_times(destination, mode).await;
        send_ok(writer).await
    }

    /// Apply `-p` metadata after an entry is complete
    async fn apply_times(&mut self, path: &str, mode: u32) {
        if !self.command.preserve_times {
            return;
        }
        let (mtime, atime) = self.times.take().unzip();
        let attrs = FileAttrs {
            permissions: Some(mode & 0o777),
            atime,
            mtime,
            ..Default::default()
        };
        if let Err(e) = self
            .fs
            .command(Command::Setstat {
                path: path.to_string(),
                attrs,
            })
            .await
        {
            debug!(path = %path, error = %e, "Unable to preserve SCP metadata");
        }
    }

    /// Send files to the client
    async fn run_source<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        wait_for_ok(reader).await?;
        let path = self.command.path.clone();
        let listing = self.fs.list(ListMethod::Stat, &path).await?;
        let attrs = listing
            .entries()
            .first()
            .map(|e| e.attrs.clone())
            .ok_or_else(|| Error::FileNotFound(path.clone()))?;

        if attrs.is_dir() {
            if !self.command.recursive {
                return Err(Error::NotSupported("directory without -r".into()));
            }
            self.send_directory(reader, writer, &path, &attrs).await
        } else {
            self.send_file(reader, writer, &path, &attrs).await
        }
    }

    async fn send_times<R, W>(&self, reader: &mut R, writer: &mut W, attrs: &FileAttrs) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if !self.command.preserve_times {
            return Ok(());
        }
        let mtime = attrs.mtime.unwrap_or(0);
        let atime = attrs.atime.unwrap_or(mtime);
        writer
            .write_all(format!("T{} 0 {} 0\n", mtime, atime).as_bytes())
            .await?;
        writer.flush().await?;
        wait_for_ok(reader).await
    }

    async fn send_file<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        path: &str,
        attrs: &FileAttrs,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let handle = self.fs.read(path).await?;
        let transfer = handle.transfer;
        let size = handle.attrs.size.unwrap_or(0);
        let mode = attrs.permissions.unwrap_or(0o644) & 0o777;

        let result = async {
            self.send_times(reader, writer, &handle.attrs).await?;
            writer
                .write_all(format!("C{:04o} {} {}\n", mode, size, base_name(path)).as_bytes())
                .await?;
            writer.flush().await?;
            wait_for_ok(reader).await?;

            let mut offset = 0u64;
            while offset < size {
                let chunk = match transfer.read_at(offset, BUFFER_SIZE as u32).await {
                    Ok(chunk) => chunk,
                    Err(Error::Eof) => break,
                    Err(e) => return Err(e),
                };
                writer.write_all(&chunk).await?;
                offset += chunk.len() as u64;
            }
            writer.write_all(&[SCP_OK]).await?;
            writer.flush().await?;
            wait_for_ok(reader).await
        }
        .await;

        if let Err(e) = &result {
            transfer.fail(e.to_string()).await;
        }
        transfer.close().await?;
        result
    }

    async fn send_directory<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        path: &str,
        attrs: &FileAttrs,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mode = attrs.permissions.unwrap_or(0o755) & 0o777;
        self.send_times(reader, writer, attrs).await?;
        writer
            .write_all(format!("D{:04o} 0 {}\n", mode, base_name(path)).as_bytes())
            .await?;
        writer.flush().await?;
        wait_for_ok(reader).await?;

        let listing = self.fs.list(ListMethod::List, path).await?;
        for entry in listing.entries() {
            let child = join(path, &entry.name);
            if entry.attrs.is_symlink() {
                debug!(path = %child, "Skipping symlink");
            } else if entry.attrs.is_dir() {
                Box::pin(self.send_directory(reader, writer, &child, &entry.attrs)).await?;
            } else {
                self.send_file(reader, writer, &child, &entry.attrs).await?;
            }
        }

        writer.write_all(b"E\n").await?;
        writer.flush().await?;
        wait_for_ok(reader).await
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("/")
}

/// Parse `<mode> <size> <name>` from a C or D line
fn parse_entry_header(body: &str) -> Result<(u32, u64, String)> {
    let mut parts = body.splitn(3, ' ');
    let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::Protocol(format!("invalid SCP header {:?}", body)));
    };
    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| Error::Protocol(format!("invalid mode {:?}", mode)))?;
    let size = size
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid size {:?}", size)))?;
    if name.is_empty() || name.contains('/') || name == ".." || name == "." {
        return Err(Error::denied(format!("SCP entry name {:?}", name)));
    }
    Ok((mode, size, name.to_string()))
}

/// Parse `<mtime> 0 <atime> 0` from a T line
fn parse_times(body: &str) -> Result<(u32, u32)> {
    let parts: Vec<&str> = body.split_whitespace().collect();
    let parse = |s: Option<&&str>| -> Result<u32> {
        s.and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("invalid SCP times {:?}", body)))
    };
    Ok((parse(parts.first())?, parse(parts.get(2))?))
}

async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LENGTH)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && n as u64 == MAX_LINE_LENGTH {
        return Err(Error::Protocol("SCP control line too long".into()));
    }
    Ok(Some(line))
}

async fn send_ok<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&[SCP_OK]).await?;
    writer.flush().await?;
    Ok(())
}

async fn send_error<W: AsyncWrite + Unpin>(writer: &mut W, error: &Error) -> Result<()> {
    let mut message = vec![SCP_ERROR];
    message.extend_from_slice(error.sanitized_message().as_bytes());
    message.push(b'\n');
    writer.write_all(&message).await?;
    writer.flush().await?;
    Ok(())
}

async fn wait_for_ok<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let status = match reader.read_u8().await {
        Ok(status) => status,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::channel_closed("SCP peer closed"));
        }
        Err(e) => return Err(e.into()),
    };
    if status == SCP_OK {
        return Ok(());
    }
    Err(Error::Protocol(format!("SCP peer replied with status {}", status)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_sink() {
        let cmd = ScpCommand::parse(&args("scp -t /upload")).unwrap();
        assert_eq!(cmd.mode, ScpMode::Sink);
        assert_eq!(cmd.path, "/upload");
        assert!(!cmd.recursive);
    }

    #[test]
    fn test_parse_combined_flags() {
        let cmd = ScpCommand::parse(&args("scp -prf /data")).unwrap();
        assert_eq!(cmd.mode, ScpMode::Source);
        assert!(cmd.recursive);
        assert!(cmd.preserve_times);
    }

    #[test]
    fn test_parse_rejects_other_commands() {
        assert!(ScpCommand::parse(&args("ls -la")).is_none());
        assert!(ScpCommand::parse(&args("scp")).is_none());
        assert!(ScpCommand::parse(&args("scp -r /x")).is_none());
        assert!(ScpCommand::parse(&args("scp -t")).is_none());
    }

    #[test]
    fn test_entry_header_rejects_traversal() {
        assert!(parse_entry_header("0644 5 ok.txt").is_ok());
        assert!(matches!(
            parse_entry_header("0644 5 ../x"),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            parse_entry_header("0755 0 .."),
            Err(Error::PermissionDenied(_))
        ));
        assert!(parse_entry_header("abc 5 x").is_err());
    }

    #[test]
    fn test_parse_times() {
        assert_eq!(parse_times("1700000000 0 1700000100 0").unwrap(), (1700000000, 1700000100));
        assert!(parse_times("x 0").is_err());
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/a/b.txt"), "b.txt");
        assert_eq!(base_name("/a/dir/"), "dir");
        assert_eq!(base_name("/"), "/");
    }
}
