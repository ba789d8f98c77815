//! SFTP request server
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation), SI-11 (Error Handling)
//! STIG: V-222566
//! Implementation: Speaks SFTP version 3 over any byte stream and turns every
//! request into a [`FileSystem`] call; failures are answered with a sanitized
//! status and the session keeps going

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::protocol::{
    codec, read_packet, write_packet, FileAttrs, MessageType, OpenFlags, StatusCode, SFTP_VERSION,
};
use crate::transfer::{Direction, Transfer};
use crate::vfs::{Command, DirEntry, FileSystem, ListMethod, Listing};
use crate::{Error, Result};

/// Largest data block returned for a single read request
pub const MAX_READ_LEN: u32 = 32 * 1024;

/// Entries returned per READDIR reply
const READDIR_BATCH: usize = 100;

enum OpenHandle {
    File {
        path: String,
        transfer: Arc<Transfer>,
        attrs: FileAttrs,
    },
    Dir {
        listing: Listing,
        offset: usize,
    },
}

/// One SFTP session bound to a filesystem
///
/// NIST 800-53: AC-12 (Session Termination), SI-11 (Error Handling)
/// Implementation: Open handles are closed when the stream ends, so a dropped
/// client never leaves a transfer registered
pub struct SftpServer {
    fs: Arc<dyn FileSystem>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
    initialized: bool,
}

impl SftpServer {
    /// Create a session over `fs`
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            handles: HashMap::new(),
            next_handle: 0,
            initialized: false,
        }
    }

    /// Serve requests until the client closes the stream or the connection is cancelled
    ///
    /// # Errors
    ///
    /// Framing errors and stream I/O failures end the session with an error.
    pub async fn serve<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connection = self.fs.connection().clone();
        let cancel = connection.cancel_token().clone();
        let (mut reader, mut writer) = tokio::io::split(stream);

        let result = loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                packet = read_packet(&mut reader) => packet,
            };
            let packet = match packet {
                Ok(Some(packet)) => packet,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            connection.touch();

            let response = match self.handle_packet(&packet).await {
                Ok(response) => response,
                Err(e) => break Err(e),
            };
            if let Err(e) = write_packet(&mut writer, &response).await {
                break Err(e);
            }
        };

        self.close_all().await;
        debug!(connection_id = %connection.id, "SFTP session ended");
        result
    }

    /// Close every open handle
    pub async fn close_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            if let OpenHandle::File { transfer, .. } = handle {
                if let Err(e) = transfer.close().await {
                    debug!(path = %transfer.path().display(), error = %e, "Close on teardown failed");
                }
            }
        }
    }

    /// Dispatch one packet and build the reply
    ///
    /// NIST 800-53: SI-10 (Input Validation)
    /// Implementation: Unknown request types are answered with OpUnsupported
    async fn handle_packet(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let Some((&kind, mut buf)) = data.split_first() else {
            return Err(Error::Protocol("Empty packet".into()));
        };

        let msg_type = match MessageType::try_from(kind) {
            Ok(msg_type) => msg_type,
            Err(_) => {
                let request_id = codec::get_u32(&mut buf)?;
                warn!(kind, "Unknown SFTP request type");
                return Ok(status(
                    request_id,
                    StatusCode::OpUnsupported,
                    "Operation unsupported",
                ));
            }
        };

        if !self.initialized && msg_type != MessageType::Init {
            return Err(Error::Protocol("Session not initialized".into()));
        }
        if msg_type == MessageType::Init {
            return self.handle_init(&mut buf);
        }

        let request_id = codec::get_u32(&mut buf)?;
        debug!(?msg_type, request_id, "SFTP request");

        let result = match msg_type {
            MessageType::Open => self.handle_open(request_id, &mut buf).await,
            MessageType::Close => self.handle_close(request_id, &mut buf).await,
            MessageType::Read => self.handle_read(request_id, &mut buf).await,
            MessageType::Write => self.handle_write(request_id, &mut buf).await,
            MessageType::Stat => self.handle_stat(request_id, &mut buf, ListMethod::Stat).await,
            MessageType::Lstat => self.handle_stat(request_id, &mut buf, ListMethod::Lstat).await,
            MessageType::Fstat => self.handle_fstat(request_id, &mut buf).await,
            MessageType::Setstat => self.handle_setstat(request_id, &mut buf).await,
            MessageType::Fsetstat => self.handle_fsetstat(request_id, &mut buf).await,
            MessageType::Opendir => self.handle_opendir(request_id, &mut buf).await,
            MessageType::Readdir => self.handle_readdir(request_id, &mut buf),
            MessageType::Remove => {
                let path = codec::get_string(&mut buf)?;
                self.run_command(request_id, Command::Remove { path }).await
            }
            MessageType::Mkdir => {
                let path = codec::get_string(&mut buf)?;
                let _attrs = FileAttrs::decode(&mut buf)?;
                self.run_command(request_id, Command::Mkdir { path }).await
            }
            MessageType::Rmdir => {
                let path = codec::get_string(&mut buf)?;
                self.run_command(request_id, Command::Rmdir { path }).await
            }
            MessageType::Rename => {
                let source = codec::get_string(&mut buf)?;
                let target = codec::get_string(&mut buf)?;
                self.run_command(request_id, Command::Rename { source, target })
                    .await
            }
            MessageType::Symlink => {
                // OpenSSH ordering: target first, then the new link
                let target = codec::get_string(&mut buf)?;
                let link = codec::get_string(&mut buf)?;
                self.run_command(request_id, Command::Symlink { target, link })
                    .await
            }
            MessageType::Realpath => self.handle_realpath(request_id, &mut buf).await,
            MessageType::Readlink => self.handle_readlink(request_id, &mut buf).await,
            _ => Err(Error::NotSupported(format!("{:?}", msg_type))),
        };

        match result {
            Ok(response) => Ok(response),
            Err(Error::Protocol(msg)) => Err(Error::Protocol(msg)),
            Err(e) => {
                if e.is_security_event() {
                    warn!(request_id, error = %e, "SFTP request denied");
                } else if !matches!(e, Error::Eof) {
                    debug!(request_id, error = %e, "SFTP request failed");
                }
                Ok(status_error(request_id, &e))
            }
        }
    }

    fn handle_init(&mut self, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let version = codec::get_u32(buf)?;
        info!(client_version = version, "SFTP session initialized");
        self.initialized = true;

        let mut response = BytesMut::new();
        response.put_u8(MessageType::Version as u8);
        response.put_u32(SFTP_VERSION);
        Ok(response.to_vec())
    }

    fn allocate_handle(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let id = self.next_handle.to_string();
        self.handles.insert(id.clone(), handle);
        id
    }

    fn handle_key(buf: &mut &[u8]) -> Result<String> {
        let raw = codec::get_bytes(buf)?;
        Ok(String::from_utf8_lossy(&raw).to_string())
    }

    fn file_handle(&self, key: &str) -> Result<(&str, &Arc<Transfer>, &FileAttrs)> {
        match self.handles.get(key) {
            Some(OpenHandle::File {
                path,
                transfer,
                attrs,
            }) => Ok((path, transfer, attrs)),
            Some(OpenHandle::Dir { .. }) => Err(Error::invalid_handle("directory handle")),
            None => Err(Error::invalid_handle(key)),
        }
    }

    /// Open a file for reading or writing
    ///
    /// NIST 800-53: AC-3 (Access Enforcement)
    /// Implementation: Any write-side flag routes to an upload; otherwise a download
    async fn handle_open(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let flags = OpenFlags(codec::get_u32(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        let handle = if flags.has_write() || flags.has_creat() || flags.has_trunc() {
            let transfer = self.fs.write(&path, flags).await?;
            OpenHandle::File {
                path,
                transfer,
                attrs: FileAttrs::default(),
            }
        } else {
            let read = self.fs.read(&path).await?;
            OpenHandle::File {
                path,
                transfer: read.transfer,
                attrs: read.attrs,
            }
        };

        let id = self.allocate_handle(handle);
        Ok(handle_reply(request_id, &id))
    }

    async fn handle_close(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let key = Self::handle_key(buf)?;
        match self.handles.remove(&key) {
            Some(OpenHandle::File { transfer, .. }) => {
                transfer.close().await?;
                Ok(status_ok(request_id))
            }
            Some(OpenHandle::Dir { .. }) => Ok(status_ok(request_id)),
            None => Err(Error::invalid_handle(key)),
        }
    }

    async fn handle_read(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let key = Self::handle_key(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?.min(MAX_READ_LEN);

        let (_, transfer, _) = self.file_handle(&key)?;
        if transfer.direction() != Direction::Download {
            return Err(Error::invalid_handle("handle not opened for reading"));
        }
        let data = transfer.read_at(offset, len).await?;

        let mut response = BytesMut::with_capacity(data.len() + 9);
        response.put_u8(MessageType::Data as u8);
        response.put_u32(request_id);
        codec::put_bytes(&mut response, &data);
        Ok(response.to_vec())
    }

    async fn handle_write(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let key = Self::handle_key(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        let (_, transfer, _) = self.file_handle(&key)?;
        if transfer.direction() != Direction::Upload {
            return Err(Error::invalid_handle("handle not opened for writing"));
        }
        transfer.write_at(offset, &data).await?;
        Ok(status_ok(request_id))
    }

    async fn handle_stat(
        &mut self,
        request_id: u32,
        buf: &mut &[u8],
        method: ListMethod,
    ) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let listing = self.fs.list(method, &path).await?;
        let attrs = first_entry(&listing, &path)?.attrs.clone();
        Ok(attrs_reply(request_id, &attrs))
    }

    async fn handle_fstat(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let key = Self::handle_key(buf)?;
        let (path, transfer, attrs) = self.file_handle(&key)?;
        let attrs = match transfer.direction() {
            Direction::Download => attrs.clone(),
            Direction::Upload => match self.fs.list(ListMethod::Stat, path).await {
                Ok(listing) => first_entry(&listing, path)?.attrs.clone(),
                Err(_) => FileAttrs {
                    size: Some(transfer.bytes_transferred()),
                    ..attrs.clone()
                },
            },
        };
        Ok(attrs_reply(request_id, &attrs))
    }

    async fn handle_setstat(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let attrs = FileAttrs::decode(buf)?;
        self.run_command(request_id, Command::Setstat { path, attrs })
            .await
    }

    async fn handle_fsetstat(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let key = Self::handle_key(buf)?;
        let attrs = FileAttrs::decode(buf)?;
        let path = self.file_handle(&key)?.0.to_string();
        self.run_command(request_id, Command::Setstat { path, attrs })
            .await
    }

    async fn handle_opendir(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let listing = self.fs.list(ListMethod::List, &path).await?;
        let id = self.allocate_handle(OpenHandle::Dir { listing, offset: 0 });
        Ok(handle_reply(request_id, &id))
    }

    fn handle_readdir(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let key = Self::handle_key(buf)?;
        let Some(OpenHandle::Dir { listing, offset }) = self.handles.get_mut(&key) else {
            return Err(Error::invalid_handle(key));
        };

        let batch = listing.list_at(*offset, READDIR_BATCH);
        if batch.is_empty() {
            return Err(Error::Eof);
        }
        *offset += batch.len();
        Ok(name_reply(request_id, batch))
    }

    async fn handle_realpath(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let real = self.fs.realpath(&path).await?;
        Ok(name_reply(
            request_id,
            &[DirEntry {
                name: real,
                attrs: FileAttrs::default(),
            }],
        ))
    }

    async fn handle_readlink(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;
        let listing = self.fs.list(ListMethod::Readlink, &path).await?;
        let entry = first_entry(&listing, &path)?;
        Ok(name_reply(request_id, std::slice::from_ref(entry)))
    }

    async fn run_command(&mut self, request_id: u32, command: Command) -> Result<Vec<u8>> {
        self.fs.command(command).await?;
        Ok(status_ok(request_id))
    }
}

fn first_entry<'a>(listing: &'a Listing, path: &str) -> Result<&'a DirEntry> {
    listing
        .entries()
        .first()
        .ok_or_else(|| Error::FileNotFound(path.to_string()))
}

fn status(request_id: u32, code: StatusCode, msg: &str) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Status as u8);
    response.put_u32(request_id);
    response.put_u32(code.into());
    codec::put_string(&mut response, msg);
    codec::put_string(&mut response, "en");
    response.to_vec()
}

fn status_ok(request_id: u32) -> Vec<u8> {
    status(request_id, StatusCode::Ok, "Success")
}

/// STATUS reply for an error
///
/// NIST 800-53: SI-11 (Error Handling)
/// STIG: V-222566
fn status_error(request_id: u32, error: &Error) -> Vec<u8> {
    status(request_id, error.to_status_code(), &error.sanitized_message())
}

fn handle_reply(request_id: u32, handle: &str) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Handle as u8);
    response.put_u32(request_id);
    codec::put_string(&mut response, handle);
    response.to_vec()
}

fn attrs_reply(request_id: u32, attrs: &FileAttrs) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Attrs as u8);
    response.put_u32(request_id);
    response.put(attrs.encode());
    response.to_vec()
}

fn name_reply(request_id: u32, entries: &[DirEntry]) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Name as u8);
    response.put_u32(request_id);
    response.put_u32(u32::try_from(entries.len()).unwrap_or(u32::MAX));
    for entry in entries {
        codec::put_string(&mut response, &entry.name);
        let longname = if entry.attrs == FileAttrs::default() {
            entry.name.clone()
        } else {
            entry.attrs.longname(&entry.name)
        };
        codec::put_string(&mut response, &longname);
        response.put(entry.attrs.encode());
    }
    response.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reply_layout() {
        let reply = status_error(7, &Error::EscapesHome("/../etc".into()));
        assert_eq!(reply[0], MessageType::Status as u8);
        assert_eq!(&reply[1..5], &7u32.to_be_bytes());
        assert_eq!(&reply[5..9], &u32::from(StatusCode::NoSuchFile).to_be_bytes());
        // Host paths never reach the client
        let text = String::from_utf8_lossy(&reply);
        assert!(!text.contains("etc"));
    }

    #[test]
    fn test_name_reply_count() {
        let entries = vec![
            DirEntry {
                name: "a".into(),
                attrs: FileAttrs::default(),
            },
            DirEntry {
                name: "b".into(),
                attrs: FileAttrs {
                    size: Some(3),
                    permissions: Some(0o100644),
                    ..Default::default()
                },
            },
        ];
        let reply = name_reply(1, &entries);
        assert_eq!(reply[0], MessageType::Name as u8);
        assert_eq!(&reply[5..9], &2u32.to_be_bytes());
    }
}
