//! SFTP Protocol Implementation
//!
//! This module implements the wire encoding of the SSH File Transfer Protocol
//! as defined in draft-ietf-secsh-filexfer-02 (protocol version 3).
//!
//! The SFTP protocol runs over the SSH connection protocol (RFC 4254),
//! using the "sftp" subsystem.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SFTP Protocol Version
pub const SFTP_VERSION: u32 = 3;

/// Largest packet accepted from a client (generous for 32 KiB writes)
pub const MAX_PACKET_LEN: u32 = 256 * 1024;

/// SFTP message types (draft-ietf-secsh-filexfer-02)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init = 1,
    Version = 2,
    /// Open file
    Open = 3,
    /// Close file
    Close = 4,
    /// Read from file
    Read = 5,
    /// Write to file
    Write = 6,
    /// Get file attributes by path
    Lstat = 7,
    /// Get file attributes by handle
    Fstat = 8,
    /// Set file attributes by path
    Setstat = 9,
    /// Set file attributes by handle
    Fsetstat = 10,
    /// Open directory
    Opendir = 11,
    /// Read directory entries
    Readdir = 12,
    /// Remove file
    Remove = 13,
    /// Create directory
    Mkdir = 14,
    /// Remove directory
    Rmdir = 15,
    /// Get real path
    Realpath = 16,
    /// Get file attributes by path (follow symlinks)
    Stat = 17,
    /// Rename file or directory
    Rename = 18,
    /// Read symbolic link
    Readlink = 19,
    /// Create symbolic link
    Symlink = 20,
    /// Status response
    Status = 101,
    /// Handle response
    Handle = 102,
    /// Data response
    Data = 103,
    /// Name response (for directory listings)
    Name = 104,
    /// Attributes response
    Attrs = 105,
    /// Extended request
    Extended = 200,
    /// Extended reply
    ExtendedReply = 201,
}

impl MessageType {
    const ALL: [MessageType; 27] = [
        MessageType::Init,
        MessageType::Version,
        MessageType::Open,
        MessageType::Close,
        MessageType::Read,
        MessageType::Write,
        MessageType::Lstat,
        MessageType::Fstat,
        MessageType::Setstat,
        MessageType::Fsetstat,
        MessageType::Opendir,
        MessageType::Readdir,
        MessageType::Remove,
        MessageType::Mkdir,
        MessageType::Rmdir,
        MessageType::Realpath,
        MessageType::Stat,
        MessageType::Rename,
        MessageType::Readlink,
        MessageType::Symlink,
        MessageType::Status,
        MessageType::Handle,
        MessageType::Data,
        MessageType::Name,
        MessageType::Attrs,
        MessageType::Extended,
        MessageType::ExtendedReply,
    ];
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|kind| *kind as u8 == value)
            .ok_or_else(|| crate::Error::Protocol(format!("packet type {} not recognised", value)))
    }
}

/// SFTP status codes returned to clients
///
/// NIST 800-53: SI-11 (Error Handling)
/// Implementation: Eof only marks the end of a read or listing
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file
    Eof = 1,
    /// No such file or directory
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// General failure
    Failure = 4,
    /// Operation not supported
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for StatusCode {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        [
            StatusCode::Ok,
            StatusCode::Eof,
            StatusCode::NoSuchFile,
            StatusCode::PermissionDenied,
            StatusCode::Failure,
            StatusCode::OpUnsupported,
        ]
        .into_iter()
        .find(|code| u32::from(*code) == value)
        .ok_or_else(|| crate::Error::Protocol(format!("status {} not recognised", value)))
    }
}

/// File open flags (SSH_FXF_*)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open for reading
    pub const READ: u32 = 0x00000001;
    /// Open for writing
    pub const WRITE: u32 = 0x00000002;
    /// Append to the end of the file
    pub const APPEND: u32 = 0x00000004;
    /// Create if missing
    pub const CREAT: u32 = 0x00000008;
    /// Truncate an existing file
    pub const TRUNC: u32 = 0x00000010;
    /// Fail if the file exists
    pub const EXCL: u32 = 0x00000020;

    /// Flags for a plain create-or-replace upload
    pub fn upload() -> Self {
        Self(Self::WRITE | Self::CREAT | Self::TRUNC)
    }

    /// Read bit set
    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    /// Write bit set
    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Append bit set
    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    /// Create bit set
    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }

    /// Truncate bit set
    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    /// Exclusive bit set
    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// File attributes (SSH_FILEXFER_ATTR_*)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// Size in bytes
    pub size: Option<u64>,
    /// Owner id
    pub uid: Option<u32>,
    /// Group id
    pub gid: Option<u32>,
    /// Full `st_mode` including file type bits
    pub permissions: Option<u32>,
    /// Access time, seconds since the epoch
    pub atime: Option<u32>,
    /// Modification time, seconds since the epoch
    pub mtime: Option<u32>,
}

/// `S_IFMT` file type mask
pub const S_IFMT: u32 = 0o170000;
/// Directory file type
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type
pub const S_IFREG: u32 = 0o100000;
/// Symbolic link file type
pub const S_IFLNK: u32 = 0o120000;

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x00000001;
    const FLAG_UIDGID: u32 = 0x00000002;
    const FLAG_PERMISSIONS: u32 = 0x00000004;
    const FLAG_ACMODTIME: u32 = 0x00000008;

    /// Build attributes from file metadata
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX));
        let atime = metadata
            .accessed()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
            .or(mtime);

        #[cfg(unix)]
        let (uid, gid, permissions) = {
            use std::os::unix::fs::MetadataExt;
            (Some(metadata.uid()), Some(metadata.gid()), metadata.mode())
        };
        #[cfg(not(unix))]
        let (uid, gid, permissions) = {
            let kind = if metadata.is_dir() {
                S_IFDIR | 0o755
            } else if metadata.file_type().is_symlink() {
                S_IFLNK | 0o777
            } else {
                S_IFREG | 0o644
            };
            (Some(0), Some(0), kind)
        };

        Self {
            size: Some(metadata.len()),
            uid,
            gid,
            permissions: Some(permissions),
            atime,
            mtime,
        }
    }

    /// Whether the attributes describe a directory
    pub fn is_dir(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFDIR)
    }

    /// Whether the attributes describe a symbolic link
    pub fn is_symlink(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFLNK)
    }

    /// `ls -l` style line used as the SFTP v3 longname
    pub fn longname(&self, name: &str) -> String {
        let mode = self.permissions.unwrap_or(0);
        let kind = match mode & S_IFMT {
            S_IFDIR => 'd',
            S_IFLNK => 'l',
            _ => '-',
        };
        let mut perms = String::with_capacity(9);
        for shift in [6u32, 3, 0] {
            let bits = (mode >> shift) & 0o7;
            perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        let modified = self
            .mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0))
            .map(|t| t.format("%b %d %H:%M").to_string())
            .unwrap_or_default();
        format!(
            "{}{} 1 {:<8} {:<8} {:>8} {} {}",
            kind,
            perms,
            self.uid.unwrap_or(0),
            self.gid.unwrap_or(0),
            self.size.unwrap_or(0),
            modified,
            name
        )
    }

    /// Wire form: flag word followed by the fields it announces
    pub fn encode(&self) -> BytesMut {
        let owner = self.uid.zip(self.gid);
        let times = self.atime.zip(self.mtime);

        let mut flags = 0u32;
        flags |= self.size.map_or(0, |_| Self::FLAG_SIZE);
        flags |= owner.map_or(0, |_| Self::FLAG_UIDGID);
        flags |= self.permissions.map_or(0, |_| Self::FLAG_PERMISSIONS);
        flags |= times.map_or(0, |_| Self::FLAG_ACMODTIME);

        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = owner {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(mode) = self.permissions {
            buf.put_u32(mode);
        }
        if let Some((atime, mtime)) = times {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
        buf
    }

    /// Parse an attribute block, advancing `buf` past it
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        use codec::{get_u32, get_u64};

        let flags = get_u32(buf)?;
        let has = |bit: u32| flags & bit != 0;

        let size = if has(Self::FLAG_SIZE) { Some(get_u64(buf)?) } else { None };
        let (uid, gid) = if has(Self::FLAG_UIDGID) {
            (Some(get_u32(buf)?), Some(get_u32(buf)?))
        } else {
            (None, None)
        };
        let permissions = if has(Self::FLAG_PERMISSIONS) {
            Some(get_u32(buf)?)
        } else {
            None
        };
        let (atime, mtime) = if has(Self::FLAG_ACMODTIME) {
            (Some(get_u32(buf)?), Some(get_u32(buf)?))
        } else {
            (None, None)
        };

        Ok(Self {
            size,
            uid,
            gid,
            permissions,
            atime,
            mtime,
        })
    }
}

/// Read one length-prefixed SFTP packet. Returns `None` on a clean end of stream.
pub async fn read_packet<R>(reader: &mut R) -> crate::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(crate::Error::Protocol(format!("Invalid packet length: {}", len)));
    }
    let mut packet = vec![0u8; len as usize];
    reader.read_exact(&mut packet).await?;
    Ok(Some(packet))
}

/// Write one SFTP packet with its length prefix
pub async fn write_packet<W>(writer: &mut W, payload: &[u8]) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| crate::Error::Protocol("Packet too large".into()))?;
    let mut frame = BytesMut::with_capacity(payload.len() + 4);
    frame.put_u32(len);
    frame.put_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Length-prefixed strings and big-endian integers
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    fn short(what: &str, need: usize, have: usize) -> crate::Error {
        crate::Error::Protocol(format!("truncated {}: need {} bytes, have {}", what, need, have))
    }

    pub fn put_string(buf: &mut BytesMut, s: &str) {
        put_bytes(buf, s.as_bytes());
    }

    /// Read a string field; SFTP v3 paths must be UTF-8 here
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        String::from_utf8(get_bytes(buf)?)
            .map_err(|e| crate::Error::Protocol(format!("string field is not UTF-8: {}", e)))
    }

    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(u32::try_from(data.len()).unwrap_or(u32::MAX));
        buf.put_slice(data);
    }

    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(short("string body", len, buf.remaining()));
        }
        let whole: &[u8] = *buf;
        let (body, rest) = whole.split_at(len);
        *buf = rest;
        Ok(body.to_vec())
    }

    pub fn get_u32(buf: &mut &[u8]) -> crate::Result<u32> {
        if buf.remaining() < 4 {
            return Err(short("uint32", 4, buf.remaining()));
        }
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8]) -> crate::Result<u64> {
        if buf.remaining() < 8 {
            return Err(short("uint64", 8, buf.remaining()));
        }
        Ok(buf.get_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs_partial_flags() {
        let attrs = FileAttrs {
            permissions: Some(0o100644),
            ..Default::default()
        };
        let encoded = attrs.encode();
        let mut slice = &encoded[..];
        let decoded = FileAttrs::decode(&mut slice).unwrap();
        assert_eq!(decoded, attrs);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_truncated_attrs_rejected() {
        let mut slice: &[u8] = &[0, 0, 0, 1, 0, 0];
        assert!(FileAttrs::decode(&mut slice).is_err());
    }

    #[test]
    fn test_longname_format() {
        let attrs = FileAttrs {
            size: Some(42),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(S_IFDIR | 0o750),
            atime: Some(0),
            mtime: Some(0),
        };
        let line = attrs.longname("docs");
        assert!(line.starts_with("drwxr-x---"));
        assert!(line.ends_with(" docs"));
        assert!(attrs.is_dir());
        assert!(!attrs.is_symlink());
    }

    #[test]
    fn test_status_code_values() {
        assert_eq!(u32::from(StatusCode::OpUnsupported), 8);
        assert_eq!(StatusCode::try_from(2).unwrap(), StatusCode::NoSuchFile);
        assert!(StatusCode::try_from(5).is_err());
    }

    #[tokio::test]
    async fn test_packet_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_packet(&mut client, &[1, 0, 0, 0, 3]).await.unwrap();
        drop(client);

        let packet = read_packet(&mut server).await.unwrap().unwrap();
        assert_eq!(packet, vec![1, 0, 0, 0, 3]);
        assert!(read_packet(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_u32(&mut client, MAX_PACKET_LEN + 1)
            .await
            .unwrap();
        assert!(read_packet(&mut server).await.is_err());
    }
}
