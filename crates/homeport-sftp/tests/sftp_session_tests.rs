//! SFTP session tests over an in-memory stream
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation), SI-11 (Error Handling)
//! STIG: V-222566, V-222596
//! Implementation: A minimal client speaks SFTP v3 packets to the session
//! engine and checks replies and status codes

use bytes::{BufMut, BytesMut};
use homeport_core::{MemoryUserStore, Permission, User};
use homeport_sftp::actions::ActionRunner;
use homeport_sftp::config::ActionsConfig;
use homeport_sftp::connection::Connection;
use homeport_sftp::protocol::{codec, read_packet, write_packet, StatusCode};
use homeport_sftp::quota::QuotaManager;
use homeport_sftp::sftp::SftpServer;
use homeport_sftp::transfer::{TransferEnv, TransferRegistry};
use homeport_sftp::vfs::{FileSystem, FsOptions, LocalFileSystem};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

const SSH_FXP_INIT: u8 = 1;
const SSH_FXP_OPEN: u8 = 3;
const SSH_FXP_CLOSE: u8 = 4;
const SSH_FXP_READ: u8 = 5;
const SSH_FXP_WRITE: u8 = 6;
const SSH_FXP_OPENDIR: u8 = 11;
const SSH_FXP_READDIR: u8 = 12;
const SSH_FXP_MKDIR: u8 = 14;
const SSH_FXP_REALPATH: u8 = 16;
const SSH_FXP_STAT: u8 = 17;

const SSH_FXP_VERSION: u8 = 2;
const SSH_FXP_STATUS: u8 = 101;
const SSH_FXP_HANDLE: u8 = 102;
const SSH_FXP_DATA: u8 = 103;
const SSH_FXP_NAME: u8 = 104;
const SSH_FXP_ATTRS: u8 = 105;

const FLAG_READ: u32 = 0x01;
const FLAG_UPLOAD: u32 = 0x02 | 0x08 | 0x10;

/// Minimal SFTP v3 client
struct TestClient {
    stream: DuplexStream,
    next_id: u32,
}

impl TestClient {
    async fn request(&mut self, kind: u8, body: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        self.next_id += 1;
        let mut packet = BytesMut::new();
        packet.put_u8(kind);
        packet.put_u32(self.next_id);
        body(&mut packet);
        write_packet(&mut self.stream, &packet).await.unwrap();
        read_packet(&mut self.stream).await.unwrap().unwrap()
    }

    async fn init(&mut self) {
        let mut packet = BytesMut::new();
        packet.put_u8(SSH_FXP_INIT);
        packet.put_u32(3);
        write_packet(&mut self.stream, &packet).await.unwrap();
        let reply = read_packet(&mut self.stream).await.unwrap().unwrap();
        assert_eq!(reply[0], SSH_FXP_VERSION);
        assert_eq!(u32::from_be_bytes([reply[1], reply[2], reply[3], reply[4]]), 3);
    }

    async fn open(&mut self, path: &str, flags: u32) -> Vec<u8> {
        self.request(SSH_FXP_OPEN, |b| {
            codec::put_string(b, path);
            b.put_u32(flags);
            b.put_u32(0);
        })
        .await
    }

    async fn open_handle(&mut self, path: &str, flags: u32) -> Vec<u8> {
        let reply = self.open(path, flags).await;
        handle_of(&reply)
    }

    async fn close(&mut self, handle: &[u8]) -> StatusCode {
        let reply = self
            .request(SSH_FXP_CLOSE, |b| codec::put_bytes(b, handle))
            .await;
        status_of(&reply)
    }

    async fn write(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> StatusCode {
        let reply = self
            .request(SSH_FXP_WRITE, |b| {
                codec::put_bytes(b, handle);
                b.put_u64(offset);
                codec::put_bytes(b, data);
            })
            .await;
        status_of(&reply)
    }

    async fn read(&mut self, handle: &[u8], offset: u64, len: u32) -> Vec<u8> {
        self.request(SSH_FXP_READ, |b| {
            codec::put_bytes(b, handle);
            b.put_u64(offset);
            b.put_u32(len);
        })
        .await
    }

    async fn path_request(&mut self, kind: u8, path: &str) -> Vec<u8> {
        self.request(kind, |b| codec::put_string(b, path)).await
    }
}

fn handle_of(reply: &[u8]) -> Vec<u8> {
    assert_eq!(reply[0], SSH_FXP_HANDLE, "expected a handle reply");
    let mut buf = &reply[5..];
    codec::get_bytes(&mut buf).unwrap()
}

fn status_of(reply: &[u8]) -> StatusCode {
    assert_eq!(reply[0], SSH_FXP_STATUS, "expected a status reply");
    let mut buf = &reply[5..];
    StatusCode::try_from(codec::get_u32(&mut buf).unwrap()).unwrap()
}

fn names_of(reply: &[u8]) -> Vec<String> {
    assert_eq!(reply[0], SSH_FXP_NAME, "expected a name reply");
    let mut buf = &reply[5..];
    let count = codec::get_u32(&mut buf).unwrap();
    (0..count)
        .map(|_| {
            let name = codec::get_string(&mut buf).unwrap();
            let _longname = codec::get_string(&mut buf).unwrap();
            homeport_sftp::protocol::FileAttrs::decode(&mut buf).unwrap();
            name
        })
        .collect()
}

/// Helper to start a session for a user with `permissions`
fn create_test_session(
    permissions: Vec<Permission>,
) -> (TestClient, JoinHandle<homeport_sftp::Result<()>>, PathBuf, TempDir) {
    let dir = TempDir::new().unwrap();
    let home = dir.path().join("alice");
    std::fs::create_dir_all(&home).unwrap();

    let mut user = User::new("alice", home.clone());
    user.permissions = permissions;
    let store = Arc::new(MemoryUserStore::with_users(vec![user.clone()], true));
    let env = TransferEnv {
        quota: QuotaManager::new(store),
        actions: Arc::new(ActionRunner::new(&ActionsConfig::default())),
        registry: Arc::new(TransferRegistry::new()),
    };
    let connection = Arc::new(Connection::new(user, "SSH-2.0-test".into(), None));
    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(
        connection,
        env,
        FsOptions::default(),
    ));

    let (client, server) = tokio::io::duplex(256 * 1024);
    let task = tokio::spawn(SftpServer::new(fs).serve(server));
    (
        TestClient {
            stream: client,
            next_id: 0,
        },
        task,
        home,
        dir,
    )
}

#[tokio::test]
async fn test_version_negotiation() {
    let (mut client, _task, _home, _dir) = create_test_session(vec![Permission::Any]);
    client.init().await;
}

/// NIST 800-53: SI-10 - Requests before INIT end the session
#[tokio::test]
async fn test_request_before_init_rejected() {
    let (mut client, task, _home, _dir) = create_test_session(vec![Permission::Any]);

    let mut packet = BytesMut::new();
    packet.put_u8(SSH_FXP_STAT);
    packet.put_u32(1);
    codec::put_string(&mut packet, "/");
    write_packet(&mut client.stream, &packet).await.unwrap();

    assert!(read_packet(&mut client.stream).await.unwrap().is_none());
    assert!(task.await.unwrap().is_err());
}

/// Upload then download the same file
#[tokio::test]
async fn test_upload_and_download() {
    let (mut client, _task, home, _dir) = create_test_session(vec![Permission::Any]);
    client.init().await;

    let handle = client.open_handle("/notes.txt", FLAG_UPLOAD).await;
    assert_eq!(client.write(&handle, 0, b"hello ").await, StatusCode::Ok);
    assert_eq!(client.write(&handle, 6, b"world").await, StatusCode::Ok);
    assert_eq!(client.close(&handle).await, StatusCode::Ok);
    assert_eq!(std::fs::read(home.join("notes.txt")).unwrap(), b"hello world");

    let handle = client.open_handle("/notes.txt", FLAG_READ).await;
    let reply = client.read(&handle, 0, 1024).await;
    assert_eq!(reply[0], SSH_FXP_DATA);
    let mut buf = &reply[5..];
    assert_eq!(codec::get_bytes(&mut buf).unwrap(), b"hello world");

    let eof = client.read(&handle, 11, 1024).await;
    assert_eq!(status_of(&eof), StatusCode::Eof);
    assert_eq!(client.close(&handle).await, StatusCode::Ok);
}

/// Directory listings are paged and end with EOF
#[tokio::test]
async fn test_directory_listing() {
    let (mut client, _task, home, _dir) = create_test_session(vec![Permission::Any]);
    client.init().await;

    let mkdir = client
        .request(SSH_FXP_MKDIR, |b| {
            codec::put_string(b, "/docs");
            b.put_u32(0);
        })
        .await;
    assert_eq!(status_of(&mkdir), StatusCode::Ok);
    assert!(home.join("docs").is_dir());
    std::fs::write(home.join("docs/b.txt"), b"b").unwrap();
    std::fs::write(home.join("docs/a.txt"), b"a").unwrap();

    let reply = client.path_request(SSH_FXP_OPENDIR, "/docs").await;
    let handle = handle_of(&reply);

    let first = client
        .request(SSH_FXP_READDIR, |b| codec::put_bytes(b, &handle))
        .await;
    let names = names_of(&first);
    assert!(names.contains(&"a.txt".to_string()));
    assert!(names.contains(&"b.txt".to_string()));

    let done = client
        .request(SSH_FXP_READDIR, |b| codec::put_bytes(b, &handle))
        .await;
    assert_eq!(status_of(&done), StatusCode::Eof);
    assert_eq!(client.close(&handle).await, StatusCode::Ok);
}

#[tokio::test]
async fn test_stat_and_realpath() {
    let (mut client, _task, home, _dir) = create_test_session(vec![Permission::Any]);
    client.init().await;
    std::fs::write(home.join("file.bin"), [0u8; 42]).unwrap();

    let stat = client.path_request(SSH_FXP_STAT, "/file.bin").await;
    assert_eq!(stat[0], SSH_FXP_ATTRS);
    let mut buf = &stat[5..];
    let attrs = homeport_sftp::protocol::FileAttrs::decode(&mut buf).unwrap();
    assert_eq!(attrs.size, Some(42));

    let real = client.path_request(SSH_FXP_REALPATH, ".").await;
    assert_eq!(names_of(&real), vec!["/".to_string()]);

    let missing = client.path_request(SSH_FXP_STAT, "/nope").await;
    assert_eq!(status_of(&missing), StatusCode::NoSuchFile);
}

/// NIST 800-53: AC-6 - Missing permissions surface as PermissionDenied
#[tokio::test]
async fn test_permission_denied_status() {
    let (mut client, _task, home, _dir) =
        create_test_session(vec![Permission::List, Permission::Download]);
    client.init().await;

    let reply = client.open("/upload.txt", FLAG_UPLOAD).await;
    assert_eq!(status_of(&reply), StatusCode::PermissionDenied);
    assert!(!home.join("upload.txt").exists());
}

/// NIST 800-53: SI-10 - Unknown request types get OpUnsupported and the session continues
#[tokio::test]
async fn test_unknown_request_type() {
    let (mut client, _task, _home, _dir) = create_test_session(vec![Permission::Any]);
    client.init().await;

    let reply = client.request(99, |_| {}).await;
    assert_eq!(status_of(&reply), StatusCode::OpUnsupported);

    let real = client.path_request(SSH_FXP_REALPATH, "/").await;
    assert_eq!(names_of(&real), vec!["/".to_string()]);
}

/// Bad handles are a plain failure
#[tokio::test]
async fn test_invalid_handle() {
    let (mut client, _task, _home, _dir) = create_test_session(vec![Permission::Any]);
    client.init().await;
    assert_eq!(client.close(b"no-such-handle").await, StatusCode::Failure);
}

/// NIST 800-53: AC-12 - Uploads still open when the client disconnects are closed
#[tokio::test]
async fn test_open_upload_closed_on_disconnect() {
    let (mut client, task, home, _dir) = create_test_session(vec![Permission::Any]);
    client.init().await;

    let handle = client.open_handle("/partial.txt", FLAG_UPLOAD).await;
    assert_eq!(client.write(&handle, 0, b"data").await, StatusCode::Ok);
    drop(client);

    assert!(task.await.unwrap().is_ok());
    assert_eq!(std::fs::read(home.join("partial.txt")).unwrap(), b"data");
}
