//! SCP sink and source tests over an in-memory stream
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation)
//! Implementation: Plays the client half of `scp -t` and `scp -f` against
//! the session engine

use homeport_core::{MemoryUserStore, Permission, User};
use homeport_sftp::actions::ActionRunner;
use homeport_sftp::config::ActionsConfig;
use homeport_sftp::connection::Connection;
use homeport_sftp::quota::QuotaManager;
use homeport_sftp::scp::{ScpCommand, ScpSession};
use homeport_sftp::transfer::{TransferEnv, TransferRegistry};
use homeport_sftp::vfs::{FileSystem, FsOptions, LocalFileSystem};
use homeport_sftp::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;

struct TestScp {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<homeport_sftp::Result<()>>,
    home: PathBuf,
    _dir: TempDir,
}

impl TestScp {
    async fn ack(&mut self) -> u8 {
        self.reader.read_u8().await.unwrap()
    }

    async fn send(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn line(&mut self) -> String {
        let mut line = Vec::new();
        self.reader.read_until(b'\n', &mut line).await.unwrap();
        String::from_utf8(line).unwrap()
    }

    async fn finish(&mut self) -> homeport_sftp::Result<()> {
        self.writer.shutdown().await.unwrap();
        (&mut self.task).await.unwrap()
    }
}

/// Helper to start `scp <args>` for a user with `permissions`
fn create_test_scp(permissions: Vec<Permission>, args: &str) -> TestScp {
    let dir = TempDir::new().unwrap();
    let home = dir.path().join("bob");
    std::fs::create_dir_all(&home).unwrap();

    let mut user = User::new("bob", home.clone());
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

    let args: Vec<String> = args.split_whitespace().map(String::from).collect();
    let command = ScpCommand::parse(&args).unwrap();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(ScpSession::new(fs, command).run(server));
    let (reader, writer) = tokio::io::split(client);
    TestScp {
        reader: BufReader::new(reader),
        writer,
        task,
        home,
        _dir: dir,
    }
}

/// Upload a single file into the home
#[tokio::test]
async fn test_sink_single_file() {
    let mut scp = create_test_scp(vec![Permission::Any], "scp -t /");
    assert_eq!(scp.ack().await, 0);

    scp.send(b"C0644 5 hello.txt\n").await;
    assert_eq!(scp.ack().await, 0);
    scp.send(b"hello\0").await;
    assert_eq!(scp.ack().await, 0);

    let home = scp.home.clone();
    assert!(scp.finish().await.is_ok());
    assert_eq!(std::fs::read(home.join("hello.txt")).unwrap(), b"hello");
}

/// The command path names the destination file directly
#[tokio::test]
async fn test_sink_to_file_path() {
    let mut scp = create_test_scp(vec![Permission::Any], "scp -t /renamed.txt");
    assert_eq!(scp.ack().await, 0);

    scp.send(b"C0644 3 original.txt\n").await;
    assert_eq!(scp.ack().await, 0);
    scp.send(b"abc\0").await;
    assert_eq!(scp.ack().await, 0);

    let home = scp.home.clone();
    assert!(scp.finish().await.is_ok());
    assert_eq!(std::fs::read(home.join("renamed.txt")).unwrap(), b"abc");
    assert!(!home.join("original.txt").exists());
}

/// Recursive upload creates directories as it goes
#[tokio::test]
async fn test_sink_recursive() {
    let mut scp = create_test_scp(vec![Permission::Any], "scp -r -t /");
    assert_eq!(scp.ack().await, 0);

    scp.send(b"D0755 0 docs\n").await;
    assert_eq!(scp.ack().await, 0);
    scp.send(b"C0644 4 a.txt\n").await;
    assert_eq!(scp.ack().await, 0);
    scp.send(b"aaaa\0").await;
    assert_eq!(scp.ack().await, 0);
    scp.send(b"E\n").await;
    assert_eq!(scp.ack().await, 0);

    let home = scp.home.clone();
    assert!(scp.finish().await.is_ok());
    assert!(home.join("docs").is_dir());
    assert_eq!(std::fs::read(home.join("docs/a.txt")).unwrap(), b"aaaa");
}

/// Directories need -r
#[tokio::test]
async fn test_sink_directory_without_recursive() {
    let mut scp = create_test_scp(vec![Permission::Any], "scp -t /");
    assert_eq!(scp.ack().await, 0);

    scp.send(b"D0755 0 docs\n").await;
    assert_eq!(scp.ack().await, 2);
    let message = scp.line().await;
    assert!(!message.is_empty());

    let result = scp.task.await.unwrap();
    assert!(matches!(result, Err(Error::NotSupported(_))));
}

/// NIST 800-53: AC-6 - Download-only users cannot upload over SCP
#[tokio::test]
async fn test_sink_permission_denied() {
    let mut scp = create_test_scp(vec![Permission::List, Permission::Download], "scp -t /");
    assert_eq!(scp.ack().await, 0);

    scp.send(b"C0644 5 hello.txt\n").await;
    assert_eq!(scp.ack().await, 2);

    let home = scp.home.clone();
    let result = scp.task.await.unwrap();
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
    assert!(!home.join("hello.txt").exists());
}

/// NIST 800-53: SI-10 - Entry names may not contain path separators
#[tokio::test]
async fn test_sink_rejects_traversal_name() {
    let mut scp = create_test_scp(vec![Permission::Any], "scp -t /");
    assert_eq!(scp.ack().await, 0);

    scp.send(b"C0644 5 ../escape.txt\n").await;
    assert_eq!(scp.ack().await, 2);
    assert!(scp.task.await.unwrap().is_err());
}

/// Download a single file
#[tokio::test]
async fn test_source_single_file() {
    let mut scp = create_test_scp(vec![Permission::Any], "scp -f /report.txt");
    std::fs::write(scp.home.join("report.txt"), b"quarterly").unwrap();

    scp.send(&[0]).await;
    let header = scp.line().await;
    assert!(header.starts_with('C'), "unexpected header {:?}", header);
    assert!(header.ends_with(" 9 report.txt\n"));

    scp.send(&[0]).await;
    let mut data = [0u8; 10];
    scp.reader.read_exact(&mut data).await.unwrap();
    assert_eq!(&data[..9], b"quarterly");
    assert_eq!(data[9], 0);

    scp.send(&[0]).await;
    assert!(scp.finish().await.is_ok());
}

/// A missing source file is reported to the client
#[tokio::test]
async fn test_source_missing_file() {
    let mut scp = create_test_scp(vec![Permission::Any], "scp -f /missing.txt");
    scp.send(&[0]).await;
    assert_eq!(scp.ack().await, 2);
    assert!(matches!(scp.task.await.unwrap(), Err(Error::FileNotFound(_))));
}
