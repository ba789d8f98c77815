//! Port forwarding tests on loopback sockets
//!
//! NIST 800-53: AC-4 (Information Flow Enforcement), AC-12 (Session Termination)
//! Implementation: The client side of a remote forward is replaced with an
//! in-process echo so listeners and pipes can be driven without an SSH peer

use async_trait::async_trait;
use homeport_sftp::forward::{connect_direct, pipe, ForwardManager, ForwardOpener, ForwardStream};
use homeport_sftp::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const DIAL_LIMIT: Duration = Duration::from_secs(5);

/// Answers every forwarded connection with an echo
#[derive(Default)]
struct EchoOpener {
    opened: AtomicUsize,
}

#[async_trait]
impl ForwardOpener for EchoOpener {
    async fn open_forwarded(
        &self,
        _address: &str,
        _port: u32,
        _origin: SocketAddr,
    ) -> Result<ForwardStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(theirs);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(ours))
    }
}

/// Refuses every forwarded connection
struct RefusingOpener;

#[async_trait]
impl ForwardOpener for RefusingOpener {
    async fn open_forwarded(
        &self,
        _address: &str,
        _port: u32,
        _origin: SocketAddr,
    ) -> Result<ForwardStream> {
        Err(Error::Connection("refused".into()))
    }
}

async fn echo_roundtrip(port: u32, payload: &[u8]) -> Vec<u8> {
    let mut socket = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
    socket.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), socket.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply
}

/// Bytes arriving on a remote-forward listener reach the opened channel
#[tokio::test]
async fn test_remote_forward_relays_bytes() {
    let manager = ForwardManager::new("alice", CancellationToken::new());
    let opener = Arc::new(EchoOpener::default());

    let port = manager.listen("127.0.0.1", 0, opener.clone()).await.unwrap();
    assert_ne!(port, 0);

    assert_eq!(echo_roundtrip(port, b"ping").await, b"ping");
    assert_eq!(opener.opened.load(Ordering::SeqCst), 1);

    let listed = manager.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, format!("127.0.0.1:{}", port));
}

/// NIST 800-53: AC-4 - Cancelled listeners are removed from the registry
#[tokio::test]
async fn test_cancel_forward() {
    let manager = ForwardManager::new("alice", CancellationToken::new());
    let port = manager
        .listen("127.0.0.1", 0, Arc::new(EchoOpener::default()))
        .await
        .unwrap();

    assert!(manager.cancel("127.0.0.1", port).await);
    assert!(manager.list().await.is_empty());
    assert!(!manager.cancel("127.0.0.1", port).await);
}

/// A port already in use cannot be forwarded
#[tokio::test]
async fn test_listen_on_busy_port() {
    let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = u32::from(busy.local_addr().unwrap().port());

    let manager = ForwardManager::new("alice", CancellationToken::new());
    let result = manager
        .listen("127.0.0.1", port, Arc::new(EchoOpener::default()))
        .await;
    assert!(matches!(result, Err(Error::ListenerBind(_))));
}

#[tokio::test]
async fn test_invalid_port_rejected() {
    let manager = ForwardManager::new("alice", CancellationToken::new());
    let result = manager
        .listen("127.0.0.1", 70_000, Arc::new(EchoOpener::default()))
        .await;
    assert!(matches!(result, Err(Error::ListenerBind(_))));
}

/// NIST 800-53: AC-12 - Teardown stops every listener
#[tokio::test]
async fn test_close_all() {
    let manager = ForwardManager::new("alice", CancellationToken::new());
    manager
        .listen("127.0.0.1", 0, Arc::new(EchoOpener::default()))
        .await
        .unwrap();
    manager
        .listen("127.0.0.1", 0, Arc::new(EchoOpener::default()))
        .await
        .unwrap();
    assert_eq!(manager.list().await.len(), 2);

    manager.close_all().await;
    assert!(manager.list().await.is_empty());
}

/// A refused channel drops the accepted socket
#[tokio::test]
async fn test_refused_channel_closes_socket() {
    let manager = ForwardManager::new("alice", CancellationToken::new());
    let port = manager
        .listen("127.0.0.1", 0, Arc::new(RefusingOpener))
        .await
        .unwrap();

    let mut socket = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

/// Direct-tcpip: connect out and pipe a channel stream to the socket
#[tokio::test]
async fn test_direct_connect_and_pipe() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = u32::from(target.local_addr().unwrap().port());
    tokio::spawn(async move {
        let (socket, _) = target.accept().await.unwrap();
        let (mut reader, mut writer) = tokio::io::split(socket);
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let socket = connect_direct("127.0.0.1", port, DIAL_LIMIT).await.unwrap();
    let (mut channel, far_end) = tokio::io::duplex(4096);
    tokio::spawn(pipe(far_end, socket, CancellationToken::new(), None));

    channel.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), channel.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"hello");
}

#[tokio::test]
async fn test_direct_connect_refused() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = u32::from(unused.local_addr().unwrap().port());
    drop(unused);

    let result = connect_direct("127.0.0.1", port, DIAL_LIMIT).await;
    assert!(matches!(result, Err(Error::Connection(_))));
}

/// A destination that never answers is given up on after the dial limit
#[tokio::test]
async fn test_direct_connect_times_out() {
    let started = std::time::Instant::now();
    // TEST-NET-1 (RFC 5737) is never routed
    let result = connect_direct("192.0.2.1", 9, Duration::from_millis(200)).await;

    assert!(matches!(result, Err(Error::Connection(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// Cancelling the token ends a running pipe
#[tokio::test]
async fn test_pipe_stops_on_cancel() {
    let (_a_client, a) = tokio::io::duplex(1024);
    let (_b_client, b) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(pipe(a, b, cancel.clone(), None));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
