//! TCP port forwarding
//!
//! NIST 800-53: AC-4 (Information Flow Enforcement), SC-7 (Boundary Protection)
//! Implementation: Remote-forward listeners are owned by one connection and keyed
//! by their bound address; cancelling a listener cancels every pipe it spawned

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AuditEvent;
use crate::connection::Connection;
use crate::{Error, Result};

/// Byte stream usable as one end of a pipe
pub trait ForwardIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> ForwardIo for T {}

/// Boxed forwarding stream
pub type ForwardStream = Box<dyn ForwardIo>;

/// Opens the client-side end of a remote forward
#[async_trait]
pub trait ForwardOpener: Send + Sync + 'static {
    /// Open a forwarded channel for a connection accepted on `address:port` from `origin`
    async fn open_forwarded(&self, address: &str, port: u32, origin: SocketAddr)
        -> Result<ForwardStream>;
}

#[async_trait]
impl ForwardOpener for russh::server::Handle {
    async fn open_forwarded(
        &self,
        address: &str,
        port: u32,
        origin: SocketAddr,
    ) -> Result<ForwardStream> {
        let channel = self
            .channel_open_forwarded_tcpip(
                address.to_string(),
                port,
                origin.ip().to_string(),
                u32::from(origin.port()),
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }
}

struct ForwardListener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-connection registry of remote-forward listeners
///
/// NIST 800-53: AC-4, AC-12 (Session Termination)
/// Implementation: `close_all` runs at connection teardown
pub struct ForwardManager {
    username: String,
    cancel: CancellationToken,
    activity: Option<Arc<Connection>>,
    listeners: Mutex<HashMap<String, ForwardListener>>,
}

/// Registry key for a listener
pub fn listener_key(address: &str, port: u32) -> String {
    format!("{}:{}", address, port)
}

fn bind_host(address: &str) -> &str {
    match address {
        "" | "*" | "0.0.0.0" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    }
}

impl ForwardManager {
    /// Create a manager whose listeners stop when `cancel` fires
    pub fn new(username: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            username: username.into(),
            cancel,
            activity: None,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Manager owned by `connection`: listeners stop when it closes and
    /// forwarded traffic counts as its activity
    pub fn for_connection(connection: Arc<Connection>) -> Self {
        Self {
            username: connection.user.username.clone(),
            cancel: connection.cancel_token().child_token(),
            activity: Some(connection),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a listener and forward every accepted socket through `opener`
    ///
    /// Returns the bound port, which differs from `port` when `port` is zero.
    ///
    /// # Errors
    ///
    /// `ListenerBind` when the address cannot be bound or is already registered.
    pub async fn listen(&self, address: &str, port: u32, opener: Arc<dyn ForwardOpener>) -> Result<u32> {
        let requested = u16::try_from(port)
            .map_err(|_| Error::ListenerBind(format!("invalid port {}", port)))?;
        let listener = TcpListener::bind((bind_host(address), requested))
            .await
            .map_err(|e| Error::ListenerBind(format!("{}:{}: {}", address, port, e)))?;
        let local_addr = listener.local_addr()?;
        let bound_port = u32::from(local_addr.port());
        let key = listener_key(address, bound_port);

        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&key) {
            return Err(Error::ListenerBind(format!("{} already forwarded", key)));
        }

        let cancel = self.cancel.child_token();
        let task = tokio::spawn(accept_loop(
            listener,
            address.to_string(),
            bound_port,
            opener,
            cancel.clone(),
            self.activity.clone(),
        ));
        listeners.insert(
            key.clone(),
            ForwardListener {
                local_addr,
                cancel,
                task,
            },
        );
        drop(listeners);

        info!(username = %self.username, address = %key, "Remote forward listening");
        AuditEvent::ForwardListener {
            username: self.username.clone(),
            address: key,
            opened: true,
            timestamp: Utc::now(),
        }
        .log();
        Ok(bound_port)
    }

    /// Stop the listener registered for `address:port`
    pub async fn cancel(&self, address: &str, port: u32) -> bool {
        let key = listener_key(address, port);
        let Some(listener) = self.listeners.lock().await.remove(&key) else {
            return false;
        };
        self.stop(key, listener);
        true
    }

    /// Stop every listener and its pipes
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.listeners.lock().await.drain().collect();
        for (key, listener) in drained {
            self.stop(key, listener);
        }
    }

    /// Registered listener keys with their bound socket addresses
    pub async fn list(&self) -> Vec<(String, SocketAddr)> {
        let mut out: Vec<_> = self
            .listeners
            .lock()
            .await
            .iter()
            .map(|(key, l)| (key.clone(), l.local_addr))
            .collect();
        out.sort();
        out
    }

    fn stop(&self, key: String, listener: ForwardListener) {
        listener.cancel.cancel();
        listener.task.abort();
        info!(username = %self.username, address = %key, "Remote forward closed");
        AuditEvent::ForwardListener {
            username: self.username.clone(),
            address: key,
            opened: false,
            timestamp: Utc::now(),
        }
        .log();
    }
}

async fn accept_loop(
    listener: TcpListener,
    address: String,
    port: u32,
    opener: Arc<dyn ForwardOpener>,
    cancel: CancellationToken,
    activity: Option<Arc<Connection>>,
) {
    loop {
        let (socket, origin) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(address = %address, port, error = %e, "Forward accept failed");
                    continue;
                }
            },
        };
        debug!(address = %address, port, origin = %origin, "Forwarded connection accepted");

        let opener = opener.clone();
        let address = address.clone();
        let cancel = cancel.child_token();
        let activity = activity.clone();
        tokio::spawn(async move {
            match opener.open_forwarded(&address, port, origin).await {
                Ok(channel) => pipe(socket, channel, cancel, activity).await,
                Err(e) => warn!(address = %address, port, error = %e, "Unable to open forwarded channel"),
            }
        });
    }
}

/// Connect to `host:port` for a direct-tcpip channel, giving up after `limit`
///
/// # Errors
///
/// Returns the connect failure or timeout; the caller refuses the channel.
pub async fn connect_direct(host: &str, port: u32, limit: Duration) -> Result<TcpStream> {
    let port = u16::try_from(port)
        .map_err(|_| Error::Connection(format!("invalid port {}", port)))?;
    match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(e)) => Err(Error::Connection(format!("{}:{}: {}", host, port, e))),
        Err(_) => Err(Error::Connection(format!(
            "{}:{}: no answer within {:?}",
            host, port, limit
        ))),
    }
}

/// Copy `reader` into `writer` until end of stream, then shut `writer` down
///
/// Every chunk moved refreshes the activity clock of `activity`.
///
/// # Errors
///
/// The first read or write failure.
pub async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    activity: Option<Arc<Connection>>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    let copied = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        total += n as u64;
        if let Some(connection) = &activity {
            connection.touch();
        }
    };
    let _ = writer.shutdown().await;
    copied
}

/// Copy bytes both ways until each side closes or `cancel` fires
pub async fn pipe<A, B>(a: A, b: B, cancel: CancellationToken, activity: Option<Arc<Connection>>)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let upstream = tokio::spawn(relay(a_read, b_write, activity.clone()));
    let downstream = tokio::spawn(relay(b_read, a_write, activity));
    let aborts = (upstream.abort_handle(), downstream.abort_handle());

    tokio::select! {
        _ = cancel.cancelled() => {
            aborts.0.abort();
            aborts.1.abort();
        }
        (up, down) = async { tokio::join!(upstream, downstream) } => {
            debug!(
                upstream = ?up.ok().and_then(std::result::Result::ok),
                downstream = ?down.ok().and_then(std::result::Result::ok),
                "Forward pipe finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_key() {
        assert_eq!(listener_key("127.0.0.1", 8080), "127.0.0.1:8080");
        assert_eq!(bind_host(""), "0.0.0.0");
        assert_eq!(bind_host("localhost"), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_cancel_unknown_listener() {
        let manager = ForwardManager::new("alice", CancellationToken::new());
        assert!(!manager.cancel("127.0.0.1", 1).await);
        assert!(manager.list().await.is_empty());
    }
}
