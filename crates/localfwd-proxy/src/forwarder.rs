//! Per-connection TCP forwarding
//!
//! Dials the remote endpoint for one accepted local connection and relays
//! bytes in both directions until either side finishes.

use crate::error::{ProxyError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Traffic counters shared by every connection of a session
#[derive(Debug, Default)]
pub struct TrafficStats {
    /// remote -> local
    bytes_in: AtomicU64,
    /// local -> remote
    bytes_out: AtomicU64,
    connections: AtomicUsize,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Count a newly accepted connection. The count drops again when the
    /// returned guard is dropped.
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: self.clone(),
        }
    }
}

/// Keeps a connection counted for as long as it lives
pub struct ConnectionGuard {
    stats: Arc<TrafficStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// How a forwarded connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// One of the peers closed or errored
    Closed,
    /// The session was stopped while the connection was open
    Cancelled,
}

/// Relays one local connection to a fixed remote endpoint
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    remote_address: String,
    dial_timeout: Duration,
    buffer_size: usize,
}

impl TcpForwarder {
    pub fn new(remote_address: String, dial_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            remote_address,
            dial_timeout,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Connect to the remote endpoint, bounded by the dial timeout
    pub async fn dial(&self) -> Result<TcpStream> {
        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.remote_address))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::Dial {
                address: self.remote_address.clone(),
                source,
            }),
            Err(_) => Err(ProxyError::Dial {
                address: self.remote_address.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out after {:?}", self.dial_timeout),
                ),
            }),
        }
    }

    /// Forward traffic between an accepted local connection and the remote.
    ///
    /// On dial failure the local stream is dropped (closing it) and the error
    /// is returned. Once connected, the first direction to finish closes both
    /// sockets. `cancel`, when given, closes the local socket early, including
    /// while the dial is still in progress.
    pub async fn forward(
        &self,
        local: TcpStream,
        peer_addr: SocketAddr,
        stats: &TrafficStats,
        cancel: Option<CancellationToken>,
    ) -> Result<ForwardOutcome> {
        let dialed = tokio::select! {
            biased;
            _ = wait_cancelled(cancel.as_ref()) => None,
            result = self.dial() => Some(result),
        };
        let remote = match dialed {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                drop(local);
                return Err(e);
            }
            None => {
                debug!(peer = %peer_addr, remote = %self.remote_address, "Dial abandoned on stop");
                return Ok(ForwardOutcome::Cancelled);
            }
        };

        debug!(
            peer = %peer_addr,
            remote = %self.remote_address,
            "Connected to remote address"
        );

        let (local_read, local_write) = local.into_split();
        let (remote_read, remote_write) = remote.into_split();

        let outbound = pump(local_read, remote_write, &stats.bytes_out, self.buffer_size);
        let inbound = pump(remote_read, local_write, &stats.bytes_in, self.buffer_size);

        let cancelled = wait_cancelled(cancel.as_ref());

        // Dropping the losing futures drops their socket halves, which closes
        // both connections.
        let outcome = tokio::select! {
            result = outbound => {
                log_direction(peer_addr, "local -> remote", result);
                ForwardOutcome::Closed
            }
            result = inbound => {
                log_direction(peer_addr, "remote -> local", result);
                ForwardOutcome::Closed
            }
            _ = cancelled => ForwardOutcome::Cancelled,
        };

        Ok(outcome)
    }
}

/// Resolves once `cancel` fires; never resolves without a token
async fn wait_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

fn log_direction(peer_addr: SocketAddr, direction: &str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(peer = %peer_addr, bytes, "{} finished", direction),
        Err(e) => debug!(peer = %peer_addr, "{} ended with error: {}", direction, e),
    }
}

/// Copy until EOF, counting bytes as soon as they are read
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    counter: &AtomicU64,
    buffer_size: usize,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        total += n as u64;
        writer.write_all(&buffer[..n]).await?;
    }

    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_connection_guard_counts() {
        let stats = Arc::new(TrafficStats::new());
        let a = stats.open_connection();
        let b = stats.open_connection();
        assert_eq!(stats.connections(), 2);
        drop(a);
        assert_eq!(stats.connections(), 1);
        drop(b);
        assert_eq!(stats.connections(), 0);
    }

    #[tokio::test]
    async fn test_pump_counts_bytes() {
        let counter = AtomicU64::new(0);
        let input: &[u8] = b"hello world";
        let mut output = Vec::new();

        let copied = pump(input, &mut output, &counter, 4).await.unwrap();

        assert_eq!(copied, 11);
        assert_eq!(output, b"hello world");
        assert_eq!(counter.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = TcpForwarder::new(addr.to_string(), Duration::from_secs(2), 1024);
        match forwarder.dial().await {
            Err(ProxyError::Dial { address, .. }) => assert_eq!(address, addr.to_string()),
            other => panic!("expected dial error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_cancelled() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();

        let _client = TcpStream::connect(local_addr).await.unwrap();
        let (accepted, peer) = local.accept().await.unwrap();

        let forwarder = TcpForwarder::new(remote_addr.to_string(), Duration::from_secs(2), 1024);
        let stats = TrafficStats::new();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = forwarder
            .forward(accepted, peer, &stats, Some(token))
            .await
            .unwrap();
        assert_eq!(outcome, ForwardOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_pending_dial() {
        // Nothing listens here, so a dial would fail rather than connect
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(local.local_addr().unwrap()).await.unwrap();
        let (accepted, peer) = local.accept().await.unwrap();

        let forwarder = TcpForwarder::new(dead_addr.to_string(), Duration::from_secs(30), 1024);
        let stats = TrafficStats::new();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            forwarder.forward(accepted, peer, &stats, Some(token)),
        )
        .await
        .expect("forward ignored cancellation")
        .unwrap();
        assert_eq!(outcome, ForwardOutcome::Cancelled);

        // The local side was closed along with the abandoned dial
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("local connection left open");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
