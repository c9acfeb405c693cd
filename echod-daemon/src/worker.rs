//! Per-connection echo worker.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

use echod_core::{ConnectionId, DaemonConfig};

use crate::registry::{ByteCounters, ConnectionRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    IdleTimeout,
    Io(String),
    /// Worker cancelled before finishing, e.g. force-closed at the end of a drain.
    Aborted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Io(err) => write!(f, "i/o error: {err}"),
            CloseReason::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub buffer_size: usize,
    pub idle_timeout: Duration,
}

impl From<&DaemonConfig> for WorkerSettings {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Registry membership for one connection. Dropping it deregisters the
/// connection and logs the summary line.
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: SocketAddr,
    registry: ConnectionRegistry,
    counters: Arc<ByteCounters>,
    started: Instant,
    reason: CloseReason,
}

impl ConnectionHandle {
    pub fn open(registry: &ConnectionRegistry, id: ConnectionId, remote: SocketAddr) -> Self {
        let counters = registry.register(id, remote);
        tracing::debug!(id = %id, remote = %remote, "connection accepted");
        Self {
            id,
            remote,
            registry: registry.clone(),
            counters,
            started: Instant::now(),
            reason: CloseReason::Aborted,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn counters(&self) -> &ByteCounters {
        &self.counters
    }

    pub fn close(mut self, reason: CloseReason) {
        self.reason = reason;
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let bytes_in = self.counters.bytes_in();
        let bytes_out = self.counters.bytes_out();
        match &self.reason {
            CloseReason::Io(_) | CloseReason::Aborted => tracing::warn!(
                id = %self.id,
                remote = %self.remote,
                bytes_in,
                bytes_out,
                duration_ms,
                reason = %self.reason,
                "connection closed"
            ),
            _ => tracing::info!(
                id = %self.id,
                remote = %self.remote,
                bytes_in,
                bytes_out,
                duration_ms,
                reason = %self.reason,
                "connection closed"
            ),
        }
    }
}

/// Echo until EOF, idle timeout, or I/O error.
///
/// Each read is bounded by `buffer_size`; the bytes go back verbatim before
/// the next read, so output order always matches input order.
pub async fn echo<S>(stream: &mut S, settings: &WorkerSettings, counters: &ByteCounters) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; settings.buffer_size.max(1)];
    loop {
        let n = match timeout(settings.idle_timeout, stream.read(&mut buf)).await {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(Ok(0)) => return CloseReason::PeerClosed,
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return CloseReason::Io(err.to_string()),
        };
        counters.add_in(n);

        match timeout(settings.idle_timeout, stream.write_all(&buf[..n])).await {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(Ok(())) => counters.add_out(n),
            Ok(Err(err)) => return CloseReason::Io(err.to_string()),
        }
    }
}

/// Worker task body: echo, half-close on clean EOF, then release the handle.
pub async fn serve<S>(mut stream: S, handle: ConnectionHandle, settings: WorkerSettings)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = echo(&mut stream, &settings, handle.counters()).await;
    if reason == CloseReason::PeerClosed {
        let _ = stream.shutdown().await;
    }
    handle.close(reason);
}
