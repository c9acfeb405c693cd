//! TCP listener and the worker pool behind it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinError, JoinSet};

use echod_core::{ConnectionId, DaemonConfig};

use crate::error::DaemonError;
use crate::registry::ConnectionRegistry;
use crate::worker::{serve, ConnectionHandle, WorkerSettings};

const LISTEN_BACKLOG: u32 = 1024;
const FD_EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    permits: Arc<Semaphore>,
    max_connections: usize,
    settings: WorkerSettings,
    next_id: u64,
}

impl Acceptor {
    /// Resolve `bind_host:port` and start listening with `SO_REUSEADDR`.
    pub async fn bind(config: &DaemonConfig, registry: ConnectionRegistry) -> Result<Self, DaemonError> {
        let label = config.listen_label();
        let bind_err = |source| DaemonError::Bind {
            addr: label.clone(),
            source,
        };

        let addr = resolve(&config.bind_host, config.port).await.map_err(bind_err)?;
        let listener = listen(addr).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        tracing::info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            buffer_size = config.buffer_size,
            "listening"
        );

        Ok(Self {
            listener,
            local_addr,
            registry,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            settings: WorkerSettings::from(config),
            next_id: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` fires. Returns the still-running workers so the
    /// caller can drain them; the listener is closed before returning.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<JoinSet<()>, DaemonError> {
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    log_worker_exit(joined);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.admit(stream, remote, &mut workers),
                    Err(err) if is_transient_accept_error(&err) => {
                        tracing::warn!(error = %err, "accept failed, retrying");
                        if is_fd_exhaustion(&err) {
                            tokio::time::sleep(FD_EXHAUSTION_BACKOFF).await;
                        }
                    }
                    Err(source) => {
                        tracing::error!(error = %source, addr = %self.local_addr, "listener failed");
                        return Err(DaemonError::Listener {
                            addr: self.local_addr,
                            source,
                        });
                    }
                },
            }
        }

        drop(self.listener);
        tracing::info!(addr = %self.local_addr, in_flight = workers.len(), "listener closed");
        Ok(workers)
    }

    fn admit(&mut self, stream: TcpStream, remote: SocketAddr, workers: &mut JoinSet<()>) {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::warn!(
                id = %id,
                remote = %remote,
                max_connections = self.max_connections,
                "connection rejected: at capacity"
            );
            drop(stream);
            return;
        };

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(id = %id, error = %err, "set_nodelay failed");
        }
        let handle = ConnectionHandle::open(&self.registry, id, remote);
        let settings = self.settings;
        workers.spawn(async move {
            let _permit = permit;
            serve(stream, handle, settings).await;
        });
    }
}

pub(crate) async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host} did not resolve to any address"),
        )
    })
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

pub(crate) fn log_worker_exit(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(err) if err.is_panic() => tracing::error!(error = %err, "worker panicked"),
        Err(_) => {}
    }
}

/// Accept errors that concern one pending connection or momentary resource
/// pressure, not the listening socket itself.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_fd_exhaustion(err)
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    use nix::errno::Errno;
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)
    )
}
