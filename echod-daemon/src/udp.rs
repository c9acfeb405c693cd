//! Datagram echo on `bind_host:udp_port`.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use echod_core::DaemonConfig;

use crate::acceptor::resolve;
use crate::error::DaemonError;

pub struct UdpEcho {
    socket: UdpSocket,
    local_addr: SocketAddr,
    buffer_size: usize,
}

impl UdpEcho {
    pub async fn bind(config: &DaemonConfig, port: u16) -> Result<Self, DaemonError> {
        let label = format!("udp {}:{}", config.bind_host, port);
        let bind_err = |source| DaemonError::Bind {
            addr: label.clone(),
            source,
        };

        let addr = resolve(&config.bind_host, port).await.map_err(bind_err)?;
        let socket = UdpSocket::bind(addr).await.map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;
        tracing::info!(addr = %local_addr, "udp echo listening");

        Ok(Self {
            socket,
            local_addr,
            buffer_size: config.buffer_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send every datagram back to its sender until `shutdown` fires.
    /// Datagrams longer than `buffer_size` are truncated.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        let mut buf = vec![0u8; self.buffer_size.max(1)];
        let mut datagrams: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => {
                        datagrams += 1;
                        if let Err(err) = self.socket.send_to(&buf[..n], peer).await {
                            tracing::debug!(peer = %peer, error = %err, "udp reply failed");
                        }
                    }
                    Err(err) if is_transient_udp_error(&err) => {
                        tracing::debug!(error = %err, "udp receive failed, retrying");
                    }
                    Err(source) => {
                        tracing::error!(addr = %self.local_addr, error = %source, "udp socket failed");
                        return Err(DaemonError::Listener {
                            addr: self.local_addr,
                            source,
                        });
                    }
                },
            }
        }

        tracing::info!(addr = %self.local_addr, datagrams, "udp echo stopped");
        Ok(())
    }
}

// ICMP errors from earlier replies surface on the next receive.
fn is_transient_udp_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
