//! Generic UDP listener (C10's shared transport). Grounded on `udp_server.h`'s
//! `UDPServer`: bind once, then hand every received datagram to a callback
//! until the socket is shut down. The original's explicit `ServerState`
//! machine collapses here into `bind`'s `Result` and the loop's natural exit.

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Matches `udp_server.h`'s `kDefaultBufferSize`.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

pub struct UdpServer {
    socket: UdpSocket,
    name: &'static str,
}

impl UdpServer {
    pub async fn bind(name: &'static str, port: u16) -> anyhow::Result<Self> {
        Self::bind_addr(name, ([0, 0, 0, 0], port).into()).await
    }

    pub async fn bind_addr(name: &'static str, addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(name, %addr, "udp server bound");
        Ok(Self { socket, name })
    }

    /// Runs until `handler` returns `false` or the socket errors out. Errors
    /// receiving a single datagram are logged and skipped rather than ending
    /// the loop — one malformed packet shouldn't take the listener down.
    pub async fn run(&self, mut handler: impl FnMut(&[u8], SocketAddr) -> bool) {
        let mut buf = [0u8; DEFAULT_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if !handler(&buf[..len], from) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(name = self.name, error = %e, "udp recv failed");
                }
            }
        }
        info!(name = self.name, "udp server stopped");
    }
}
