use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::MAX_UDP_PAYLOAD_SIZE;

#[derive(Debug, Clone)]
pub struct Datagram {
    pub remote_addr: SocketAddr,
    pub data: Vec<u8>,
}

/// [`DatagramTransport`] is the unreliable, unordered datagram channel the
/// gossiper runs on. Once `shutdown` is called, `recv` fails and `is_closed`
/// reports true.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn recv(&self) -> Result<Datagram>;
    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()>;
    fn local_addr(&self) -> Result<SocketAddr>;
    async fn shutdown(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}

pub struct DefaultTransport {
    udp_socket: UdpSocket,
    // Reused across receives; only the received bytes are copied out.
    recv_buffer: Mutex<Vec<u8>>,
    shutdown: CancellationToken,
}

impl DefaultTransport {
    pub async fn new(ip_addr: Ipv4Addr, port: u16) -> Result<Self> {
        let addr = SocketAddrV4::new(ip_addr, port);
        let udp_socket = UdpSocket::bind(addr).await.context("Failed to bind UDP socket")?;
        let local_addr = udp_socket.local_addr().context("Failed to get local address")?;

        info!("> [GOSSIPMESH] Bound gossip socket to {}", local_addr);

        Ok(Self {
            udp_socket,
            recv_buffer: Mutex::new(vec![0u8; MAX_UDP_PAYLOAD_SIZE]),
            shutdown: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl DatagramTransport for DefaultTransport {
    async fn recv(&self) -> Result<Datagram> {
        let mut buf = self.recv_buffer.lock().await;
        tokio::select! {
            result = self.udp_socket.recv_from(&mut buf[..]) => {
                let (len, remote_addr) = result.context("Failed to receive UDP datagram")?;
                Ok(Datagram { remote_addr, data: buf[..len].to_vec() })
            }
            _ = self.shutdown.cancelled() => Err(anyhow!("transport is closed")),
        }
    }

    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("transport is closed"));
        }
        self.udp_socket
            .send_to(data, target)
            .await
            .context("Failed to send UDP datagram")?;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp_socket.local_addr()?)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        info!("> [GOSSIPMESH] Gossip socket closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
