use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transport::{Datagram, DatagramTransport};

/// In-memory network connecting mock transports by address. Datagrams sent to
/// an address nobody is bound to are dropped, as UDP would.
#[derive(Default)]
pub(crate) struct MockNetwork {
    endpoints: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
}

impl MockNetwork {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn bind(self: &Arc<Self>, addr: SocketAddr) -> Arc<MockDatagramTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.lock().insert(addr, tx);
        Arc::new(MockDatagramTransport {
            addr,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Delivers `data` to `to` as if `from` had sent it. Returns false when
    /// nothing is bound at `to`.
    pub(crate) fn deliver(&self, from: SocketAddr, to: SocketAddr, data: Vec<u8>) -> bool {
        match self.endpoints.lock().get(&to) {
            Some(tx) => tx.send(Datagram { remote_addr: from, data }).is_ok(),
            None => false,
        }
    }

    fn unbind(&self, addr: &SocketAddr) {
        self.endpoints.lock().remove(addr);
    }
}

pub(crate) struct MockDatagramTransport {
    addr: SocketAddr,
    network: Arc<MockNetwork>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    shutdown: CancellationToken,
}

impl MockDatagramTransport {
    pub(crate) fn get_sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DatagramTransport for MockDatagramTransport {
    async fn recv(&self) -> Result<Datagram> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            datagram = incoming.recv() => datagram.ok_or_else(|| anyhow!("mock network dropped the endpoint")),
            _ = self.shutdown.cancelled() => Err(anyhow!("transport is closed")),
        }
    }

    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("transport is closed"));
        }
        self.sent.lock().push((target, data.to_vec()));
        self.network.deliver(self.addr, target, data.to_vec());
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.network.unbind(&self.addr);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
