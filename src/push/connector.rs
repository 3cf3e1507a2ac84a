use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

/// A byte stream a rendezvous exchange can run on
pub trait RendezvousStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl <T: AsyncRead + AsyncWrite + Unpin + Send> RendezvousStream for T {}

/// Opens outgoing rendezvous connections: direct connections to a servent that serves replies,
///  and connect-backs to a requester after receiving a push.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddrV4) -> anyhow::Result<Box<dyn RendezvousStream>>;
}

pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> TcpConnector {
        TcpConnector { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddrV4) -> anyhow::Result<Box<dyn RendezvousStream>> {
        trace!("connecting to {}", addr);
        let stream = time::timeout(self.timeout, TcpStream::connect(addr)).await
            .map_err(|_| anyhow!("connecting to {} timed out after {:?}", addr, self.timeout))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
