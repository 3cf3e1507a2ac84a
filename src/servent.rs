//! The servent: everything that lives for as long as the node runs, constructed once and shared
//!  explicitly. Starting a servent binds its TCP and UDP sockets and spawns the accept loop,
//!  the datagram receiver and the periodic maintenance tasks.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::ServentConfig;
use crate::messaging::connection::{LocalHandle, TcpConnection};
use crate::messaging::frame_reader::{decode_datagram, DecodeOutcome};
use crate::messaging::guid::Guid;
use crate::messaging::handshake;
use crate::messaging::handshake::CONNECT_PREFIX;
use crate::messaging::message::Message;
use crate::push::connector::TcpConnector;
use crate::push::push_coordinator::{run_push_sweep, PushCoordinator};
use crate::push::rendezvous_protocol::{read_giv_terminator, GivLine, GIV_PREFIX};
use crate::reply_cache::{run_reply_cache_housekeeping, ReplyCache};
use crate::routing::message_router::MessageRouter;
use crate::util::lines::read_line;

const MAX_DATAGRAM_LEN: usize = 65536;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Servent {
    config: Arc<ServentConfig>,
    local_addr: SocketAddr,
    router: Arc<MessageRouter>,
    push_coordinator: Arc<PushCoordinator>,
    reply_cache: Arc<ReplyCache>,
    tasks: Vec<JoinHandle<()>>,
}

impl Servent {
    /// Binds the servent's sockets and starts its tasks. Messages addressed to this servent
    ///  (replies to its own pings and queries, push requests for it) are delivered through the
    ///  returned receiver.
    ///
    /// If the advertised address has port 0, the port the listener was bound to is advertised.
    pub async fn start(mut config: ServentConfig) -> anyhow::Result<(Servent, mpsc::Receiver<Arc<Message>>)> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(local_addr).await?);

        if let Some(advertised) = config.advertised_addr {
            if advertised.port() == 0 {
                config.advertised_addr = Some(SocketAddrV4::new(*advertised.ip(), local_addr.port()));
            }
        }
        let config = Arc::new(config);

        let client_guid = Guid::generate();
        info!("starting servent {:?} on {}, advertising {:?}", client_guid, local_addr, config.advertised_addr);

        let (local, local_recv) = LocalHandle::new(config.outbound_queue_len);
        let reply_cache = Arc::new(ReplyCache::new(&config));
        let router = Arc::new(MessageRouter::new(config.clone(), client_guid, reply_cache.clone(), local));
        let push_coordinator = Arc::new(PushCoordinator::new(
            config.clone(),
            client_guid,
            router.clone(),
            Arc::new(TcpConnector::new(config.direct_connect_timeout)),
            Some(udp.clone()),
        ));

        let tasks = vec![
            tokio::spawn(accept_loop(listener, config.clone(), router.clone(), push_coordinator.clone())),
            tokio::spawn(datagram_loop(udp, config.clone(), router.clone())),
            tokio::spawn(run_push_sweep(push_coordinator.clone(), config.push_sweep_interval)),
            tokio::spawn(run_reply_cache_housekeeping(reply_cache.clone(), config.reply_cache_sweep_interval)),
        ];

        let servent = Servent {
            config,
            local_addr,
            router,
            push_coordinator,
            reply_cache,
            tasks,
        };
        Ok((servent, local_recv))
    }

    pub fn config(&self) -> &ServentConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_guid(&self) -> Guid {
        self.router.client_guid()
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn push_coordinator(&self) -> &Arc<PushCoordinator> {
        &self.push_coordinator
    }

    pub fn reply_cache(&self) -> &Arc<ReplyCache> {
        &self.reply_cache
    }

    /// Opens a connection to another servent and registers it with the router once the handshake
    ///  succeeded
    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<Arc<TcpConnection>> {
        let timeout = self.config.handshake_timeout;
        let stream = match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => bail!("connecting to {} timed out", addr),
        };
        stream.set_nodelay(true)?;

        let mut stream = BufReader::new(stream);
        let protocol_version = time::timeout(timeout, handshake::initiate(&mut stream, &self.config)).await??;
        Ok(TcpConnection::spawn(stream, addr, protocol_version, self.router.clone(), self.config.outbound_queue_len))
    }
}

impl Drop for Servent {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[tracing::instrument(name="accept loop", skip_all)]
async fn accept_loop(listener: TcpListener, config: Arc<ServentConfig>, router: Arc<MessageRouter>, push_coordinator: Arc<PushCoordinator>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let config = config.clone();
                let router = router.clone();
                let push_coordinator = push_coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = on_inbound(stream, peer_addr, config, router, push_coordinator).await {
                        debug!("dropping inbound connection from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => on_accept_error(e).await,
        }
    }
}

/// Errors like running out of file descriptors persist, the next accept waits for a while
async fn on_accept_error(e: std::io::Error) {
    warn!("error accepting connection, retrying in {:?}: {}", ACCEPT_RETRY_DELAY, e);
    time::sleep(ACCEPT_RETRY_DELAY).await;
}

/// Classifies an inbound connection by its first line: connect-backs after a push start with
///  `GIV`, regular connections with the connect handshake
async fn on_inbound(stream: TcpStream, peer_addr: SocketAddr, config: Arc<ServentConfig>, router: Arc<MessageRouter>, push_coordinator: Arc<PushCoordinator>) -> anyhow::Result<()> {
    let timeout = config.handshake_timeout;
    stream.set_nodelay(true)?;
    let mut stream = BufReader::new(stream);

    let Some(first_line) = time::timeout(timeout, read_line(&mut stream)).await?? else {
        debug!("{} closed the connection without sending anything", peer_addr);
        return Ok(());
    };

    if first_line.starts_with(GIV_PREFIX) {
        let giv: GivLine = first_line.parse()?;
        time::timeout(timeout, read_giv_terminator(&mut stream)).await??;
        debug!("connect-back from {}: {}", peer_addr, giv);
        push_coordinator.handle_inbound_rendezvous(giv.servent_id, giv.index, stream);
    }
    else if first_line.starts_with(CONNECT_PREFIX) {
        let protocol_version = time::timeout(timeout, handshake::respond(&mut stream, &first_line, &config)).await??;
        TcpConnection::spawn(stream, peer_addr, protocol_version, router, config.outbound_queue_len);
    }
    else {
        bail!("unrecognized request {:?}", first_line);
    }
    Ok(())
}

#[tracing::instrument(name="datagram receiver", skip_all)]
async fn datagram_loop(udp: Arc<UdpSocket>, config: Arc<ServentConfig>, router: Arc<MessageRouter>) {
    let limits = config.frame_limits();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        let (len, from) = match udp.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("error receiving datagram: {}", e);
                continue;
            }
        };

        match decode_datagram(&buf[..len], &limits) {
            Ok(DecodeOutcome::Frame(msg)) => router.on_datagram(msg),
            Ok(DecodeOutcome::BadFrame(bad)) => debug!("skipping bad datagram from {}: {}", from, bad.reason),
            Ok(DecodeOutcome::EndOfStream) => {}
            Err(e) => debug!("skipping invalid datagram from {}: {}", from, e),
        }
    }
}
