use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::{anyhow, bail};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

use crate::messaging::frame_reader::{read_frame, DecodeOutcome, FrameLimits};
use crate::messaging::handshake::ProtocolVersion;
use crate::messaging::message::Message;
use crate::routing::message_router::MessageRouter;

/// Opaque identity of a connection, used as a map key by the routing tables
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HandleKey(pub u64);

impl HandleKey {
    pub fn next() -> HandleKey {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        HandleKey(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A destination for messages: a connection to a peer, or this servent itself.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionHandle: Send + Sync {
    fn key(&self) -> HandleKey;

    fn is_open(&self) -> bool;

    /// Queues a message for sending without waiting. Fails if the connection is closed or its
    ///  queue is full, in which case the message is dropped.
    fn send(&self, message: Arc<Message>) -> anyhow::Result<()>;

    /// true for the handle representing this servent as the origin or destination of messages
    fn is_local(&self) -> bool {
        false
    }

    fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::V0_6
    }
}

impl Debug for dyn ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection[{}{}]", self.key().0, if self.is_local() { " local" } else { "" })
    }
}


/// A handshaked connection to a peer. Incoming frames are read by one task and passed to the
///  [MessageRouter], outgoing messages are queued and written by a second task.
pub struct TcpConnection {
    key: HandleKey,
    peer_addr: SocketAddr,
    protocol_version: ProtocolVersion,
    open: AtomicBool,
    send_queue: Mutex<Option<mpsc::Sender<Arc<Message>>>>,
}

impl Debug for TcpConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpConnection[{:?}@{}]", self.key, self.peer_addr)
    }
}

impl TcpConnection {
    /// Registers the connection with the router and spawns its reader and writer tasks
    pub fn spawn<S>(stream: S, peer_addr: SocketAddr, protocol_version: ProtocolVersion, router: Arc<MessageRouter>, outbound_queue_len: usize) -> Arc<TcpConnection>
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let (reader, writer) = tokio::io::split(stream);
        let (send, recv) = mpsc::channel(outbound_queue_len);

        let connection = Arc::new(TcpConnection {
            key: HandleKey::next(),
            peer_addr,
            protocol_version,
            open: AtomicBool::new(true),
            send_queue: Mutex::new(Some(send)),
        });
        info!("connection {:?} established with protocol version {}", connection, protocol_version);

        router.connection_opened(connection.clone());

        let limits = router.frame_limits();
        tokio::spawn(write_loop(peer_addr, Arc::downgrade(&connection), writer, recv));
        tokio::spawn(read_loop(connection.clone(), reader, router, limits));
        connection
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Marks the connection as closed. The writer task drains its queue and shuts down the
    ///  socket, which in turn terminates the reader.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("closing connection {:?}", self);
        }
        self.send_queue.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl ConnectionHandle for TcpConnection {
    fn key(&self) -> HandleKey {
        self.key
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, message: Arc<Message>) -> anyhow::Result<()> {
        let send_queue = self.send_queue.lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(send_queue) = send_queue.as_ref() else {
            bail!("connection {:?} is closed", self);
        };

        match send_queue.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!("send queue of {:?} is full", self)),
            Err(TrySendError::Closed(_)) => Err(anyhow!("connection {:?} is closed", self)),
        }
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }
}

#[tracing::instrument(name="connection reader", skip_all, fields(peer = %connection.peer_addr))]
async fn read_loop<S: AsyncRead>(connection: Arc<TcpConnection>, mut reader: ReadHalf<S>, router: Arc<MessageRouter>, limits: FrameLimits) {
    loop {
        match read_frame(&mut reader, &limits).await {
            Ok(DecodeOutcome::Frame(msg)) => {
                trace!("received {:?} {:?}", msg.function_code(), msg.guid);
                router.on_message(msg, connection.clone());
            }
            Ok(DecodeOutcome::BadFrame(bad)) => {
                debug!("skipping bad frame {:?} (function code 0x{:02x}): {}", bad.guid, bad.function_code, bad.reason);
            }
            Ok(DecodeOutcome::EndOfStream) => {
                debug!("connection closed by peer");
                break;
            }
            Err(e) => {
                warn!("closing connection: {}", e);
                break;
            }
        }

        if !connection.is_open() {
            break;
        }
    }

    connection.close();
    router.connection_closed(connection.key);
}

#[tracing::instrument(name="connection writer", skip(connection, writer, recv))]
async fn write_loop<S: AsyncWrite>(peer_addr: SocketAddr, connection: Weak<TcpConnection>, writer: WriteHalf<S>, mut recv: mpsc::Receiver<Arc<Message>>) {
    let mut writer = BufWriter::new(writer);
    if let Err(e) = do_write_loop(&mut writer, &mut recv).await {
        debug!("error writing to connection: {}", e);
        if let Some(connection) = connection.upgrade() {
            connection.close();
        }
    }
    recv.close();
    let _ = writer.shutdown().await;
}

async fn do_write_loop<W: AsyncWrite + Unpin>(writer: &mut W, recv: &mut mpsc::Receiver<Arc<Message>>) -> anyhow::Result<()> {
    while let Some(msg) = recv.recv().await {
        msg.write_to(writer).await?;

        // flush only when the queue is drained to batch writes under load
        while let Ok(msg) = recv.try_recv() {
            msg.write_to(writer).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}


/// Messages addressed to this servent (replies to our own queries and pings, pushes for our
///  servent id) are delivered to the application through this handle.
#[derive(Debug)]
pub struct LocalHandle {
    key: HandleKey,
    delivery: mpsc::Sender<Arc<Message>>,
}

impl LocalHandle {
    pub fn new(queue_len: usize) -> (Arc<LocalHandle>, mpsc::Receiver<Arc<Message>>) {
        let (delivery, recv) = mpsc::channel(queue_len);
        let handle = Arc::new(LocalHandle {
            key: HandleKey::next(),
            delivery,
        });
        (handle, recv)
    }
}

impl ConnectionHandle for LocalHandle {
    fn key(&self) -> HandleKey {
        self.key
    }

    fn is_open(&self) -> bool {
        !self.delivery.is_closed()
    }

    fn send(&self, message: Arc<Message>) -> anyhow::Result<()> {
        self.delivery.try_send(message)
            .map_err(|e| anyhow!("local delivery failed: {}", e))
    }

    fn is_local(&self) -> bool {
        true
    }
}
