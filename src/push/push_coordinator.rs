//! Coordination of push rendezvous requests.
//!
//! A servent behind a firewall can not be connected to. To get its query replies anyway, we send
//!  it a push request (routed along the path its query replies came on, and via UDP to its push
//!  proxies), asking it to connect back to us. When it does, the connection announces the
//!  servent id and resource index it was pushed for, and is matched against the pending requests
//!  registered here.
//!
//! Pending requests that are not matched within the expiry window are removed by a periodic sweep
//!  and reported as failed.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServentConfig;
use crate::messaging::guid::Guid;
use crate::messaging::message::Message;
use crate::messaging::payload::push_request::PushRequest;
use crate::messaging::payload::Payload;
use crate::push::connector::Connector;
use crate::push::push_state::PushState;
use crate::push::rendezvous_handler::{RendezvousHandler, RendezvousListener, RendezvousOutcome};
use crate::push::rendezvous_protocol::{read_browse_request, write_browse_response, GivLine};
use crate::routing::message_router::PushSender;
use crate::util::net_addr::{is_private_ipv4, is_valid_ipv4, is_valid_port};
use crate::util::safe_converter::SafeCast;

struct PendingPush {
    handler: Arc<RendezvousHandler>,
    resource_index: u32,
    created: Instant,
}

pub struct PushCoordinator {
    config: Arc<ServentConfig>,
    client_guid: Guid,
    push_sender: Arc<dyn PushSender>,
    connector: Arc<dyn Connector>,
    udp: Option<Arc<UdpSocket>>,
    pending: Mutex<FxHashMap<Guid, PendingPush>>,
}

impl PushCoordinator {
    pub fn new(config: Arc<ServentConfig>, client_guid: Guid, push_sender: Arc<dyn PushSender>, connector: Arc<dyn Connector>, udp: Option<Arc<UdpSocket>>) -> PushCoordinator {
        PushCoordinator {
            config,
            client_guid,
            push_sender,
            connector,
            udp,
            pending: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<FxHashMap<Guid, PendingPush>> {
        self.pending.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn num_pending(&self) -> usize {
        self.lock().len()
    }

    /// Starts fetching the query replies of the servent at `target`. If it looks directly
    ///  reachable, a direct connection is attempted first, falling back to a push request if that
    ///  fails. Pushing needs the servent's id.
    ///
    /// The returned handler reports progress; results and the final outcome go to `listener`.
    pub fn request_rendezvous(self: &Arc<Self>, target: SocketAddrV4, servent_id: Option<Guid>, resource_index: u32, proxies: Vec<SocketAddrV4>, listener: Arc<dyn RendezvousListener>) -> Arc<RendezvousHandler> {
        let handler = Arc::new(RendezvousHandler::new(target, servent_id, resource_index, self.config.clone(), listener));

        if !is_valid_ipv4(*target.ip()) || !is_valid_port(target.port()) {
            warn!("invalid rendezvous target {}", target);
            handler.finish(RendezvousOutcome::Failed);
            return handler;
        }

        debug!("starting rendezvous with {} as {:?}", target, handler);
        handler.set_state(PushState::Started);

        if self.should_connect_directly(target, servent_id) {
            let coordinator = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                coordinator.connect_directly(handler, proxies).await
            });
        }
        else {
            self.push(&handler, &proxies);
        }
        handler
    }

    fn should_connect_directly(&self, target: SocketAddrV4, servent_id: Option<Guid>) -> bool {
        let is_private = is_private_ipv4(*target.ip());
        !self.config.local_is_private
            || !is_private
            || self.config.advertised_addr == Some(target)
            || servent_id.is_none()
    }

    async fn connect_directly(&self, handler: Arc<RendezvousHandler>, proxies: Vec<SocketAddrV4>) {
        handler.set_state(PushState::DirectlyConnecting);

        match self.connector.connect(handler.target()).await {
            Ok(stream) => {
                debug!("{:?}: connected directly", handler);
                handler.exchange(BufReader::new(stream)).await;
            }
            Err(e) => {
                debug!("{:?}: direct connection failed, trying push: {}", handler, e);
                self.push(&handler, &proxies);
            }
        }
    }

    /// Registers the handler as pending and sends the push request. Registering comes first so
    ///  that even an immediate connect-back finds it.
    fn push(&self, handler: &Arc<RendezvousHandler>, proxies: &[SocketAddrV4]) {
        let Some(servent_id) = handler.servent_id() else {
            debug!("{:?}: no servent id, can not push", handler);
            handler.finish(RendezvousOutcome::Failed);
            return;
        };
        let Some(callback) = self.config.advertised_addr else {
            debug!("{:?}: no advertised address to receive a connect-back at", handler);
            handler.finish(RendezvousOutcome::Failed);
            return;
        };

        let replaced = self.lock().insert(servent_id, PendingPush {
            handler: handler.clone(),
            resource_index: handler.resource_index(),
            created: Instant::now(),
        });
        if let Some(replaced) = replaced {
            debug!("replacing pending push {:?}", replaced.handler);
            replaced.handler.finish(RendezvousOutcome::Failed);
        }

        handler.set_state(PushState::Pushing);

        let push = PushRequest::new(servent_id, handler.resource_index(), callback);
        if !self.push_sender.send_push(push.clone()) {
            debug!("{:?}: push request could not be routed to any connection", handler);
        }
        self.send_to_proxies(push, proxies);
    }

    fn send_to_proxies(&self, push: PushRequest, proxies: &[SocketAddrV4]) {
        let Some(udp) = &self.udp else {
            return;
        };

        let msg = Message::new(Guid::generate(), self.config.push_ttl, Payload::Push(push));
        let mut buf = BytesMut::with_capacity(msg.total_len());
        msg.ser(&mut buf);

        for proxy in proxies {
            if let Err(e) = udp.try_send_to(&buf, SocketAddr::V4(*proxy)) {
                debug!("error sending push request to proxy {}: {}", proxy, e);
            }
        }
    }

    /// Matches a connect-back against the pending requests. A matching request is removed and
    ///  its exchange runs on a separate task. Returns `false` if there was no match, which is
    ///  expected for late or duplicate connect-backs: the stream is dropped.
    pub fn handle_inbound_rendezvous<S>(&self, servent_id: Guid, resource_index: u32, stream: S) -> bool
    where S: AsyncBufRead + AsyncWrite + Unpin + Send + 'static
    {
        let pending = {
            let mut pending = self.lock();
            match pending.get(&servent_id) {
                Some(p) if p.resource_index == resource_index => pending.remove(&servent_id),
                _ => None,
            }
        };

        match pending {
            Some(pending) => {
                debug!("matched connect-back from {:?} to {:?}", servent_id, pending.handler);
                tokio::spawn(async move {
                    pending.handler.exchange(stream).await
                });
                true
            }
            None => {
                info!("no pending push request for {:?} / index {} - dropping connection", servent_id, resource_index);
                false
            }
        }
    }

    /// Removes pending requests that are older than the expiry window and reports them as failed
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired = {
            let mut pending = self.lock();
            let expired_keys = pending.iter()
                .filter(|(_, p)| now.saturating_duration_since(p.created) > self.config.push_expiry)
                .map(|(k, _)| *k)
                .collect::<Vec<_>>();
            expired_keys.iter()
                .flat_map(|k| pending.remove(k))
                .collect::<Vec<_>>()
        };

        for p in expired {
            debug!("push request {:?} expired", p.handler);
            p.handler.finish(RendezvousOutcome::Failed);
        }
    }

    /// The pushed servent's side: connects back to the requester and serves `replies`
    pub async fn respond_to_push(&self, push: &PushRequest, name: &str, replies: Vec<Arc<Message>>) -> anyhow::Result<()> {
        if push.servent_id() != self.client_guid {
            bail!("push request is for {:?}, not for us", push.servent_id());
        }

        let stream = self.connector.connect(push.callback_addr()).await?;
        let giv = GivLine {
            index: push.resource_index(),
            servent_id: self.client_guid,
            name: name.to_string(),
        };
        serve_connect_back(BufReader::new(stream), &giv, &replies, self.config.exchange_read_timeout).await
    }
}

async fn serve_connect_back<S: AsyncBufRead + AsyncWrite + Unpin>(mut stream: S, giv: &GivLine, replies: &[Arc<Message>], read_timeout: Duration) -> anyhow::Result<()> {
    giv.write_to(&mut stream).await?;
    time::timeout(read_timeout, read_browse_request(&mut stream)).await??;

    let content_length = replies.iter()
        .map(|r| -> u64 { r.total_len().safe_cast() })
        .sum();
    write_browse_response(&mut stream, content_length).await?;
    for reply in replies {
        reply.write_to(&mut stream).await?;
    }
    stream.flush().await?;
    stream.shutdown().await?;
    debug!("served {} replies after push", replies.len());
    Ok(())
}

/// Periodically expires pending push requests. Runs until the task is aborted.
pub async fn run_push_sweep(coordinator: Arc<PushCoordinator>, interval: Duration) {
    let mut ticks = time::interval(interval);
    loop {
        ticks.tick().await;
        coordinator.sweep();
    }
}
