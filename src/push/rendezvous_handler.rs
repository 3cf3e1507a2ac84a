use std::fmt::{Debug, Formatter};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::config::ServentConfig;
use crate::messaging::frame_reader::{read_frame, DecodeOutcome};
use crate::messaging::function_code::FunctionCode;
use crate::messaging::guid::Guid;
use crate::messaging::message::Message;
use crate::push::push_state::{PushState, StateStamp};
use crate::push::rendezvous_protocol::{read_browse_response, write_browse_request};
use crate::util::safe_converter::SafeCast;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RendezvousOutcome {
    Completed,
    Failed,
}

/// Receives the results of a rendezvous request. Replies are passed on as they arrive,
///  [RendezvousListener::on_finished] is called exactly once per request.
#[cfg_attr(test, mockall::automock)]
pub trait RendezvousListener: Send + Sync {
    fn on_reply(&self, session: Guid, reply: Message);
    fn on_finished(&self, session: Guid, outcome: RendezvousOutcome);
}

/// One rendezvous request: the connection to a servent (direct or pushed), followed by the
///  exchange of its query replies.
pub struct RendezvousHandler {
    /// identifies the request towards the listener, and replaces the identifier of received
    ///  replies
    session: Guid,
    target: SocketAddrV4,
    servent_id: Option<Guid>,
    resource_index: u32,
    config: Arc<ServentConfig>,
    listener: Arc<dyn RendezvousListener>,
    state: Mutex<StateStamp>,
    finished: AtomicBool,
    bytes_expected: AtomicU64,
    bytes_read: AtomicU64,
}

impl Debug for RendezvousHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RendezvousHandler[{:?}@{}]", self.session, self.target)
    }
}

impl RendezvousHandler {
    pub fn new(target: SocketAddrV4, servent_id: Option<Guid>, resource_index: u32, config: Arc<ServentConfig>, listener: Arc<dyn RendezvousListener>) -> RendezvousHandler {
        RendezvousHandler {
            session: Guid::generate(),
            target,
            servent_id,
            resource_index,
            config,
            listener,
            state: Mutex::new(StateStamp::new(PushState::NotStarted)),
            finished: AtomicBool::new(false),
            bytes_expected: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> Guid {
        self.session
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    pub fn servent_id(&self) -> Option<Guid> {
        self.servent_id
    }

    pub fn resource_index(&self) -> u32 {
        self.resource_index
    }

    pub fn state(&self) -> StateStamp {
        *self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Transitions to a new state. Transitions out of `Finished` are ignored.
    pub(crate) fn set_state(&self, state: PushState) {
        let mut lock = self.state.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if lock.state == PushState::Finished {
            return;
        }
        trace!("{:?}: {:?} -> {:?}", self, lock.state, state);
        *lock = StateStamp::new(state);
    }

    /// Estimated fraction of the request that is complete at `now`, between 0.0 and 1.0
    pub fn progress(&self, now: Instant) -> f64 {
        let stamp = self.state();
        match stamp.state {
            PushState::NotStarted | PushState::Started => 0.0,
            PushState::DirectlyConnecting => stamp.elapsed_fraction(now, self.config.direct_connect_timeout),
            PushState::Pushing => stamp.elapsed_fraction(now, self.config.push_expiry),
            PushState::Exchanging => {
                let expected = self.bytes_expected.load(Ordering::Acquire);
                if expected == 0 {
                    0.5
                }
                else {
                    (self.bytes_read.load(Ordering::Acquire) as f64 / expected as f64).min(1.0)
                }
            }
            PushState::Finished => 1.0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Finishes the request and notifies the listener, unless it was finished before. Returns
    ///  `true` if this call finished it.
    pub(crate) fn finish(&self, outcome: RendezvousOutcome) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(PushState::Finished);
        info!("{:?} finished: {:?}", self, outcome);
        self.listener.on_finished(self.session, outcome);
        true
    }

    /// Requests and reads the servent's query replies, then finishes the request. The stream is
    ///  shut down and dropped afterwards.
    pub async fn exchange<S: AsyncBufRead + AsyncWrite + Unpin>(&self, mut stream: S) {
        if self.is_finished() {
            debug!("{:?} is already finished - dropping rendezvous connection", self);
            return;
        }

        self.set_state(PushState::Exchanging);
        let outcome = match self.do_exchange(&mut stream).await {
            Ok(()) => RendezvousOutcome::Completed,
            Err(e) => {
                debug!("{:?}: error during exchange: {}", self, e);
                RendezvousOutcome::Failed
            }
        };
        let _ = stream.shutdown().await;
        self.finish(outcome);
    }

    async fn do_exchange<S: AsyncBufRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> anyhow::Result<()> {
        let read_timeout = self.config.exchange_read_timeout;
        let limits = self.config.frame_limits();

        write_browse_request(stream, self.config.advertised_addr, &self.config.user_agent).await?;
        if let Some(content_length) = time::timeout(read_timeout, read_browse_response(stream)).await?? {
            self.bytes_expected.store(content_length, Ordering::Release);
        }

        loop {
            let outcome = match time::timeout(read_timeout, read_frame(stream, &limits)).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    // the servent stopped sending without closing the connection
                    debug!("{:?}: no data for {:?}, ending exchange", self, read_timeout);
                    return Ok(());
                }
            };

            match outcome {
                DecodeOutcome::Frame(mut msg) => {
                    self.bytes_read.fetch_add(msg.total_len().safe_cast(), Ordering::AcqRel);
                    if msg.function_code() == FunctionCode::QueryReply {
                        msg.guid = self.session;
                        self.listener.on_reply(self.session, msg);
                    }
                    else {
                        trace!("{:?}: ignoring {:?} during exchange", self, msg.function_code());
                    }
                }
                DecodeOutcome::BadFrame(bad) => {
                    debug!("{:?}: skipping bad frame: {}", self, bad.reason);
                }
                DecodeOutcome::EndOfStream => return Ok(()),
            }
        }
    }
}
