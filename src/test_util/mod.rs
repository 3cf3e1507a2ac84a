use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::messaging::connection::{ConnectionHandle, HandleKey};
use crate::messaging::function_code::FunctionCode;
use crate::messaging::guid::Guid;
use crate::messaging::handshake::ProtocolVersion;
use crate::messaging::message::Message;

/// A [ConnectionHandle] that records everything sent to it, for asserting on routing decisions
#[derive(Debug)]
pub struct TrackingConnection {
    key: HandleKey,
    open: AtomicBool,
    local: bool,
    protocol_version: ProtocolVersion,
    tracker: Mutex<Vec<Arc<Message>>>,
}

impl TrackingConnection {
    pub fn new() -> Arc<TrackingConnection> {
        Self::create(false, ProtocolVersion::V0_6)
    }

    pub fn new_local() -> Arc<TrackingConnection> {
        Self::create(true, ProtocolVersion::V0_6)
    }

    pub fn with_version(protocol_version: ProtocolVersion) -> Arc<TrackingConnection> {
        Self::create(false, protocol_version)
    }

    fn create(local: bool, protocol_version: ProtocolVersion) -> Arc<TrackingConnection> {
        Arc::new(TrackingConnection {
            key: HandleKey::next(),
            open: AtomicBool::new(true),
            local,
            protocol_version,
            tracker: Default::default(),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<Arc<Message>> {
        self.tracker.lock().unwrap().clone()
    }

    /// removes and returns the oldest message sent to this connection, panicking if there is none
    pub fn next_sent(&self) -> Arc<Message> {
        let mut lock = self.tracker.lock().unwrap();
        if lock.is_empty() {
            panic!("no message was sent to {:?}", self.key);
        }
        lock.remove(0)
    }

    pub fn assert_message_sent(&self, function_code: FunctionCode, guid: Guid) -> Arc<Message> {
        let msg = self.next_sent();
        assert_eq!(msg.function_code(), function_code, "unexpected message {:?}", msg);
        assert_eq!(msg.guid, guid, "unexpected message {:?}", msg);
        msg
    }

    pub fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.lock().unwrap();
        assert!(lock.is_empty(), "unexpected messages: {:?}", *lock);
    }
}

impl ConnectionHandle for TrackingConnection {
    fn key(&self) -> HandleKey {
        self.key
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, message: Arc<Message>) -> anyhow::Result<()> {
        if !self.is_open() {
            anyhow::bail!("connection {:?} is closed", self.key);
        }
        self.tracker.lock().unwrap().push(message);
        Ok(())
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }
}

/// Upcast for passing a tracking connection where the routing code expects a trait object
pub fn as_handle(connection: &Arc<TrackingConnection>) -> Arc<dyn ConnectionHandle> {
    connection.clone()
}
