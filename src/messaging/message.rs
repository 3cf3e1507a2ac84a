use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::messaging::function_code::FunctionCode;
use crate::messaging::guid::Guid;
use crate::messaging::header::{Header, HEADER_LEN};
use crate::messaging::payload::Payload;
use crate::util::safe_converter::PrecheckedCast;

/// A decoded (or locally built) overlay message.
///
/// Messages are not modified after construction, with the exception of [Message::relay] which
///  is called exactly once when a message is received for forwarding. After that, messages are
///  shared as `Arc<Message>`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub guid: Guid,
    pub ttl: u8,
    pub hops: u8,
    pub payload: Payload,
}

impl Message {
    pub fn new(guid: Guid, ttl: u8, payload: Payload) -> Message {
        Message {
            guid,
            ttl,
            hops: 0,
            payload,
        }
    }

    pub fn ping(guid: Guid, ttl: u8) -> Message {
        Self::new(guid, ttl, Payload::Ping)
    }

    pub fn function_code(&self) -> FunctionCode {
        self.payload.function_code()
    }

    pub fn header(&self) -> Header {
        Header {
            guid: self.guid,
            function_code: self.function_code().into(),
            ttl: self.ttl,
            hops: self.hops,
            payload_len: self.payload.len().prechecked_cast(),
        }
    }

    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Accounts for one hop: increments hops and decrements the TTL if it is positive. Returns
    ///  the TTL *before* decrementing it.
    pub fn relay(&mut self) -> u8 {
        let old_ttl = self.ttl;
        self.hops = self.hops.saturating_add(1);
        if self.ttl > 0 {
            self.ttl -= 1;
        }
        old_ttl
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header().ser(buf);
        buf.put_slice(self.payload.as_bytes());
    }

    /// Writes the message without flushing - batching writes is up to the caller.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> anyhow::Result<()> {
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        self.header().ser(&mut header);
        writer.write_all(&header).await?;
        writer.write_all(self.payload.as_bytes()).await?;
        Ok(())
    }
}
