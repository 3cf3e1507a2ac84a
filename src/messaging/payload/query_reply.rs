use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::messaging::frame_reader::BadFrameReason;
use crate::messaging::function_code::FunctionCode;
use crate::messaging::guid::{Guid, GUID_LEN};
use crate::util::byte_order::{u16_le_at, u32_le_at};

pub const QUERY_REPLY_MIN_LEN: usize = 26;

const RESULTS_OFFSET: usize = 11;

/// Search results. The fixed prefix (hit count, responder address, speed) and the trailing
///  servent id are decoded here; the result records in between are opaque to the routing layer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueryReply {
    raw: Bytes,
}

impl QueryReply {
    pub fn new(hit_count: u8, addr: SocketAddrV4, speed: u32, results: &[u8], servent_id: Guid) -> QueryReply {
        let mut buf = BytesMut::with_capacity(RESULTS_OFFSET + results.len() + GUID_LEN);
        buf.put_u8(hit_count);
        buf.put_u16_le(addr.port());
        buf.put_slice(&addr.ip().octets());
        buf.put_u32_le(speed);
        buf.put_slice(results);
        buf.put_slice(servent_id.as_bytes());
        QueryReply { raw: buf.freeze() }
    }

    pub fn parse(raw: Bytes) -> Result<QueryReply, BadFrameReason> {
        if raw.len() < QUERY_REPLY_MIN_LEN {
            return Err(BadFrameReason::PayloadLength { function_code: FunctionCode::QueryReply, len: raw.len() });
        }
        Ok(QueryReply { raw })
    }

    pub fn hit_count(&self) -> u8 {
        self.raw[0]
    }

    pub fn port(&self) -> u16 {
        u16_le_at(&self.raw, 1)
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.raw[3], self.raw[4], self.raw[5], self.raw[6])
    }

    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip(), self.port())
    }

    pub fn speed(&self) -> u32 {
        u32_le_at(&self.raw, 7)
    }

    /// Empty for a minimal reply, where the servent id overlaps the fixed prefix
    pub fn results(&self) -> &[u8] {
        let end = self.raw.len() - GUID_LEN;
        &self.raw[RESULTS_OFFSET.min(end)..end]
    }

    /// the responding servent's id, always the last 16 bytes
    pub fn servent_id(&self) -> Guid {
        let mut raw = [0u8; GUID_LEN];
        raw.copy_from_slice(&self.raw[self.raw.len() - GUID_LEN..]);
        Guid::new(raw)
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }
}
