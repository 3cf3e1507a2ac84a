use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::messaging::frame_reader::BadFrameReason;
use crate::messaging::function_code::FunctionCode;
use crate::util::byte_order::{u16_le_at, u32_le_at};

pub const PONG_MIN_LEN: usize = 14;

/// Reply to a discovery ping, advertising a servent's address and what it shares. Anything after
///  the fixed 14 bytes is kept as opaque extension data.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Pong {
    raw: Bytes,
}

impl Pong {
    pub fn new(addr: SocketAddrV4, shared_files: u32, shared_kb: u32) -> Pong {
        let mut buf = BytesMut::with_capacity(PONG_MIN_LEN);
        buf.put_u16_le(addr.port());
        buf.put_slice(&addr.ip().octets());
        buf.put_u32_le(shared_files);
        buf.put_u32_le(shared_kb);
        Pong { raw: buf.freeze() }
    }

    pub fn parse(raw: Bytes) -> Result<Pong, BadFrameReason> {
        if raw.len() < PONG_MIN_LEN {
            return Err(BadFrameReason::PayloadLength { function_code: FunctionCode::Pong, len: raw.len() });
        }
        Ok(Pong { raw })
    }

    pub fn port(&self) -> u16 {
        u16_le_at(&self.raw, 0)
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.raw[2], self.raw[3], self.raw[4], self.raw[5])
    }

    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip(), self.port())
    }

    pub fn shared_files(&self) -> u32 {
        u32_le_at(&self.raw, 6)
    }

    pub fn shared_kb(&self) -> u32 {
        u32_le_at(&self.raw, 10)
    }

    pub fn extensions(&self) -> &[u8] {
        &self.raw[PONG_MIN_LEN..]
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }
}
