use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::messaging::frame_reader::BadFrameReason;
use crate::messaging::function_code::FunctionCode;
use crate::messaging::guid::{Guid, GUID_LEN};
use crate::util::byte_order::{u16_le_at, u32_le_at};
use crate::util::net_addr::{is_valid_ipv4, is_valid_port};

pub const PUSH_LEN: usize = 26;

/// Resource index signalling that the requester wants a firewall-to-firewall transfer rather than
///  a specific resource.
pub const FW_TRANS_INDEX: u32 = i32::MAX as u32 - 2;

const INDEX_OFFSET: usize = GUID_LEN;
const IP_OFFSET: usize = 20;
const PORT_OFFSET: usize = 24;

/// Asks the servent identified by `servent_id` to open a connection to the requester's callback
///  address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PushRequest {
    raw: Bytes,
}

impl PushRequest {
    pub fn new(servent_id: Guid, resource_index: u32, callback: SocketAddrV4) -> PushRequest {
        let mut buf = BytesMut::with_capacity(PUSH_LEN);
        buf.put_slice(servent_id.as_bytes());
        buf.put_u32_le(resource_index);
        buf.put_slice(&callback.ip().octets());
        buf.put_u16_le(callback.port());
        PushRequest { raw: buf.freeze() }
    }

    pub fn parse(raw: Bytes) -> Result<PushRequest, BadFrameReason> {
        if raw.len() != PUSH_LEN {
            return Err(BadFrameReason::PayloadLength { function_code: FunctionCode::Push, len: raw.len() });
        }

        let result = PushRequest { raw };
        if !is_valid_ipv4(result.ip()) || !is_valid_port(result.port()) {
            return Err(BadFrameReason::InvalidPushAddress(result.callback_addr()));
        }
        Ok(result)
    }

    pub fn servent_id(&self) -> Guid {
        let mut raw = [0u8; GUID_LEN];
        raw.copy_from_slice(&self.raw[..GUID_LEN]);
        Guid::new(raw)
    }

    pub fn resource_index(&self) -> u32 {
        u32_le_at(&self.raw, INDEX_OFFSET)
    }

    pub fn is_firewall_transfer(&self) -> bool {
        self.resource_index() == FW_TRANS_INDEX
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.raw[IP_OFFSET], self.raw[IP_OFFSET + 1], self.raw[IP_OFFSET + 2], self.raw[IP_OFFSET + 3])
    }

    pub fn port(&self) -> u16 {
        u16_le_at(&self.raw, PORT_OFFSET)
    }

    pub fn callback_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip(), self.port())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_layout() {
        let servent_id = Guid::new([7; 16]);
        let push = PushRequest::new(servent_id, 0x0102_0304, SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 6346));

        let mut expected = vec![7u8; 16];
        expected.extend_from_slice(&[4, 3, 2, 1, 192, 168, 0, 1, 0xca, 0x18]);
        assert_eq!(push.as_bytes().as_ref(), expected.as_slice());

        let parsed = PushRequest::parse(push.as_bytes().clone()).unwrap();
        assert_eq!(parsed.servent_id(), servent_id);
        assert_eq!(parsed.resource_index(), 0x0102_0304);
        assert_eq!(parsed.callback_addr(), SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 6346));
        assert!(!parsed.is_firewall_transfer());
    }

    #[test]
    fn test_firewall_transfer_index() {
        let push = PushRequest::new(Guid::ZERO, FW_TRANS_INDEX, SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 1));
        assert!(push.is_firewall_transfer());
        assert_eq!(FW_TRANS_INDEX, 0x7fff_fffd);
    }

    #[rstest]
    #[case::short(25)]
    #[case::long(27)]
    #[case::empty(0)]
    fn test_parse_wrong_len(#[case] len: usize) {
        assert_eq!(
            PushRequest::parse(Bytes::from(vec![1u8; len])),
            Err(BadFrameReason::PayloadLength { function_code: FunctionCode::Push, len }),
        );
    }

    #[rstest]
    #[case::zero_ip(Ipv4Addr::new(0, 1, 1, 1), 6346)]
    #[case::broadcast_ip(Ipv4Addr::new(255, 255, 255, 255), 6346)]
    #[case::zero_port(Ipv4Addr::new(1, 1, 1, 1), 0)]
    fn test_parse_invalid_address(#[case] ip: Ipv4Addr, #[case] port: u16) {
        let raw = PushRequest::new(Guid::ZERO, 1, SocketAddrV4::new(ip, port)).as_bytes().clone();
        assert_eq!(
            PushRequest::parse(raw),
            Err(BadFrameReason::InvalidPushAddress(SocketAddrV4::new(ip, port))),
        );
    }
}
