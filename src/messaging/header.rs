use bytes::BufMut;

use crate::messaging::guid::{Guid, GUID_LEN};
use crate::util::byte_order::u32_le_at;

pub const HEADER_LEN: usize = 23;

const FUNCTION_CODE_OFFSET: usize = 16;
const TTL_OFFSET: usize = 17;
const HOPS_OFFSET: usize = 18;
const PAYLOAD_LEN_OFFSET: usize = 19;

/// The fixed 23 byte header preceding every message: identifier, function code, TTL, hops and
///  little endian payload length.
///
/// The function code is kept as the raw byte here since an unknown code is a property of the
///  frame that is reported after the payload was consumed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub guid: Guid,
    pub function_code: u8,
    pub ttl: u8,
    pub hops: u8,
    pub payload_len: u32,
}

impl Header {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Header {
        let mut guid = [0u8; GUID_LEN];
        guid.copy_from_slice(&buf[..GUID_LEN]);

        Header {
            guid: Guid::new(guid),
            function_code: buf[FUNCTION_CODE_OFFSET],
            ttl: buf[TTL_OFFSET],
            hops: buf[HOPS_OFFSET],
            payload_len: u32_le_at(buf, PAYLOAD_LEN_OFFSET),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.guid.as_bytes());
        buf.put_u8(self.function_code);
        buf.put_u8(self.ttl);
        buf.put_u8(self.hops);
        buf.put_u32_le(self.payload_len);
    }
}


#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use super::*;

    #[test]
    fn test_layout() {
        let header = Header {
            guid: Guid::new([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]),
            function_code: 0x80,
            ttl: 5,
            hops: 2,
            payload_len: 0x0102,
        };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16,
            0x80, 5, 2,
            2, 1, 0, 0,
        ]);

        let raw: [u8; HEADER_LEN] = buf.as_ref().try_into().unwrap();
        assert_eq!(Header::parse(&raw), header);
    }

    #[test]
    fn test_payload_len_is_unsigned() {
        let mut raw = [0u8; HEADER_LEN];
        raw[19..].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(Header::parse(&raw).payload_len, u32::MAX);
    }
}
