use bytes::{BufMut, Bytes, BytesMut};

use crate::messaging::frame_reader::BadFrameReason;
use crate::messaging::function_code::FunctionCode;
use crate::util::buf_ext::BufExt;
use crate::util::byte_order::u16_le_at;

pub const QUERY_MIN_LEN: usize = 3;

/// A search request: minimum speed, NUL terminated search text and optional extension data.
///  Interpreting the search text is up to the application.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Query {
    raw: Bytes,
}

impl Query {
    pub fn new(min_speed: u16, search_text: &str) -> Query {
        let mut buf = BytesMut::with_capacity(search_text.len() + QUERY_MIN_LEN);
        buf.put_u16_le(min_speed);
        buf.put_slice(search_text.as_bytes());
        buf.put_u8(0);
        Query { raw: buf.freeze() }
    }

    pub fn parse(raw: Bytes) -> Result<Query, BadFrameReason> {
        if raw.len() < QUERY_MIN_LEN {
            return Err(BadFrameReason::PayloadLength { function_code: FunctionCode::Query, len: raw.len() });
        }
        Ok(Query { raw })
    }

    pub fn min_speed(&self) -> u16 {
        u16_le_at(&self.raw, 0)
    }

    /// The search text up to the first NUL byte, with invalid UTF-8 replaced
    pub fn search_text(&self) -> String {
        let mut buf = &self.raw[2..];
        String::from_utf8_lossy(&buf.get_null_terminated()).into_owned()
    }

    /// Everything after the search text's terminator, excluding a trailing NUL
    pub fn extensions(&self) -> &[u8] {
        let mut buf = &self.raw[2..];
        buf.get_null_terminated();
        match buf {
            [rest @ .., 0] => rest,
            rest => rest,
        }
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }
}
