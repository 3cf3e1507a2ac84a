use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    Ping = 0x00,
    Pong = 0x01,
    Push = 0x40,
    Query = 0x80,
    QueryReply = 0x81,
}

impl FunctionCode {
    /// Replies travel back along a recorded path rather than being flooded, and they are exempt
    ///  from the soft TTL limit.
    pub fn is_reply(&self) -> bool {
        matches!(self, FunctionCode::Pong | FunctionCode::QueryReply)
    }
}
