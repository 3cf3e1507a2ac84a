pub mod pong;
pub mod push_request;
pub mod query;
pub mod query_reply;

use bytes::Bytes;

use crate::messaging::frame_reader::BadFrameReason;
use crate::messaging::function_code::FunctionCode;
use crate::messaging::payload::pong::Pong;
use crate::messaging::payload::push_request::PushRequest;
use crate::messaging::payload::query::Query;
use crate::messaging::payload::query_reply::QueryReply;

/// The closed set of message kinds this servent routes, one variant per function code.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    Ping,
    Pong(Pong),
    Push(PushRequest),
    Query(Query),
    QueryReply(QueryReply),
}

impl Payload {
    pub fn parse(function_code: FunctionCode, raw: Bytes) -> Result<Payload, BadFrameReason> {
        match function_code {
            FunctionCode::Ping => {
                if !raw.is_empty() {
                    return Err(BadFrameReason::PayloadLength { function_code, len: raw.len() });
                }
                Ok(Payload::Ping)
            }
            FunctionCode::Pong => Ok(Payload::Pong(Pong::parse(raw)?)),
            FunctionCode::Push => Ok(Payload::Push(PushRequest::parse(raw)?)),
            FunctionCode::Query => Ok(Payload::Query(Query::parse(raw)?)),
            FunctionCode::QueryReply => Ok(Payload::QueryReply(QueryReply::parse(raw)?)),
        }
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Payload::Ping => FunctionCode::Ping,
            Payload::Pong(_) => FunctionCode::Pong,
            Payload::Push(_) => FunctionCode::Push,
            Payload::Query(_) => FunctionCode::Query,
            Payload::QueryReply(_) => FunctionCode::QueryReply,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Ping => &[],
            Payload::Pong(p) => p.as_bytes(),
            Payload::Push(p) => p.as_bytes(),
            Payload::Query(p) => p.as_bytes(),
            Payload::QueryReply(p) => p.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}
