//! Decoding of messages from a byte stream or a datagram.
//!
//! Problems are reported in two tiers. Anything that leaves the stream in an unknown state
//!  (truncation, I/O errors, an absurd payload length) is returned as an `Err`, and the connection
//!  must be closed. Problems with a single frame are returned as [DecodeOutcome::BadFrame] - the
//!  declared payload was consumed, so the caller can log the frame and keep reading.

use std::fmt::{Display, Formatter};
use std::net::SocketAddrV4;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::messaging::function_code::FunctionCode;
use crate::messaging::guid::Guid;
use crate::messaging::header::{Header, HEADER_LEN};
use crate::messaging::message::Message;
use crate::messaging::payload::Payload;
use crate::util::safe_converter::SafeCast;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameLimits {
    /// payload lengths above this are treated as a broken (or hostile) stream
    pub max_payload_len: u32,
    pub hard_max_ttl: u8,
    /// If set, requests (not replies) with more hops than this are rejected, and requests with
    ///  TTL + hops above it have their TTL reduced to fit.
    pub soft_max_ttl: Option<u8>,
}

impl Default for FrameLimits {
    fn default() -> Self {
        FrameLimits {
            max_payload_len: 65536,
            hard_max_ttl: 14,
            soft_max_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DecodeOutcome {
    Frame(Message),
    BadFrame(BadFrame),
    EndOfStream,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BadFrame {
    pub guid: Guid,
    pub function_code: u8,
    pub reason: BadFrameReason,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BadFrameReason {
    TtlAboveMax { ttl: u8, max: u8 },
    HopsAboveMax { hops: u8, max: u8 },
    HopsAboveSoftMax { hops: u8, soft_max: u8 },
    TtlPlusHopsAboveMax { ttl: u8, hops: u8, max: u8 },
    UnknownFunctionCode(u8),
    PayloadLength { function_code: FunctionCode, len: usize },
    InvalidPushAddress(SocketAddrV4),
}

impl Display for BadFrameReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BadFrameReason::TtlAboveMax { ttl, max } => write!(f, "TTL {} exceeds maximum of {}", ttl, max),
            BadFrameReason::HopsAboveMax { hops, max } => write!(f, "hops {} exceed maximum of {}", hops, max),
            BadFrameReason::HopsAboveSoftMax { hops, soft_max } => write!(f, "hops {} exceed soft maximum of {}", hops, soft_max),
            BadFrameReason::TtlPlusHopsAboveMax { ttl, hops, max } => write!(f, "TTL {} + hops {} exceed maximum of {}", ttl, hops, max),
            BadFrameReason::UnknownFunctionCode(code) => write!(f, "unknown function code 0x{:02x}", code),
            BadFrameReason::PayloadLength { function_code, len } => write!(f, "invalid payload length {} for {:?}", len, function_code),
            BadFrameReason::InvalidPushAddress(addr) => write!(f, "invalid callback address {} in push request", addr),
        }
    }
}

/// Reads the next frame from a stream. Returns [DecodeOutcome::EndOfStream] if the stream ends
///  cleanly before the first header byte.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, limits: &FrameLimits) -> anyhow::Result<DecodeOutcome> {
    let mut header_buf = [0u8; HEADER_LEN];
    if !read_header(reader, &mut header_buf).await? {
        return Ok(DecodeOutcome::EndOfStream);
    }

    let header = Header::parse(&header_buf);
    check_payload_len(&header, limits)?;

    let mut payload = BytesMut::zeroed(header.payload_len.safe_cast());
    reader.read_exact(&mut payload).await
        .map_err(|e| anyhow!("error reading payload of {} bytes: {}", header.payload_len, e))?;

    Ok(decode_frame(header, payload.freeze(), limits))
}

/// Decodes a single UDP datagram with the same rules as [read_frame]. Bytes after the declared
///  payload are ignored.
pub fn decode_datagram(datagram: &[u8], limits: &FrameLimits) -> anyhow::Result<DecodeOutcome> {
    let header_buf: &[u8; HEADER_LEN] = datagram.get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| anyhow!("datagram of {} bytes is too short for a header", datagram.len()))?;

    let header = Header::parse(header_buf);
    check_payload_len(&header, limits)?;

    let payload_len: usize = header.payload_len.safe_cast();
    let payload_end = HEADER_LEN + payload_len;
    if datagram.len() < payload_end {
        bail!("datagram of {} bytes is truncated, header declares {} payload bytes", datagram.len(), header.payload_len);
    }

    Ok(decode_frame(header, Bytes::copy_from_slice(&datagram[HEADER_LEN..payload_end]), limits))
}

/// Validation of a frame whose payload was read completely
pub fn decode_frame(header: Header, payload: Bytes, limits: &FrameLimits) -> DecodeOutcome {
    match validated_message(&header, payload, limits) {
        Ok(msg) => DecodeOutcome::Frame(msg),
        Err(reason) => DecodeOutcome::BadFrame(BadFrame {
            guid: header.guid,
            function_code: header.function_code,
            reason,
        }),
    }
}

fn validated_message(header: &Header, payload: Bytes, limits: &FrameLimits) -> Result<Message, BadFrameReason> {
    let function_code = FunctionCode::try_from(header.function_code).ok();
    let is_reply = function_code
        .map(|c| c.is_reply())
        .unwrap_or(false);

    let max = limits.hard_max_ttl;
    let hops = header.hops;
    let mut ttl = header.ttl;

    if ttl > max {
        return Err(BadFrameReason::TtlAboveMax { ttl, max });
    }
    if hops > max {
        return Err(BadFrameReason::HopsAboveMax { hops, max });
    }

    let soft_max = limits.soft_max_ttl.filter(|_| !is_reply);
    if let Some(soft_max) = soft_max {
        if hops > soft_max {
            return Err(BadFrameReason::HopsAboveSoftMax { hops, soft_max });
        }
    }

    if ttl as u16 + hops as u16 > max as u16 {
        return Err(BadFrameReason::TtlPlusHopsAboveMax { ttl, hops, max });
    }

    if let Some(soft_max) = soft_max {
        if ttl + hops > soft_max {
            ttl = soft_max - hops;
        }
    }

    let function_code = function_code
        .ok_or(BadFrameReason::UnknownFunctionCode(header.function_code))?;

    Ok(Message {
        guid: header.guid,
        ttl,
        hops,
        payload: Payload::parse(function_code, payload)?,
    })
}

fn check_payload_len(header: &Header, limits: &FrameLimits) -> anyhow::Result<()> {
    if header.payload_len > limits.max_payload_len {
        bail!("unreasonable payload length {} (maximum is {})", header.payload_len, limits.max_payload_len);
    }
    Ok(())
}

/// Returns `false` if the stream ended before the first byte; a stream ending later is an error.
async fn read_header<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8; HEADER_LEN]) -> anyhow::Result<bool> {
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            bail!("connection closed after {} of {} header bytes", filled, HEADER_LEN);
        }
        filled += n;
    }
    Ok(true)
}


#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;
    use super::*;
    use crate::messaging::payload::pong::Pong;
    use crate::messaging::payload::push_request::PushRequest;
    use crate::messaging::payload::query::Query;
    use crate::messaging::payload::query_reply::QueryReply;

    fn raw_frame(function_code: u8, ttl: u8, hops: u8, payload: &[u8]) -> Vec<u8> {
        let mut result = vec![0xab; 16];
        result.extend_from_slice(&[function_code, ttl, hops]);
        result.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        result.extend_from_slice(payload);
        result
    }

    fn expect_frame(outcome: DecodeOutcome) -> Message {
        match outcome {
            DecodeOutcome::Frame(msg) => msg,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    fn expect_bad_frame(outcome: DecodeOutcome) -> BadFrameReason {
        match outcome {
            DecodeOutcome::BadFrame(bad) => bad.reason,
            other => panic!("expected a bad frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_end_to_end() {
        let msg = Message::ping(Guid::generate(), 5);
        let mut raw = BytesMut::new();
        msg.ser(&mut raw);
        assert_eq!(raw.len(), 23);

        let mut reader: &[u8] = &raw;
        let mut decoded = expect_frame(read_frame(&mut reader, &FrameLimits::default()).await.unwrap());
        assert_eq!(decoded, msg);
        assert_eq!(decoded.ttl, 5);
        assert_eq!(decoded.hops, 0);
        assert_eq!(decoded.payload.len(), 0);

        assert_eq!(decoded.relay(), 5);
        assert_eq!(decoded.ttl, 4);
        assert_eq!(decoded.hops, 1);

        assert_eq!(read_frame(&mut reader, &FrameLimits::default()).await.unwrap(), DecodeOutcome::EndOfStream);
    }

    #[rstest]
    #[case::pong(Payload::Pong(Pong::new(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346), 10, 20)))]
    #[case::push(Payload::Push(PushRequest::new(Guid::new([5; 16]), 3, SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346))))]
    #[case::query(Payload::Query(Query::new(0, "abc")))]
    #[case::query_reply(Payload::QueryReply(QueryReply::new(1, SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346), 0, b"x", Guid::new([6; 16]))))]
    #[tokio::test]
    async fn test_frame_round_trip(#[case] payload: Payload) {
        let msg = Message { guid: Guid::generate(), ttl: 3, hops: 2, payload };

        let mut raw = Vec::new();
        msg.write_to(&mut raw).await.unwrap();

        let mut reader: &[u8] = &raw;
        assert_eq!(expect_frame(read_frame(&mut reader, &FrameLimits::default()).await.unwrap()), msg);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_bad_frames_keep_stream_framed() {
        let mut raw = Vec::new();
        raw.extend(raw_frame(0x31, 1, 0, b"vendor specific"));
        raw.extend(raw_frame(0x00, 1, 0, b"big ping"));
        raw.extend(raw_frame(0x80, 15, 0, b"\0\0abc\0"));
        raw.extend(raw_frame(0x80, 2, 0, b"\0\0abc\0"));

        let limits = FrameLimits::default();
        let mut reader: &[u8] = &raw;
        assert_eq!(expect_bad_frame(read_frame(&mut reader, &limits).await.unwrap()), BadFrameReason::UnknownFunctionCode(0x31));
        assert_eq!(
            expect_bad_frame(read_frame(&mut reader, &limits).await.unwrap()),
            BadFrameReason::PayloadLength { function_code: FunctionCode::Ping, len: 8 },
        );
        assert_eq!(
            expect_bad_frame(read_frame(&mut reader, &limits).await.unwrap()),
            BadFrameReason::TtlAboveMax { ttl: 15, max: 14 },
        );

        let msg = expect_frame(read_frame(&mut reader, &limits).await.unwrap());
        assert_eq!(msg.payload, Payload::Query(Query::new(0, "abc")));
        assert_eq!(read_frame(&mut reader, &limits).await.unwrap(), DecodeOutcome::EndOfStream);
    }

    #[rstest]
    #[case::ttl_above_max(0x00, 15, 0, Some(BadFrameReason::TtlAboveMax { ttl: 15, max: 14 }))]
    #[case::hops_above_max(0x00, 0, 15, Some(BadFrameReason::HopsAboveMax { hops: 15, max: 14 }))]
    #[case::sum_above_max(0x00, 8, 7, Some(BadFrameReason::TtlPlusHopsAboveMax { ttl: 8, hops: 7, max: 14 }))]
    #[case::high_bit_ttl(0x00, 0x80, 0, Some(BadFrameReason::TtlAboveMax { ttl: 0x80, max: 14 }))]
    #[case::sum_at_max(0x00, 7, 7, None)]
    fn test_ttl_and_hops(#[case] function_code: u8, #[case] ttl: u8, #[case] hops: u8, #[case] expected: Option<BadFrameReason>) {
        let outcome = decode_datagram(&raw_frame(function_code, ttl, hops, &[]), &FrameLimits::default()).unwrap();
        match expected {
            Some(reason) => assert_eq!(expect_bad_frame(outcome), reason),
            None => {
                let msg = expect_frame(outcome);
                assert_eq!((msg.ttl, msg.hops), (ttl, hops));
            }
        }
    }

    #[rstest]
    #[case::request_clamped(0x80, 6, 2, Ok((3, 2)))]
    #[case::request_within_limit(0x80, 2, 2, Ok((2, 2)))]
    #[case::request_too_many_hops(0x80, 0, 6, Err(BadFrameReason::HopsAboveSoftMax { hops: 6, soft_max: 5 }))]
    #[case::reply_exempt(0x81, 6, 6, Ok((6, 6)))]
    fn test_soft_max(#[case] function_code: u8, #[case] ttl: u8, #[case] hops: u8, #[case] expected: Result<(u8, u8), BadFrameReason>) {
        let limits = FrameLimits { soft_max_ttl: Some(5), ..FrameLimits::default() };
        let payload = if function_code == 0x81 { vec![1u8; 26] } else { b"\0\0abc\0".to_vec() };

        let outcome = decode_datagram(&raw_frame(function_code, ttl, hops, &payload), &limits).unwrap();
        match expected {
            Ok((expected_ttl, expected_hops)) => {
                let msg = expect_frame(outcome);
                assert_eq!((msg.ttl, msg.hops), (expected_ttl, expected_hops));
            }
            Err(reason) => assert_eq!(expect_bad_frame(outcome), reason),
        }
    }

    #[tokio::test]
    async fn test_truncated_header_is_fatal() {
        let raw = raw_frame(0x00, 1, 0, &[]);
        let mut reader: &[u8] = &raw[..10];
        assert!(read_frame(&mut reader, &FrameLimits::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_fatal() {
        let raw = raw_frame(0x80, 1, 0, b"\0\0abc\0");
        let mut reader: &[u8] = &raw[..raw.len() - 1];
        assert!(read_frame(&mut reader, &FrameLimits::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_payload_is_fatal() {
        let mut raw = raw_frame(0x80, 1, 0, &[]);
        raw[19..23].copy_from_slice(&0x7fff_ffffu32.to_le_bytes());

        let mut reader: &[u8] = &raw;
        assert!(read_frame(&mut reader, &FrameLimits::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_payload_len_at_limit() {
        let limits = FrameLimits { max_payload_len: 30, ..FrameLimits::default() };
        let raw = raw_frame(0x81, 1, 0, &[1u8; 30]);
        let mut reader: &[u8] = &raw;
        expect_frame(read_frame(&mut reader, &limits).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_frame_across_partial_writes() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let msg = Message::new(Guid::generate(), 4, Payload::Query(Query::new(0, "a somewhat longer search text")));
        let expected = msg.clone();

        tokio::spawn(async move {
            msg.write_to(&mut client).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let limits = FrameLimits::default();
        assert_eq!(expect_frame(read_frame(&mut server, &limits).await.unwrap()), expected);
        assert_eq!(read_frame(&mut server, &limits).await.unwrap(), DecodeOutcome::EndOfStream);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_header(vec![0; 22])]
    #[case::truncated_payload(raw_frame(0x80, 1, 0, b"\0\0abc\0")[..25].to_vec())]
    fn test_decode_datagram_fatal(#[case] datagram: Vec<u8>) {
        assert!(decode_datagram(&datagram, &FrameLimits::default()).is_err());
    }

    #[test]
    fn test_decode_datagram_ignores_trailing_bytes() {
        let mut datagram = raw_frame(0x00, 2, 1, &[]);
        datagram.extend_from_slice(b"trailing");

        let msg = expect_frame(decode_datagram(&datagram, &FrameLimits::default()).unwrap());
        assert_eq!(msg.payload, Payload::Ping);
        assert_eq!((msg.ttl, msg.hops), (2, 1));
    }

    #[test]
    fn test_bad_frame_reason_display() {
        assert_eq!(BadFrameReason::UnknownFunctionCode(0x31).to_string(), "unknown function code 0x31");
        assert_eq!(
            BadFrameReason::PayloadLength { function_code: FunctionCode::Push, len: 3 }.to_string(),
            "invalid payload length 3 for Push",
        );
    }
}
