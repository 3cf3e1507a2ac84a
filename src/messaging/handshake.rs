//! The connect handshake, reduced to agreeing on a protocol version:
//!
//! ```ascii
//! initiator                                responder
//!   GNUTELLA CONNECT/0.6  + headers  ---->
//!                                    <----  GNUTELLA/0.6 200 OK  + headers
//!   GNUTELLA/0.6 200 OK   + headers  ---->
//! ```
//!
//! Both sides use the lower of the two versions afterwards. Headers are parsed with `httparse` and
//!  ignored except for logging. The `GNUTELLA` start lines are not HTTP and are parsed here.

use std::cmp::min;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::ServentConfig;
use crate::util::lines::{expect_line, read_headers};

pub const CONNECT_PREFIX: &str = "GNUTELLA CONNECT/";
const RESPONSE_PREFIX: &str = "GNUTELLA/";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const V0_6: ProtocolVersion = ProtocolVersion { major: 0, minor: 6 };

    /// the lowest version we accept connections with
    pub const MIN_SUPPORTED: ProtocolVersion = ProtocolVersion::V0_6;
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.')
            .ok_or_else(|| anyhow!("invalid protocol version {:?}", s))?;
        Ok(ProtocolVersion {
            major: major.parse()?,
            minor: minor.parse()?,
        })
    }
}

/// Parses a status line like `GNUTELLA/0.6 200 OK`
fn parse_response_line(line: &str) -> anyhow::Result<(ProtocolVersion, u16)> {
    let rest = line.strip_prefix(RESPONSE_PREFIX)
        .ok_or_else(|| anyhow!("not a handshake response: {:?}", line))?;

    let mut parts = rest.splitn(3, ' ');
    let version = parts.next().unwrap_or_default().parse()?;
    let code = parts.next()
        .ok_or_else(|| anyhow!("handshake response without status code: {:?}", line))?
        .parse()?;
    Ok((version, code))
}

pub fn parse_connect_line(line: &str) -> anyhow::Result<ProtocolVersion> {
    line.strip_prefix(CONNECT_PREFIX)
        .ok_or_else(|| anyhow!("not a connect request: {:?}", line))?
        .trim()
        .parse()
}

async fn write_block<S: AsyncWrite + Unpin>(stream: &mut S, first_line: &str, user_agent: Option<&str>) -> anyhow::Result<()> {
    let mut block = format!("{}\r\n", first_line);
    if let Some(user_agent) = user_agent {
        block.push_str(&format!("User-Agent: {}\r\n", user_agent));
    }
    block.push_str("\r\n");

    stream.write_all(block.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Runs the handshake on an outbound connection, returning the negotiated protocol version
pub async fn initiate<S: AsyncBufRead + AsyncWrite + Unpin>(stream: &mut S, config: &ServentConfig) -> anyhow::Result<ProtocolVersion> {
    let ours = config.protocol_version;
    write_block(stream, &format!("{}{}", CONNECT_PREFIX, ours), Some(&config.user_agent)).await?;

    let (theirs, code) = parse_response_line(&expect_line(stream).await?)?;
    let headers = read_headers(stream).await?;
    debug!("handshake response {} {} with user agent {:?}", theirs, code, headers.get("User-Agent"));
    if code != 200 {
        bail!("connection rejected with status {}", code);
    }

    let negotiated = min(ours, theirs);
    if negotiated < ProtocolVersion::MIN_SUPPORTED {
        bail!("protocol version {} is not supported", theirs);
    }

    write_block(stream, &format!("{}{} 200 OK", RESPONSE_PREFIX, ours), None).await?;
    Ok(negotiated)
}

/// Runs the handshake on an inbound connection whose first line was already read
pub async fn respond<S: AsyncBufRead + AsyncWrite + Unpin>(stream: &mut S, connect_line: &str, config: &ServentConfig) -> anyhow::Result<ProtocolVersion> {
    let ours = config.protocol_version;
    let theirs = parse_connect_line(connect_line)?;
    let headers = read_headers(stream).await?;
    debug!("connect request for version {} with user agent {:?}", theirs, headers.get("User-Agent"));

    let negotiated = min(ours, theirs);
    if negotiated < ProtocolVersion::MIN_SUPPORTED {
        write_block(stream, &format!("{}{} 503 Version not supported", RESPONSE_PREFIX, ours), None).await?;
        bail!("protocol version {} is not supported", theirs);
    }

    write_block(stream, &format!("{}{} 200 OK", RESPONSE_PREFIX, ours), Some(&config.user_agent)).await?;

    let (_, code) = parse_response_line(&expect_line(stream).await?)?;
    read_headers(stream).await?;
    if code != 200 {
        bail!("peer aborted the handshake with status {}", code);
    }
    Ok(negotiated)
}
