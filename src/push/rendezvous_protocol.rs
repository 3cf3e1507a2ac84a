//! The text part of a push rendezvous. The pushed servent connects to the requester and announces
//!  itself; the requester then asks for its query replies using a minimal HTTP exchange:
//!
//! ```ascii
//! pushed servent                               requester
//!   GIV <index>:<servent id hex>/<name> \n\n  ---->
//!                                        <----  GET / HTTP/1.1 + headers
//!   HTTP/1.1 200 OK + headers             ---->
//!   query reply frames ...                ---->
//! ```

use std::fmt::{Display, Formatter};
use std::net::SocketAddrV4;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::messaging::guid::Guid;
use crate::util::lines::{expect_line, read_header_block, Headers, MAX_NUM_HEADERS};

pub const GIV_PREFIX: &str = "GIV ";
pub const QUERY_REPLY_MIME_TYPE: &str = "application/x-gnutella-packets";

/// The announcement line a pushed servent sends after connecting back to the requester
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GivLine {
    pub index: u32,
    pub servent_id: Guid,
    pub name: String,
}

impl Display for GivLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}:{}/{}", GIV_PREFIX, self.index, self.servent_id, self.name)
    }
}

impl FromStr for GivLine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(GIV_PREFIX)
            .ok_or_else(|| anyhow!("not a GIV line: {:?}", s))?;
        let (index, rest) = rest.split_once(':')
            .ok_or_else(|| anyhow!("GIV line without index: {:?}", s))?;
        let (servent_id, name) = rest.split_once('/')
            .ok_or_else(|| anyhow!("GIV line without name: {:?}", s))?;

        Ok(GivLine {
            index: index.trim().parse()?,
            servent_id: servent_id.parse()?,
            name: name.to_string(),
        })
    }
}

impl GivLine {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> anyhow::Result<()> {
        writer.write_all(format!("{}\n\n", self).as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Reads the blank line that terminates a GIV announcement
pub async fn read_giv_terminator<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<()> {
    let line = expect_line(reader).await?;
    if !line.is_empty() {
        bail!("expected an empty line after GIV, was {:?}", line);
    }
    Ok(())
}

pub async fn write_browse_request<W: AsyncWrite + Unpin>(writer: &mut W, host: Option<SocketAddrV4>, user_agent: &str) -> anyhow::Result<()> {
    let mut request = String::from("GET / HTTP/1.1\r\n");
    if let Some(host) = host {
        request.push_str(&format!("Host: {}\r\n", host));
    }
    request.push_str(&format!("User-Agent: {}\r\n", user_agent));
    request.push_str(&format!("Accept: {}\r\n", QUERY_REPLY_MIME_TYPE));
    request.push_str("Content-Length: 0\r\n");
    request.push_str("Connection: close\r\n");
    request.push_str("\r\n");

    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the request sent by [write_browse_request]
pub async fn read_browse_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<()> {
    let block = read_header_block(reader).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    if request.parse(&block)?.is_partial() {
        bail!("incomplete browse request");
    }
    if request.method != Some("GET") {
        bail!("not a browse request: {:?} {:?}", request.method, request.path);
    }

    let headers = Headers::from_parsed(request.headers);
    trace!("browse request for {:?} from user agent {:?}", request.path, headers.get("User-Agent"));
    Ok(())
}

/// Reads the response header of a browse exchange, returning the announced content length if any.
///  Anything but a 2xx response carrying uncompressed query replies is an error.
pub async fn read_browse_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<u64>> {
    let block = read_header_block(reader).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    if response.parse(&block)?.is_partial() {
        bail!("incomplete browse response");
    }
    let code = response.code
        .ok_or_else(|| anyhow!("browse response without status code"))?;
    if !(200..300).contains(&code) {
        bail!("browse request failed with HTTP status {}", code);
    }

    let headers = Headers::from_parsed(response.headers);
    if let Some(content_type) = headers.get("Content-Type") {
        if !content_type.to_ascii_lowercase().contains(QUERY_REPLY_MIME_TYPE) {
            bail!("unexpected content type {:?}", content_type);
        }
    }
    if let Some(encoding) = headers.get("Content-Encoding") {
        bail!("unsupported content encoding {:?}", encoding);
    }

    let content_length = headers.get("Content-Length")
        .and_then(|s| s.parse().ok());
    debug!("browse response {} with content length {:?}", code, content_length);
    Ok(content_length)
}

pub async fn write_browse_response<W: AsyncWrite + Unpin>(writer: &mut W, content_length: u64) -> anyhow::Result<()> {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        QUERY_REPLY_MIME_TYPE,
        content_length,
    );
    writer.write_all(response.as_bytes()).await?;
    Ok(())
}
