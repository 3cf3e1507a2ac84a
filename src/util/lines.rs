//! Reading of newline terminated text lines and header blocks, as used by the connect handshake
//!  and the rendezvous exchange. Reading goes through an [AsyncBufRead] so that bytes following
//!  the text part (binary frames) stay in the buffer for the next reader.

use anyhow::bail;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const MAX_LINE_LEN: u64 = 4096;
pub const MAX_NUM_HEADERS: usize = 64;

/// Reads a line terminated by `\n`, stripping the terminator and an optional preceding `\r`.
///  Returns `None` if the stream ends before the first byte of the line.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<String>> {
    let mut raw = Vec::new();
    let n = (&mut *reader).take(MAX_LINE_LEN).read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return Ok(None);
    }

    match raw.last() {
        Some(b'\n') => {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
        }
        _ if n as u64 == MAX_LINE_LEN => bail!("line exceeds {} bytes", MAX_LINE_LEN),
        _ => bail!("stream ended in the middle of a line"),
    }

    Ok(Some(String::from_utf8(raw)?))
}

/// Reads a line, treating end of stream as an error
pub async fn expect_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<String> {
    match read_line(reader).await? {
        Some(line) => Ok(line),
        None => bail!("stream ended while expecting a line"),
    }
}

pub const MAX_HEADER_BLOCK_LEN: usize = 16 * 1024;

/// Reads lines up to and including the empty line that terminates an HTTP style header block,
///  returning the raw bytes for `httparse`. Bytes after the block stay in the reader.
pub async fn read_header_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut block = Vec::new();
    loop {
        let line_start = block.len();
        let n = (&mut *reader).take(MAX_LINE_LEN).read_until(b'\n', &mut block).await?;
        match block.last() {
            _ if n == 0 => bail!("stream ended in a header block"),
            Some(b'\n') => {}
            _ if n as u64 == MAX_LINE_LEN => bail!("line exceeds {} bytes", MAX_LINE_LEN),
            _ => bail!("stream ended in the middle of a line"),
        }
        if block.len() > MAX_HEADER_BLOCK_LEN {
            bail!("header block exceeds {} bytes", MAX_HEADER_BLOCK_LEN);
        }

        if matches!(&block[line_start..], b"\n" | b"\r\n") {
            return Ok(block);
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn from_parsed(headers: &[httparse::Header<'_>]) -> Headers {
        Headers {
            entries: headers.iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
                .collect(),
        }
    }

    /// Case insensitive lookup of a header's value, the first occurrence wins
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads and parses `Name: value` lines up to and including an empty line
pub async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Headers> {
    let block = read_header_block(reader).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
    match httparse::parse_headers(&block, &mut headers)? {
        httparse::Status::Complete((_, parsed)) => Ok(Headers::from_parsed(parsed)),
        httparse::Status::Partial => bail!("incomplete header block"),
    }
}
