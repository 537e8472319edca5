//! HTTP/1.1 wire codec.
//!
//! Request framing is hand-written (method, target and headers are already validated by the
//! `http` crate's types, so serializing them is a straight write); response framing is parsed
//! with [`httparse`], and chunked transfer coding is decoded incrementally so a partial chunk
//! arriving mid-`read` doesn't stall the whole response.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::error::{Error, Result};

const MAX_HEADERS: usize = 128;

/// Writes `METHOD target HTTP/1.1\r\n` followed by each header as `Name: value\r\n`, then the
/// blank line terminating the header block. `target` is origin-form (`/path?query`) for a direct
/// request or absolute-form (`http://host/path?query`) when routed through a proxy.
pub(crate) fn write_request_head(buf: &mut BytesMut, method: &Method, target: &Uri, headers: &HeaderMap) {
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.to_string().as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// Writes one chunk of a chunked-encoded body: `<hex-size>\r\n<data>\r\n`.
pub(crate) fn encode_chunk(buf: &mut BytesMut, chunk: &[u8]) {
    if chunk.is_empty() {
        return;
    }
    let size = itoa_hex(chunk.len());
    buf.put_slice(size.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(chunk);
    buf.put_slice(b"\r\n");
}

/// Writes the terminating `0\r\n\r\n` chunk with no trailers.
pub(crate) fn encode_last_chunk(buf: &mut BytesMut) {
    buf.put_slice(b"0\r\n\r\n");
}

fn itoa_hex(mut n: usize) -> String {
    if n == 0 {
        return "0".to_owned();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(std::char::from_digit((n % 16) as u32, 16).unwrap());
        n /= 16;
    }
    digits.iter().rev().collect()
}

/// A successfully parsed status line and header block.
pub(crate) struct ParsedResponse {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) reason: String,
    pub(crate) headers: HeaderMap,
    /// Bytes of `buf` consumed by the status line and headers, including the trailing blank
    /// line; the body (if any) starts immediately after.
    pub(crate) consumed: usize,
}

/// Parses a response status line and header block from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet contain a complete header block — the caller should
/// read more bytes and retry.
pub(crate) fn parse_response(buf: &[u8]) -> Result<Option<ParsedResponse>> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut header_storage);

    let status = response
        .parse(buf)
        .map_err(|e| Error::bad_message(e.to_string()))?;

    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let code = response.code.ok_or_else(|| Error::bad_message("missing status code"))?;
    let status = StatusCode::from_u16(code).map_err(|e| Error::bad_message(e.to_string()))?;
    let reason = response.reason.unwrap_or("").to_owned();
    let version = if response.version == Some(1) {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        if header.name.is_empty() {
            continue;
        }
        let name = http::header::HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| Error::bad_message(e.to_string()))?;
        let value = http::header::HeaderValue::from_bytes(header.value)
            .map_err(|e| Error::bad_message(e.to_string()))?;
        headers.append(name, value);
    }

    Ok(Some(ParsedResponse {
        version,
        status,
        reason,
        headers,
        consumed,
    }))
}

/// How a response's body is delimited on the wire (RFC 7230 §3.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    /// No body is present regardless of headers (`HEAD`, 1xx, 204, 304).
    None,
    /// `Content-Length` framing.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// No length given; the body runs until the connection closes. Only valid on a response
    /// that will not be followed by another pipelined response.
    UntilClose,
}

/// Determines how the body following a response's headers is framed.
pub(crate) fn body_length(request_method: &Method, status: StatusCode, headers: &HeaderMap) -> Result<BodyLength> {
    if request_method == Method::HEAD
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.as_u16() < 200
    {
        return Ok(BodyLength::None);
    }

    let is_chunked = headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.rsplit(',').next().unwrap_or("").trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);

    if is_chunked {
        return Ok(BodyLength::Chunked);
    }

    if let Some(len) = headers.get(http::header::CONTENT_LENGTH) {
        let len = len
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::bad_message("invalid Content-Length"))?;
        return Ok(BodyLength::Fixed(len));
    }

    Ok(BodyLength::UntilClose)
}

/// Incrementally decodes a chunked-encoded body from a byte stream that may arrive in
/// arbitrary-sized reads.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkedState,
}

#[derive(Debug)]
enum ChunkedState {
    ChunkSize,
    ChunkData(u64),
    ChunkDataCrlf,
    Trailers,
    Done,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        ChunkedDecoder {
            state: ChunkedState::ChunkSize,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state, ChunkedState::Done)
    }

    /// Consumes as much of `buf` as forms complete chunk framing, appending decoded data bytes
    /// to `out`. Leaves any trailing partial frame in `buf` for the next call.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut, out: &mut BytesMut) -> Result<()> {
        loop {
            match self.state {
                ChunkedState::ChunkSize => match find_crlf(buf) {
                    Some(line_end) => {
                        let line = &buf[..line_end];
                        let size_str = std::str::from_utf8(line)
                            .map_err(|_| Error::bad_message("non-utf8 chunk size"))?;
                        let size_str = size_str.split(';').next().unwrap_or("").trim();
                        let size = u64::from_str_radix(size_str, 16)
                            .map_err(|_| Error::bad_message("invalid chunk size"))?;
                        buf.advance(line_end + 2);
                        self.state = if size == 0 {
                            ChunkedState::Trailers
                        } else {
                            ChunkedState::ChunkData(size)
                        };
                    }
                    None => return Ok(()),
                },
                ChunkedState::ChunkData(remaining) => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    out.extend_from_slice(&buf[..take]);
                    buf.advance(take);
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkedState::ChunkDataCrlf
                    } else {
                        ChunkedState::ChunkData(remaining)
                    };
                }
                ChunkedState::ChunkDataCrlf => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    buf.advance(2);
                    self.state = ChunkedState::ChunkSize;
                }
                ChunkedState::Trailers => match find_crlf(buf) {
                    Some(0) => {
                        buf.advance(2);
                        self.state = ChunkedState::Done;
                        return Ok(());
                    }
                    Some(line_end) => {
                        buf.advance(line_end + 2);
                    }
                    None => return Ok(()),
                },
                ChunkedState::Done => return Ok(()),
            }
        }
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Splits `additional` bytes of body data out of `buf`, advancing past the consumed amount.
/// Used for the fixed-length body fast path.
pub(crate) fn take_fixed(buf: &mut BytesMut, remaining: &mut u64) -> Bytes {
    let take = (*remaining).min(buf.len() as u64) as usize;
    let chunk = buf.split_to(take).freeze();
    *remaining -= chunk.len() as u64;
    chunk
}
