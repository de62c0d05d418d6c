//! HTTP/1.1 wire codec
//!
//! Request head encoding, response head parsing and body framing for a
//! single connection. The codec is deliberately incremental: the caller
//! owns the read buffer and feeds it back in until a parse completes,
//! so nothing here performs I/O.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use courier_common::{CourierError, CourierResult};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

const INITIAL_HEADERS: usize = 32;
const MAX_HEADERS: usize = 128;

/// Upper bound on a response head; anything larger is a protocol error.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Request-target form for the request line.
pub(crate) enum RequestTarget<'a> {
    /// `/path?query` — direct origin connections
    Origin(&'a Uri),
    /// Full URI — requests forwarded through a plain proxy
    Absolute(&'a Uri),
    /// `host:port` — the `CONNECT` request
    Authority(&'a str),
}

/// Encode a request head (request line through the blank line).
///
/// `Host` always goes first and is owned by the pool; a caller-supplied
/// `Host` or `Content-Length` is ignored so framing stays authoritative.
/// `extra` carries per-attempt headers (auth) layered on without
/// mutating the caller's request.
pub(crate) fn encode_request_head(
    buf: &mut BytesMut,
    method: &Method,
    target: &RequestTarget<'_>,
    host: &HeaderValue,
    headers: Option<&HeaderMap>,
    extra: Option<&HeaderMap>,
    body_len: Option<u64>,
) {
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    match target {
        RequestTarget::Origin(uri) => {
            let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            buf.put_slice(path.as_bytes());
        }
        RequestTarget::Absolute(uri) => buf.put_slice(uri.to_string().as_bytes()),
        RequestTarget::Authority(authority) => buf.put_slice(authority.as_bytes()),
    }
    buf.put_slice(b" HTTP/1.1\r\nHost: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(headers) = headers {
        for (name, value) in headers {
            if name == HOST || name == CONTENT_LENGTH {
                continue;
            }
            put_header(buf, name, value);
        }
    }
    if let Some(extra) = extra {
        for (name, value) in extra {
            put_header(buf, name, value);
        }
    }

    if let Some(len) = body_len {
        if len > 0 || method_requires_length(method) {
            buf.put_slice(b"Content-Length: ");
            buf.put_slice(len.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
    buf.put_slice(b"\r\n");
}

fn put_header(buf: &mut BytesMut, name: &HeaderName, value: &HeaderValue) {
    buf.put_slice(name.as_str().as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

/// Methods that conventionally send `Content-Length: 0` for an empty body.
fn method_requires_length(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body bytes follow (HEAD, 1xx, 204, 304)
    None,
    ContentLength(u64),
    Chunked,
    /// Body runs to connection close; the connection is not reusable
    UntilClose,
}

/// Try to parse a complete response head out of `buf`.
///
/// On success the head bytes are consumed from the buffer. `Ok(None)`
/// means the head is still incomplete and more bytes are needed.
pub(crate) fn parse_response_head(buf: &mut BytesMut) -> CourierResult<Option<ResponseHead>> {
    let mut headers = [httparse::EMPTY_HEADER; INITIAL_HEADERS];
    let mut vec;
    let mut parser = httparse::Response::new(&mut headers);
    let mut result = parser.parse(&buf[..]);
    if matches!(result, Err(httparse::Error::TooManyHeaders)) {
        vec = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
        parser = httparse::Response::new(&mut vec);
        result = parser.parse(&buf[..]);
    }

    let consumed = match result {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(CourierError::protocol("response head exceeds 64 KiB"));
            }
            return Ok(None);
        }
        Err(e) => {
            return Err(CourierError::protocol(format!(
                "malformed response head: {e}"
            )))
        }
    };

    let status = parser
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| CourierError::protocol("invalid response status"))?;
    let version = match parser.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(CourierError::protocol("unsupported HTTP version")),
    };

    let mut map = HeaderMap::with_capacity(parser.headers.len());
    for h in parser.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| CourierError::protocol(format!("invalid header name '{}'", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| CourierError::protocol("invalid header value"))?;
        map.append(name, value);
    }

    buf.advance(consumed);
    Ok(Some(ResponseHead {
        status,
        version,
        headers: map,
    }))
}

/// Decide the body framing for a response to `method`.
pub(crate) fn body_framing(method: &Method, head: &ResponseHead) -> CourierResult<BodyFraming> {
    if *method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::None);
    }
    if is_chunked(&head.headers) {
        return Ok(BodyFraming::Chunked);
    }
    if let Some(len) = content_length(&head.headers)? {
        return Ok(BodyFraming::ContentLength(len));
    }
    Ok(BodyFraming::UntilClose)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers.get_all(TRANSFER_ENCODING).iter().any(|value| {
        value
            .to_str()
            .map(|v| {
                v.split(',')
                    .any(|enc| enc.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    })
}

fn content_length(headers: &HeaderMap) -> CourierResult<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| CourierError::protocol("invalid Content-Length"))?;
        match length {
            None => length = Some(parsed),
            Some(existing) if existing == parsed => {}
            Some(_) => {
                return Err(CourierError::protocol(
                    "conflicting Content-Length headers",
                ))
            }
        }
    }
    Ok(length)
}

/// Whether the server asked for the connection to be closed after this
/// response.
pub(crate) fn connection_close(head: &ResponseHead) -> bool {
    let mut close = head.version == Version::HTTP_10;
    for value in head.headers.get_all(CONNECTION) {
        if let Ok(v) = value.to_str() {
            for token in v.split(',') {
                match token.trim().to_ascii_lowercase().as_str() {
                    "close" => close = true,
                    "keep-alive" => {
                        if head.version == Version::HTTP_10 {
                            close = false;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    close
}

/// Incremental chunked transfer-coding decoder.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
    Done,
}

/// One step of chunked decoding.
#[derive(Debug)]
pub(crate) enum DecodeStep {
    /// Decoded payload bytes
    Data(Bytes),
    /// The buffer holds an incomplete element; feed more bytes
    NeedMore,
    /// The terminal chunk and trailers are fully consumed
    Complete,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> CourierResult<DecodeStep> {
        loop {
            match self.state {
                ChunkState::Size => match find_crlf(buf) {
                    Some(line_end) => {
                        let size = parse_chunk_size(&buf[..line_end])?;
                        buf.advance(line_end + 2);
                        self.state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    }
                    None => {
                        if buf.len() > 18 {
                            return Err(CourierError::protocol("chunk size line too long"));
                        }
                        return Ok(DecodeStep::NeedMore);
                    }
                },
                ChunkState::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(DecodeStep::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data { remaining: left }
                    };
                    return Ok(DecodeStep::Data(data));
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(DecodeStep::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(CourierError::protocol("missing chunk terminator"));
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => match find_crlf(buf) {
                    Some(0) => {
                        buf.advance(2);
                        self.state = ChunkState::Done;
                        return Ok(DecodeStep::Complete);
                    }
                    Some(line_end) => {
                        // Trailer fields are consumed and ignored
                        buf.advance(line_end + 2);
                    }
                    None => return Ok(DecodeStep::NeedMore),
                },
                ChunkState::Done => return Ok(DecodeStep::Complete),
            }
        }
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> CourierResult<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| CourierError::protocol("non-ASCII chunk size line"))?;
    // Chunk extensions after ';' are ignored
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| CourierError::protocol(format!("invalid chunk size '{size}'")))
}
