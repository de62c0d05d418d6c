//! Streaming response body
//!
//! The body is the pool's hook back into connection lifecycle: reading
//! it to completion returns the connection for reuse, while dropping a
//! partially read body disposes the connection — its stream position is
//! unknown and it can never carry another request.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use courier_common::{CourierError, CourierResult};

use crate::connection::HttpConnection;
use crate::http1::{BodyFraming, ChunkedDecoder, DecodeStep};
use crate::pool::ConnectionPool;

/// Response body handle.
pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    Empty,
    Buffered(Bytes),
    Streaming(Box<StreamingBody>),
}

struct StreamingBody {
    conn: Option<HttpConnection>,
    pool: Arc<ConnectionPool>,
    reader: FramingReader,
}

enum FramingReader {
    Exact { remaining: u64 },
    Chunked(ChunkedDecoder),
    UntilClose,
}

impl Body {
    pub(crate) fn empty() -> Self {
        Self {
            inner: BodyInner::Empty,
        }
    }

    pub(crate) fn buffered(bytes: Bytes) -> Self {
        Self {
            inner: BodyInner::Buffered(bytes),
        }
    }

    /// A body that streams off `conn` and releases it to `pool` when the
    /// framing says the response is over. The caller has already ruled
    /// out the zero-length framings.
    pub(crate) fn streaming(
        conn: HttpConnection,
        pool: Arc<ConnectionPool>,
        framing: BodyFraming,
    ) -> Self {
        let reader = match framing {
            BodyFraming::ContentLength(n) => FramingReader::Exact { remaining: n },
            BodyFraming::Chunked => FramingReader::Chunked(ChunkedDecoder::new()),
            BodyFraming::UntilClose => FramingReader::UntilClose,
            BodyFraming::None => FramingReader::Exact { remaining: 0 },
        };
        Self {
            inner: BodyInner::Streaming(Box::new(StreamingBody {
                conn: Some(conn),
                pool,
                reader,
            })),
        }
    }

    /// Next chunk of body bytes; `None` when the body is complete.
    pub async fn chunk(&mut self) -> CourierResult<Option<Bytes>> {
        match &mut self.inner {
            BodyInner::Empty => Ok(None),
            BodyInner::Buffered(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
            BodyInner::Streaming(body) => body.next_chunk().await,
        }
    }

    /// Read the whole body into one buffer.
    pub async fn bytes(mut self) -> CourierResult<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

/// Release a fully consumed connection back to its pool, honoring
/// `Connection: close`.
fn give_back(conn: &mut Option<HttpConnection>, pool: &Arc<ConnectionPool>) {
    if let Some(conn) = conn.take() {
        if conn.marked_close() {
            pool.invalidate_connection(conn);
        } else {
            pool.return_connection(conn);
        }
    }
}

/// Dispose a connection whose stream is in an unknown or terminal state.
fn discard(conn: &mut Option<HttpConnection>, pool: &Arc<ConnectionPool>) {
    if let Some(conn) = conn.take() {
        pool.invalidate_connection(conn);
    }
}

impl StreamingBody {
    async fn next_chunk(&mut self) -> CourierResult<Option<Bytes>> {
        match &mut self.reader {
            FramingReader::Exact { remaining } => {
                if *remaining == 0 {
                    give_back(&mut self.conn, &self.pool);
                    return Ok(None);
                }
                let Some(conn) = self.conn.as_mut() else {
                    return Ok(None);
                };
                if conn.buffered().is_empty() {
                    let n = match conn.fill_read_buf().await {
                        Ok(n) => n,
                        Err(e) => {
                            discard(&mut self.conn, &self.pool);
                            return Err(e);
                        }
                    };
                    if n == 0 {
                        let endpoint = conn.endpoint().to_string();
                        discard(&mut self.conn, &self.pool);
                        return Err(CourierError::transport_msg(
                            endpoint,
                            "connection closed mid-body",
                            false,
                        ));
                    }
                }
                let take = (*remaining).min(conn.buffered().len() as u64) as usize;
                let data = conn.buffered().split_to(take).freeze();
                *remaining -= take as u64;
                if *remaining == 0 {
                    give_back(&mut self.conn, &self.pool);
                }
                Ok(Some(data))
            }
            FramingReader::Chunked(decoder) => loop {
                let Some(conn) = self.conn.as_mut() else {
                    return Ok(None);
                };
                let step = match decoder.decode(conn.buffered()) {
                    Ok(step) => step,
                    Err(e) => {
                        discard(&mut self.conn, &self.pool);
                        return Err(e);
                    }
                };
                match step {
                    DecodeStep::Data(data) => return Ok(Some(data)),
                    DecodeStep::Complete => {
                        give_back(&mut self.conn, &self.pool);
                        return Ok(None);
                    }
                    DecodeStep::NeedMore => {
                        let n = match conn.fill_read_buf().await {
                            Ok(n) => n,
                            Err(e) => {
                                discard(&mut self.conn, &self.pool);
                                return Err(e);
                            }
                        };
                        if n == 0 {
                            let endpoint = conn.endpoint().to_string();
                            discard(&mut self.conn, &self.pool);
                            return Err(CourierError::transport_msg(
                                endpoint,
                                "connection closed mid chunked body",
                                false,
                            ));
                        }
                    }
                }
            },
            FramingReader::UntilClose => {
                let Some(conn) = self.conn.as_mut() else {
                    return Ok(None);
                };
                if conn.buffered().is_empty() {
                    let n = match conn.fill_read_buf().await {
                        Ok(n) => n,
                        Err(e) => {
                            discard(&mut self.conn, &self.pool);
                            return Err(e);
                        }
                    };
                    if n == 0 {
                        // EOF is this framing's normal terminator; the
                        // connection is spent either way
                        discard(&mut self.conn, &self.pool);
                        return Ok(None);
                    }
                }
                let data = conn.buffered().split().freeze();
                Ok(Some(data))
            }
        }
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        // A partially read body leaves the stream mid-message
        discard(&mut self.conn, &self.pool);
    }
}
