//! A single pooled HTTP/1.1 connection
//!
//! An [`HttpConnection`] is exclusively owned by whoever holds it: the
//! pool's idle stack or exactly one in-flight requester. It carries the
//! byte stream, its creation timestamp, the buffered reader state, and
//! the bookkeeping the retry loop needs (`can_retry`). Dropping the
//! value is disposal.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use courier_common::{CourierError, CourierResult};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::trace;

use crate::http1::{self, RequestTarget, ResponseHead};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The byte stream under a connection.
///
/// TLS always terminates the stack: a tunneled TLS connection wraps the
/// TCP socket that was dialed to the proxy, so `Tls` never nests.
#[derive(Debug)]
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One live HTTP/1.1 connection.
#[derive(Debug)]
pub(crate) struct HttpConnection {
    id: u64,
    transport: Transport,
    read_buf: BytesMut,
    created_at: Instant,
    /// `host:port` label for errors and logs
    endpoint: String,
    /// Checked out of the idle stack rather than freshly dialed
    reused: bool,
    /// Any response bytes observed for the current request
    response_started: bool,
    /// The current response asked for the connection to close
    marked_close: bool,
}

impl HttpConnection {
    pub(crate) fn new(transport: Transport, endpoint: String) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        trace!(connection = id, endpoint = %endpoint, "connection established");
        Self {
            id,
            transport,
            read_buf: BytesMut::with_capacity(8 * 1024),
            created_at: Instant::now(),
            endpoint,
            reused: false,
            response_started: false,
            marked_close: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the absolute-age policy has run out for this connection.
    /// A zero lifetime means "never pool": every connection is expired.
    pub(crate) fn lifetime_expired(&self, lifetime: Option<Duration>) -> bool {
        match lifetime {
            None => false,
            Some(limit) if limit.is_zero() => true,
            Some(limit) => self.created_at.elapsed() >= limit,
        }
    }

    /// Reset per-request state when the connection is checked out of the
    /// idle stack or handed to a waiter.
    pub(crate) fn begin_reuse(&mut self) {
        self.reused = true;
        self.response_started = false;
        self.marked_close = false;
    }

    /// A failed send may be replayed iff the connection was reused and
    /// the peer never produced a response byte.
    pub(crate) fn can_retry(&self) -> bool {
        self.reused && !self.response_started
    }

    pub(crate) fn marked_close(&self) -> bool {
        self.marked_close
    }

    /// Non-destructive idle usability probe.
    ///
    /// An idle connection must be silent: a readable byte is stray data,
    /// a zero-length read is the server closing. Either way the
    /// connection is unusable and will be disposed, so consuming the
    /// probe byte loses nothing.
    pub(crate) fn polls_clean(&self) -> bool {
        if !self.read_buf.is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        match self.transport.tcp().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Write a request and read the final response head.
    ///
    /// Interim `1xx` responses are skipped (`101` is surfaced: the
    /// stream changes protocol under it). `body: None` suppresses the
    /// framing headers entirely (`CONNECT`); `Some` writes the body with
    /// a `Content-Length`.
    pub(crate) async fn exchange(
        &mut self,
        method: &Method,
        target: &RequestTarget<'_>,
        host: &HeaderValue,
        headers: Option<&HeaderMap>,
        extra: Option<&HeaderMap>,
        body: Option<&Bytes>,
    ) -> CourierResult<ResponseHead> {
        let mut head = BytesMut::with_capacity(512);
        http1::encode_request_head(
            &mut head,
            method,
            target,
            host,
            headers,
            extra,
            body.map(|b| b.len() as u64),
        );
        self.write_all(&head).await?;
        if let Some(body) = body {
            if !body.is_empty() {
                self.write_all(body).await?;
            }
        }
        self.flush().await?;

        loop {
            let head = self.read_head().await?;
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                trace!(connection = self.id, status = %head.status, "skipping interim response");
                continue;
            }
            self.marked_close = http1::connection_close(&head);
            return Ok(head);
        }
    }

    async fn read_head(&mut self) -> CourierResult<ResponseHead> {
        loop {
            if let Some(head) = http1::parse_response_head(&mut self.read_buf)? {
                return Ok(head);
            }
            if self.fill_read_buf().await? == 0 {
                let retryable = self.can_retry();
                return Err(CourierError::transport_msg(
                    self.endpoint.clone(),
                    "connection closed before response head",
                    retryable,
                ));
            }
        }
    }

    /// Read more bytes off the wire into the parse buffer. Returns the
    /// number of bytes read; 0 is EOF.
    pub(crate) async fn fill_read_buf(&mut self) -> CourierResult<usize> {
        let n = self
            .transport
            .read_buf(&mut self.read_buf)
            .await
            .map_err(|e| {
                CourierError::transport_with_retry(self.endpoint.clone(), e, self.can_retry())
            })?;
        if n > 0 {
            self.response_started = true;
        }
        Ok(n)
    }

    /// Buffered-but-unparsed response bytes, for the body decoders.
    pub(crate) fn buffered(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Tear the connection apart for use as a tunnel transport.
    ///
    /// Only valid on a plain connection with an empty read buffer: a
    /// proxy that pipelines bytes after its `200` broke the protocol.
    pub(crate) fn into_tunnel_stream(self) -> CourierResult<TcpStream> {
        if !self.read_buf.is_empty() {
            return Err(CourierError::protocol(
                "proxy sent data ahead of the tunneled stream",
            ));
        }
        match self.transport {
            Transport::Plain(stream) => Ok(stream),
            Transport::Tls(_) => Err(CourierError::protocol(
                "cannot tunnel through a TLS proxy connection",
            )),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> CourierResult<()> {
        self.transport.write_all(data).await.map_err(|e| {
            CourierError::transport_with_retry(self.endpoint.clone(), e, self.can_retry())
        })
    }

    async fn flush(&mut self) -> CourierResult<()> {
        self.transport.flush().await.map_err(|e| {
            CourierError::transport_with_retry(self.endpoint.clone(), e, self.can_retry())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    async fn pair() -> (HttpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (
            HttpConnection::new(Transport::Plain(client), addr.to_string()),
            server,
        )
    }

    #[tokio::test]
    async fn test_polls_clean_on_quiet_connection() {
        let (conn, _server) = pair().await;
        assert!(conn.polls_clean());
    }

    #[tokio::test]
    async fn test_poll_detects_server_close() {
        let (conn, server) = pair().await;
        drop(server);
        // Give the FIN a moment to arrive
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.polls_clean());
    }

    #[tokio::test]
    async fn test_poll_detects_stray_bytes() {
        let (conn, mut server) = pair().await;
        server.write_all(b"surprise").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.polls_clean());
    }

    #[tokio::test]
    async fn test_lifetime_expiry_rules() {
        let (conn, _server) = pair().await;
        assert!(!conn.lifetime_expired(None));
        assert!(conn.lifetime_expired(Some(Duration::ZERO)));
        assert!(!conn.lifetime_expired(Some(Duration::from_secs(3600))));
    }

    #[tokio::test]
    async fn test_can_retry_only_when_reused() {
        let (mut conn, _server) = pair().await;
        assert!(!conn.can_retry());
        conn.begin_reuse();
        assert!(conn.can_retry());
        conn.response_started = true;
        assert!(!conn.can_retry());
    }
}
