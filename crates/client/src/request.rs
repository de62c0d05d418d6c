//! Outgoing request type
//!
//! Owned by the caller and never mutated by the send chain: auth and
//! framing headers are layered on at encode time. The header map is
//! materialized lazily so `has_headers` costs nothing on the common
//! headerless request.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

/// An HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: Option<HeaderMap>,
    body: Bytes,
    force_tunnel: bool,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: None,
            body: Bytes::new(),
            force_tunnel: false,
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: Uri, body: impl Into<Bytes>) -> Self {
        let mut request = Self::new(Method::POST, uri);
        request.body = body.into();
        request
    }

    /// Append a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.get_or_insert_with(HeaderMap::new).append(name, value);
        self
    }

    /// Replace the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Request a proxy `CONNECT` tunnel even for a plain-HTTP origin.
    /// Upgrade-style requests need the end-to-end byte stream a plain
    /// proxy hop cannot give them. No effect without a proxy.
    pub fn via_tunnel(mut self) -> Self {
        self.force_tunnel = true;
        self
    }

    /// Whether any header has been set, without materializing the map.
    pub fn has_headers(&self) -> bool {
        self.headers.as_ref().is_some_and(|h| !h.is_empty())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub(crate) fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub(crate) fn force_tunnel(&self) -> bool {
        self.force_tunnel
    }
}
