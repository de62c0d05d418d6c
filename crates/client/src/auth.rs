//! Request and proxy authentication
//!
//! Basic credentials only: the challenge/response state machines for the
//! negotiated schemes live outside this crate. The pool drives the flow:
//! an optional preemptive `Authorization` header (once the per-pool
//! cache has seen the server demand one), a single retry on `401`/`407`
//! when the challenge admits Basic, and nothing else.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::{HeaderName, HeaderValue, PROXY_AUTHENTICATE, WWW_AUTHENTICATE};
use http::HeaderMap;

/// Credentials presented to a server or proxy.
#[derive(Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Encoded value for `Authorization` / `Proxy-Authorization`.
    pub(crate) fn header_value(&self) -> HeaderValue {
        match self {
            Self::Basic { username, password } => {
                let token = BASE64.encode(format!("{username}:{password}"));
                let mut value = HeaderValue::from_str(&format!("Basic {token}"))
                    .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
                value.set_sensitive(true);
                value
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

/// Per-pool preemptive-auth memory.
///
/// Armed the first time a request on the pool succeeds after answering
/// a Basic challenge; from then on (when the client opted in with
/// `pre_authenticate`) the header is attached up front.
#[derive(Debug, Default)]
pub(crate) struct CredentialCache {
    preauth_basic: AtomicBool,
}

impl CredentialCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm(&self) {
        self.preauth_basic.store(true, Ordering::Relaxed);
    }

    pub(crate) fn armed(&self) -> bool {
        self.preauth_basic.load(Ordering::Relaxed)
    }
}

/// Whether a `401` challenge admits the Basic scheme.
pub(crate) fn server_challenge_accepts_basic(headers: &HeaderMap) -> bool {
    challenge_accepts_basic(headers, WWW_AUTHENTICATE)
}

/// Whether a `407` challenge admits the Basic scheme.
pub(crate) fn proxy_challenge_accepts_basic(headers: &HeaderMap) -> bool {
    challenge_accepts_basic(headers, PROXY_AUTHENTICATE)
}

fn challenge_accepts_basic(headers: &HeaderMap, name: HeaderName) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| {
                v.split(',')
                    .any(|challenge| challenge.trim().to_ascii_lowercase().starts_with("basic"))
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header_value() {
        let creds = Credentials::basic("user", "pass");
        let value = creds.header_value();
        // base64("user:pass")
        assert_eq!(value.to_str().unwrap(), "Basic dXNlcjpwYXNz");
        assert!(value.is_sensitive());
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = Credentials::basic("user", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_challenge_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"test\""),
        );
        assert!(server_challenge_accepts_basic(&headers));
        assert!(!proxy_challenge_accepts_basic(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHENTICATE,
            HeaderValue::from_static("Negotiate, Basic realm=\"proxy\""),
        );
        assert!(proxy_challenge_accepts_basic(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        assert!(!server_challenge_accepts_basic(&headers));
    }

    #[test]
    fn test_credential_cache_arms_once() {
        let cache = CredentialCache::new();
        assert!(!cache.armed());
        cache.arm();
        assert!(cache.armed());
    }
}
