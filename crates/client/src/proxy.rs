//! Proxy resolution
//!
//! A [`ProxyResolver`] maps each request URI to the proxy it should be
//! dispatched through, or to `None` for a direct connection. Automatic
//! discovery of OS proxy settings is out of scope; callers supply a
//! resolver explicitly.

use std::fmt;

use http::Uri;

use crate::auth::Credentials;

/// Resolves the proxy (if any) for a request URI.
pub trait ProxyResolver: Send + Sync + fmt::Debug {
    /// The proxy to use for `uri`, or `None` to go direct.
    fn proxy_for(&self, uri: &Uri) -> Option<Uri>;

    /// Credentials attached to the resolved proxy, when the resolver
    /// carries them. Falls back to the client's
    /// `default_proxy_credentials` when absent.
    fn credentials_for(&self, proxy: &Uri) -> Option<Credentials> {
        let _ = proxy;
        None
    }
}

/// Routes everything through one fixed proxy, with a bypass list.
pub struct StaticProxy {
    uri: Uri,
    bypass: Vec<String>,
    credentials: Option<Credentials>,
}

impl StaticProxy {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            bypass: Vec::new(),
            credentials: None,
        }
    }

    /// Attach credentials presented in `Proxy-Authorization`.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Add hosts that skip the proxy. A leading dot matches any
    /// subdomain (`.internal` matches `svc.internal`).
    pub fn with_bypass(mut self, hosts: impl IntoIterator<Item = String>) -> Self {
        self.bypass
            .extend(hosts.into_iter().map(|h| h.to_ascii_lowercase()));
        self
    }

    fn bypassed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.bypass.iter().any(|entry| {
            if let Some(suffix) = entry.strip_prefix('.') {
                host == suffix || host.ends_with(entry.as_str())
            } else {
                host == *entry
            }
        })
    }
}

impl fmt::Debug for StaticProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticProxy")
            .field("uri", &self.uri)
            .field("bypass", &self.bypass)
            .finish_non_exhaustive()
    }
}

impl ProxyResolver for StaticProxy {
    fn proxy_for(&self, uri: &Uri) -> Option<Uri> {
        match uri.host() {
            Some(host) if self.bypassed(host) => None,
            Some(_) => Some(self.uri.clone()),
            None => None,
        }
    }

    fn credentials_for(&self, _proxy: &Uri) -> Option<Credentials> {
        self.credentials.clone()
    }
}
