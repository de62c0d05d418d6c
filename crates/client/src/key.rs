//! Endpoint keys for the connection pool
//!
//! A [`PoolKey`] names exactly one pool: the combination of origin,
//! TLS target name and proxy that makes two requests shareable over the
//! same set of connections. The classifier enforces which fields each
//! kind carries; any deviation is a programming error.

use std::fmt;

use courier_common::{CourierError, CourierResult};
use http::Uri;

/// How a pool's connections reach the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Plain HTTP directly to the origin
    Http,
    /// TLS directly to the origin
    Https,
    /// Plain HTTP through a proxy (absolute-form requests, no tunnel)
    Proxy,
    /// HTTP origin reached through a proxy `CONNECT` tunnel
    ProxyTunnel,
    /// HTTPS origin reached through a proxy `CONNECT` tunnel
    SslProxyTunnel,
    /// Connections used to send the `CONNECT` itself
    ProxyConnect,
}

/// The proxy half of a key: where to dial and how to name it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    /// Original URI in display form, kept for logs and errors
    pub uri: String,
}

impl ProxyEndpoint {
    pub fn from_uri(proxy: &Uri) -> CourierResult<Self> {
        let host = proxy
            .host()
            .ok_or_else(|| CourierError::invalid_request("proxy URI has no host"))?;
        let port = proxy
            .port_u16()
            .unwrap_or_else(|| default_port(proxy.scheme_str()));
        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
            uri: proxy.to_string(),
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Identity of one connection pool.
///
/// Field population by kind:
///
/// | kind           | host | port | ssl_host | proxy |
/// |----------------|------|------|----------|-------|
/// | Http           | yes  | yes  | -        | -     |
/// | Https          | yes  | yes  | yes      | -     |
/// | Proxy          | -    | -    | -        | yes   |
/// | ProxyTunnel    | yes  | yes  | -        | yes   |
/// | SslProxyTunnel | yes  | yes  | yes      | yes   |
/// | ProxyConnect   | yes  | yes  | -        | yes   |
///
/// For `ProxyConnect` the host/port are the proxy's own: that is where
/// its connections dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    kind: PoolKind,
    host: Option<String>,
    port: Option<u16>,
    ssl_host: Option<String>,
    proxy: Option<ProxyEndpoint>,
}

fn default_port(scheme: Option<&str>) -> u16 {
    match scheme {
        Some("https") => 443,
        _ => 80,
    }
}

impl PoolKey {
    pub fn http(host: String, port: u16) -> Self {
        let key = Self {
            kind: PoolKind::Http,
            host: Some(host),
            port: Some(port),
            ssl_host: None,
            proxy: None,
        };
        key.debug_validate();
        key
    }

    pub fn https(host: String, port: u16, ssl_host: String) -> Self {
        let key = Self {
            kind: PoolKind::Https,
            host: Some(host),
            port: Some(port),
            ssl_host: Some(ssl_host),
            proxy: None,
        };
        key.debug_validate();
        key
    }

    pub fn proxy(proxy: ProxyEndpoint) -> Self {
        let key = Self {
            kind: PoolKind::Proxy,
            host: None,
            port: None,
            ssl_host: None,
            proxy: Some(proxy),
        };
        key.debug_validate();
        key
    }

    pub fn proxy_tunnel(host: String, port: u16, proxy: ProxyEndpoint) -> Self {
        let key = Self {
            kind: PoolKind::ProxyTunnel,
            host: Some(host),
            port: Some(port),
            ssl_host: None,
            proxy: Some(proxy),
        };
        key.debug_validate();
        key
    }

    pub fn ssl_proxy_tunnel(
        host: String,
        port: u16,
        ssl_host: String,
        proxy: ProxyEndpoint,
    ) -> Self {
        let key = Self {
            kind: PoolKind::SslProxyTunnel,
            host: Some(host),
            port: Some(port),
            ssl_host: Some(ssl_host),
            proxy: Some(proxy),
        };
        key.debug_validate();
        key
    }

    pub fn proxy_connect(proxy: ProxyEndpoint) -> Self {
        let key = Self {
            kind: PoolKind::ProxyConnect,
            host: Some(proxy.host.clone()),
            port: Some(proxy.port),
            ssl_host: None,
            proxy: Some(proxy),
        };
        key.debug_validate();
        key
    }

    /// Classify a request URI (plus the resolved proxy for it) into a key.
    ///
    /// `force_tunnel` requests a `CONNECT` tunnel even for a plain-HTTP
    /// origin, which upgrade-style requests need; it has no effect
    /// without a proxy.
    pub fn classify(uri: &Uri, proxy: Option<&Uri>, force_tunnel: bool) -> CourierResult<Self> {
        let scheme = uri.scheme_str().unwrap_or("");
        let is_https = match scheme {
            "http" => false,
            "https" => true,
            other => {
                return Err(CourierError::invalid_request(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| CourierError::invalid_request("request URI has no host"))?
            .to_ascii_lowercase();
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let key = match proxy {
            None if is_https => Self::https(host.clone(), port, host),
            None => Self::http(host, port),
            Some(proxy) => {
                let endpoint = ProxyEndpoint::from_uri(proxy)?;
                if is_https {
                    Self::ssl_proxy_tunnel(host.clone(), port, host, endpoint)
                } else if force_tunnel {
                    Self::proxy_tunnel(host, port, endpoint)
                } else {
                    Self::proxy(endpoint)
                }
            }
        };
        Ok(key)
    }

    fn debug_validate(&self) {
        let (host, port, ssl, proxy) = (
            self.host.is_some(),
            self.port.is_some(),
            self.ssl_host.is_some(),
            self.proxy.is_some(),
        );
        let expected = match self.kind {
            PoolKind::Http => (true, true, false, false),
            PoolKind::Https => (true, true, true, false),
            PoolKind::Proxy => (false, false, false, true),
            PoolKind::ProxyTunnel => (true, true, false, true),
            PoolKind::SslProxyTunnel => (true, true, true, true),
            PoolKind::ProxyConnect => (true, true, false, true),
        };
        debug_assert_eq!(
            (host, port, ssl, proxy),
            expected,
            "malformed pool key for {:?}",
            self.kind
        );
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn ssl_host(&self) -> Option<&str> {
        self.ssl_host.as_deref()
    }

    pub fn proxy_endpoint(&self) -> Option<&ProxyEndpoint> {
        self.proxy.as_ref()
    }

    /// Proxy authentication applies to the kinds that talk to the proxy
    /// in the clear.
    pub fn uses_proxy_auth(&self) -> bool {
        matches!(self.kind, PoolKind::Proxy | PoolKind::ProxyConnect)
    }

    /// Whether requests on this pool use the absolute-form target.
    pub fn absolute_form(&self) -> bool {
        self.kind == PoolKind::Proxy
    }

    /// Where this pool's connections dial directly, if they do.
    ///
    /// Tunneled kinds return `None`: their transport is obtained through
    /// the sibling `ProxyConnect` pool instead of a dial.
    pub fn dial_target(&self) -> Option<(&str, u16)> {
        match self.kind {
            PoolKind::Http | PoolKind::Https | PoolKind::ProxyConnect => {
                Some((self.host.as_deref()?, self.port?))
            }
            PoolKind::Proxy => {
                let proxy = self.proxy.as_ref()?;
                Some((proxy.host.as_str(), proxy.port))
            }
            PoolKind::ProxyTunnel | PoolKind::SslProxyTunnel => None,
        }
    }

    /// Pre-encoded `Host` value for origin connections.
    ///
    /// `host:port` unless the port is the scheme default, then bare
    /// `host`. Raw-`Proxy` pools have no single origin and compute the
    /// value per request.
    pub fn host_header_value(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let port = self.port?;
        let default = match self.kind {
            PoolKind::Http | PoolKind::ProxyTunnel => 80,
            PoolKind::Https | PoolKind::SslProxyTunnel => 443,
            // CONNECT always names the port explicitly
            PoolKind::ProxyConnect => return Some(format!("{host}:{port}")),
            PoolKind::Proxy => return None,
        };
        if port == default {
            Some(host.to_string())
        } else {
            Some(format!("{host}:{port}"))
        }
    }

    /// `host:port` used in errors and connect timeouts.
    pub fn endpoint_label(&self) -> String {
        match (&self.host, self.port, &self.proxy) {
            (Some(host), Some(port), _) => format!("{host}:{port}"),
            (_, _, Some(proxy)) => proxy.authority(),
            _ => "<unkeyed>".to_string(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PoolKind::Http => write!(
                f,
                "http://{}:{}",
                self.host.as_deref().unwrap_or(""),
                self.port.unwrap_or(0)
            ),
            PoolKind::Https => write!(
                f,
                "https://{}:{}",
                self.host.as_deref().unwrap_or(""),
                self.port.unwrap_or(0)
            ),
            PoolKind::Proxy => write!(
                f,
                "proxy {}",
                self.proxy.as_ref().map(|p| p.uri.as_str()).unwrap_or("")
            ),
            PoolKind::ProxyTunnel => write!(
                f,
                "http://{}:{} via {}",
                self.host.as_deref().unwrap_or(""),
                self.port.unwrap_or(0),
                self.proxy.as_ref().map(|p| p.uri.as_str()).unwrap_or(""),
            ),
            PoolKind::SslProxyTunnel => write!(
                f,
                "https://{}:{} via {}",
                self.host.as_deref().unwrap_or(""),
                self.port.unwrap_or(0),
                self.proxy.as_ref().map(|p| p.uri.as_str()).unwrap_or(""),
            ),
            PoolKind::ProxyConnect => write!(
                f,
                "connect {}",
                self.proxy.as_ref().map(|p| p.uri.as_str()).unwrap_or("")
            ),
        }
    }
}
