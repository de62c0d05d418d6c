//! Client configuration
//!
//! All knobs recognized by the handler, with the conventions the pool
//! relies on: `None` on an optional duration means the policy is
//! disabled (infinite), while `Some(Duration::ZERO)` is a meaningful
//! extreme (`pooled_connection_lifetime` zero = never pool,
//! `pooled_connection_idle_timeout` zero = dispose on return).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use courier_common::{CourierError, CourierResult};
use tokio::net::TcpStream;

use crate::auth::Credentials;
use crate::proxy::ProxyResolver;
use crate::tls::TlsOptions;

/// Future returned by a [`ConnectCallback`].
pub type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// User hook replacing the default TCP dial. Receives the host and port
/// the pool would have dialed.
pub type ConnectCallback = Arc<dyn Fn(&str, u16) -> ConnectFuture + Send + Sync>;

/// Reaper period floor: sweeping more often than this buys nothing.
const REAPER_FLOOR: Duration = Duration::from_secs(1);

/// Reaper period when neither expiry policy is active. The reaper still
/// has to retire pools that go quiet.
const REAPER_DEFAULT: Duration = Duration::from_secs(30);

/// Configuration for a [`Client`](crate::Client) and its pools.
#[derive(Clone)]
pub struct ClientConfig {
    /// Per-pool connection cap. `None` disables the cap (and with it the
    /// waiter logic).
    pub max_connections_per_server: Option<usize>,
    /// Max age of a connection from creation to final reuse. `None` =
    /// unlimited; zero = never pool.
    pub pooled_connection_lifetime: Option<Duration>,
    /// Max time a connection may sit idle in the pool. `None` =
    /// unlimited; zero = dispose on return.
    pub pooled_connection_idle_timeout: Option<Duration>,
    /// Upper bound on dial + handshake. `None` disables.
    pub connect_timeout: Option<Duration>,
    /// Enable the per-pool credential cache for preemptive auth.
    pub pre_authenticate: bool,
    /// TLS configuration, cloned and specialized per pool.
    pub tls: TlsOptions,
    /// Request-level credentials.
    pub credentials: Option<Credentials>,
    /// Proxy resolver. `None` = all connections are direct.
    pub proxy: Option<Arc<dyn ProxyResolver>>,
    /// Credentials used when the resolved proxy has none of its own.
    pub default_proxy_credentials: Option<Credentials>,
    /// Optional user hook replacing the default TCP dial.
    pub connect_callback: Option<ConnectCallback>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections_per_server: None,
            pooled_connection_lifetime: None,
            pooled_connection_idle_timeout: Some(Duration::from_secs(90)),
            connect_timeout: Some(Duration::from_secs(10)),
            pre_authenticate: false,
            tls: TlsOptions::default(),
            credentials: None,
            proxy: None,
            default_proxy_credentials: None,
            connect_callback: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration, returning an error if invalid.
    pub fn validate(&self) -> CourierResult<()> {
        if self.max_connections_per_server == Some(0) {
            return Err(CourierError::invalid_request(
                "max_connections_per_server must be greater than 0",
            ));
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(CourierError::invalid_request(
                "connect_timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    /// The effective connection cap.
    pub(crate) fn max_connections(&self) -> usize {
        self.max_connections_per_server.unwrap_or(usize::MAX)
    }

    /// Reaper period: `min(idle_timeout, lifetime)` clamped to a floor.
    /// Zero policies contribute nothing (they leave no idle entries to
    /// sweep), so only positive bounds count.
    pub(crate) fn reaper_period(&self) -> Duration {
        let bound = [
            self.pooled_connection_idle_timeout,
            self.pooled_connection_lifetime,
        ]
        .into_iter()
        .flatten()
        .filter(|d| !d.is_zero())
        .min();

        match bound {
            Some(d) => d.max(REAPER_FLOOR),
            None => REAPER_DEFAULT,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("max_connections_per_server", &self.max_connections_per_server)
            .field("pooled_connection_lifetime", &self.pooled_connection_lifetime)
            .field(
                "pooled_connection_idle_timeout",
                &self.pooled_connection_idle_timeout,
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("pre_authenticate", &self.pre_authenticate)
            .field("credentials", &self.credentials)
            .field("proxy", &self.proxy)
            .field("has_connect_callback", &self.connect_callback.is_some())
            .finish_non_exhaustive()
    }
}
