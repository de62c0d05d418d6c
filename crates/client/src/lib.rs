//! Courier — an HTTP/1.1 client over pooled connections
//!
//! Courier dispatches requests over pooled TCP (optionally TLS-wrapped)
//! connections to origin servers, optionally through an HTTP proxy. The
//! core of the crate is the per-endpoint connection pool: it multiplexes
//! concurrent requests over a bounded number of connections, chooses
//! between reusing a warm connection, dialing a new one, or queueing the
//! caller, and evicts connections that age out or go stale.
//!
//! # Architecture
//!
//! - [`Client`]: thin facade over a middleware chain whose tail is the
//!   pool manager
//! - manager: endpoint-key → pool map, proxy resolution, background
//!   reaper
//! - pool: idle stack (LIFO), waiter queue (FIFO), connection counter,
//!   lifetime/idle policies
//! - factory: dial, proxy `CONNECT` tunneling, TLS handshake
//!
//! # Example
//!
//! ```no_run
//! use courier_client::{Client, ClientConfig};
//!
//! # async fn run() -> courier_common::CourierResult<()> {
//! let client = Client::new(ClientConfig::default())?;
//! let response = client.get("http://example.com/".parse().unwrap()).await?;
//! let body = response.bytes().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod body;
pub mod config;
mod connect;
mod connection;
mod handler;
mod http1;
mod key;
mod manager;
mod pool;
pub mod proxy;
pub mod request;
pub mod response;
pub mod tls;

pub use auth::Credentials;
pub use body::Body;
pub use config::{ClientConfig, ConnectCallback, ConnectFuture};
pub use handler::{Client, ClientBuilder, SendHandler};
pub use proxy::{ProxyResolver, StaticProxy};
pub use request::Request;
pub use response::Response;
pub use tls::{RootStoreSource, TlsOptions};

pub use courier_common::{CourierError, CourierResult, PoolMetricsSnapshot};

// Every operation takes a cancellation token; re-exported so callers
// need not depend on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
