//! Connection factory
//!
//! Turns a pool's endpoint key into a ready connection: dial the
//! target (or hand the dial to the user's connect callback), lay a
//! proxy `CONNECT` tunnel through the sibling pool where the key asks
//! for one, and finish with the TLS handshake when the key names a
//! peer. Yields either a connection or the proxy's refusal — never
//! both.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use courier_common::{CourierError, CourierResult};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::{HttpConnection, Transport};
use crate::key::PoolKind;
use crate::pool::{ConnectionPool, TunnelOutcome};
use crate::response::Response;
use crate::tls;

pub(crate) enum ConnectOutcome {
    Connection(HttpConnection),
    /// The proxy refused the `CONNECT`; its response stands in for the
    /// origin's.
    TunnelRejected(Response),
}

/// Establish a ready connection for `pool`.
///
/// The whole attempt — dial, tunnel, TLS — runs under the configured
/// connect timeout, which surfaces as `ConnectTimeout` rather than a
/// generic cancellation. The caller's token aborts the attempt too.
pub(crate) async fn establish(
    pool: &Arc<ConnectionPool>,
    cancel: &CancellationToken,
) -> CourierResult<ConnectOutcome> {
    let started = Instant::now();
    let deadline = pool.config().connect_timeout;

    let attempt = async {
        match deadline {
            Some(limit) => match tokio::time::timeout(limit, establish_inner(pool, cancel)).await {
                Ok(result) => result,
                Err(_) => Err(CourierError::connect_timeout(
                    pool.key().endpoint_label(),
                    started.elapsed().as_millis() as u64,
                )),
            },
            None => establish_inner(pool, cancel).await,
        }
    };
    tokio::pin!(attempt);

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CourierError::Cancelled {
            operation: format!("connect to {}", pool.key()),
        }),
        result = &mut attempt => result,
    }
}

async fn establish_inner(
    pool: &Arc<ConnectionPool>,
    cancel: &CancellationToken,
) -> CourierResult<ConnectOutcome> {
    let key = pool.key();
    let endpoint = key.endpoint_label();

    // Raw transport: a dialed socket, or a stream tunneled through the
    // sibling ProxyConnect pool
    let stream = match key.kind() {
        PoolKind::Http | PoolKind::Https | PoolKind::Proxy | PoolKind::ProxyConnect => {
            let (host, port) = key
                .dial_target()
                .ok_or_else(|| CourierError::invalid_request("pool key has no dial target"))?;
            dial(pool, host, port).await?
        }
        PoolKind::ProxyTunnel | PoolKind::SslProxyTunnel => {
            let manager = pool.manager()?;
            let proxy = key
                .proxy_endpoint()
                .cloned()
                .ok_or_else(|| CourierError::invalid_request("tunnel key has no proxy"))?;
            let connect_pool = manager.proxy_connect_pool(proxy)?;
            match connect_pool.connect_tunnel(&endpoint, cancel).await? {
                TunnelOutcome::Stream(stream) => stream,
                TunnelOutcome::Rejected(response) => {
                    return Ok(ConnectOutcome::TunnelRejected(response))
                }
            }
        }
    };

    // TLS when the key names a validation peer
    let transport = match key.ssl_host() {
        Some(ssl_host) => {
            let config = pool.tls_config().cloned().ok_or_else(|| {
                CourierError::protocol("pool with ssl_host has no TLS configuration")
            })?;
            let connector = TlsConnector::from(config);
            let name = tls::server_name(ssl_host)?;
            let handshake_started = Instant::now();
            match connector.connect(name, stream).await {
                Ok(tls_stream) => {
                    pool.metrics()
                        .record_tls_handshake(handshake_started.elapsed(), true);
                    trace!(endpoint = %endpoint, ssl_host, "TLS handshake complete");
                    Transport::Tls(Box::new(tls_stream))
                }
                Err(e) => {
                    pool.metrics()
                        .record_tls_handshake(handshake_started.elapsed(), false);
                    return Err(CourierError::tls(ssl_host, e));
                }
            }
        }
        None => Transport::Plain(stream),
    };

    Ok(ConnectOutcome::Connection(HttpConnection::new(
        transport, endpoint,
    )))
}

/// Dial `host:port`, trying every resolved address in order. The user's
/// connect callback replaces the whole step when configured.
async fn dial(pool: &Arc<ConnectionPool>, host: &str, port: u16) -> CourierResult<TcpStream> {
    let endpoint = format!("{host}:{port}");

    if let Some(callback) = &pool.config().connect_callback {
        trace!(endpoint = %endpoint, "dialing via connect callback");
        let stream = callback(host, port)
            .await
            .map_err(|e| CourierError::transport(endpoint.clone(), e))?;
        stream.set_nodelay(true).ok();
        return Ok(stream);
    }

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| CourierError::transport(endpoint.clone(), e))?
        .collect();
    if addrs.is_empty() {
        return Err(CourierError::transport_msg(
            endpoint,
            "hostname resolved to no addresses",
            false,
        ));
    }

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                trace!(endpoint = %endpoint, addr = %addr, "dialed");
                return Ok(stream);
            }
            Err(e) => {
                trace!(endpoint = %endpoint, addr = %addr, error = %e, "dial failed");
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(CourierError::transport(endpoint, e)),
        None => Err(CourierError::transport_msg(endpoint, "connect failed", false)),
    }
}
