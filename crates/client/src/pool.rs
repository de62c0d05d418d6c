//! Per-endpoint connection pool
//!
//! Arbitrates every request against one endpoint: reuse an idle
//! connection, dial a new one under the cap, or queue the caller until a
//! slot frees. All pool state lives behind a single mutex; nothing that
//! can block is done while holding it. Idle connections are served LIFO
//! (the warm one first, cold ones age into the reaper), waiters strictly
//! FIFO.
//!
//! A connection is always in exactly one place: the idle stack, one
//! in-flight caller, or gone. `associated_count` tracks the first two,
//! and every increment is paired with exactly one decrement when the
//! connection dies or is detached as a tunnel transport.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use courier_common::{CourierError, CourierResult, PoolMetrics};
use http::header::{HeaderValue, AUTHORIZATION, PROXY_AUTHORIZATION};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::auth::{self, CredentialCache, Credentials};
use crate::body::Body;
use crate::config::ClientConfig;
use crate::connect::{self, ConnectOutcome};
use crate::connection::HttpConnection;
use crate::http1::{self, BodyFraming, RequestTarget, ResponseHead};
use crate::key::{PoolKey, PoolKind};
use crate::manager::PoolManager;
use crate::request::Request;
use crate::response::Response;
use crate::tls;

/// An idle connection with its return timestamp.
struct CachedConnection {
    conn: HttpConnection,
    returned_at: Instant,
}

impl CachedConnection {
    fn new(conn: HttpConnection) -> Self {
        Self {
            conn,
            returned_at: Instant::now(),
        }
    }

    /// Both the lifetime and the idle bound hold right now.
    fn is_usable(&self, lifetime: Option<Duration>, idle_timeout: Option<Duration>) -> bool {
        if self.conn.lifetime_expired(lifetime) {
            return false;
        }
        match idle_timeout {
            None => true,
            Some(limit) if limit.is_zero() => false,
            Some(limit) => self.returned_at.elapsed() < limit,
        }
    }
}

/// Single-shot handoff slot: a released connection, or `None` for
/// "capacity freed, try again". A cancelled waiter is detected by its
/// dropped receiver and skipped by the releaser.
struct Waiter {
    tx: oneshot::Sender<Option<HttpConnection>>,
}

struct PoolState {
    /// LIFO: most recently returned last
    idle: Vec<CachedConnection>,
    /// FIFO
    waiters: VecDeque<Waiter>,
    /// Live connections either idle here or checked out
    associated_count: usize,
    disposed: bool,
    used_since_cleanup: bool,
}

/// Result of an acquisition.
#[derive(Debug)]
pub(crate) enum Acquired {
    Connection { conn: HttpConnection, fresh: bool },
    /// The proxy refused the tunnel; its response stands in for the
    /// origin's.
    TunnelResponse(Response),
}

/// Result of establishing a tunnel on a `ProxyConnect` pool.
pub(crate) enum TunnelOutcome {
    Stream(tokio::net::TcpStream),
    Rejected(Response),
}

pub(crate) struct ConnectionPool {
    key: PoolKey,
    config: Arc<ClientConfig>,
    manager: Weak<PoolManager>,
    max_connections: usize,
    /// Pre-encoded `Host` for origin pools; raw-proxy pools compute it
    /// per request
    host_header: Option<HeaderValue>,
    /// Frozen TLS configuration when the key carries an `ssl_host`
    tls_config: Option<Arc<rustls::ClientConfig>>,
    credential_cache: CredentialCache,
    metrics: Arc<PoolMetrics>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub(crate) fn new(
        key: PoolKey,
        config: Arc<ClientConfig>,
        manager: Weak<PoolManager>,
        metrics: Arc<PoolMetrics>,
    ) -> CourierResult<Self> {
        let host_header = match key.host_header_value() {
            Some(value) => Some(HeaderValue::from_str(&value).map_err(|_| {
                CourierError::invalid_request(format!("host '{value}' is not a valid header value"))
            })?),
            None => None,
        };
        let tls_config = match key.ssl_host() {
            Some(ssl_host) => {
                let specialized = config.tls.specialize(ssl_host);
                Some(tls::build_client_config(&specialized)?)
            }
            None => None,
        };

        debug!(pool = %key, "created connection pool");
        Ok(Self {
            max_connections: config.max_connections(),
            key,
            config,
            manager,
            host_header,
            tls_config,
            credential_cache: CredentialCache::new(),
            metrics,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                waiters: VecDeque::new(),
                associated_count: 0,
                disposed: false,
                // A pool exists because a request needed it
                used_since_cleanup: true,
            }),
        })
    }

    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }

    pub(crate) fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub(crate) fn tls_config(&self) -> Option<&Arc<rustls::ClientConfig>> {
        self.tls_config.as_ref()
    }

    pub(crate) fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub(crate) fn manager(&self) -> CourierResult<Arc<PoolManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| CourierError::disposed("pool manager"))
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            state.associated_count,
            state.idle.len(),
            state.waiters.len(),
        )
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// The sole entry point for higher layers: request auth, then proxy
    /// auth, then the retry loop — in that order.
    pub(crate) async fn send(
        self: &Arc<Self>,
        request: &Request,
        do_request_auth: bool,
        cancel: &CancellationToken,
    ) -> CourierResult<Response> {
        if do_request_auth && self.config.credentials.is_some() {
            self.send_with_request_auth(request, cancel).await
        } else {
            self.send_with_proxy_auth(request, HeaderMap::new(), cancel)
                .await
        }
    }

    /// One preemptive or challenge-driven round of request-level Basic
    /// auth on top of the proxy-auth layer.
    async fn send_with_request_auth(
        self: &Arc<Self>,
        request: &Request,
        cancel: &CancellationToken,
    ) -> CourierResult<Response> {
        let creds = self
            .config
            .credentials
            .clone()
            .ok_or_else(|| CourierError::invalid_request("request auth without credentials"))?;

        let mut extra = HeaderMap::new();
        if self.config.pre_authenticate && self.credential_cache.armed() {
            extra.insert(AUTHORIZATION, creds.header_value());
        }
        let preauthed = extra.contains_key(AUTHORIZATION);

        let response = self
            .send_with_proxy_auth(request, extra.clone(), cancel)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED
            || preauthed
            || !auth::server_challenge_accepts_basic(response.headers())
        {
            return Ok(response);
        }

        debug!(pool = %self.key, "answering Basic challenge");
        // Drain the challenge body so the connection can be reused
        let _ = response.into_body().bytes().await;

        extra.insert(AUTHORIZATION, creds.header_value());
        let response = self.send_with_proxy_auth(request, extra, cancel).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            self.credential_cache.arm();
        }
        Ok(response)
    }

    /// One challenge-driven round of proxy Basic auth, for the kinds
    /// that talk to the proxy in the clear.
    async fn send_with_proxy_auth(
        self: &Arc<Self>,
        request: &Request,
        extra: HeaderMap,
        cancel: &CancellationToken,
    ) -> CourierResult<Response> {
        if !self.key.uses_proxy_auth() {
            return self.send_with_retry(request, extra, cancel).await;
        }
        let Some(creds) = self.proxy_credentials() else {
            return self.send_with_retry(request, extra, cancel).await;
        };

        let response = self.send_with_retry(request, extra.clone(), cancel).await?;
        if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED
            || extra.contains_key(PROXY_AUTHORIZATION)
            || !auth::proxy_challenge_accepts_basic(response.headers())
        {
            return Ok(response);
        }

        debug!(pool = %self.key, "answering proxy Basic challenge");
        let _ = response.into_body().bytes().await;

        let mut extra = extra;
        extra.insert(PROXY_AUTHORIZATION, creds.header_value());
        self.send_with_retry(request, extra, cancel).await
    }

    /// Acquire, send, and retry on a reused connection that failed
    /// before the peer observably consumed the request. A fresh
    /// connection is never retried.
    async fn send_with_retry(
        self: &Arc<Self>,
        request: &Request,
        extra: HeaderMap,
        cancel: &CancellationToken,
    ) -> CourierResult<Response> {
        loop {
            let (mut conn, fresh) = match self.acquire(cancel).await? {
                Acquired::Connection { conn, fresh } => (conn, fresh),
                Acquired::TunnelResponse(response) => return Ok(response),
            };
            if !fresh {
                self.metrics.record_reuse();
            }

            let host = self.host_value_for(request)?;
            let target = if self.key.absolute_form() {
                RequestTarget::Absolute(request.uri())
            } else {
                RequestTarget::Origin(request.uri())
            };
            let extra_ref = (!extra.is_empty()).then_some(&extra);

            let result = with_cancellation(
                conn.exchange(
                    request.method(),
                    &target,
                    &host,
                    request.headers(),
                    extra_ref,
                    Some(request.body_bytes()),
                ),
                cancel,
            )
            .await;

            let Some(result) = result else {
                // Stream state unknown after a cancelled send
                self.invalidate_connection(conn);
                return Err(CourierError::Cancelled {
                    operation: format!("request to {}", self.key),
                });
            };

            match result {
                Ok(head) => return self.finish_exchange(conn, request.method(), head),
                Err(e) if e.is_retryable() && !fresh => {
                    debug!(
                        pool = %self.key,
                        connection = conn.id(),
                        error = %e,
                        "retrying request after failure on reused connection"
                    );
                    self.metrics.record_retry();
                    self.invalidate_connection(conn);
                    continue;
                }
                Err(e) => {
                    self.invalidate_connection(conn);
                    return Err(e);
                }
            }
        }
    }

    /// Wrap the parsed head and the connection into a response whose
    /// body returns the connection on completion.
    fn finish_exchange(
        self: &Arc<Self>,
        conn: HttpConnection,
        method: &Method,
        head: ResponseHead,
    ) -> CourierResult<Response> {
        let framing = match http1::body_framing(method, &head) {
            Ok(framing) => framing,
            Err(e) => {
                self.invalidate_connection(conn);
                return Err(e);
            }
        };

        let body = match framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => {
                if conn.marked_close() {
                    self.invalidate_connection(conn);
                } else {
                    self.return_connection(conn);
                }
                Body::empty()
            }
            framing => Body::streaming(conn, Arc::clone(self), framing),
        };

        Ok(Response::new(head.status, head.version, head.headers, body))
    }

    fn host_value_for(&self, request: &Request) -> CourierResult<HeaderValue> {
        if let Some(host) = &self.host_header {
            return Ok(host.clone());
        }
        // Raw-proxy pools carry many origins; compute per request
        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| CourierError::invalid_request("request URI has no host"))?;
        let default = if uri.scheme_str() == Some("https") {
            443
        } else {
            80
        };
        let value = match uri.port_u16() {
            Some(port) if port != default => format!("{host}:{port}"),
            _ => host.to_string(),
        };
        HeaderValue::from_str(&value)
            .map_err(|_| CourierError::invalid_request("request host is not a valid header value"))
    }

    fn proxy_credentials(&self) -> Option<Credentials> {
        let endpoint = self.key.proxy_endpoint()?;
        if let Some(resolver) = &self.config.proxy {
            if let Ok(uri) = endpoint.uri.parse() {
                if let Some(creds) = resolver.credentials_for(&uri) {
                    return Some(creds);
                }
            }
        }
        self.config.default_proxy_credentials.clone()
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Get an idle connection, reserve a slot for a new one, or queue
    /// behind the cap.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> CourierResult<Acquired> {
        loop {
            enum Action {
                Reuse(CachedConnection),
                Create,
                Wait(oneshot::Receiver<Option<HttpConnection>>),
            }

            let action = {
                let mut state = self.state.lock();
                if state.disposed {
                    return Err(CourierError::disposed(format!("pool {}", self.key)));
                }
                state.used_since_cleanup = true;
                if let Some(cached) = state.idle.pop() {
                    Action::Reuse(cached)
                } else if state.associated_count < self.max_connections {
                    state.associated_count += 1;
                    Action::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter { tx });
                    Action::Wait(rx)
                }
            };

            match action {
                Action::Reuse(cached) => {
                    let usable = cached.is_usable(
                        self.config.pooled_connection_lifetime,
                        self.config.pooled_connection_idle_timeout,
                    ) && cached.conn.polls_clean();
                    if usable {
                        let mut conn = cached.conn;
                        conn.begin_reuse();
                        trace!(pool = %self.key, connection = conn.id(), "reusing idle connection");
                        return Ok(Acquired::Connection { conn, fresh: false });
                    }
                    debug!(
                        pool = %self.key,
                        connection = cached.conn.id(),
                        "evicting stale idle connection"
                    );
                    self.metrics.record_stale_eviction();
                    self.invalidate_connection(cached.conn);
                    continue;
                }
                Action::Create => {
                    return match self.create_connection(cancel).await {
                        Ok(acquired @ Acquired::Connection { .. }) => Ok(acquired),
                        Ok(Acquired::TunnelResponse(response)) => {
                            // No connection came of the reserved slot
                            self.decrement_and_signal();
                            Ok(Acquired::TunnelResponse(response))
                        }
                        Err(e) => {
                            self.decrement_and_signal();
                            Err(e)
                        }
                    };
                }
                Action::Wait(rx) => {
                    self.metrics.record_wait();
                    trace!(pool = %self.key, "waiting for a pooled connection");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            // The waiter is discarded lazily: the next
                            // releaser sees the dropped receiver
                            return Err(CourierError::AcquireCancelled {
                                endpoint: self.key.endpoint_label(),
                            });
                        }
                        result = rx => match result {
                            Ok(Some(mut conn)) => {
                                conn.begin_reuse();
                                self.metrics.record_handoff();
                                trace!(
                                    pool = %self.key,
                                    connection = conn.id(),
                                    "received handed-off connection"
                                );
                                return Ok(Acquired::Connection { conn, fresh: false });
                            }
                            // Capacity freed; take it from the top
                            Ok(None) => continue,
                            Err(_) => {
                                return Err(CourierError::disposed(format!("pool {}", self.key)))
                            }
                        }
                    }
                }
            }
        }
    }

    async fn create_connection(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> CourierResult<Acquired> {
        match Box::pin(connect::establish(self, cancel)).await? {
            ConnectOutcome::Connection(conn) => {
                self.metrics.record_open();
                debug!(pool = %self.key, connection = conn.id(), "opened connection");
                Ok(Acquired::Connection { conn, fresh: true })
            }
            ConnectOutcome::TunnelRejected(response) => {
                self.metrics.record_tunnel_rejection();
                Ok(Acquired::TunnelResponse(response))
            }
        }
    }

    // ------------------------------------------------------------------
    // Tunnel establishment (ProxyConnect pools only)
    // ------------------------------------------------------------------

    /// Send `CONNECT authority` on this pool and either yield the raw
    /// stream or the proxy's refusal.
    pub(crate) async fn connect_tunnel(
        self: &Arc<Self>,
        authority: &str,
        cancel: &CancellationToken,
    ) -> CourierResult<TunnelOutcome> {
        debug_assert_eq!(self.key.kind(), PoolKind::ProxyConnect);

        let host = HeaderValue::from_str(authority).map_err(|_| {
            CourierError::invalid_request("tunnel authority is not a valid header value")
        })?;
        let mut extra = HeaderMap::new();
        if let Some(creds) = self.proxy_credentials() {
            extra.insert(PROXY_AUTHORIZATION, creds.header_value());
        }
        let extra_ref = (!extra.is_empty()).then_some(&extra);

        loop {
            let (mut conn, fresh) = match self.acquire(cancel).await? {
                Acquired::Connection { conn, fresh } => (conn, fresh),
                Acquired::TunnelResponse(_) => {
                    return Err(CourierError::protocol(
                        "proxy-connect pool produced a tunnel response",
                    ))
                }
            };
            if !fresh {
                self.metrics.record_reuse();
            }

            let result = with_cancellation(
                conn.exchange(
                    &Method::CONNECT,
                    &RequestTarget::Authority(authority),
                    &host,
                    None,
                    extra_ref,
                    None,
                ),
                cancel,
            )
            .await;

            let Some(result) = result else {
                self.invalidate_connection(conn);
                return Err(CourierError::Cancelled {
                    operation: format!("CONNECT {authority}"),
                });
            };

            match result {
                Ok(head) if head.status == StatusCode::OK => {
                    trace!(pool = %self.key, authority, "tunnel established");
                    let conn = self.detach_connection(conn);
                    return Ok(TunnelOutcome::Stream(conn.into_tunnel_stream()?));
                }
                Ok(head) => {
                    debug!(pool = %self.key, authority, status = %head.status, "tunnel refused");
                    let response = self.finish_exchange(conn, &Method::CONNECT, head)?;
                    return Ok(TunnelOutcome::Rejected(response));
                }
                Err(e) if e.is_retryable() && !fresh => {
                    self.metrics.record_retry();
                    self.invalidate_connection(conn);
                    continue;
                }
                Err(e) => {
                    self.invalidate_connection(conn);
                    return Err(e);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Release paths
    // ------------------------------------------------------------------

    /// Called after a response body was fully read (or the request
    /// failed non-fatally). Hands the connection to the head waiter,
    /// parks it idle, or disposes it. Idempotent against a disposed
    /// pool.
    pub(crate) fn return_connection(&self, mut conn: HttpConnection) {
        let lifetime_ok = !conn.lifetime_expired(self.config.pooled_connection_lifetime);
        let clean = lifetime_ok && conn.polls_clean();

        if !clean {
            trace!(pool = %self.key, connection = conn.id(), "returned connection not reusable");
            self.invalidate_connection(conn);
            return;
        }

        let idle_enabled = !matches!(
            self.config.pooled_connection_idle_timeout,
            Some(limit) if limit.is_zero()
        );
        let conn_id = conn.id();

        // Serve the head waiter, or park. The no-waiter check and the
        // idle push happen under one lock acquisition: a waiter can only
        // enqueue while the stack is empty, so they must not interleave.
        loop {
            let waiter = {
                let mut state = self.state.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        if !state.disposed && idle_enabled {
                            state.idle.push(CachedConnection::new(conn));
                            drop(state);
                            trace!(pool = %self.key, connection = conn_id, "connection parked idle");
                            return;
                        }
                        break;
                    }
                }
            };
            // Cancelled waiters hand the connection back; try the next
            match waiter.tx.send(Some(conn)) {
                Ok(()) => return,
                Err(back) => match back {
                    Some(back) => conn = back,
                    // A failed send always carries the value back
                    None => return,
                },
            }
        }

        self.invalidate_connection(conn);
    }

    /// Dispose a connection and free its slot, waking one waiter with
    /// the capacity signal.
    pub(crate) fn invalidate_connection(&self, conn: HttpConnection) {
        trace!(pool = %self.key, connection = conn.id(), "disposing connection");
        drop(conn);
        self.metrics.record_dispose();
        self.decrement_and_signal();
    }

    /// Release a connection's slot without disposing it: ownership
    /// leaves the pool (tunnel transports).
    fn detach_connection(&self, conn: HttpConnection) -> HttpConnection {
        self.decrement_and_signal();
        conn
    }

    fn decrement_and_signal(&self) {
        let mut state = self.state.lock();
        state.associated_count = state.associated_count.saturating_sub(1);
        // Exactly one waiter is woken per freed slot
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(None).is_ok() {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown and reaping
    // ------------------------------------------------------------------

    /// Dispose the pool: idle connections die now, checked-out ones on
    /// their eventual return.
    pub(crate) fn dispose(&self) {
        let (idle, waiters) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.associated_count = state.associated_count.saturating_sub(state.idle.len());
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        debug!(pool = %self.key, idle = idle.len(), waiters = waiters.len(), "pool disposed");
        for _ in &idle {
            self.metrics.record_dispose();
        }
        // Dropping the idle stack closes the sockets; dropped waiter
        // senders surface Disposed to queued acquirers
    }

    /// Reaper entry point: evict unusable idle connections; retire the
    /// pool when it is empty and saw no traffic since the last sweep.
    pub(crate) fn clean_cache_and_dispose_if_unused(&self) -> bool {
        let swept = {
            let mut state = self.state.lock();
            if state.disposed {
                return true;
            }
            std::mem::take(&mut state.idle)
        };

        // Probe outside the lock: the poll touches the socket
        let mut kept = Vec::with_capacity(swept.len());
        let mut evicted = 0usize;
        for cached in swept {
            let usable = cached.is_usable(
                self.config.pooled_connection_lifetime,
                self.config.pooled_connection_idle_timeout,
            ) && cached.conn.polls_clean();
            if usable {
                kept.push(cached);
            } else {
                trace!(pool = %self.key, connection = cached.conn.id(), "reaper evicting connection");
                self.metrics.record_stale_eviction();
                self.metrics.record_dispose();
                evicted += 1;
            }
        }

        let retire = {
            let mut state = self.state.lock();
            state.associated_count = state.associated_count.saturating_sub(evicted);

            // Reinsert survivors, serving any waiter that queued while
            // the stack was out (idle and waiters never coexist)
            for cached in kept {
                let CachedConnection {
                    mut conn,
                    returned_at,
                } = cached;
                loop {
                    let Some(waiter) = state.waiters.pop_front() else {
                        state.idle.push(CachedConnection { conn, returned_at });
                        break;
                    };
                    match waiter.tx.send(Some(conn)) {
                        Ok(()) => break,
                        Err(Some(back)) => conn = back,
                        Err(None) => break,
                    }
                }
            }

            if state.idle.is_empty() && state.associated_count == 0 && !state.used_since_cleanup {
                state.disposed = true;
                true
            } else {
                state.used_since_cleanup = false;
                false
            }
        };

        if retire {
            debug!(pool = %self.key, "retiring unused pool");
        }
        retire
    }
}

/// Run `fut` unless `cancel` fires first; `None` means cancelled.
async fn with_cancellation<F: Future>(fut: F, cancel: &CancellationToken) -> Option<F::Output> {
    tokio::pin!(fut);
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        result = &mut fut => Some(result),
    }
}
