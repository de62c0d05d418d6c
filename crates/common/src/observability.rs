//! Observability for the Courier HTTP client
//!
//! Provides the tracing/logging bootstrap and lightweight atomic counters
//! for the connection pool. Counters are plain atomics so they can be
//! bumped from the pool hot path without locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing/logging subsystem
pub fn init_tracing() -> Result<()> {
    // Use JSON format for structured logging in production
    let format = std::env::var("COURIER_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let json_layer = if format == "json" {
        Some(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let pretty_layer = if format == "pretty" {
        Some(
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    // Configure log level from environment
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .init();

    info!("Tracing initialized");
    Ok(())
}

/// Connection pool metrics
///
/// One instance is shared by every pool owned by a manager. All counters
/// are monotonic; readers take a [`PoolMetricsSnapshot`].
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Connections dialed (including tunneled and TLS-wrapped)
    pub connections_opened: AtomicU64,
    /// Requests served on a reused pooled connection
    pub connections_reused: AtomicU64,
    /// Connections torn down for any reason
    pub connections_disposed: AtomicU64,
    /// Connections handed directly from a releaser to a waiter
    pub handoffs: AtomicU64,
    /// Acquisitions that had to queue behind the connection cap
    pub pool_waits: AtomicU64,
    /// Idle connections evicted after failing the usability probe
    pub stale_evictions: AtomicU64,
    /// `CONNECT` tunnels refused by the proxy
    pub tunnel_rejections: AtomicU64,
    /// TLS handshake failures
    pub tls_failures: AtomicU64,
    /// Requests re-sent after a retryable transport failure
    pub request_retries: AtomicU64,
    /// Pools retired by the reaper
    pub pools_retired: AtomicU64,
    /// Total TLS handshake time in microseconds
    pub tls_handshake_us: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reuse(&self) {
        self.connections_reused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispose(&self) {
        self.connections_disposed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handoff(&self) {
        self.handoffs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wait(&self) {
        self.pool_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_eviction(&self) {
        self.stale_evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tunnel_rejection(&self) {
        self.tunnel_rejections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry(&self) {
        self.request_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pool_retired(&self) {
        self.pools_retired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a TLS handshake attempt
    pub fn record_tls_handshake(&self, duration: Duration, success: bool) {
        if !success {
            self.tls_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.tls_handshake_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_reused: self.connections_reused.load(Ordering::Relaxed),
            connections_disposed: self.connections_disposed.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
            pool_waits: self.pool_waits.load(Ordering::Relaxed),
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            tunnel_rejections: self.tunnel_rejections.load(Ordering::Relaxed),
            tls_failures: self.tls_failures.load(Ordering::Relaxed),
            request_retries: self.request_retries.load(Ordering::Relaxed),
            pools_retired: self.pools_retired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub connections_opened: u64,
    pub connections_reused: u64,
    pub connections_disposed: u64,
    pub handoffs: u64,
    pub pool_waits: u64,
    pub stale_evictions: u64,
    pub tunnel_rejections: u64,
    pub tls_failures: u64,
    pub request_retries: u64,
    pub pools_retired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = PoolMetrics::new();
        metrics.record_open();
        metrics.record_open();
        metrics.record_reuse();
        metrics.record_dispose();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_opened, 2);
        assert_eq!(snap.connections_reused, 1);
        assert_eq!(snap.connections_disposed, 1);
        assert_eq!(snap.pool_waits, 0);
    }

    #[test]
    fn test_tls_handshake_failure_counted() {
        let metrics = PoolMetrics::new();
        metrics.record_tls_handshake(Duration::from_millis(5), true);
        metrics.record_tls_handshake(Duration::from_millis(7), false);

        let snap = metrics.snapshot();
        assert_eq!(snap.tls_failures, 1);
    }
}
