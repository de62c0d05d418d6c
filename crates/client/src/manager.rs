//! Process-wide pool manager
//!
//! Owns the endpoint-key → pool map and the background reaper. Each
//! request is resolved against the proxy, classified into a key, routed
//! to its pool (created on first use), and sent. Pools hold a weak
//! reference back to the manager for tunnel dispatch; the manager owns
//! them strongly and never outlives them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use courier_common::{CourierError, CourierResult, PoolMetrics};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::key::{PoolKey, ProxyEndpoint};
use crate::pool::ConnectionPool;
use crate::request::Request;
use crate::response::Response;

pub(crate) struct PoolManager {
    pools: DashMap<PoolKey, Arc<ConnectionPool>>,
    config: Arc<ClientConfig>,
    metrics: Arc<PoolMetrics>,
    /// Weak self-handle that pools hold back to the manager
    weak: Weak<PoolManager>,
    reaper_cancel: CancellationToken,
    disposed: AtomicBool,
}

impl PoolManager {
    /// Create the manager and start its reaper. Must run inside a tokio
    /// runtime.
    pub(crate) fn new(config: ClientConfig) -> CourierResult<Arc<Self>> {
        config.validate()?;
        let manager = Arc::new_cyclic(|weak| Self {
            pools: DashMap::new(),
            config: Arc::new(config),
            metrics: Arc::new(PoolMetrics::new()),
            weak: weak.clone(),
            reaper_cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });
        Self::spawn_reaper(&manager);
        Ok(manager)
    }

    fn spawn_reaper(manager: &Arc<Self>) {
        let weak = Arc::downgrade(manager);
        let cancel = manager.reaper_cancel.clone();
        let period = manager.config.reaper_period();
        debug!(period_ms = period.as_millis() as u64, "starting pool reaper");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(period) => {}
                    () = cancel.cancelled() => break,
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.reap_once();
            }
        });
    }

    /// One reaper pass over every pool. No pool lock is held across
    /// pool iterations; retired pools are removed from the map.
    pub(crate) fn reap_once(&self) {
        let mut retired = Vec::new();
        for entry in self.pools.iter() {
            if entry.value().clean_cache_and_dispose_if_unused() {
                retired.push(entry.key().clone());
            }
        }
        for key in retired {
            if self.pools.remove(&key).is_some() {
                self.metrics.record_pool_retired();
                debug!(pool = %key, "removed retired pool");
            }
        }
    }

    /// Route one request: resolve proxy, classify, find the pool, send.
    pub(crate) async fn dispatch(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> CourierResult<Response> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CourierError::disposed("client"));
        }

        let proxy = self
            .config
            .proxy
            .as_ref()
            .and_then(|resolver| resolver.proxy_for(request.uri()));
        let key = PoolKey::classify(request.uri(), proxy.as_ref(), request.force_tunnel())?;

        let pool = self.pool_for(key.clone())?;
        match pool.send(request, true, cancel).await {
            Err(CourierError::Disposed { component })
                if !self.disposed.load(Ordering::Acquire) =>
            {
                // Raced with the reaper retiring the pool; rebuild once
                trace!(component = %component, "pool retired mid-dispatch, retrying");
                let pool = self.pool_for(key)?;
                pool.send(request, true, cancel).await
            }
            result => result,
        }
    }

    /// Look up or insert the pool for `key`, double-checked under the
    /// map's shard lock.
    pub(crate) fn pool_for(&self, key: PoolKey) -> CourierResult<Arc<ConnectionPool>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CourierError::disposed("client"));
        }

        if let Some(pool) = self.pools.get(&key) {
            if !pool.is_disposed() {
                return Ok(Arc::clone(&pool));
            }
            drop(pool);
            self.pools.remove_if(&key, |_, pool| pool.is_disposed());
        }

        let created = Arc::new(ConnectionPool::new(
            key.clone(),
            Arc::clone(&self.config),
            self.weak.clone(),
            Arc::clone(&self.metrics),
        )?);
        Ok(self.pools.entry(key).or_insert(created).clone())
    }

    /// The sibling pool that carries `CONNECT` requests to `proxy`.
    pub(crate) fn proxy_connect_pool(
        &self,
        proxy: ProxyEndpoint,
    ) -> CourierResult<Arc<ConnectionPool>> {
        self.pool_for(PoolKey::proxy_connect(proxy))
    }

    pub(crate) fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Tear down: stop the reaper and dispose every pool. Checked-out
    /// connections die on their eventual return.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reaper_cancel.cancel();
        let keys: Vec<PoolKey> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.dispose();
            }
        }
        debug!("pool manager disposed");
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.reaper_cancel.cancel();
    }
}
