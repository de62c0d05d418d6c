//! Send chain and client facade
//!
//! Behaviors compose as an explicit chain: each layer implements
//! [`SendHandler`] and owns the next one, and the pool manager sits at
//! the tail. The [`Client`] is a thin facade over the chain plus the
//! manager's lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{CourierResult, PoolMetricsSnapshot};
use http::Uri;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::manager::PoolManager;
use crate::request::Request;
use crate::response::Response;

/// One layer of the send chain.
#[async_trait]
pub trait SendHandler: Send + Sync {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> CourierResult<Response>;
}

#[async_trait]
impl SendHandler for PoolManager {
    async fn send(&self, request: Request, cancel: &CancellationToken) -> CourierResult<Response> {
        self.dispatch(&request, cancel).await
    }
}

/// Wraps an inner handler into an outer one.
type Layer = Box<dyn FnOnce(Arc<dyn SendHandler>) -> Arc<dyn SendHandler>>;

/// Builder for a [`Client`] with optional middleware layers.
pub struct ClientBuilder {
    config: ClientConfig,
    layers: Vec<Layer>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            layers: Vec::new(),
        }
    }

    /// Add a middleware layer. Layers wrap outward: the last one added
    /// sees the request first.
    pub fn layer(
        mut self,
        wrap: impl FnOnce(Arc<dyn SendHandler>) -> Arc<dyn SendHandler> + 'static,
    ) -> Self {
        self.layers.push(Box::new(wrap));
        self
    }

    /// Build the client. Must run inside a tokio runtime (the manager
    /// spawns its reaper task).
    pub fn build(self) -> CourierResult<Client> {
        let manager = PoolManager::new(self.config)?;
        let mut chain: Arc<dyn SendHandler> = manager.clone();
        for wrap in self.layers {
            chain = wrap(chain);
        }
        Ok(Client { chain, manager })
    }
}

/// HTTP/1.1 client over pooled connections.
pub struct Client {
    chain: Arc<dyn SendHandler>,
    manager: Arc<PoolManager>,
}

impl Client {
    /// Build a client with no extra middleware.
    pub fn new(config: ClientConfig) -> CourierResult<Self> {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub async fn send(&self, request: Request) -> CourierResult<Response> {
        self.send_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn send_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> CourierResult<Response> {
        self.chain.send(request, cancel).await
    }

    pub async fn get(&self, uri: Uri) -> CourierResult<Response> {
        self.send(Request::get(uri)).await
    }

    /// Snapshot of the pool counters.
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.manager.metrics().snapshot()
    }

    /// Number of live pools.
    pub fn active_pools(&self) -> usize {
        self.manager.pool_count()
    }

    /// Tear the client down: every pool is disposed, idle connections
    /// die now and checked-out ones on their eventual return. Dropping
    /// the client does the same.
    pub fn dispose(&self) {
        self.manager.dispose();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.manager.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use http::{HeaderMap, StatusCode, Version};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tail;

    #[async_trait]
    impl SendHandler for Tail {
        async fn send(
            &self,
            _request: Request,
            _cancel: &CancellationToken,
        ) -> CourierResult<Response> {
            Ok(Response::new(
                StatusCode::OK,
                Version::HTTP_11,
                HeaderMap::new(),
                Body::empty(),
            ))
        }
    }

    struct Tagging {
        inner: Arc<dyn SendHandler>,
        order: Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    }

    use parking_lot::Mutex;

    #[async_trait]
    impl SendHandler for Tagging {
        async fn send(
            &self,
            request: Request,
            cancel: &CancellationToken,
        ) -> CourierResult<Response> {
            self.order.lock().push(self.tag);
            self.inner.send(request, cancel).await
        }
    }

    #[tokio::test]
    async fn test_layers_wrap_outward() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut chain: Arc<dyn SendHandler> = Arc::new(Tail);
        for tag in ["inner", "outer"] {
            chain = Arc::new(Tagging {
                inner: chain,
                order: Arc::clone(&order),
                tag,
            });
        }

        let cancel = CancellationToken::new();
        let response = chain
            .send(Request::get("http://example.com/".parse().unwrap()), &cancel)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn test_counting_middleware_sees_every_send() {
        struct Counting {
            inner: Arc<dyn SendHandler>,
            count: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl SendHandler for Counting {
            async fn send(
                &self,
                request: Request,
                cancel: &CancellationToken,
            ) -> CourierResult<Response> {
                self.count.fetch_add(1, Ordering::Relaxed);
                self.inner.send(request, cancel).await
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let client = Client::builder(ClientConfig::default())
            .layer(move |inner| {
                Arc::new(Counting {
                    inner,
                    count: count_clone,
                })
            })
            .build()
            .unwrap();

        // The chain is exercised even though the dispatch itself fails
        // (nothing is listening on this URI)
        let _ = client
            .send(Request::get("http://127.0.0.1:1/".parse().unwrap()))
            .await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
