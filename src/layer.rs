use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{request, Request, Response};
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Full};
use tower::{Layer, Service};

use crate::dispatch::{Downstream, GatewayCache};
use crate::error::{BoxError, DownstreamExhausted, Result};
use crate::storage::Storage;
use crate::trace::{Trace, TraceToken};

/// Cache performance counters.
///
/// Tracks lookups and outcomes for monitoring cache effectiveness; updated
/// from the dispatch trace after every request.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Lookups that found an entry.
    pub hits: AtomicU64,
    /// Lookups that found nothing.
    pub misses: AtomicU64,
    /// Responses written to storage.
    pub stores: AtomicU64,
    /// Requests forwarded without cache involvement.
    pub passes: AtomicU64,
}

impl CacheMetrics {
    /// Creates a zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache hit rate over all lookups, 0.0 to 1.0.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stores.store(0, Ordering::Relaxed);
        self.passes.store(0, Ordering::Relaxed);
    }

    fn record(&self, trace: &Trace) {
        for token in trace.tokens() {
            let counter = match token {
                TraceToken::Hit => &self.hits,
                TraceToken::Miss => &self.misses,
                TraceToken::Store => &self.stores,
                TraceToken::Pass => &self.passes,
                _ => continue,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Tower layer hosting a [`GatewayCache`] in front of an inner service.
///
/// This is a **shared cache**: anything it stores is served to every client
/// with a matching key. The `private_headers` option and the `private`
/// directive keep user-specific responses out; endpoints that need
/// per-user answers should not be routed through it at all.
pub struct CacheLayer<S: Storage> {
    cache: Arc<GatewayCache<S>>,
    metrics: Arc<CacheMetrics>,
}

impl<S: Storage> CacheLayer<S> {
    /// Wraps a configured gateway.
    pub fn new(cache: GatewayCache<S>) -> Self {
        Self { cache: Arc::new(cache), metrics: Arc::new(CacheMetrics::new()) }
    }

    /// The shared performance counters.
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Removes a specific entry by its canonical key.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.cache.storage().remove(key).await
    }

    /// Removes the entry a request would be answered from.
    pub async fn invalidate_request<B>(&self, req: &Request<B>) -> Result<()> {
        match self.cache.cache_key(req.uri(), req.headers()) {
            Some(key) => self.invalidate(&key).await,
            None => Ok(()),
        }
    }
}

impl<S: Storage> Clone for CacheLayer<S> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<Inner, S: Storage> Layer<Inner> for CacheLayer<S> {
    type Service = CacheService<Inner, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        CacheService {
            inner,
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Tower service produced by [`CacheLayer`]. The inner service is the
/// dispatcher's backend; it is invoked at most once per request, with the
/// original request body.
pub struct CacheService<Inner, S: Storage> {
    inner: Inner,
    cache: Arc<GatewayCache<S>>,
    metrics: Arc<CacheMetrics>,
}

impl<Inner: Clone, S: Storage> Clone for CacheService<Inner, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<Inner, S, ReqBody, ResBody> Service<Request<ReqBody>>
    for CacheService<Inner, S>
where
    Inner: Service<Request<ReqBody>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    Inner::Error: Into<BoxError>,
    Inner::Future: Send,
    S: Storage,
    ReqBody: Send + 'static,
    ResBody: HttpBody + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = Pin<
        Box<
            dyn Future<Output = std::result::Result<Self::Response, BoxError>>
                + Send,
        >,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        let inner = self.inner.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let downstream = ServiceDownstream { inner, body: Some(body) };
            let (response, trace) =
                cache.dispatch_traced(parts, downstream).await?;
            metrics.record(&trace);
            Ok(response.map(Full::new))
        })
    }
}

/// Adapts the wrapped tower service to the dispatcher's [`Downstream`]
/// contract. Owns the original request body, which it spends on the single
/// backend call a dispatch is allowed.
struct ServiceDownstream<Inner, B> {
    inner: Inner,
    body: Option<B>,
}

#[async_trait::async_trait]
impl<Inner, ReqBody, ResBody> Downstream for ServiceDownstream<Inner, ReqBody>
where
    Inner: Service<Request<ReqBody>, Response = Response<ResBody>> + Send,
    Inner::Error: Into<BoxError>,
    Inner::Future: Send,
    ReqBody: Send,
    ResBody: HttpBody + Send,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
{
    async fn forward(
        &mut self,
        parts: request::Parts,
    ) -> Result<Response<Bytes>> {
        let body = self.body.take().ok_or(DownstreamExhausted)?;
        let response = self
            .inner
            .call(Request::from_parts(parts, body))
            .await
            .map_err(Into::into)?;
        let (parts, body) = response.into_parts();
        let collected = body.collect().await.map_err(Into::into)?.to_bytes();
        Ok(Response::from_parts(parts, collected))
    }
}
