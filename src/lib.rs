#![forbid(unsafe_code, future_incompatible)]
#![deny(missing_docs, nonstandard_style, unused_qualifications)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A shared ("proxy") HTTP response caching middleware.
//!
//! Sits between a client or upstream reverse proxy and a backend service,
//! intercepts GET/HEAD requests, and answers them from a pluggable
//! key-value store when HTTP freshness and validation rules permit, falling
//! back to the backend otherwise. It implements the shared-cache subset of
//! RFC 2616 §13: freshness from `Cache-Control`/`Expires`, conditional
//! revalidation with `If-Modified-Since`/`If-None-Match`, request-driven
//! invalidation on unsafe methods, pass-through of uncacheable traffic, and
//! per-route TTL rules.
//!
//! # Basic usage
//!
//! ```rust
//! # #[cfg(feature = "manager-moka")]
//! # fn main() -> Result<(), http_cache_gateway::ConfigError> {
//! use http_cache_gateway::{
//!     CacheLayer, GatewayCache, Matcher, MokaStorage, Rules, TtlSpec,
//! };
//!
//! let rules = Rules::new()
//!     // more specific rules first; the first match wins
//!     .push(Matcher::path("^/feeds").unwrap(), TtlSpec::Invalidate)
//!     .push(Matcher::path("^/").unwrap(), TtlSpec::Fixed(300));
//!
//! let cache = GatewayCache::new(MokaStorage::default(), rules)?;
//! let layer = CacheLayer::new(cache);
//! // wrap any tower service: layer.layer(my_service)
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "manager-moka"))]
//! # fn main() {}
//! ```
//!
//! # Dispatch outcomes
//!
//! Every response carries an `x-plack-cache` header listing the dispatcher
//! states the request went through (`lookup, hit, refurbish`, `lookup,
//! miss, fetch, store`, and so on), along with the canonical key and
//! timing headers. Routes not covered by a rule pass straight through.
//!
//! # Caveats
//!
//! This is a shared cache: anything stored is served to every client whose
//! request maps to the same key. Responses marked `private` or `no-store`
//! are never stored, and requests carrying one of the configured
//! `private_headers` (by default `Authorization` and `Cookie`) mark the
//! response private unless it explicitly declares `public`. Response
//! bodies are fully materialised before storage; this middleware is not
//! meant for endpoints that stream.
//!
//! # Features
//!
//! - `manager-moka` (default): enable [`MokaStorage`], an in-memory
//!   [moka](https://github.com/moka-rs/moka)-backed storage manager.

mod control;
mod dispatch;
mod error;
mod layer;
mod managers;
mod meta;
mod rules;
mod storage;
mod trace;

pub use control::CacheControl;
pub use dispatch::{Downstream, GatewayCache};
pub use error::{BoxError, ConfigError, DownstreamExhausted, Result};
pub use layer::{CacheLayer, CacheMetrics, CacheService};
pub use meta::ResponseMeta;
pub use rules::{Matcher, RewriteFn, Rule, RuleMatch, Rules, TtlSpec};
pub use storage::{CacheEntry, Headers, Storage, StoredResponse};
pub use trace::{Trace, TraceToken};

#[cfg(feature = "manager-moka")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
pub use managers::moka::MokaStorage;

/// `x-plack-cache` header: the comma-joined dispatcher trace.
pub const TRACE_HEADER: &str = "x-plack-cache";
/// `x-plack-cache-key` header: the canonical cache key of the request.
pub const KEY_HEADER: &str = "x-plack-cache-key";
/// `x-plack-cache-time` header: microseconds spent in the middleware,
/// backend time excluded.
pub const TIME_HEADER: &str = "x-plack-cache-time";
/// `x-plack-cache-time-pass` header: microseconds spent in the backend;
/// only present when the backend was called.
pub const TIME_PASS_HEADER: &str = "x-plack-cache-time-pass";

/// Behavioural knobs of the dispatcher. Storage and rules are constructor
/// arguments of [`GatewayCache`]; everything else lives here.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Header names stripped from backend responses before they are
    /// wrapped, stored, or served.
    pub scrub: Vec<String>,
    /// When `false` (the default), requests with a query string bypass the
    /// cache (invalidating the query-less key) and keys never include the
    /// query. When `true`, the query is part of the canonical key.
    pub cache_queries: bool,
    /// When `true`, a client `Cache-Control: no-cache` skips the lookup
    /// and refreshes the entry from the backend. Off by default; the
    /// directive is ignored then.
    pub allow_reload: bool,
    /// Request headers whose presence marks the response `private` (and
    /// therefore uncacheable) unless the response declares `public`.
    pub private_headers: Vec<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            scrub: Vec::new(),
            cache_queries: false,
            allow_reload: false,
            private_headers: vec![
                "authorization".to_owned(),
                "cookie".to_owned(),
            ],
        }
    }
}

#[cfg(test)]
mod test;
