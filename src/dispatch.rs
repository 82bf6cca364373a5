use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{
    CACHE_CONTROL, ETAG, EXPECT, HOST, IF_MODIFIED_SINCE, IF_NONE_MATCH,
};
use http::{request, HeaderMap, HeaderName, HeaderValue, Method, Response,
    StatusCode, Uri};
use log::warn;
use url::Url;

use crate::control::CacheControl;
use crate::error::{ConfigError, Result};
use crate::meta::ResponseMeta;
use crate::rules::{RuleMatch, Rules, TtlSpec};
use crate::storage::{CacheEntry, Headers, Storage};
use crate::trace::{Trace, TraceToken};
use crate::{
    CacheOptions, KEY_HEADER, TIME_HEADER, TIME_PASS_HEADER, TRACE_HEADER,
};

/// The backend behind the cache, invoked at most once per dispatched
/// request.
///
/// `forward` receives the request head the dispatcher wants answered (the
/// original one for pass-through, a conditional or de-conditioned clone for
/// revalidation and fetching) and must return the response with its body
/// fully materialised.
#[async_trait::async_trait]
pub trait Downstream: Send {
    /// Forwards a request to the backend.
    async fn forward(
        &mut self,
        parts: request::Parts,
    ) -> Result<Response<Bytes>>;
}

/// The caching gateway: decides, per request, among pass, hit-serve,
/// revalidate, miss-fetch-store, and invalidate.
///
/// One instance serves many workers; per-request state lives in a private
/// context threaded through the dispatch calls, never in the gateway
/// itself.
#[derive(Debug)]
pub struct GatewayCache<S> {
    storage: S,
    rules: Rules,
    options: CacheOptions,
}

impl<S: Storage> GatewayCache<S> {
    /// Builds a gateway over `storage` and `rules`, validating the rule
    /// set. Misconfigured rules are a fatal initialisation error, not a
    /// runtime surprise.
    pub fn new(
        storage: S,
        rules: Rules,
    ) -> std::result::Result<Self, ConfigError> {
        rules.validate()?;
        Ok(Self { storage, rules, options: CacheOptions::default() })
    }

    /// Replaces the default options, builder style.
    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// The configured options.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// The storage backend.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The canonical cache key for a request head: lowercased scheme and
    /// host, default port elided, query kept only when `cache_queries` is
    /// on. The method is deliberately not part of the key, so HEAD is
    /// answered from a GET entry. `None` when no absolute URL can be
    /// determined for the request.
    pub fn cache_key(&self, uri: &Uri, headers: &HeaderMap) -> Option<String> {
        let mut url = canonical_url(uri, headers)?;
        if !self.options.cache_queries {
            url.set_query(None);
        }
        Some(url.to_string())
    }

    /// Dispatches one request, returning the final response with trace and
    /// timing headers attached.
    pub async fn dispatch<D: Downstream>(
        &self,
        parts: request::Parts,
        downstream: D,
    ) -> Result<Response<Bytes>> {
        let (response, _trace) = self.dispatch_traced(parts, downstream).await?;
        Ok(response)
    }

    /// As [`dispatch`](Self::dispatch), additionally handing back the
    /// trace for callers that keep their own accounting.
    pub async fn dispatch_traced<D: Downstream>(
        &self,
        parts: request::Parts,
        mut downstream: D,
    ) -> Result<(Response<Bytes>, Trace)> {
        let mut ex = Exchange::new(self.cache_key(&parts.uri, &parts.headers));
        let mut response =
            self.classify(&mut ex, parts, &mut downstream).await?;
        ex.annotate(response.headers_mut());
        Ok((response, ex.trace))
    }

    async fn classify<D: Downstream>(
        &self,
        ex: &mut Exchange,
        parts: request::Parts,
        downstream: &mut D,
    ) -> Result<Response<Bytes>> {
        if parts.method != Method::GET && parts.method != Method::HEAD {
            ex.trace.push(TraceToken::Invalidate);
            self.remove_quiet(ex.key.as_deref()).await;
            return self.pass(ex, parts, downstream).await;
        }
        if parts.headers.contains_key(EXPECT) {
            ex.trace.push(TraceToken::Expect);
            return self.pass(ex, parts, downstream).await;
        }
        if self.options.allow_reload && wants_reload(&parts.headers) {
            ex.trace.push(TraceToken::Reload);
            return self.reload(ex, parts, downstream).await;
        }
        self.lookup(ex, parts, downstream).await
    }

    async fn lookup<D: Downstream>(
        &self,
        ex: &mut Exchange,
        parts: request::Parts,
        downstream: &mut D,
    ) -> Result<Response<Bytes>> {
        ex.trace.push(TraceToken::Lookup);
        let Some(key) = ex.key.clone() else {
            return self.pass(ex, parts, downstream).await;
        };
        if !self.options.cache_queries
            && parts.uri.query().is_some_and(|query| !query.is_empty())
        {
            ex.trace.push(TraceToken::Invalidate);
            self.remove_quiet(Some(&key)).await;
            return self.pass(ex, parts, downstream).await;
        }
        let Some(rule) = self.rules.matched(parts.uri.path()) else {
            return self.pass(ex, parts, downstream).await;
        };
        if rule.ttl == TtlSpec::Invalidate {
            ex.trace.push(TraceToken::Invalidate);
            self.remove_quiet(Some(&key)).await;
            return self.pass(ex, parts, downstream).await;
        }
        let entry = match self.storage.get(&key).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!("cache get failed for {key}: {err}");
                None
            }
        };
        match entry {
            Some(entry) => {
                ex.trace.push(TraceToken::Hit);
                let stored = ResponseMeta::from_stored(&entry.response);
                if stored.is_fresh() {
                    ex.trace.push(TraceToken::Refurbish);
                    Ok(refurbish(stored))
                } else {
                    ex.trace.push(TraceToken::Validate);
                    self.validate(ex, parts, rule, stored, downstream).await
                }
            }
            None => {
                ex.trace.push(TraceToken::Miss);
                self.fetch(ex, parts, Some(rule), downstream).await
            }
        }
    }

    /// Client-forced refresh: skip the lookup, fetch, and overwrite the
    /// entry. Rules are still consulted so the stored lifetime is the one
    /// the route would normally get; unmatched or invalidating routes fetch
    /// without storing.
    async fn reload<D: Downstream>(
        &self,
        ex: &mut Exchange,
        parts: request::Parts,
        downstream: &mut D,
    ) -> Result<Response<Bytes>> {
        let rule = match self.rules.matched(parts.uri.path()) {
            Some(rule) if rule.ttl == TtlSpec::Invalidate => {
                ex.trace.push(TraceToken::Invalidate);
                self.remove_quiet(ex.key.as_deref()).await;
                None
            }
            rule => rule,
        };
        self.fetch(ex, parts, rule, downstream).await
    }

    async fn pass<D: Downstream>(
        &self,
        ex: &mut Exchange,
        parts: request::Parts,
        downstream: &mut D,
    ) -> Result<Response<Bytes>> {
        ex.trace.push(TraceToken::Pass);
        ex.forward(downstream, parts).await
    }

    /// Miss or reload: ask the backend for a full response and store it if
    /// the route and the response allow it.
    async fn fetch<D: Downstream>(
        &self,
        ex: &mut Exchange,
        parts: request::Parts,
        rule: Option<RuleMatch>,
        downstream: &mut D,
    ) -> Result<Response<Bytes>> {
        ex.trace.push(TraceToken::Fetch);
        let mut sub = parts.clone();
        sub.headers.remove(IF_MODIFIED_SINCE);
        sub.headers.remove(IF_NONE_MATCH);
        if let Some(rule) = &rule {
            apply_path(&mut sub, &rule.path);
        }
        let response = ex.forward(downstream, sub).await?;
        let meta = self.admit(&parts, response);
        let meta = match rule {
            Some(rule) => self.store(ex, &parts, meta, rule.ttl).await,
            None => meta,
        };
        Ok(meta.finalize())
    }

    /// Stale hit: revalidate against the backend with the stored
    /// validators merged into the client's.
    async fn validate<D: Downstream>(
        &self,
        ex: &mut Exchange,
        parts: request::Parts,
        rule: RuleMatch,
        mut stored: ResponseMeta,
        downstream: &mut D,
    ) -> Result<Response<Bytes>> {
        let mut sub = parts.clone();
        apply_path(&mut sub, &rule.path);

        // Last-Modified is echoed byte-for-byte; parsing and reformatting
        // it could lose the origin's exact validator.
        match stored.last_modified() {
            Some(last_modified) => {
                if let Ok(value) = HeaderValue::from_str(last_modified) {
                    sub.headers.insert(IF_MODIFIED_SINCE, value);
                }
            }
            None => {
                sub.headers.remove(IF_MODIFIED_SINCE);
            }
        }

        let client_etags = etag_list(parts.headers.get_all(IF_NONE_MATCH));
        let stored_etags = etag_list(stored.headers().get_all(ETAG));
        let mut union = client_etags.clone();
        for etag in &stored_etags {
            if !union.contains(etag) {
                union.push(etag.clone());
            }
        }
        if union.is_empty() {
            sub.headers.remove(IF_NONE_MATCH);
        } else if let Ok(value) = HeaderValue::from_str(&union.join(", ")) {
            sub.headers.insert(IF_NONE_MATCH, value);
        }

        let response = ex.forward(downstream, sub).await?;
        if response.status() != StatusCode::NOT_MODIFIED {
            // Anything else replaces or bypasses the entry; a 5xx is simply
            // not cacheable, so the stored entry survives it.
            let meta = self.admit(&parts, response);
            let meta = self.store(ex, &parts, meta, rule.ttl).await;
            return Ok(meta.finalize());
        }

        ex.trace.push(TraceToken::NotModified);
        if let Some(etag) =
            response.headers().get(ETAG).and_then(|value| value.to_str().ok())
        {
            // The backend confirmed a validator the client sent but we do
            // not hold; the 304 belongs to the client, not to our entry.
            if client_etags.iter().any(|candidate| candidate == etag)
                && !stored_etags.iter().any(|candidate| candidate == etag)
            {
                let mut meta = ResponseMeta::new(response);
                meta.make_not_modified();
                return Ok(meta.finalize());
            }
        }
        stored.merge_not_modified(response.headers());
        Ok(stored.finalize())
    }

    /// Applies the scrub list and the private-request marking, yielding the
    /// caching view of a backend response.
    fn admit(
        &self,
        request: &request::Parts,
        mut response: Response<Bytes>,
    ) -> ResponseMeta {
        for name in &self.options.scrub {
            if let Ok(name) = HeaderName::try_from(name.as_str()) {
                response.headers_mut().remove(name);
            }
        }
        let mut meta = ResponseMeta::new(response);
        if !meta.control().public && self.request_is_private(request) {
            meta.control_mut().private = true;
        }
        meta
    }

    fn request_is_private(&self, request: &request::Parts) -> bool {
        self.options.private_headers.iter().any(|name| {
            HeaderName::try_from(name.as_str())
                .map(|name| request.headers.contains_key(name))
                .unwrap_or(false)
        })
    }

    /// Arbitrates the rule lifetime against the origin's and stores the
    /// response when cacheable. The lifetime is applied to a candidate
    /// first, so responses that end up not stored are served untouched.
    /// Storage failures are logged and otherwise ignored; serving never
    /// hinges on cache health.
    async fn store(
        &self,
        ex: &mut Exchange,
        request: &request::Parts,
        meta: ResponseMeta,
        ttl: TtlSpec,
    ) -> ResponseMeta {
        let Some(key) = ex.key.clone() else { return meta };
        let mut candidate = meta.clone();
        let lifetime = if candidate.is_must_revalidate() {
            // Origin wins: its own lifetime governs, untouched.
            candidate.ttl().filter(|ttl| *ttl > 0).map(|ttl| ttl as u64)
        } else {
            match ttl.resolve(candidate.ttl()) {
                Some(seconds) => {
                    candidate.set_ttl(seconds);
                    Some(seconds)
                }
                None => candidate
                    .ttl()
                    .filter(|ttl| *ttl > 0)
                    .map(|ttl| ttl as u64),
            }
        };
        if !candidate.is_cacheable() {
            return meta;
        }
        ex.trace.push(TraceToken::Store);
        let entry = CacheEntry {
            request_headers: Headers::from(&request.headers),
            response: candidate.to_stored(),
        };
        if let Err(err) = self
            .storage
            .set(key.clone(), entry, lifetime.map(Duration::from_secs))
            .await
        {
            warn!("cache set failed for {key}: {err}");
        }
        candidate
    }

    async fn remove_quiet(&self, key: Option<&str>) {
        let Some(key) = key else { return };
        if let Err(err) = self.storage.remove(key).await {
            warn!("cache remove failed for {key}: {err}");
        }
    }
}

/// Fresh hit: serve the stored response with its age recomputed from the
/// stored `Date` and the current clock.
fn refurbish(mut stored: ResponseMeta) -> Response<Bytes> {
    stored.refresh_age();
    stored.finalize()
}

/// Per-request dispatcher context: the canonical key, the trace buffer, and
/// the timing state. Never shared across requests.
struct Exchange {
    key: Option<String>,
    trace: Trace,
    started: Instant,
    backend: Option<Duration>,
}

impl Exchange {
    fn new(key: Option<String>) -> Self {
        Self { key, trace: Trace::new(), started: Instant::now(), backend: None }
    }

    async fn forward<D: Downstream>(
        &mut self,
        downstream: &mut D,
        parts: request::Parts,
    ) -> Result<Response<Bytes>> {
        let started = Instant::now();
        let result = downstream.forward(parts).await;
        *self.backend.get_or_insert(Duration::ZERO) += started.elapsed();
        result
    }

    /// Writes the trace, key, and timing headers. Backend time is reported
    /// separately and subtracted from the total.
    fn annotate(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.trace.header_value()) {
            headers.insert(TRACE_HEADER, value);
        }
        if let Some(key) = &self.key {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(KEY_HEADER, value);
            }
        }
        let backend = self.backend.unwrap_or_default();
        let own = self.started.elapsed().saturating_sub(backend);
        if let Ok(value) = HeaderValue::from_str(&own.as_micros().to_string())
        {
            headers.insert(TIME_HEADER, value);
        }
        if let Some(backend) = self.backend {
            if let Ok(value) =
                HeaderValue::from_str(&backend.as_micros().to_string())
            {
                headers.insert(TIME_PASS_HEADER, value);
            }
        }
    }
}

/// Reconstructs the absolute request URL: the URI itself when absolute,
/// otherwise `Host` plus a scheme inferred from forwarding headers (with
/// localhost assumed plain http). The `url` crate lowercases scheme and
/// host and elides default ports, which is exactly the canonical form the
/// cache key needs.
fn canonical_url(uri: &Uri, headers: &HeaderMap) -> Option<Url> {
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }
    let host = headers.get(HOST)?.to_str().ok()?;
    let scheme = scheme_for(host, headers);
    let mut url = Url::parse(&format!("{scheme}://{host}/")).ok()?;
    if let Some(path_and_query) = uri.path_and_query() {
        url.set_path(path_and_query.path());
        url.set_query(path_and_query.query());
    }
    Some(url)
}

fn scheme_for(host: &str, headers: &HeaderMap) -> &'static str {
    if let Some(proto) = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
    {
        return if proto.eq_ignore_ascii_case("http") { "http" } else { "https" };
    }
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    }
}

/// Did the client ask for a reload? Only `Cache-Control: no-cache` counts;
/// the option gate lives at the call site.
fn wants_reload(headers: &HeaderMap) -> bool {
    headers.get_all(CACHE_CONTROL).iter().any(|value| {
        value
            .to_str()
            .map(|value| CacheControl::parse(value).no_cache)
            .unwrap_or(false)
    })
}

/// Swaps the path of a request head, keeping scheme, authority, and query
/// intact. Used when a rewrite matcher renamed the route.
fn apply_path(parts: &mut request::Parts, path: &str) {
    if parts.uri.path() == path {
        return;
    }
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    };
    let mut builder = Uri::builder();
    if let Some(scheme) = parts.uri.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = parts.uri.authority() {
        builder = builder.authority(authority.clone());
    }
    if let Ok(uri) = builder.path_and_query(path_and_query).build() {
        parts.uri = uri;
    }
}

/// Parses a comma-separated validator list, preserving order and dropping
/// duplicates. Quoted commas are not handled; a malformed list simply
/// yields odd tags, which at worst costs a revalidation.
fn etag_list<'a>(
    values: impl IntoIterator<Item = &'a HeaderValue>,
) -> Vec<String> {
    let mut etags: Vec<String> = Vec::new();
    for value in values {
        let Ok(value) = value.to_str() else { continue };
        for tag in value.split(',') {
            let tag = tag.trim();
            if !tag.is_empty() && !etags.iter().any(|seen| seen == tag) {
                etags.push(tag.to_owned());
            }
        }
    }
    etags
}
