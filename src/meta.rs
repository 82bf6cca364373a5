use std::time::SystemTime;

use bytes::Bytes;
use http::header::{
    AGE, ALLOW, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LANGUAGE,
    CONTENT_LENGTH, CONTENT_TYPE, DATE, ETAG, EXPIRES, LAST_MODIFIED, VARY,
};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};

use crate::control::CacheControl;
use crate::storage::{Headers, StoredResponse};

/// Statuses a shared cache may store (RFC 2616 §13.4).
const CACHEABLE_STATUS: [u16; 7] = [200, 203, 300, 301, 302, 404, 410];

/// Headers that must not appear on a `304 Not Modified` (RFC 2616 §10.3.5).
fn not_modified_strip() -> [HeaderName; 7] {
    [
        ALLOW,
        CONTENT_ENCODING,
        CONTENT_LANGUAGE,
        CONTENT_LENGTH,
        HeaderName::from_static("content-md5"),
        CONTENT_TYPE,
        LAST_MODIFIED,
    ]
}

/// A caching view over a raw response triple `(status, headers, body)`.
///
/// Parses `Cache-Control` once at construction and freezes the clock
/// reading, so every freshness computation against this response uses the
/// same `now`. The directive map is only re-serialised into a header when
/// the response is handed back out via [`finalize`](Self::finalize).
///
/// All date handling fails soft: a malformed date reads as absent, and the
/// cacheability predicates answer `false` on anything they cannot prove.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    control: CacheControl,
    now: SystemTime,
}

impl ResponseMeta {
    /// Wraps a response, reading the clock now.
    pub fn new(response: Response<Bytes>) -> Self {
        Self::at(response, SystemTime::now())
    }

    /// Wraps a response against an explicit clock reading.
    pub fn at(response: Response<Bytes>, now: SystemTime) -> Self {
        let (parts, body) = response.into_parts();
        let control = CacheControl::from_headers(&parts.headers);
        Self { status: parts.status, headers: parts.headers, body, control, now }
    }

    /// Rehydrates the view from a stored response, against the current
    /// clock.
    pub fn from_stored(stored: &StoredResponse) -> Self {
        let mut response = Response::new(Bytes::from(stored.body.clone()));
        *response.status_mut() = StatusCode::from_u16(stored.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *response.headers_mut() = stored.headers.to_header_map();
        Self::new(response)
    }

    /// The persistable form of this response, with the directive map
    /// written through so stored copies carry any lifetime applied to them.
    pub fn to_stored(&self) -> StoredResponse {
        let mut headers = self.headers.clone();
        write_control(&mut headers, &self.control);
        StoredResponse {
            status: self.status.as_u16(),
            headers: Headers::from(&headers),
            body: self.body.to_vec(),
        }
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers. `Cache-Control` may be stale here; the parsed
    /// directive map is authoritative until `finalize`.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The parsed directive map.
    pub fn control(&self) -> &CacheControl {
        &self.control
    }

    /// Mutable access to the directive map.
    pub fn control_mut(&mut self) -> &mut CacheControl {
        &mut self.control
    }

    fn header_str(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    fn date_header(&self, name: HeaderName) -> Option<SystemTime> {
        self.header_str(name)
            .and_then(|value| httpdate::parse_http_date(value).ok())
    }

    fn set_date_header(&mut self, name: HeaderName, instant: SystemTime) {
        if let Ok(value) =
            HeaderValue::from_str(&httpdate::fmt_http_date(instant))
        {
            self.headers.insert(name, value);
        }
    }

    /// `Date`, parsed per RFC 1123.
    pub fn date(&self) -> Option<SystemTime> {
        self.date_header(DATE)
    }

    /// Sets `Date`.
    pub fn set_date(&mut self, instant: SystemTime) {
        self.set_date_header(DATE, instant);
    }

    /// `Expires`, parsed per RFC 1123.
    pub fn expires(&self) -> Option<SystemTime> {
        self.date_header(EXPIRES)
    }

    /// Sets `Expires`.
    pub fn set_expires(&mut self, instant: SystemTime) {
        self.set_date_header(EXPIRES, instant);
    }

    /// `ETag`, byte-opaque.
    pub fn etag(&self) -> Option<&str> {
        self.header_str(ETAG)
    }

    /// Sets `ETag`.
    pub fn set_etag(&mut self, etag: &str) {
        if let Ok(value) = HeaderValue::from_str(etag) {
            self.headers.insert(ETAG, value);
        }
    }

    /// `Vary`, byte-opaque. Tracked for future variant selection only.
    pub fn vary(&self) -> Option<&str> {
        self.header_str(VARY)
    }

    /// Sets `Vary`.
    pub fn set_vary(&mut self, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(VARY, value);
        }
    }

    /// `Last-Modified`, byte-opaque. Deliberately never parsed to an
    /// instant: the stored bytes are compared and echoed verbatim so the
    /// origin's validator survives intact.
    pub fn last_modified(&self) -> Option<&str> {
        self.header_str(LAST_MODIFIED)
    }

    /// Sets `Last-Modified`.
    pub fn set_last_modified(&mut self, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(LAST_MODIFIED, value);
        }
    }

    /// Current age in seconds: the `Age` header if present, otherwise
    /// `now − Date` clamped at zero, otherwise zero.
    pub fn age(&self) -> u64 {
        if let Some(age) =
            self.header_str(AGE).and_then(|value| value.trim().parse().ok())
        {
            return age;
        }
        match self.date() {
            Some(date) => self
                .now
                .duration_since(date)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Sets the `Age` header.
    pub fn set_age(&mut self, seconds: u64) {
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            self.headers.insert(AGE, value);
        }
    }

    /// Drops any stored `Age` and recomputes it from `Date` and the clock.
    pub fn refresh_age(&mut self) {
        self.headers.remove(AGE);
        let age = self.age();
        self.set_age(age);
    }

    /// Freshness lifetime in seconds. `s-maxage` wins over `max-age`; with
    /// neither, falls back to `Expires − Date` (or `Expires − now` when
    /// `Date` is absent), clamped at zero.
    pub fn max_age(&self) -> Option<u64> {
        if let Some(seconds) = self.control.s_maxage {
            return Some(seconds);
        }
        if let Some(seconds) = self.control.max_age {
            return Some(seconds);
        }
        let expires = self.expires()?;
        let from = self.date().unwrap_or(self.now);
        Some(
            expires
                .duration_since(from)
                .map(|remaining| remaining.as_secs())
                .unwrap_or(0),
        )
    }

    /// Remaining lifetime, `max_age − age`; negative once stale, `None`
    /// when no lifetime is declared.
    pub fn ttl(&self) -> Option<i64> {
        self.max_age().map(|max_age| max_age as i64 - self.age() as i64)
    }

    /// Extends the lifetime to `seconds` from now by writing
    /// `s-maxage = age + seconds` into the directive map.
    pub fn set_ttl(&mut self, seconds: u64) {
        self.control.s_maxage = Some(self.age() + seconds);
    }

    /// A response is fresh while it has remaining lifetime.
    pub fn is_fresh(&self) -> bool {
        matches!(self.ttl(), Some(ttl) if ttl > 0)
    }

    /// A response can answer a conditional request if it carries a
    /// validator.
    pub fn is_validateable(&self) -> bool {
        self.headers.contains_key(LAST_MODIFIED)
            || self.headers.contains_key(ETAG)
    }

    /// Whether a shared cache may store this response.
    pub fn is_cacheable(&self) -> bool {
        CACHEABLE_STATUS.contains(&self.status.as_u16())
            && !self.control.no_store
            && !self.control.private
            && (self.is_validateable() || self.is_fresh())
    }

    /// Whether the origin forbids serving this response stale.
    pub fn is_must_revalidate(&self) -> bool {
        self.control.must_revalidate || self.control.proxy_revalidate
    }

    /// Forces the response stale by driving its age up to `max_age`.
    pub fn expire(&mut self) {
        if self.is_fresh() {
            if let Some(max_age) = self.max_age() {
                self.set_age(max_age);
            }
        }
    }

    /// Rewrites the response into a conformant `304 Not Modified`: status,
    /// empty body, and none of the entity headers forbidden on a 304.
    pub fn make_not_modified(&mut self) {
        self.status = StatusCode::NOT_MODIFIED;
        self.body = Bytes::new();
        for name in not_modified_strip() {
            self.headers.remove(name);
        }
    }

    /// Adopts the revalidation headers of a `304 Not Modified` response:
    /// `Date`, `Expires`, `Cache-Control`, `ETag`, and `Last-Modified` are
    /// copied by name where present, any stale `Age` is dropped, and the
    /// directive map is re-parsed from the merged headers.
    pub fn merge_not_modified(&mut self, fresh: &HeaderMap) {
        for name in [DATE, EXPIRES, CACHE_CONTROL, ETAG, LAST_MODIFIED] {
            if let Some(value) = fresh.get(&name) {
                self.headers.insert(name, value.clone());
            }
        }
        self.headers.remove(AGE);
        self.control = CacheControl::from_headers(&self.headers);
    }

    /// Re-serialises the directive map into the `Cache-Control` header
    /// (dropping the header when the map is empty) and hands the response
    /// back.
    pub fn finalize(mut self) -> Response<Bytes> {
        write_control(&mut self.headers, &self.control);
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

fn write_control(headers: &mut HeaderMap, control: &CacheControl) {
    match control.to_header_value() {
        Some(value) => {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(CACHE_CONTROL, value);
            }
        }
        None => {
            headers.remove(CACHE_CONTROL);
        }
    }
}
