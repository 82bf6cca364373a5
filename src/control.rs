use std::collections::BTreeMap;

use http::header::CACHE_CONTROL;
use http::HeaderMap;

/// Parsed `Cache-Control` directive map (RFC 2616 §14.9).
///
/// Known directives get typed fields; anything else is preserved in
/// `extensions` and re-emitted verbatim. Parsing is fail-soft: malformed
/// numeric values are treated as absent, empty tokens are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `no-store`: the response must not be written to any cache.
    pub no_store: bool,
    /// `no-cache`: the response must be revalidated before use.
    pub no_cache: bool,
    /// `private`: the response is for a single user only.
    pub private: bool,
    /// `public`: the response may be stored by shared caches.
    pub public: bool,
    /// `must-revalidate`: stale copies must not be served.
    pub must_revalidate: bool,
    /// `proxy-revalidate`: as `must-revalidate`, for shared caches only.
    pub proxy_revalidate: bool,
    /// `max-age` in seconds.
    pub max_age: Option<u64>,
    /// `s-maxage` in seconds; takes precedence over `max-age` here.
    pub s_maxage: Option<u64>,
    extensions: BTreeMap<String, Option<String>>,
}

impl CacheControl {
    /// Parses a single `Cache-Control` header value.
    pub fn parse(value: &str) -> Self {
        let mut control = Self::default();
        control.absorb(value);
        control
    }

    /// Parses every `Cache-Control` value present in `headers` into one map.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut control = Self::default();
        for value in headers.get_all(CACHE_CONTROL) {
            if let Ok(value) = value.to_str() {
                control.absorb(value);
            }
        }
        control
    }

    fn absorb(&mut self, value: &str) {
        for token in value.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, directive_value) = match token.split_once('=') {
                Some((name, value)) => {
                    (name.trim().to_ascii_lowercase(), Some(value.trim()))
                }
                None => (token.to_ascii_lowercase(), None),
            };
            match name.as_str() {
                "no-store" => self.no_store = true,
                "no-cache" => self.no_cache = true,
                "private" => self.private = true,
                "public" => self.public = true,
                "must-revalidate" => self.must_revalidate = true,
                "proxy-revalidate" => self.proxy_revalidate = true,
                "max-age" => {
                    self.max_age = directive_value.and_then(parse_seconds)
                }
                "s-maxage" => {
                    self.s_maxage = directive_value.and_then(parse_seconds)
                }
                _ => {
                    self.extensions
                        .insert(name, directive_value.map(str::to_owned));
                }
            }
        }
    }

    /// Returns the value of an unknown (extension) directive, if present.
    /// The outer `Option` is presence, the inner one whether the directive
    /// carried a value.
    pub fn extension(&self, name: &str) -> Option<Option<&str>> {
        self.extensions
            .get(&name.to_ascii_lowercase())
            .map(|value| value.as_deref())
    }

    /// True when no directive at all is set.
    pub fn is_empty(&self) -> bool {
        !self.no_store
            && !self.no_cache
            && !self.private
            && !self.public
            && !self.must_revalidate
            && !self.proxy_revalidate
            && self.max_age.is_none()
            && self.s_maxage.is_none()
            && self.extensions.is_empty()
    }

    /// Re-serialises the directive map into a header value, or `None` when
    /// the map is empty (the header is then not emitted at all).
    pub fn to_header_value(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut directives = Vec::new();
        if self.public {
            directives.push("public".to_owned());
        }
        if self.private {
            directives.push("private".to_owned());
        }
        if self.no_cache {
            directives.push("no-cache".to_owned());
        }
        if self.no_store {
            directives.push("no-store".to_owned());
        }
        if let Some(secs) = self.max_age {
            directives.push(format!("max-age={secs}"));
        }
        if let Some(secs) = self.s_maxage {
            directives.push(format!("s-maxage={secs}"));
        }
        if self.must_revalidate {
            directives.push("must-revalidate".to_owned());
        }
        if self.proxy_revalidate {
            directives.push("proxy-revalidate".to_owned());
        }
        for (name, value) in &self.extensions {
            match value {
                Some(value) => directives.push(format!("{name}={value}")),
                None => directives.push(name.clone()),
            }
        }
        Some(directives.join(", "))
    }
}

fn parse_seconds(value: &str) -> Option<u64> {
    value.trim().trim_matches('"').parse().ok()
}
