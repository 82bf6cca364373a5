use std::collections::HashMap;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Case-insensitive, serialisable header multimap.
///
/// The persisted counterpart of [`http::HeaderMap`]: names are normalised to
/// lowercase and every value for a name is kept, so entries survive a trip
/// through any serde-based storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, Vec<String>>);

impl Headers {
    /// Creates an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any existing values for that name.
    pub fn insert(&mut self, name: &str, value: String) {
        self.0.insert(name.to_ascii_lowercase(), vec![value]);
    }

    /// Appends a value, preserving existing values for the same name.
    pub fn append(&mut self, name: &str, value: String) {
        self.0.entry(name.to_ascii_lowercase()).or_default().push(value);
    }

    /// Returns the first value for a name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Returns every value for a name.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Removes a name and all its values.
    pub fn remove(&mut self, name: &str) {
        self.0.remove(&name.to_ascii_lowercase());
    }

    /// Checks whether a name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Iterates over `(name, value)` pairs, one pair per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(name, values)| {
            values.iter().map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// Converts back into an [`http::HeaderMap`], skipping values that are
    /// not valid header material.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in self.iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }
}

impl From<&HeaderMap> for Headers {
    fn from(headers: &HeaderMap) -> Self {
        let mut converted = Self::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                converted.append(name.as_str(), value.to_owned());
            }
        }
        converted
    }
}

/// The persisted form of an HTTP response: the raw triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers as they were stored.
    pub headers: Headers,
    /// Fully materialised response body.
    pub body: Vec<u8>,
}

/// A cache record: the stored response plus the request headers it was
/// stored under. The request headers are kept to feed future `Vary`
/// negotiation; nothing reads them yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Headers of the request that produced the stored response.
    pub request_headers: Headers,
    /// The stored response triple.
    pub response: StoredResponse,
}

/// A trait providing methods for storing, reading, and removing cache
/// records.
///
/// `ttl` is the freshness lifetime the dispatcher resolved for the entry;
/// `None` means the entry carries no lifetime of its own (it is retained for
/// its validators). How the lifetime is enforced is up to the backend.
/// Implementations are expected to be safe to share across workers; the
/// dispatcher does not serialise access.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Attempts to pull a cached entry. Absent on miss.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    /// Attempts to store an entry under `key` for `ttl`.
    async fn set(
        &self,
        key: String,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<()>;
    /// Attempts to remove an entry. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
