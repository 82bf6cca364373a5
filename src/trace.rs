use std::fmt;

/// A dispatcher state, recorded as it is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceToken {
    /// The cache was consulted for this request.
    Lookup,
    /// Storage held an entry for the key.
    Hit,
    /// Storage held nothing for the key.
    Miss,
    /// The backend was asked for a full response.
    Fetch,
    /// The fetched response was written to storage.
    Store,
    /// The request was forwarded without cache involvement.
    Pass,
    /// The entry for the key was removed.
    Invalidate,
    /// An `Expect` header forced the request through untouched.
    Expect,
    /// A client reload bypassed the lookup.
    Reload,
    /// A stale entry was revalidated against the backend.
    Validate,
    /// The backend confirmed the stale entry with a 304.
    NotModified,
    /// A fresh entry was served with its age recomputed.
    Refurbish,
}

impl TraceToken {
    /// The token as it appears in the trace header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Fetch => "fetch",
            Self::Store => "store",
            Self::Pass => "pass",
            Self::Invalidate => "invalidate",
            Self::Expect => "expect",
            Self::Reload => "reload",
            Self::Validate => "validate",
            Self::NotModified => "notmodified",
            Self::Refurbish => "refurbish",
        }
    }
}

impl fmt::Display for TraceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-local, append-only record of the states the dispatcher entered,
/// in order. Emitted on the response as a diagnostic header; never shared
/// across requests.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    tokens: Vec<TraceToken>,
}

impl Trace {
    /// Creates an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token.
    pub fn push(&mut self, token: TraceToken) {
        self.tokens.push(token);
    }

    /// The recorded tokens, in entry order.
    pub fn tokens(&self) -> &[TraceToken] {
        &self.tokens
    }

    /// Whether a state was entered.
    pub fn contains(&self, token: TraceToken) -> bool {
        self.tokens.contains(&token)
    }

    /// The comma-joined header rendition.
    pub fn header_value(&self) -> String {
        self.tokens
            .iter()
            .map(TraceToken::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}
