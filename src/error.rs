use std::fmt;

use thiserror::Error;

/// Generic error type for the gateway cache middleware.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` typedef to use with the [`BoxError`] type
pub type Result<T> = std::result::Result<T, BoxError>;

/// Error type for a second backend invocation within one request.
///
/// The dispatcher calls the backend at most once per request; the adapter
/// that owns the original request body reports this if that contract is
/// violated.
#[derive(Debug, Default, Copy, Clone)]
pub struct DownstreamExhausted;

impl fmt::Display for DownstreamExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Backend already invoked for this request")
    }
}

impl std::error::Error for DownstreamExhausted {}

/// Fatal rule-set misconfiguration, reported at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A clamp rule whose lower bound exceeds its upper bound.
    #[error("rule {index}: clamp range is inverted ({min} > {max})")]
    InvertedClamp {
        /// Position of the offending rule in the rule list.
        index: usize,
        /// Lower bound of the clamp.
        min: u64,
        /// Upper bound of the clamp.
        max: u64,
    },
    /// A fixed TTL of zero seconds; use an invalidating rule instead.
    #[error("rule {index}: fixed ttl must be positive")]
    ZeroTtl {
        /// Position of the offending rule in the rule list.
        index: usize,
    },
}
