use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::error::ConfigError;

/// A path predicate that may rewrite the path it matched.
///
/// The closure receives a mutable copy of the request path; returning `true`
/// selects the rule, and any edit made to the copy becomes the path the
/// backend sees. Edits from non-matching invocations are discarded.
pub type RewriteFn = Arc<dyn Fn(&mut String) -> bool + Send + Sync>;

/// How a rule decides whether it applies to a request path.
#[derive(Clone)]
pub enum Matcher {
    /// Test the path against a regular expression.
    Path(Regex),
    /// Invoke a user-supplied predicate; see [`RewriteFn`].
    Rewrite(RewriteFn),
}

impl Matcher {
    /// Shorthand for a regex matcher.
    pub fn path(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Path(Regex::new(pattern)?))
    }

    /// Shorthand for a predicate matcher.
    pub fn rewrite<F>(predicate: F) -> Self
    where
        F: Fn(&mut String) -> bool + Send + Sync + 'static,
    {
        Self::Rewrite(Arc::new(predicate))
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(regex) => {
                f.debug_tuple("Path").field(&regex.as_str()).finish()
            }
            Self::Rewrite(_) => f.write_str("Rewrite(..)"),
        }
    }
}

/// A user-supplied lifetime directive for matched routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlSpec {
    /// Cache for exactly this many seconds, overriding the origin.
    Fixed(u64),
    /// Force the entry out of the cache and pass the request through.
    Invalidate,
    /// Keep the origin's lifetime, clamped into the given bounds. When the
    /// origin declares no lifetime, `min` applies.
    Clamp {
        /// Lower bound in seconds.
        min: Option<u64>,
        /// Upper bound in seconds.
        max: Option<u64>,
    },
}

impl TtlSpec {
    /// Resolves the lifetime to store under, given the lifetime the
    /// response itself declares. `None` means the spec leaves no lifetime
    /// to apply.
    pub(crate) fn resolve(&self, declared: Option<i64>) -> Option<u64> {
        match *self {
            Self::Fixed(seconds) => Some(seconds),
            Self::Invalidate => None,
            Self::Clamp { min, max } => {
                match declared.filter(|ttl| *ttl > 0) {
                    Some(ttl) => {
                        let mut ttl = ttl as u64;
                        if let Some(min) = min {
                            ttl = ttl.max(min);
                        }
                        if let Some(max) = max {
                            ttl = ttl.min(max);
                        }
                        Some(ttl)
                    }
                    None => min,
                }
            }
        }
    }
}

/// One `(matcher, ttl)` pair.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Decides whether the rule applies.
    pub matcher: Matcher,
    /// What to do with matching routes.
    pub ttl: TtlSpec,
}

/// The outcome of a successful rule match.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// The matched rule's lifetime directive.
    pub ttl: TtlSpec,
    /// The request path after any rewrite the matcher performed.
    pub path: String,
}

/// An ordered list of rules; the first match wins, so more specific rules
/// belong first. An empty list caches nothing: every request passes
/// through.
#[derive(Debug, Clone, Default)]
pub struct Rules {
    rules: Vec<Rule>,
}

impl Rules {
    /// Creates an empty rule list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule, builder style.
    pub fn push(mut self, matcher: Matcher, ttl: TtlSpec) -> Self {
        self.rules.push(Rule { matcher, ttl });
        self
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rejects rule sets that cannot mean anything sensible.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (index, rule) in self.rules.iter().enumerate() {
            match rule.ttl {
                TtlSpec::Fixed(0) => {
                    return Err(ConfigError::ZeroTtl { index })
                }
                TtlSpec::Clamp { min: Some(min), max: Some(max) }
                    if min > max =>
                {
                    return Err(ConfigError::InvertedClamp {
                        index,
                        min,
                        max,
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Walks the list in order and returns the first match, along with the
    /// path as the winning matcher left it. Paths touched by matchers that
    /// did not match are left alone.
    pub fn matched(&self, path: &str) -> Option<RuleMatch> {
        for rule in &self.rules {
            match &rule.matcher {
                Matcher::Path(regex) => {
                    if regex.is_match(path) {
                        return Some(RuleMatch {
                            ttl: rule.ttl,
                            path: path.to_owned(),
                        });
                    }
                }
                Matcher::Rewrite(predicate) => {
                    let mut candidate = path.to_owned();
                    if predicate(&mut candidate) {
                        return Some(RuleMatch {
                            ttl: rule.ttl,
                            path: candidate,
                        });
                    }
                }
            }
        }
        None
    }
}
