//! URL path patterns for client-side route tables.
//!
//! Patterns match against the URL *path* only; query and fragment are
//! ignored. The textual form used in configuration is:
//!
//! - `/about`: exact path
//! - `/static/*`: any path under `/static/`
//! - `*.webp`: any path ending in `.webp`
//! - `/albums/:id`: segment-wise route, `:name` or `*` matches one segment

use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact path match.
    Exact,
    /// Path prefix match.
    Prefix,
    /// Path suffix match (e.g., extension).
    Suffix,
    /// Segment-wise route with placeholders.
    Route,
}

/// URL pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(path: &str) -> Self {
        Self {
            pattern_type: PatternType::Exact,
            pattern: path.to_string(),
        }
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            pattern_type: PatternType::Prefix,
            pattern: prefix.to_string(),
        }
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self {
            pattern_type: PatternType::Suffix,
            pattern: suffix.to_string(),
        }
    }

    /// Create a route pattern such as `/albums/:id/photos`.
    pub fn route(route: &str) -> Self {
        Self {
            pattern_type: PatternType::Route,
            pattern: route.to_string(),
        }
    }

    /// Parse the textual form described in the module docs.
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty URL pattern".to_string());
        }

        if let Some(prefix) = text.strip_suffix('*') {
            if prefix.ends_with('/') && !prefix.contains('*') {
                return Ok(Self::prefix(prefix));
            }
        }
        if let Some(suffix) = text.strip_prefix('*') {
            if !suffix.contains('*') && !suffix.contains('/') {
                return Ok(Self::suffix(suffix));
            }
        }
        if !text.starts_with('/') {
            return Err(format!("URL pattern must start with '/': {}", text));
        }
        if text.split('/').any(|s| s.starts_with(':') || s == "*") {
            return Ok(Self::route(text));
        }
        Ok(Self::exact(text))
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        self.matches_path(url.path())
    }

    /// Check if a path matches this pattern.
    pub fn matches_path(&self, path: &str) -> bool {
        match self.pattern_type {
            PatternType::Exact => path == self.pattern,
            PatternType::Prefix => path.starts_with(&self.pattern),
            PatternType::Suffix => path.ends_with(&self.pattern),
            PatternType::Route => route_matches(&self.pattern, path),
        }
    }
}

impl TryFrom<String> for UrlPattern {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UrlPattern> for String {
    fn from(pattern: UrlPattern) -> Self {
        match pattern.pattern_type {
            PatternType::Exact | PatternType::Route => pattern.pattern,
            PatternType::Prefix => format!("{}*", pattern.pattern),
            PatternType::Suffix => format!("*{}", pattern.pattern),
        }
    }
}

fn route_matches(route: &str, path: &str) -> bool {
    let route_segments: Vec<&str> = route.trim_end_matches('/').split('/').collect();
    let path_segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();

    if route_segments.len() != path_segments.len() {
        return false;
    }

    route_segments
        .iter()
        .zip(path_segments.iter())
        .all(|(r, p)| match *r {
            "*" => !p.is_empty(),
            r if r.starts_with(':') => !p.is_empty(),
            r => r == *p,
        })
}

/// An ordered list of client-side routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    patterns: Vec<UrlPattern>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from textual patterns.
    pub fn parse<I, S>(patterns: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| UrlPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Add a pattern.
    pub fn add(&mut self, pattern: UrlPattern) {
        self.patterns.push(pattern);
    }

    /// Whether any route matches the URL.
    pub fn contains(&self, url: &Url) -> bool {
        let hit = self.patterns.iter().find(|p| p.matches(url));
        if let Some(pattern) = hit {
            trace!(url = %url, pattern = %pattern.pattern, "Client route matched");
        }
        hit.is_some()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
