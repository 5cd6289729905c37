//! Remote identities and their flattened cache keys.
//!
//! A remote value is addressed by a scope (tenant, collection, ...) plus a
//! structured path. Both are flattened into one [`CacheKey`] string with
//! `serde_json`, so segment boundaries can never collide:
//!
//! ```text
//!   ("users", a/b)      ──► ["users",["a","b"]]
//!   ("users", "a/b")    ──► ["users",["a/b"]]       (one segment, distinct)
//!   list("users", a)    ──► {"list":["users",["a"]]}
//!   list("users", ∅)    ──► {"list":["users",null]}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Structured path below a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemotePath(Vec<String>);

impl RemotePath {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Split `a/b/c` into segments. Empty segments are skipped.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Whether `prefix` is a segment-wise prefix of this path.
    pub fn starts_with(&self, prefix: &RemotePath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Whether either path contains the other.
    pub fn overlaps(&self, other: &RemotePath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl From<&str> for RemotePath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// Flattened `(scope, path)` identity used as the key of the local cache
/// and of key-scoped subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(scope: &str, path: &RemotePath) -> Self {
        Self(json!([scope, path.segments()]).to_string())
    }

    /// Key of a cached listing.
    pub fn query(scope: &str, path: Option<&RemotePath>) -> Self {
        let path = path.map(RemotePath::segments);
        Self(json!({ "list": [scope, path] }).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
