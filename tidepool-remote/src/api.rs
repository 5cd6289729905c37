//! Remote data API contract, credentials and errors.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tidepool_core::Blob;

use crate::key::RemotePath;

/// Remote errors. `Clone` so a shared fetch can hand the same failure to
/// every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Unauthorized")]
    Unauthorized,
    /// The remote refused the operation
    #[error("Rejected by remote: {0}")]
    Rejected(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Bearer credential passed with every remote call.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("AuthToken(<none>)")
        } else {
            f.write_str("AuthToken(<redacted>)")
        }
    }
}

/// Remote cache configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub auth_token: AuthToken,
    /// Upper bound on every remote call
    pub request_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            auth_token: AuthToken::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RemoteConfig {
    pub fn for_testing() -> Self {
        Self {
            auth_token: AuthToken::new("test-token"),
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// The remote data service. One cache operation maps to exactly one call.
pub trait RemoteApi {
    /// Current value at `(scope, path)`, `None` when absent.
    fn get(
        &self,
        scope: &str,
        path: &RemotePath,
        auth: &AuthToken,
    ) -> impl Future<Output = Result<Option<Blob>, RemoteError>>;

    fn set(
        &self,
        scope: &str,
        path: &RemotePath,
        value: &[u8],
        auth: &AuthToken,
    ) -> impl Future<Output = Result<(), RemoteError>>;

    /// Keys below `path` (or the whole scope).
    fn list(
        &self,
        scope: &str,
        path: Option<&RemotePath>,
        auth: &AuthToken,
    ) -> impl Future<Output = Result<Vec<String>, RemoteError>>;
}

/// Run a remote call under `limit`.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| RemoteError::Timeout(limit))?
}
