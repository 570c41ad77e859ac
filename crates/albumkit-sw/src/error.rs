//! Error types.

use albumkit_net::NetError;
use albumkit_store::StoreError;
use thiserror::Error;

use crate::codec::CodecError;

/// Errors raised by lifecycle and storage operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// The failure a page observes for an intercepted request.
///
/// Everything else (network loss with a usable fallback, cache misses,
/// persistence failures) is recovered inside the policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Neither network, cache nor replay queue could answer.
    #[error("Unsatisfiable request {url}: {reason}")]
    Unsatisfiable { url: String, reason: String },

    /// The mutation could not reach the network and is waiting for replay.
    #[error("Mutation queued for replay, not completed: {url}")]
    MutationQueued { url: String, key: String },
}

impl FetchError {
    pub(crate) fn unsatisfiable(url: &url::Url, reason: impl Into<String>) -> Self {
        Self::Unsatisfiable {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the mutation behind this failure is still queued.
    pub fn is_queued(&self) -> bool {
        matches!(self, FetchError::MutationQueued { .. })
    }
}
