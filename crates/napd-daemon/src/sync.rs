//! Remote policy sync.
//!
//! Policies are fetched from a remote server as a single JSON array of
//! policy documents via an idempotent, basic-authenticated `GET`. The
//! fetch itself lives behind [`PolicySource`] so the orchestration of a
//! sync (persist, reload, mark, push) can be exercised without a network.
//!
//! Nothing here retries: a failed sync surfaces to the caller, and the
//! next scheduled freshness check (or an explicit trigger) tries again.

use async_trait::async_trait;
use napd_core::config::SyncConfig;
use napd_core::policy::PolicyError;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::storage::StorageError;

/// Failures along the sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The fetch could not be performed.
    #[error("policy fetch failed: {message}")]
    Fetch {
        /// Description of the transport failure.
        message: String,
    },

    /// The server answered with a non-success status.
    #[error("policy server returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The response body is not a JSON array of policy objects.
    #[error("policy payload is invalid: {message}")]
    InvalidPayload {
        /// Description of the shape violation.
        message: String,
    },

    /// Persisting the fetched set failed.
    #[error("failed to persist synced policies")]
    Persist(#[from] StorageError),

    /// Reloading the store from the fetched set failed.
    #[error("failed to reload policy store")]
    Reload(#[from] PolicyError),
}

/// Source of the remote policy set.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetches the serialized policy set.
    async fn fetch(&self) -> Result<String, SyncError>;
}

/// HTTP-backed [`PolicySource`].
pub struct HttpPolicySource {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl HttpPolicySource {
    /// Builds the source from sync configuration.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch(&self) -> Result<String, SyncError> {
        debug!(endpoint = self.endpoint.as_str(), "fetching policies");

        let mut request = self.client.get(&self.endpoint);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await.map_err(|e| SyncError::Fetch {
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|e| SyncError::Fetch {
            message: e.to_string(),
        })
    }
}

/// Parses a fetched payload into individual policy documents.
///
/// The payload must be a JSON array and every element must be an object;
/// the `"Id"` field is checked later by the store reload, which rejects
/// the batch as a whole.
///
/// # Errors
///
/// Returns [`SyncError::InvalidPayload`] on shape violations.
pub fn parse_policy_set(payload: &str) -> Result<Vec<Value>, SyncError> {
    let root: Value = serde_json::from_str(payload).map_err(|e| SyncError::InvalidPayload {
        message: e.to_string(),
    })?;

    let Value::Array(documents) = root else {
        return Err(SyncError::InvalidPayload {
            message: "payload is not a JSON array".to_owned(),
        });
    };

    if let Some(position) = documents.iter().position(|doc| !doc.is_object()) {
        return Err(SyncError::InvalidPayload {
            message: format!("element {position} is not a JSON object"),
        });
    }

    Ok(documents)
}
