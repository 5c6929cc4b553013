//! HTTP clients for the services a collaborative editor talks to besides
//! the relay: version snapshots and text completion.
//!
//! Both are consumed, not implemented here. Each has a trait so the
//! application (and tests) can substitute its own backend.

pub mod completion;
pub mod snapshot;

use std::time::Duration;

use thiserror::Error;

pub use completion::{CompletionService, HttpCompletionService, Transcription};
pub use snapshot::{
    HttpSnapshotStore, PresignedUpload, SnapshotStore, Version, VersionEvents, VersionSaved, VersionSaver,
    DEFAULT_SAVE_INTERVAL,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Base URLs of the external services.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub completion_base_url: String,
    pub snapshot_base_url: String,
    pub request_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            completion_base_url: "http://localhost:3000".to_string(),
            snapshot_base_url: "http://localhost:3001".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    /// Defaults overridden by `VIBEDOC_COMPLETION_URL` and
    /// `VIBEDOC_SNAPSHOT_URL`.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("VIBEDOC_COMPLETION_URL") {
            self.completion_base_url = url;
        }
        if let Some(url) = lookup("VIBEDOC_SNAPSHOT_URL") {
            self.snapshot_base_url = url;
        }
        self
    }

    pub(crate) fn http_client(&self) -> Result<reqwest::Client, ServiceError> {
        Ok(reqwest::Client::builder().timeout(self.request_timeout).build()?)
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Turn a non-success response into `ServiceError::Status`.
pub(crate) async fn check(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_else(|_| status.to_string());
    Err(ServiceError::Status { status: status.as_u16(), body })
}
