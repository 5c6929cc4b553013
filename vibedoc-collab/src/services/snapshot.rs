//! Version snapshots: the serialized document tree uploaded through a
//! presigned URL and registered as a numbered version.
//!
//! ```text
//! VersionSaver (leader only, every 5 s)
//!     │ POST /documents/{id}/versions/presigned-url ─► {presignedUrl, fileName}
//!     │ PUT  presignedUrl  (document JSON)
//!     └ POST /documents/{id}/versions {s3Key}        ─► Version
//!
//! GET /events  (text/event-stream) ─► {"type":"version_saved", documentId, version}
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{check, join_url, ServiceConfig, ServiceError};

pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: String,
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub s3_key: String,
    pub version: u64,
    /// Short summary of what changed since the previous version.
    #[serde(default)]
    pub diff: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub presigned_url: String,
    /// Object key, registered as the version's `s3Key`.
    pub file_name: String,
}

/// `version_saved` notification from the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSaved {
    #[serde(rename = "type")]
    pub kind: String,
    pub document_id: String,
    pub version: u64,
}

/// Version storage backend.
pub trait SnapshotStore: Send + Sync {
    fn presigned_upload(&self, doc_id: Uuid) -> impl Future<Output = Result<PresignedUpload, ServiceError>> + Send;

    fn upload(&self, target: &PresignedUpload, json: String) -> impl Future<Output = Result<(), ServiceError>> + Send;

    fn register_version(&self, doc_id: Uuid, s3_key: &str) -> impl Future<Output = Result<Version, ServiceError>> + Send;

    fn list_versions(&self, doc_id: Uuid) -> impl Future<Output = Result<Vec<Version>, ServiceError>> + Send;

    /// Upload `json` and register it as the next version.
    fn save_snapshot(&self, doc_id: Uuid, json: String) -> impl Future<Output = Result<Version, ServiceError>> + Send {
        async move {
            let target = self.presigned_upload(doc_id).await?;
            self.upload(&target, json).await?;
            self.register_version(doc_id, &target.file_name).await
        }
    }
}

/// [`SnapshotStore`] backed by the version service's REST API.
pub struct HttpSnapshotStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotStore {
    pub fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self { client: config.http_client()?, base_url: config.snapshot_base_url.clone() })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Subscribe to `version_saved` notifications.
    pub async fn version_events(&self) -> Result<VersionEvents, ServiceError> {
        let response = self.client.get(self.url("/events")).header("Accept", "text/event-stream").send().await?;
        Ok(VersionEvents { response: check(response).await?, parser: SseParser::default(), ready: Vec::new() })
    }
}

impl SnapshotStore for HttpSnapshotStore {
    async fn presigned_upload(&self, doc_id: Uuid) -> Result<PresignedUpload, ServiceError> {
        let url = self.url(&format!("/documents/{doc_id}/versions/presigned-url"));
        let response = check(self.client.post(url).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn upload(&self, target: &PresignedUpload, json: String) -> Result<(), ServiceError> {
        let response =
            self.client.put(&target.presigned_url).header("Content-Type", "application/json").body(json).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn register_version(&self, doc_id: Uuid, s3_key: &str) -> Result<Version, ServiceError> {
        let url = self.url(&format!("/documents/{doc_id}/versions"));
        let body = serde_json::json!({ "s3Key": s3_key });
        let response = check(self.client.post(url).json(&body).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn list_versions(&self, doc_id: Uuid) -> Result<Vec<Version>, ServiceError> {
        let url = self.url(&format!("/documents/{doc_id}/versions"));
        let response = check(self.client.get(url).send().await?).await?;
        Ok(response.json().await?)
    }
}

// ───────────────────────────────────────────────────────────────────
// Server-sent events
// ───────────────────────────────────────────────────────────────────

/// Incremental `text/event-stream` parser yielding `data` payloads.
#[derive(Debug, Default)]
struct SseParser {
    /// Raw bytes of the unfinished event. Chunks may split a UTF-8
    /// sequence, so decoding waits for a complete event.
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = event_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end).collect();
            let block = String::from_utf8_lossy(&raw).replace("\r\n", "\n");
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}

/// Length of the first complete event in `buf`, blank line included.
fn event_end(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(i, b)| match (*b, &buf[i + 1..]) {
        (b'\n', [b'\n', ..]) => Some(i + 2),
        (b'\n', [b'\r', b'\n', ..]) => Some(i + 3),
        _ => None,
    })
}

/// Stream of `version_saved` notifications.
pub struct VersionEvents {
    response: reqwest::Response,
    parser: SseParser,
    ready: Vec<String>,
}

impl VersionEvents {
    /// Next notification, or `None` when the server closed the stream.
    /// Events of other types are skipped.
    pub async fn next(&mut self) -> Result<Option<VersionSaved>, ServiceError> {
        loop {
            while !self.ready.is_empty() {
                let data = self.ready.remove(0);
                match serde_json::from_str::<VersionSaved>(&data) {
                    Ok(event) if event.kind == "version_saved" => return Ok(Some(event)),
                    Ok(_) => {}
                    Err(e) => log::debug!("Skipping unrecognized event: {e}"),
                }
            }
            let Some(chunk) = self.response.chunk().await? else {
                return Ok(None);
            };
            self.ready = self.parser.push(&chunk);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Periodic saver
// ───────────────────────────────────────────────────────────────────

/// Uploads the document at most once per interval while this replica
/// leads, skipping unchanged content.
pub struct VersionSaver<S: SnapshotStore> {
    store: S,
    doc_id: Uuid,
    interval: Duration,
    last_attempt: Option<Instant>,
    last_saved: Option<String>,
}

impl<S: SnapshotStore> VersionSaver<S> {
    pub fn new(store: S, doc_id: Uuid) -> Self {
        Self { store, doc_id, interval: DEFAULT_SAVE_INTERVAL, last_attempt: None, last_saved: None }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last_attempt.map_or(true, |last| now.duration_since(last) >= self.interval)
    }

    /// Save `json` when leading and due. Returns the new version, if any.
    pub async fn maybe_save(&mut self, is_leader: bool, json: String, now: Instant) -> Result<Option<Version>, ServiceError> {
        if !is_leader {
            // A new leader starts its own interval.
            self.last_attempt = None;
            return Ok(None);
        }
        if !self.is_due(now) {
            return Ok(None);
        }
        self.last_attempt = Some(now);
        if self.last_saved.as_deref() == Some(json.as_str()) {
            return Ok(None);
        }

        let version = self.store.save_snapshot(self.doc_id, json.clone()).await?;
        log::info!("Saved version {} of doc {}", version.version, self.doc_id);
        self.last_saved = Some(json);
        Ok(Some(version))
    }
}
