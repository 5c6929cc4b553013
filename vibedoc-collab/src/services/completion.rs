//! Text completion endpoints: ghost-text continuation, voice
//! transcription and version-diff summaries.

use std::future::Future;

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use super::{check, join_url, ServiceConfig, ServiceError};

/// Upper bound of context sent for a ghost-text suggestion.
pub const MAX_CONTEXT_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
}

pub trait CompletionService: Send + Sync {
    /// Likely next sentence after `context`.
    fn ghost_text(&self, context: &str) -> impl Future<Output = Result<String, ServiceError>> + Send;

    /// Transcribe recorded audio.
    fn voice_to_text(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        mime: &str,
    ) -> impl Future<Output = Result<Transcription, ServiceError>> + Send;

    /// A few words describing how `current` differs from `previous`.
    fn summarize_version_diff(
        &self,
        previous: &str,
        current: &str,
    ) -> impl Future<Output = Result<String, ServiceError>> + Send;
}

/// Trailing `MAX_CONTEXT_CHARS` characters of `text`.
pub fn ghost_context(text: &str) -> &str {
    let count = text.chars().count();
    if count <= MAX_CONTEXT_CHARS {
        return text;
    }
    let start = text.char_indices().nth(count - MAX_CONTEXT_CHARS).map_or(0, |(i, _)| i);
    &text[start..]
}

pub struct HttpCompletionService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCompletionService {
    pub fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self { client: config.http_client()?, base_url: config.completion_base_url.clone() })
    }
}

#[derive(Serialize)]
struct GhostTextRequest<'a> {
    context: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummarizeRequest<'a> {
    prev_version: &'a str,
    cur_version: &'a str,
}

impl CompletionService for HttpCompletionService {
    async fn ghost_text(&self, context: &str) -> Result<String, ServiceError> {
        let body = GhostTextRequest { context: ghost_context(context) };
        let response = self.client.post(join_url(&self.base_url, "/ghost-text")).json(&body).send().await?;
        Ok(check(response).await?.text().await?)
    }

    async fn voice_to_text(&self, audio: Vec<u8>, file_name: &str, mime: &str) -> Result<Transcription, ServiceError> {
        let part = Part::bytes(audio).file_name(file_name.to_string()).mime_str(mime)?;
        let form = Form::new().part("audio", part);
        let response = self.client.post(join_url(&self.base_url, "/voice-to-text")).multipart(form).send().await?;
        let text = check(response).await?.text().await?;
        serde_json::from_str(&text).map_err(|e| ServiceError::InvalidResponse(format!("transcription: {e}")))
    }

    async fn summarize_version_diff(&self, previous: &str, current: &str) -> Result<String, ServiceError> {
        let body = SummarizeRequest { prev_version: previous, cur_version: current };
        let response =
            self.client.post(join_url(&self.base_url, "/summarize-version-diff")).json(&body).send().await?;
        Ok(check(response).await?.text().await?)
    }
}
