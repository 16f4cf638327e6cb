//! HTTP clients for the translation and transcription backends.

use crate::config::EnrichmentConfig;
use crate::services::enrichment::provider::{
    TranscribeError, Transcriber, TranscriptionOutput, TranslateError, TranslationOutput, Translator,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Builds the shared client used by both backends.
///
/// # Errors
/// Returns `reqwest::Error` if the TLS backend cannot be initialized.
pub fn build_http_client(config: &EnrichmentConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(Duration::from_secs(config.request_timeout_secs)).build()
}

#[derive(Debug, Clone)]
struct Endpoint {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Endpoint {
    fn new(http: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/').to_string(), api_key }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.http.post(format!("{}/{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

enum Failure {
    Rejected(String),
    Unavailable(String),
}

fn classify_status(status: StatusCode, body: String) -> Failure {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Failure::Unavailable(format!("{status}: {body}"))
    } else {
        Failure::Rejected(format!("{status}: {body}"))
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, Failure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, body))
}

#[derive(Debug, Clone)]
pub struct HttpTranslator {
    endpoint: Endpoint,
}

impl HttpTranslator {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self { endpoint: Endpoint::new(http, base_url, api_key) }
    }
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_language: Option<&'a str>,
    target_language: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    translated_text: String,
    source_language: Option<String>,
}

#[async_trait]
impl Translator for HttpTranslator {
    #[tracing::instrument(level = "debug", skip(self, text), fields(chars = text.len()), err(level = "warn"))]
    async fn translate(
        &self,
        text: &str,
        source: Option<&str>,
        target: &str,
    ) -> Result<TranslationOutput, TranslateError> {
        let response = self
            .endpoint
            .post("translate")
            .json(&TranslateRequest { text, source_language: source, target_language: target })
            .send()
            .await
            .map_err(|e| TranslateError::Unavailable(e.to_string()))?;

        let response = check(response).await.map_err(|f| match f {
            Failure::Rejected(m) => TranslateError::Rejected(m),
            Failure::Unavailable(m) => TranslateError::Unavailable(m),
        })?;

        let body: TranslateResponse =
            response.json().await.map_err(|e| TranslateError::InvalidResponse(e.to_string()))?;

        let source_language = body.source_language.or_else(|| source.map(ToString::to_string)).ok_or_else(|| {
            TranslateError::InvalidResponse("backend did not report a source language".to_string())
        })?;

        Ok(TranslationOutput { text: body.translated_text, source_language })
    }
}

#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    endpoint: Endpoint,
}

impl HttpTranscriber {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self { endpoint: Endpoint::new(http, base_url, api_key) }
    }
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
    language: String,
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    #[tracing::instrument(level = "debug", skip(self, audio), fields(bytes = audio.len()), err(level = "warn"))]
    async fn transcribe(&self, audio: Bytes, mime_type: &str) -> Result<TranscriptionOutput, TranscribeError> {
        let response = self
            .endpoint
            .post("transcribe")
            .header(CONTENT_TYPE, mime_type)
            .body(audio)
            .send()
            .await
            .map_err(|e| TranscribeError::Unavailable(e.to_string()))?;

        let response = check(response).await.map_err(|f| match f {
            Failure::Rejected(m) => TranscribeError::Rejected(m),
            Failure::Unavailable(m) => TranscribeError::Unavailable(m),
        })?;

        let body: TranscribeResponse =
            response.json().await.map_err(|e| TranscribeError::InvalidResponse(e.to_string()))?;

        Ok(TranscriptionOutput { text: body.text, language: body.language })
    }
}
