use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("Translation backend rejected the request: {0}")]
    Rejected(String),
    #[error("Translation backend unavailable: {0}")]
    Unavailable(String),
    #[error("Unexpected translation response: {0}")]
    InvalidResponse(String),
}

#[derive(Error, Debug)]
pub enum TranscribeError {
    #[error("Transcription backend rejected the audio: {0}")]
    Rejected(String),
    #[error("Transcription backend unavailable: {0}")]
    Unavailable(String),
    #[error("Unexpected transcription response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationOutput {
    pub text: String,
    /// Language the backend detected, or the one it was told.
    pub source_language: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionOutput {
    pub text: String,
    pub language: String,
}

#[async_trait]
pub trait Translator: Send + Sync + std::fmt::Debug {
    /// Translates `text` into `target`. A `None` source asks the backend to detect it.
    ///
    /// # Errors
    /// Returns a `TranslateError` if the backend refuses, fails, or answers garbage.
    async fn translate(
        &self,
        text: &str,
        source: Option<&str>,
        target: &str,
    ) -> Result<TranslationOutput, TranslateError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync + std::fmt::Debug {
    async fn transcribe(&self, audio: Bytes, mime_type: &str) -> Result<TranscriptionOutput, TranscribeError>;
}
