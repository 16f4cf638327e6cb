//! Post-delivery enrichment: translation of text and transcription of voice
//! notes. Runs detached from the send that produced the message; results only
//! flow back as a patched row plus a `message_updated` event.

pub mod provider;

use crate::adapters::repository::{Directory, MessageStore};
use crate::adapters::storage::{ObjectStorage, StorageError};
use crate::config::EnrichmentConfig;
use crate::domain::clock::MonotonicClock;
use crate::domain::message::{Message, MessageKind, MessagePatch, Transcript, Translation};
use crate::error::AppError;
use crate::services::dispatch::DeliveryDispatcher;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, UpDownCounter},
};
use provider::{TranscribeError, Transcriber, TranslateError, Translator};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

const DEFAULT_AUDIO_MIME: &str = "application/octet-stream";

#[derive(Error, Debug)]
enum EnrichmentError {
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Transcribe(#[from] TranscribeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] AppError),
}

/// What happened to one job, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Patched,
    Skipped(&'static str),
    /// The message was deleted, edited or vanished before the result was written.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub message: Message,
    /// Sender-supplied plaintext of an encrypted body.
    pub plaintext: Option<String>,
}

#[derive(Clone, Debug)]
struct Metrics {
    jobs_total: Counter<u64>,
    in_flight: UpDownCounter<i64>,
    duration_seconds: Histogram<f64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            jobs_total: meter
                .u64_counter("babel_enrichment_jobs_total")
                .with_description("Enrichment jobs by kind and outcome")
                .build(),
            in_flight: meter
                .i64_up_down_counter("babel_enrichment_in_flight")
                .with_description("Enrichment jobs spawned but not finished")
                .build(),
            duration_seconds: meter
                .f64_histogram("babel_enrichment_duration_seconds")
                .with_description("Time taken by a single enrichment job")
                .build(),
        }
    }
}

/// Backends the pipeline talks to. Any of them may be absent, which disables
/// the branches that need it.
#[derive(Clone, Debug, Default)]
pub struct Collaborators {
    pub translator: Option<Arc<dyn Translator>>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn Directory>,
    dispatcher: DeliveryDispatcher,
    collaborators: Collaborators,
    clock: Arc<MonotonicClock>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    accepting: AtomicBool,
    enabled: bool,
    audio_max_bytes: usize,
    metrics: Metrics,
}

#[derive(Clone, Debug)]
pub struct EnrichmentService {
    inner: Arc<Inner>,
}

impl EnrichmentService {
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn Directory>,
        dispatcher: DeliveryDispatcher,
        collaborators: Collaborators,
        clock: Arc<MonotonicClock>,
        config: &EnrichmentConfig,
        audio_max_bytes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                directory,
                dispatcher,
                collaborators,
                clock,
                permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                tracker: TaskTracker::new(),
                accepting: AtomicBool::new(true),
                enabled: config.enabled,
                audio_max_bytes,
                metrics: Metrics::new(),
            }),
        }
    }

    fn wants(&self, job: &EnrichmentJob) -> bool {
        let c = &self.inner.collaborators;
        if !self.inner.enabled || job.message.deleted {
            return false;
        }
        match job.message.kind {
            MessageKind::Text => c.translator.is_some(),
            MessageKind::Audio => c.transcriber.is_some() && c.storage.is_some(),
            _ => false,
        }
    }

    /// Queues a job and returns immediately. The job waits for a slot in the
    /// bounded pool, so a burst of sends never fans out unbounded backend calls.
    pub fn submit(&self, job: EnrichmentJob) {
        if !self.wants(&job) {
            return;
        }
        if !self.inner.accepting.load(Ordering::Acquire) {
            tracing::debug!(message_id = %job.message.id, "Enrichment draining, job dropped");
            return;
        }

        let this = self.clone();
        let span = tracing::info_span!("enrichment", message_id = %job.message.id, kind = %job.message.kind);
        self.inner.metrics.in_flight.add(1, &[]);
        self.inner.tracker.spawn(
            async move {
                let Ok(_permit) = Arc::clone(&this.inner.permits).acquire_owned().await else {
                    return;
                };
                this.run(job).await;
            }
            .instrument(span),
        );
    }

    async fn run(&self, job: EnrichmentJob) {
        let kind = job.message.kind;
        let start = std::time::Instant::now();

        let result = match kind {
            MessageKind::Audio => self.process_audio(&job.message).await,
            _ => self.process_text(&job.message, job.plaintext.as_deref()).await,
        };

        let label = match &result {
            Ok(Outcome::Patched) => {
                tracing::debug!("Enrichment applied");
                "patched"
            }
            Ok(Outcome::Skipped(reason)) => {
                tracing::debug!(reason, "Enrichment skipped");
                "skipped"
            }
            Ok(Outcome::Discarded) => {
                tracing::debug!("Message gone before enrichment finished");
                "discarded"
            }
            Err(e) => {
                tracing::warn!(error = %e, "Enrichment failed");
                "failed"
            }
        };

        let m = &self.inner.metrics;
        m.jobs_total.add(1, &[KeyValue::new("kind", kind.as_str()), KeyValue::new("outcome", label)]);
        m.duration_seconds.record(start.elapsed().as_secs_f64(), &[KeyValue::new("kind", kind.as_str())]);
        m.in_flight.add(-1, &[]);
    }

    async fn target_language(&self, message: &Message) -> Result<Option<String>, EnrichmentError> {
        match message.receiver_id {
            Some(receiver) => Ok(self.inner.directory.preferred_language(receiver).await?),
            None => Ok(None),
        }
    }

    async fn process_text(&self, message: &Message, plaintext: Option<&str>) -> Result<Outcome, EnrichmentError> {
        let Some(translator) = &self.inner.collaborators.translator else {
            return Ok(Outcome::Skipped("no translator"));
        };
        if message.group_id().is_some() {
            return Ok(Outcome::Skipped("group message"));
        }

        let text = match plaintext {
            Some(text) => text,
            None if !message.is_encrypted() => message.content.as_str(),
            None => return Ok(Outcome::Skipped("no plaintext")),
        };
        if text.trim().is_empty() {
            return Ok(Outcome::Skipped("empty"));
        }

        let Some(target) = self.target_language(message).await? else {
            return Ok(Outcome::Skipped("receiver has no language"));
        };
        let source = self.inner.directory.preferred_language(message.sender_id).await?;
        if source.as_deref() == Some(target.as_str()) {
            return Ok(Outcome::Skipped("same language"));
        }

        let output = translator.translate(text, source.as_deref(), &target).await?;
        if output.source_language == target {
            return Ok(Outcome::Skipped("same language"));
        }

        let patch = MessagePatch::Translation(Translation {
            text: output.text,
            source_language: output.source_language,
            target_language: target,
        });
        self.apply(message, &patch).await
    }

    async fn process_audio(&self, message: &Message) -> Result<Outcome, EnrichmentError> {
        let c = &self.inner.collaborators;
        let (Some(transcriber), Some(storage)) = (&c.transcriber, &c.storage) else {
            return Ok(Outcome::Skipped("no transcriber"));
        };
        if message.is_encrypted() {
            return Ok(Outcome::Skipped("encrypted audio"));
        }

        let Some(attachment_id) = message.metadata_str("attachment_id").and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            tracing::debug!("Audio message has no well-formed attachment reference");
            return Ok(Outcome::Skipped("bad attachment reference"));
        };

        let object = storage.get(&attachment_id.to_string(), self.inner.audio_max_bytes).await?;
        let mime_type = message
            .metadata_str("mime_type")
            .map(ToString::to_string)
            .or(object.content_type)
            .unwrap_or_else(|| DEFAULT_AUDIO_MIME.to_string());

        let transcription = transcriber.transcribe(object.bytes, &mime_type).await?;

        let mut transcript = Transcript {
            text: transcription.text,
            language: transcription.language,
            translated_text: None,
            target_language: None,
        };

        if let Some(translator) = &c.translator
            && let Some(target) = self.target_language(message).await?
            && target != transcript.language
        {
            match translator.translate(&transcript.text, Some(&transcript.language), &target).await {
                Ok(output) => {
                    transcript.translated_text = Some(output.text);
                    transcript.target_language = Some(target);
                }
                Err(e) => {
                    // The transcript alone is still worth keeping.
                    tracing::warn!(error = %e, "Transcript translation failed");
                }
            }
        }

        self.apply(message, &MessagePatch::Transcript(transcript)).await
    }

    /// Writes the result against the copy it was computed from. An edit in the
    /// meantime makes the result stale, so it is dropped like a deletion.
    async fn apply(&self, source: &Message, patch: &MessagePatch) -> Result<Outcome, EnrichmentError> {
        let now = self.inner.clock.now();
        match self.inner.store.apply_patch(source.id, patch, source.edited_at, now).await? {
            Some(updated) => {
                self.inner.dispatcher.deliver_updated(&updated).await;
                Ok(Outcome::Patched)
            }
            None => Ok(Outcome::Discarded),
        }
    }

    /// Stops accepting jobs and waits for running ones, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.tracker.close();
        let pending = self.inner.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for enrichment tasks to finish");
        }
        if tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_err() {
            tracing::warn!(remaining = self.inner.tracker.len(), "Enrichment drain timed out");
        }
    }

    /// Waits until every job submitted so far has finished. New jobs are still
    /// accepted afterwards.
    pub async fn settle(&self) {
        let tracker = &self.inner.tracker;
        tracker.close();
        tracker.wait().await;
        // A drained pool stays closed.
        if self.inner.accepting.load(Ordering::Acquire) {
            tracker.reopen();
        }
    }
}
