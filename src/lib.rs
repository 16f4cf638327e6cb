#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

pub mod adapters;
pub mod api;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;
pub mod telemetry;
pub mod workers;

pub use workers::Workers;

use crate::adapters::ai::{HttpTranscriber, HttpTranslator, build_http_client};
use crate::adapters::database::{DbPool, PgConversationStore, PgDirectory, PgMessageStore};
use crate::adapters::memory::{MemoryConversationStore, MemoryDirectory, MemoryMessageStore};
use crate::adapters::repository::{ConversationStore, Directory, MessageStore};
use crate::adapters::storage::{ObjectStorage, S3Storage};
use crate::api::ServiceContainer;
use crate::config::{Config, StorageConfig};
use crate::domain::clock::MonotonicClock;
use crate::services::conversation_service::ConversationService;
use crate::services::dispatch::{DeliveryDispatcher, LocalSessionHub, SessionHub};
use crate::services::enrichment::provider::{Transcriber, Translator};
use crate::services::enrichment::{Collaborators, EnrichmentService};
use crate::services::gateway::GatewayService;
use crate::services::health_service::HealthService;
use crate::services::message_service::{MessageDeps, MessageService};
use crate::services::rate_limit_service::{RateLimitService, SenderRateLimiter};
use crate::services::sync_service::SyncService;
use crate::workers::{HubGcWorker, RateLimitSweepWorker};
use std::sync::Arc;
use tokio::sync::watch;

/// Everything `main` needs after wiring: the routers' services, the probes,
/// the background workers and the enrichment pool to drain on shutdown.
#[derive(Debug)]
pub struct App {
    pub services: ServiceContainer,
    pub health_service: HealthService,
    pub workers: Workers,
    pub enrichment: EnrichmentService,
}

/// Wires adapters into services. Without a database pool every store is kept
/// in memory, which is what tests and local development use.
#[derive(Debug)]
pub struct AppBuilder {
    config: Config,
    pool: Option<DbPool>,
    s3_client: Option<aws_sdk_s3::Client>,
    object_storage: Option<Arc<dyn ObjectStorage>>,
    directory: Option<Arc<dyn Directory>>,
    translator: Option<Arc<dyn Translator>>,
    transcriber: Option<Arc<dyn Transcriber>>,
}

impl AppBuilder {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            pool: None,
            s3_client: None,
            object_storage: None,
            directory: None,
            translator: None,
            transcriber: None,
        }
    }

    #[must_use]
    pub fn with_database(mut self, pool: DbPool) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_s3(mut self, client: aws_sdk_s3::Client) -> Self {
        self.s3_client = Some(client);
        self
    }

    #[must_use]
    pub fn with_object_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.object_storage = Some(storage);
        self
    }

    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    #[must_use]
    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    /// # Errors
    /// Returns an error if the enrichment HTTP client cannot be built.
    pub fn build(self) -> anyhow::Result<App> {
        let config = self.config;

        let (conversation_store, message_store, default_directory): (
            Arc<dyn ConversationStore>,
            Arc<dyn MessageStore>,
            Arc<dyn Directory>,
        ) = match self.pool {
            Some(pool) => (
                Arc::new(PgConversationStore::new(pool.clone())),
                Arc::new(PgMessageStore::new(pool.clone())),
                Arc::new(PgDirectory::new(pool)),
            ),
            None => {
                tracing::warn!("No database configured, messages are kept in memory only");
                (
                    Arc::new(MemoryConversationStore::new()),
                    Arc::new(MemoryMessageStore::new()),
                    Arc::new(MemoryDirectory::new()),
                )
            }
        };
        let directory = self.directory.unwrap_or(default_directory);

        let storage: Option<Arc<dyn ObjectStorage>> = match (self.object_storage, self.s3_client, &config.storage.bucket)
        {
            (Some(storage), _, _) => Some(storage),
            (None, Some(client), Some(bucket)) => Some(Arc::new(S3Storage::new(client, bucket.clone()))),
            _ => None,
        };

        let needs_http = (self.translator.is_none() && config.enrichment.translator_url.is_some())
            || (self.transcriber.is_none() && config.enrichment.transcriber_url.is_some());
        let http = if needs_http { Some(build_http_client(&config.enrichment)?) } else { None };

        let translator = self.translator.or_else(|| {
            let (http, url) = (http.as_ref()?, config.enrichment.translator_url.as_deref()?);
            Some(Arc::new(HttpTranslator::new(http.clone(), url, config.enrichment.api_key.clone())) as Arc<dyn Translator>)
        });
        let transcriber = self.transcriber.or_else(|| {
            let (http, url) = (http.as_ref()?, config.enrichment.transcriber_url.as_deref()?);
            Some(Arc::new(HttpTranscriber::new(http.clone(), url, config.enrichment.api_key.clone()))
                as Arc<dyn Transcriber>)
        });

        let clock = Arc::new(MonotonicClock::new());
        let hub: Arc<dyn SessionHub> = Arc::new(LocalSessionHub::new(config.notifications.user_channel_capacity));
        let dispatcher = DeliveryDispatcher::new(Arc::clone(&hub), Arc::clone(&directory));

        let enrichment = EnrichmentService::new(
            Arc::clone(&message_store),
            Arc::clone(&directory),
            dispatcher.clone(),
            Collaborators { translator, transcriber, storage: storage.clone() },
            Arc::clone(&clock),
            &config.enrichment,
            config.storage.audio_max_bytes,
        );

        let conversation_service = ConversationService::new(conversation_store, Arc::clone(&clock));
        let rate_limiter = Arc::new(SenderRateLimiter::from_config(&config.rate_limit));

        let message_service = MessageService::new(
            MessageDeps {
                store: Arc::clone(&message_store),
                directory: Arc::clone(&directory),
                conversations: conversation_service.clone(),
                dispatcher,
                enrichment: enrichment.clone(),
                rate_limiter: Arc::clone(&rate_limiter),
                clock,
            },
            config.messaging.clone(),
        );

        let sync_service = SyncService::new(
            conversation_service.clone(),
            Arc::clone(&message_store),
            directory,
            config.messaging.sync_batch_limit,
        );

        let gateway_service =
            GatewayService::new(message_service.clone(), sync_service.clone(), Arc::clone(&hub), config.websocket.clone());

        let health_service = HealthService::new(message_store, storage, config.health.clone());

        let workers = Workers {
            hub_gc: HubGcWorker::new(hub, config.notifications.gc_interval_secs),
            rate_limit_sweep: RateLimitSweepWorker::new(rate_limiter, config.rate_limit.sweep_interval_secs),
        };

        Ok(App {
            services: ServiceContainer {
                conversation_service,
                message_service,
                sync_service,
                gateway_service,
                rate_limit_service: RateLimitService::new(config.server.trusted_proxies.clone()),
            },
            health_service,
            workers,
            enrichment,
        })
    }
}

/// Routes panics through tracing so they reach the configured log sink.
pub fn setup_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map(|l| format!("{}:{}", l.file(), l.line())).unwrap_or_default();
        tracing::error!(panic = %info, location = %location, "Process panicked");
        default_hook(info);
    }));
}

/// # Errors
/// Returns an error if a migration fails to apply.
pub async fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Flips `shutdown_tx` on SIGINT or SIGTERM.
pub fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }

        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

/// Builds an S3 client when a bucket is configured.
pub async fn initialize_s3_client(config: &StorageConfig) -> Option<aws_sdk_s3::Client> {
    config.bucket.as_ref()?;

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));
    if let Some(endpoint) = &config.endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
        loader = loader
            .credentials_provider(aws_credential_types::Credentials::new(access_key, secret_key, None, None, "static"));
    }

    let sdk_config = loader.load().await;
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.force_path_style).build();
    Some(aws_sdk_s3::Client::from_conf(s3_config))
}
