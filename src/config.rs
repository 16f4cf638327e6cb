use clap::{Args, Parser, ValueEnum};
use ipnetwork::IpNetwork;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub database: DatabaseConfig,

    #[command(flatten)]
    pub server: ServerConfig,

    #[command(flatten)]
    pub auth: AuthConfig,

    #[command(flatten)]
    pub rate_limit: RateLimitConfig,

    #[command(flatten)]
    pub messaging: MessagingConfig,

    #[command(flatten)]
    pub enrichment: EnrichmentConfig,

    #[command(flatten)]
    pub notifications: NotificationConfig,

    #[command(flatten)]
    pub websocket: WsConfig,

    #[command(flatten)]
    pub storage: StorageConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,

    #[command(flatten)]
    pub health: HealthConfig,
}

#[derive(Clone, Debug, Args)]
pub struct DatabaseConfig {
    /// Database connection URL. When unset, messages are kept in memory only.
    #[arg(long = "database-url", env = "BABEL_DATABASE_URL")]
    pub url: Option<String>,

    /// Maximum number of pooled connections
    #[arg(long, env = "BABEL_DB_MAX_CONNECTIONS", default_value_t = 20)]
    pub max_connections: u32,

    /// Minimum number of idle pooled connections
    #[arg(long, env = "BABEL_DB_MIN_CONNECTIONS", default_value_t = 2)]
    pub min_connections: u32,

    /// Seconds to wait for a free connection before failing
    #[arg(long, env = "BABEL_DB_ACQUIRE_TIMEOUT_SECS", default_value_t = 5)]
    pub acquire_timeout_secs: u64,
}

#[derive(Clone, Debug, Args)]
pub struct ServerConfig {
    /// Host to listen on
    #[arg(long, env = "BABEL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "BABEL_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Port for the management (health) server
    #[arg(long, env = "BABEL_MGMT_PORT", default_value_t = 9090)]
    pub mgmt_port: u16,

    /// Seconds to wait for background tasks during shutdown
    #[arg(long, env = "BABEL_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Comma-separated list of CIDRs to trust for X-Forwarded-For IP extraction
    #[arg(
        long,
        env = "BABEL_TRUSTED_PROXIES",
        default_value = "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,127.0.0.1/32",
        value_delimiter = ','
    )]
    pub trusted_proxies: Vec<IpNetwork>,
}

#[derive(Clone, Debug, Args)]
pub struct AuthConfig {
    /// Secret used to verify session tokens (HS256)
    #[arg(long, env = "BABEL_JWT_SECRET")]
    pub jwt_secret: String,
}

#[derive(Clone, Debug, Args)]
pub struct RateLimitConfig {
    /// HTTP requests per second allowed per client IP
    #[arg(long, env = "BABEL_RATE_LIMIT_PER_SECOND", default_value_t = 10)]
    pub per_second: u32,

    /// HTTP burst allowance per client IP
    #[arg(long, env = "BABEL_RATE_LIMIT_BURST", default_value_t = 20)]
    pub burst: u32,

    /// Messages a single sender may send within one window
    #[arg(long, env = "BABEL_SEND_LIMIT", default_value_t = 10)]
    pub send_limit: u32,

    /// Length of the per-sender sliding window in milliseconds
    #[arg(long, env = "BABEL_SEND_WINDOW_MS", default_value_t = 1000)]
    pub send_window_ms: u64,

    /// How often idle sender windows are swept
    #[arg(long, env = "BABEL_SEND_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug, Args)]
pub struct MessagingConfig {
    /// Maximum number of messages returned by a single resync request
    #[arg(long, env = "BABEL_SYNC_BATCH_LIMIT", default_value_t = 100)]
    pub sync_batch_limit: usize,

    /// Maximum page size for history queries
    #[arg(long, env = "BABEL_HISTORY_MAX_LIMIT", default_value_t = 100)]
    pub history_max_limit: i64,

    /// Maximum size of message content in bytes
    #[arg(long, env = "BABEL_MAX_CONTENT_BYTES", default_value_t = 65_536)]
    pub max_content_bytes: usize,

    /// Maximum number of mentioned users per message
    #[arg(long, env = "BABEL_MAX_MENTIONS", default_value_t = 50)]
    pub max_mentions: usize,
}

#[derive(Clone, Debug, Args)]
pub struct EnrichmentConfig {
    /// Enables translation and transcription of delivered messages
    #[arg(long = "enrichment-enabled", env = "BABEL_ENRICHMENT_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub enabled: bool,

    /// Maximum number of enrichment tasks running at once
    #[arg(long, env = "BABEL_ENRICHMENT_MAX_CONCURRENCY", default_value_t = 16)]
    pub max_concurrency: usize,

    /// Base URL of the translation service
    #[arg(long, env = "BABEL_TRANSLATOR_URL")]
    pub translator_url: Option<String>,

    /// Base URL of the transcription service
    #[arg(long, env = "BABEL_TRANSCRIBER_URL")]
    pub transcriber_url: Option<String>,

    /// Bearer token sent to the translation and transcription services
    #[arg(long, env = "BABEL_ENRICHMENT_API_KEY")]
    pub api_key: Option<String>,

    /// Timeout for a single request to an enrichment backend
    #[arg(long, env = "BABEL_ENRICHMENT_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 16,
            translator_url: None,
            transcriber_url: None,
            api_key: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct NotificationConfig {
    /// How often to reclaim dispatcher channels without live sessions
    #[arg(long, env = "BABEL_GC_INTERVAL_SECS", default_value_t = 60)]
    pub gc_interval_secs: u64,

    /// Capacity of each user's live event channel
    #[arg(long, env = "BABEL_USER_CHANNEL_CAPACITY", default_value_t = 64)]
    pub user_channel_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { gc_interval_secs: 60, user_channel_capacity: 64 }
    }
}

#[derive(Clone, Debug, Args)]
pub struct WsConfig {
    /// Size of the outbound frame buffer
    #[arg(long, env = "BABEL_WS_OUTBOUND_BUFFER_SIZE", default_value_t = 32)]
    pub outbound_buffer_size: usize,

    /// Number of inbound frames queued for processing per session
    #[arg(long, env = "BABEL_WS_INBOUND_QUEUE_SIZE", default_value_t = 32)]
    pub inbound_queue_size: usize,

    /// Size of the acknowledgment buffer
    #[arg(long, env = "BABEL_WS_ACK_BUFFER_SIZE", default_value_t = 100)]
    pub ack_buffer_size: usize,

    /// Number of acknowledgments to batch before flushing
    #[arg(long, env = "BABEL_WS_ACK_BATCH_SIZE", default_value_t = 50)]
    pub ack_batch_size: usize,

    /// How often to flush pending acknowledgments
    #[arg(long, env = "BABEL_WS_ACK_FLUSH_INTERVAL_MS", default_value_t = 500)]
    pub ack_flush_interval_ms: u64,

    /// How long a closing session waits for its queued frames to finish
    #[arg(long, env = "BABEL_WS_DRAIN_TIMEOUT_MS", default_value_t = 5000)]
    pub drain_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            outbound_buffer_size: 32,
            inbound_queue_size: 32,
            ack_buffer_size: 100,
            ack_batch_size: 50,
            ack_flush_interval_ms: 500,
            drain_timeout_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct StorageConfig {
    /// S3 bucket holding uploaded attachments. Audio transcription is disabled when unset.
    #[arg(long = "storage-bucket", env = "BABEL_STORAGE_BUCKET")]
    pub bucket: Option<String>,

    /// S3 region
    #[arg(long = "storage-region", env = "BABEL_STORAGE_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Custom S3 endpoint (useful for MinIO)
    #[arg(long = "storage-endpoint", env = "BABEL_STORAGE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// S3 access key
    #[arg(long = "storage-access-key", env = "BABEL_STORAGE_ACCESS_KEY")]
    pub access_key: Option<String>,

    /// S3 secret key
    #[arg(long = "storage-secret-key", env = "BABEL_STORAGE_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Force path style (required for many MinIO setups: http://host/bucket/key)
    #[arg(long = "storage-force-path-style", env = "BABEL_STORAGE_FORCE_PATH_STYLE", default_value_t = false)]
    pub force_path_style: bool,

    /// Largest audio object fetched for transcription (Default: 25MB)
    #[arg(long, env = "BABEL_AUDIO_MAX_BYTES", default_value_t = 26_214_400)]
    pub audio_max_bytes: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Args)]
pub struct TelemetryConfig {
    /// Log output format
    #[arg(long, env = "BABEL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// OTLP collector endpoint for traces and metrics
    #[arg(long, env = "BABEL_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

#[derive(Clone, Debug, Args)]
pub struct HealthConfig {
    /// Timeout for the database readiness check
    #[arg(long, env = "BABEL_HEALTH_DB_TIMEOUT_MS", default_value_t = 2000)]
    pub db_timeout_ms: u64,

    /// Timeout for the object storage readiness check
    #[arg(long, env = "BABEL_HEALTH_STORAGE_TIMEOUT_MS", default_value_t = 2000)]
    pub storage_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { db_timeout_ms: 2000, storage_timeout_ms: 2000 }
    }
}

impl Config {
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }
}
