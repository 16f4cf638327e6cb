use crate::config::RateLimitConfig;
use crate::error::{AppError, Result};
use axum::http::Request;
use axum::http::StatusCode;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tower_governor::GovernorError;
use tower_governor::key_extractor::KeyExtractor;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Metrics {
    pub decisions_total: Counter<u64>,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            decisions_total: meter
                .u64_counter("babel_rate_limit_decisions_total")
                .with_description("Rate limit decisions (allowed/throttled)")
                .build(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct IpKeyExtractor {
    trusted_proxies: Vec<IpNetwork>,
}

impl IpKeyExtractor {
    #[must_use]
    pub fn new(trusted_proxies: Vec<IpNetwork>) -> Self {
        Self { trusted_proxies }
    }

    /// Uses the right-most untrusted `X-Forwarded-For` hop when the peer is a trusted proxy.
    #[must_use]
    pub fn identify_client_ip(&self, headers: &axum::http::HeaderMap, peer_addr: IpAddr) -> IpAddr {
        if !self.is_trusted(&peer_addr) {
            return peer_addr;
        }

        let xff = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());

        if let Some(xff_val) = xff
            && let Some(real_ip) =
                xff_val.rsplit(',').filter_map(|s| s.trim().parse::<IpAddr>().ok()).find(|ip| !self.is_trusted(ip))
        {
            return real_ip;
        }

        peer_addr
    }

    fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(*ip))
    }
}

impl KeyExtractor for IpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> std::result::Result<Self::Key, GovernorError> {
        use axum::extract::ConnectInfo;
        use std::net::SocketAddr;

        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .ok_or(GovernorError::UnableToExtractKey)?;

        Ok(self.identify_client_ip(req.headers(), peer_ip))
    }
}

/// HTTP-level, IP-keyed throttling shared by the REST routes.
#[derive(Clone, Debug)]
pub struct RateLimitService {
    pub extractor: IpKeyExtractor,
    pub metrics: Metrics,
}

impl RateLimitService {
    #[must_use]
    pub fn new(trusted_proxies: Vec<IpNetwork>) -> Self {
        Self { extractor: IpKeyExtractor::new(trusted_proxies), metrics: Metrics::new() }
    }

    pub fn log_decision(&self, status: StatusCode, ratelimit_after: Option<String>) {
        let label = if status == StatusCode::TOO_MANY_REQUESTS {
            if let Some(after) = ratelimit_after {
                warn!("Rate limit exceeded (retry allowed after {}s)", after);
            }
            "throttled"
        } else {
            "allowed"
        };

        self.metrics.decisions_total.add(1, &[KeyValue::new("scope", "http"), KeyValue::new("status", label)]);
    }
}

/// Sliding-window admission gate for inbound sends, keyed by sender.
///
/// Each sender keeps a log of the instants of its admitted sends inside the
/// current window. The map entry is held locked for the whole check so
/// concurrent sends from one sender (several tabs) never lose a count.
#[derive(Debug)]
pub struct SenderRateLimiter {
    windows: DashMap<Uuid, VecDeque<Instant>>,
    limit: u32,
    window: Duration,
    metrics: Metrics,
}

impl SenderRateLimiter {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { windows: DashMap::new(), limit: limit.max(1), window, metrics: Metrics::new() }
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.send_limit, Duration::from_millis(config.send_window_ms))
    }

    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Counts one send for `sender_id` if the window has room.
    ///
    /// # Errors
    /// Returns `AppError::RateLimited` with the whole seconds until the oldest send
    /// leaves the window (at least 1).
    pub fn check(&self, sender_id: Uuid) -> Result<()> {
        let now = Instant::now();
        let mut log = self.windows.entry(sender_id).or_default();

        while log.front().is_some_and(|sent| now.duration_since(*sent) >= self.window) {
            log.pop_front();
        }

        if log.len() >= self.limit as usize {
            let oldest = log.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            let retry_after_secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            self.metrics.decisions_total.add(1, &[KeyValue::new("scope", "sender"), KeyValue::new("status", "throttled")]);
            tracing::warn!(%sender_id, limit = self.limit, "Sender exceeded message rate");
            return Err(AppError::RateLimited { retry_after_secs: retry_after_secs.max(1), limit: self.limit });
        }

        log.push_back(now);
        self.metrics.decisions_total.add(1, &[KeyValue::new("scope", "sender"), KeyValue::new("status", "allowed")]);
        Ok(())
    }

    /// Forgets senders whose whole log has aged out. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, log| log.back().is_some_and(|last| now.duration_since(*last) < self.window));
        before.saturating_sub(self.windows.len())
    }

    #[must_use]
    pub fn tracked_senders(&self) -> usize {
        self.windows.len()
    }
}
