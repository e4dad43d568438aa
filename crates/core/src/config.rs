use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

/// Master configuration.
///
/// Parsed from `farmhand.toml`; every key can be overridden with a
/// `FARMHAND_SECTION_KEY` environment variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

impl MasterConfig {
    /// Parse config from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus env overrides, for deployments without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `FARMHAND_SECTION_KEY` overrides `section.key`, e.g.
    /// `FARMHAND_DISPATCH_MAX_SEND_ATTEMPTS` -> `dispatch.max_send_attempts`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("FARMHAND_DISPATCH_MAX_SEND_ATTEMPTS") {
            self.dispatch.max_send_attempts = v;
        }
        if let Some(v) = env_parse("FARMHAND_DISPATCH_RETRY_BACKOFF_MS") {
            self.dispatch.retry_backoff_ms = v;
        }
        if let Some(v) = env_parse("FARMHAND_DISPATCH_SPAWN_DISPATCH") {
            self.dispatch.spawn_dispatch = v;
        }
        if let Some(v) = env_parse("FARMHAND_DISPATCH_SPECULATIVE") {
            self.dispatch.speculative = v;
        }
        if let Some(v) = env_parse("FARMHAND_DISPATCH_MAX_CLAIMS_PER_PARTIAL") {
            self.dispatch.max_claims_per_partial = v;
        }
        if let Some(v) = env_parse("FARMHAND_THROTTLE_SLACK") {
            self.throttle.slack = v;
        }
        if let Some(v) = env_parse("FARMHAND_QUEUE_SHARED_CAPACITY") {
            self.queue.shared_capacity = v;
        }
        if let Some(v) = env_parse("FARMHAND_LIVENESS_INTERVAL_MS") {
            self.liveness.interval_ms = v;
        }
        if let Some(v) = env_parse("FARMHAND_LIVENESS_PROBE_TIMEOUT_MS") {
            self.liveness.probe_timeout_ms = v;
        }
        if let Some(v) = env_parse("FARMHAND_CLIENT_MAX_NOTIFY_ATTEMPTS") {
            self.client.max_notify_attempts = v;
        }
        if let Some(v) = env_parse("FARMHAND_CLIENT_RETRY_BACKOFF_MS") {
            self.client.retry_backoff_ms = v;
        }
        if let Some(v) = env_parse("FARMHAND_SHUTDOWN_RELEASE_TIMEOUT_MS") {
            self.shutdown.release_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u16>("FARMHAND_STATS_HTTP_PORT") {
            self.stats.http_port = (v > 0).then_some(v);
        }
    }

    /// Reject settings the master cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_send_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_send_attempts must be at least 1".into(),
            ));
        }
        if self.client.max_notify_attempts == 0 {
            return Err(ConfigError::Invalid(
                "client.max_notify_attempts must be at least 1".into(),
            ));
        }
        if self.liveness.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "liveness.interval_ms must be positive".into(),
            ));
        }
        if self.liveness.probe_timeout_ms >= self.liveness.interval_ms {
            return Err(ConfigError::Invalid(format!(
                "liveness.probe_timeout_ms ({}) must be below liveness.interval_ms ({})",
                self.liveness.probe_timeout_ms, self.liveness.interval_ms
            )));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  dispatch:  attempts={}, backoff={}ms, spawn={}, speculative={}, max_claims={}",
            self.dispatch.max_send_attempts,
            self.dispatch.retry_backoff_ms,
            self.dispatch.spawn_dispatch,
            self.dispatch.speculative,
            self.dispatch.max_claims_per_partial
        );
        tracing::info!("  throttle:  slack={}", self.throttle.slack);
        tracing::info!("  queue:     shared_capacity={}", self.queue.shared_capacity);
        tracing::info!(
            "  liveness:  interval={}ms, probe_timeout={}ms",
            self.liveness.interval_ms,
            self.liveness.probe_timeout_ms
        );
        tracing::info!(
            "  client:    attempts={}, backoff={}ms",
            self.client.max_notify_attempts,
            self.client.retry_backoff_ms
        );
        tracing::info!(
            "  stats:     http_port={}",
            self.stats
                .http_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "(disabled)".into())
        );
    }
}

// ── Dispatch ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Delivery attempts per partial problem and worker.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Fixed sleep between delivery attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Run each dispatch attempt on its own task instead of inline.
    #[serde(default)]
    pub spawn_dispatch: bool,
    /// Hand in-flight partial problems to idle workers when nothing else is left.
    #[serde(default = "default_true")]
    pub speculative: bool,
    /// Upper bound on concurrent claims of one partial problem (0 = unlimited).
    #[serde(default = "default_max_claims")]
    pub max_claims_per_partial: usize,
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_max_claims() -> usize {
    3
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: default_max_send_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            spawn_dispatch: false,
            speculative: default_true(),
            max_claims_per_partial: default_max_claims(),
        }
    }
}

impl DispatchConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ── Throttle ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Outstanding partial problems allowed per problem beyond the worker count.
    #[serde(default = "default_slack")]
    pub slack: usize,
}

fn default_slack() -> usize {
    2
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            slack: default_slack(),
        }
    }
}

impl ThrottleConfig {
    /// Outstanding limit for a problem given the registered worker count.
    pub fn limit(&self, registered_workers: usize) -> usize {
        registered_workers + self.slack
    }
}

// ── Queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Capacity of the shared queue between selection and dispatch (0 = unbounded).
    #[serde(default = "default_shared_capacity")]
    pub shared_capacity: usize,
}

fn default_shared_capacity() -> usize {
    4
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            shared_capacity: default_shared_capacity(),
        }
    }
}

// ── Liveness ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_liveness_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_liveness_interval_ms() -> u64 {
    5000
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_liveness_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ── Client ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_max_notify_attempts")]
    pub max_notify_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_notify_attempts() -> u32 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_notify_attempts: default_max_notify_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ClientConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ── Shutdown ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long a terminating problem waits for workers to let go of it
    /// before its resources are released anyway.
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,
}

fn default_release_timeout_ms() -> u64 {
    5000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            release_timeout_ms: default_release_timeout_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

// ── Stats ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Port for the `GET /stats` endpoint; disabled when absent.
    pub http_port: Option<u16>,
}
