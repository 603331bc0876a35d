use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for Lurker
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Identifiers to seed the frontier with on startup
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub frontier: FrontierConfig,
    #[serde(default, rename = "circuit-breaker")]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
}

/// Worker pool and global limits
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Global request budget across all hosts
    #[serde(rename = "requests-per-second", default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// How long to wait for workers to drain after a shutdown signal
    #[serde(rename = "shutdown-timeout-secs", default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            requests_per_second: default_requests_per_second(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// HTTP fetch settings
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Per-attempt request timeout (milliseconds)
    #[serde(rename = "timeout-ms", default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// TCP connect timeout (milliseconds)
    #[serde(rename = "connect-timeout-ms", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

/// Retry and backoff policy parameters
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Number of retryable failures after which an item is dead-lettered
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(rename = "base-delay-ms", default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound of the uniform jitter added to each delay
    #[serde(rename = "jitter-ms", default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Cap applied after jitter
    #[serde(rename = "max-delay-ms", default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            jitter_ms: default_jitter_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Frontier bounds and per-host politeness
#[derive(Debug, Clone, Deserialize)]
pub struct FrontierConfig {
    /// Maximum number of items held in memory
    #[serde(rename = "max-pending", default = "default_max_pending")]
    pub max_pending: usize,

    /// Maximum items in flight against one host
    #[serde(rename = "per-host-concurrency", default = "default_per_host_concurrency")]
    pub per_host_concurrency: usize,

    /// Minimum time between two dispatches to the same host (milliseconds)
    #[serde(rename = "min-host-interval-ms", default)]
    pub min_host_interval_ms: u64,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            per_host_concurrency: default_per_host_concurrency(),
            min_host_interval_ms: 0,
        }
    }
}

/// Per-host circuit breaker thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive retryable failures that open the circuit
    #[serde(rename = "failure-threshold", default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit suspends the host (milliseconds)
    #[serde(rename = "cooldown-ms", default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Durable storage location
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path", default = "default_database_path")]
    pub database_path: String,

    /// Directory for downloaded asset bytes; without it only the asset
    /// metadata is stored
    #[serde(rename = "asset-dir", default)]
    pub asset_dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            asset_dir: None,
        }
    }
}

/// Host patterns that bound which discovered identifiers are followed
///
/// An empty allow list admits every host. Deny always wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Entity extraction rules
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default, rename = "rule")]
    pub rules: Vec<ExtractRule>,

    /// Queue every `img[src]` for download as an asset
    #[serde(default = "default_true")]
    pub assets: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            assets: default_true(),
        }
    }
}

/// A selector-driven entity rule
///
/// Every element matching `selector` becomes one entity of `kind`. The
/// entity's natural key is read from the `key` attribute of the element
/// (resolved against the document address when it looks like a link), and
/// each field is the trimmed text of the first match of its selector
/// within the element.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractRule {
    pub kind: String,
    pub selector: String,
    pub key: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn default_workers() -> usize {
    8
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    format!("lurker/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_pending() -> usize {
    10_000
}

fn default_per_host_concurrency() -> usize {
    2
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_database_path() -> String {
    "./lurker.db".to_string()
}

fn default_true() -> bool {
    true
}
