use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Directory of the embedded queue keyspace
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            queue_path: default_queue_path(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queue")
}

/// API request limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: ByteSize,
    #[serde(default = "default_max_urls_per_bundle")]
    pub max_urls_per_bundle: usize,
    #[serde(default = "default_max_url_bytes")]
    pub max_url_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            max_urls_per_bundle: default_max_urls_per_bundle(),
            max_url_bytes: default_max_url_bytes(),
        }
    }
}

fn default_max_payload_bytes() -> ByteSize {
    ByteSize(256 * 1024) // 256 KB
}

fn default_max_urls_per_bundle() -> usize {
    100
}

fn default_max_url_bytes() -> usize {
    2048
}

/// Download worker pool
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sleep between claims while the part queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Minimum spacing of progress samples for one part
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Upper bound on how long a control command waits while no data arrives
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_concurrency() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_checkpoint_interval_ms() -> u64 {
    250
}

fn default_stall_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("bundlebox/{}", env!("CARGO_PKG_VERSION"))
}

/// Queue retry policy and retention
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Finished bundles older than this are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl QueueConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 86400)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_retention_days() -> u32 {
    7
}

/// Shared bandwidth budget
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterConfig {
    /// Aggregate bytes per second across all transfers
    #[serde(default = "default_rate_budget")]
    pub rate_budget: ByteSize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_budget: default_rate_budget(),
        }
    }
}

fn default_rate_budget() -> ByteSize {
    ByteSize(10 * 1024 * 1024) // 10 MB/s
}

/// File-hosting provider
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// API root, e.g. `https://provider.example/api`
    pub base_url: Option<String>,
    /// Hosts whose links are resolved through the provider
    #[serde(default)]
    pub link_hosts: Vec<String>,
    /// Loaded from environment, never from the config file
    #[serde(skip)]
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

/// Local storage for part files
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("data/downloads")
}
