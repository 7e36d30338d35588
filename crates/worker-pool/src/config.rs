//! Worker configuration.

use std::time::Duration;

use anyhow::Result;
use flowrun_control_plane::config::QueueConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier.
    pub worker_id: String,

    /// Jobs processed at the same time.
    pub concurrency: usize,

    /// Pause between polls of an empty queue.
    pub poll_interval: Duration,

    /// How often a running job tells the broker it is still alive.
    pub heartbeat_interval: Duration,

    /// `text` or `json`.
    pub log_format: String,

    /// Queue to pull from and broker to connect to.
    pub queue: QueueConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `WORKER_ID` (default: hostname plus a random suffix)
    /// - `WORKER_CONCURRENCY` (default: 5)
    /// - `WORKER_POLL_INTERVAL_MS` (default: 100)
    /// - `WORKER_HEARTBEAT_INTERVAL_MS` (default: 30000, must be > 0)
    /// - `WORKER_LOG_FORMAT` (default: "text")
    /// - `FLOWRUN_QUEUE_*` as read by [`QueueConfig::from_env`]
    pub fn from_env() -> Result<Self> {
        let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id());

        let concurrency: usize = std::env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CONCURRENCY);

        let poll_ms: u64 = std::env::var("WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let heartbeat_ms: u64 = std::env::var("WORKER_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);

        let log_format = std::env::var("WORKER_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

        Ok(Self {
            worker_id,
            concurrency,
            poll_interval: Duration::from_millis(poll_ms),
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            log_format,
            queue: QueueConfig::from_env()?,
        })
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

const DEFAULT_CONCURRENCY: usize = 5;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            log_format: "text".to_string(),
            queue: QueueConfig::default(),
        }
    }
}
