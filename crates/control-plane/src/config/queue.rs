//! Job queue configuration.

use serde::Deserialize;

use crate::queue::{Backoff, JobOptions};

/// Queue configuration loaded from environment variables.
///
/// Environment variables are prefixed with `FLOWRUN_QUEUE_`:
/// - `FLOWRUN_QUEUE_NATS_URL`: Broker URL (default: "nats://localhost:4222")
/// - `FLOWRUN_QUEUE_NAME`: Queue flow executions are enqueued on (default: "flow-execution")
/// - `FLOWRUN_QUEUE_JOB_NAME`: Job name for execution runs (default: "execute-flow")
/// - `FLOWRUN_QUEUE_ATTEMPTS`: Delivery attempts per job (default: 3)
/// - `FLOWRUN_QUEUE_BACKOFF_MS`: Base of the exponential backoff (default: 2000)
/// - `FLOWRUN_QUEUE_STREAM_PREFIX`: JetStream stream name prefix (default: "FLOWRUN")
/// - `FLOWRUN_QUEUE_KV_BUCKET`: JetStream key-value bucket for job records (default: "flowrun_jobs")
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_job_name")]
    pub job_name: String,

    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    #[serde(default = "default_kv_bucket")]
    pub kv_bucket: String,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_name() -> String {
    "flow-execution".to_string()
}

fn default_job_name() -> String {
    "execute-flow".to_string()
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_stream_prefix() -> String {
    "FLOWRUN".to_string()
}

fn default_kv_bucket() -> String {
    "flowrun_jobs".to_string()
}

impl QueueConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLOWRUN_QUEUE_").from_env::<QueueConfig>()
    }

    /// Retry policy attached to every execution job.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.attempts.max(1),
            backoff: Backoff::Exponential {
                delay: self.backoff_ms,
            },
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            name: default_name(),
            job_name: default_job_name(),
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            stream_prefix: default_stream_prefix(),
            kv_bucket: default_kv_bucket(),
        }
    }
}
