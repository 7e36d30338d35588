//! Job queue abstraction.
//!
//! Decouples "request an execution" from "run an execution". A job carries
//! an opaque JSON payload plus a retry policy; the queue guarantees
//! at-least-once delivery to a worker and applies the retry policy when a
//! worker reports a retryable failure.
//!
//! Two implementations:
//! - [`NatsJobQueue`]: NATS JetStream, one stream per queue for delivery and
//!   a key-value bucket holding the job records.
//! - [`MemoryJobQueue`]: single-process queue for tests and local runs.

pub mod memory;
pub mod nats;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryJobQueue;
pub use nats::NatsJobQueue;

/// Capacity of the job event broadcast channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by queue implementations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Job serialization error: {0}")]
    Serialization(String),

    #[error("Unknown job {0}")]
    UnknownJob(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Delay between delivery attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay: u64 },
    /// `delay * 2^(n-1)` before the n-th retry.
    Exponential { delay: u64 },
}

impl Backoff {
    /// Delay to wait after `attempts_made` failed attempts (1-based).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => Duration::from_millis(delay),
            Backoff::Exponential { delay } => {
                let exponent = attempts_made.saturating_sub(1).min(16);
                Duration::from_millis(delay.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Retry policy attached to a job at enqueue time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOptions {
    /// Total delivery attempts, including the first.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::Exponential { delay: 2000 },
        }
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// A job record as stored by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub options: JobOptions,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(queue: &str, name: &str, payload: Value, options: JobOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            name: name.to_string(),
            payload,
            options,
            state: JobState::Waiting,
            attempts_made: 0,
            failed_reason: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
        }
    }

    /// 1-based number of the delivery currently being processed.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Whether another failure would still leave an attempt to retry with.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt() < self.options.attempts
    }

    pub(crate) fn mark_active(&mut self) {
        self.state = JobState::Active;
        self.processed_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self) {
        self.state = JobState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_released(&mut self) {
        self.state = JobState::Waiting;
    }

    /// Record a failed attempt and decide whether the job goes back to the
    /// queue.
    pub(crate) fn register_failure(&mut self, reason: &str, retryable: bool) -> FailOutcome {
        let retry = retryable && self.has_attempts_left();
        self.attempts_made += 1;
        self.failed_reason = Some(reason.to_string());

        if retry {
            self.state = JobState::Delayed;
            FailOutcome::Retrying {
                attempts_made: self.attempts_made,
                delay: self.options.backoff.delay_for(self.attempts_made),
            }
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(Utc::now());
            FailOutcome::Failed {
                attempts_made: self.attempts_made,
            }
        }
    }
}

/// Returned by [`JobQueue::enqueue`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    pub name: String,
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Redelivered after `delay`.
    Retrying { attempts_made: u32, delay: Duration },
    /// Out of attempts, or the failure was not retryable.
    Failed { attempts_made: u32 },
}

/// Broker acknowledgement handle for one delivery.
pub(crate) enum DeliveryToken {
    Memory,
    Nats(Box<async_nats::jetstream::Message>),
}

/// One hand-off of a job to a worker. Must be settled exactly once through
/// `complete`, `fail` or `release`.
pub struct Delivery {
    pub job: Job,
    pub(crate) token: DeliveryToken,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery").field("job", &self.job).finish()
    }
}

/// Job lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub queue: String,
    pub job_id: String,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEventKind {
    Added,
    Active { attempt: u32 },
    Completed,
    Retrying { attempts_made: u32, delay_ms: u64 },
    Failed { reason: String },
    Released,
    /// The worker holding the delivery is still on it.
    Progress,
}

impl JobEventKind {
    pub(crate) fn from_outcome(outcome: FailOutcome, reason: &str) -> Self {
        match outcome {
            FailOutcome::Retrying {
                attempts_made,
                delay,
            } => JobEventKind::Retrying {
                attempts_made,
                delay_ms: delay.as_millis() as u64,
            },
            FailOutcome::Failed { .. } => JobEventKind::Failed {
                reason: reason.to_string(),
            },
        }
    }
}

/// Named job queues with at-least-once delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job to `queue`.
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<JobHandle>;

    /// Fetch a job record by id.
    async fn get_job(&self, queue: &str, job_id: &str) -> QueueResult<Option<Job>>;

    /// Take the next ready job, if any, without blocking for long.
    async fn next_job(&self, queue: &str) -> QueueResult<Option<Delivery>>;

    /// Settle a delivery as processed.
    async fn complete(&self, delivery: Delivery) -> QueueResult<()>;

    /// Settle a delivery as failed; retried with backoff when `retryable`
    /// and attempts remain.
    async fn fail(
        &self,
        delivery: Delivery,
        reason: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome>;

    /// Hand a delivery back untouched (shutdown); does not consume an attempt.
    async fn release(&self, delivery: Delivery) -> QueueResult<()>;

    /// Keep an unsettled delivery from being handed to another worker.
    /// Call well inside the broker's ack wait for as long as the job runs.
    async fn touch(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Subscribe to job lifecycle events emitted by this process.
    fn subscribe_events(&self) -> broadcast::Receiver<JobEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential { delay: 2000 };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed { delay: 500 };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_options_wire_format() {
        let json = serde_json::to_value(JobOptions::default()).unwrap();
        assert_eq!(
            json,
            json!({ "attempts": 3, "backoff": { "type": "exponential", "delay": 2000 } })
        );
    }

    #[test]
    fn test_failure_accounting() {
        let mut job = Job::new("q", "j", json!({}), JobOptions::default());
        assert_eq!(job.attempt(), 1);

        let first = job.register_failure("db down", true);
        assert_eq!(
            first,
            FailOutcome::Retrying {
                attempts_made: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(job.state, JobState::Delayed);

        let second = job.register_failure("db down", true);
        assert_eq!(
            second,
            FailOutcome::Retrying {
                attempts_made: 2,
                delay: Duration::from_secs(4)
            }
        );

        let third = job.register_failure("db down", true);
        assert_eq!(third, FailOutcome::Failed { attempts_made: 3 });
        assert_eq!(job.state, JobState::Failed);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let mut job = Job::new("q", "j", json!({}), JobOptions::default());
        let outcome = job.register_failure("execution vanished", false);
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 1 });
        assert_eq!(job.failed_reason.as_deref(), Some("execution vanished"));
    }

    #[test]
    fn test_event_wire_format() {
        let event = JobEvent {
            queue: "flow-execution".to_string(),
            job_id: "j1".to_string(),
            kind: JobEventKind::Retrying {
                attempts_made: 1,
                delay_ms: 2000,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["kind"]["event"], "retrying");
    }
}
