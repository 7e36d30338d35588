//! In-process job queue.
//!
//! Same contract as the JetStream queue, minus durability: jobs live in the
//! process and are lost on restart. Backoff delays are honoured with
//! `tokio::time::Instant`, so paused-clock tests can step through them.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use super::{
    Delivery, DeliveryToken, FailOutcome, Job, JobEvent, JobEventKind, JobHandle, JobOptions,
    JobQueue, QueueError, QueueResult, EVENT_CHANNEL_CAPACITY,
};

#[derive(Default)]
struct QueueState {
    /// Job records keyed by `(queue, job_id)`.
    jobs: HashMap<(String, String), Job>,
    /// Ready job ids per queue, in delivery order.
    ready: HashMap<String, VecDeque<String>>,
    /// Jobs waiting out a backoff: `(queue, job_id, due)`.
    delayed: Vec<(String, String, Instant)>,
    /// Completed and failed jobs, oldest first.
    finished: VecDeque<(String, String)>,
}

impl QueueState {
    fn promote_due(&mut self, queue: &str, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            let (q, _, due) = &self.delayed[index];
            if q == queue && *due <= now {
                let (q, id, _) = self.delayed.remove(index);
                self.ready.entry(q).or_default().push_back(id);
            } else {
                index += 1;
            }
        }
    }

    /// Record a finished job and drop the oldest records beyond `keep`.
    fn retire(&mut self, queue: &str, job_id: &str, keep: usize) {
        self.finished
            .push_back((queue.to_string(), job_id.to_string()));
        while self.finished.len() > keep {
            if let Some(key) = self.finished.pop_front() {
                self.jobs.remove(&key);
            }
        }
    }

    fn job_mut(&mut self, queue: &str, job_id: &str) -> QueueResult<&mut Job> {
        self.jobs
            .get_mut(&(queue.to_string(), job_id.to_string()))
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))
    }
}

/// Finished job records kept for lookup by default.
pub const DEFAULT_RETAINED_JOBS: usize = 1000;

/// In-memory [`JobQueue`].
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    events: broadcast::Sender<JobEvent>,
    retain_finished: usize,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_JOBS)
    }

    /// Keep at most `retain_finished` completed or failed job records.
    pub fn with_retention(retain_finished: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            events,
            retain_finished,
        }
    }

    /// Number of jobs ready or waiting out a backoff on `queue`.
    pub async fn pending_count(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        let ready = state.ready.get(queue).map_or(0, VecDeque::len);
        let delayed = state.delayed.iter().filter(|(q, _, _)| q == queue).count();
        ready + delayed
    }

    fn emit(&self, job: &Job, kind: JobEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            kind,
        });
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<JobHandle> {
        let job = Job::new(queue, name, payload, options);
        let handle = JobHandle {
            id: job.id.clone(),
            queue: job.queue.clone(),
            name: job.name.clone(),
        };

        {
            let mut state = self.state.lock().await;
            state
                .ready
                .entry(queue.to_string())
                .or_default()
                .push_back(job.id.clone());
            state
                .jobs
                .insert((queue.to_string(), job.id.clone()), job.clone());
        }

        tracing::debug!(queue = %queue, job_id = %handle.id, name = %name, "Job enqueued");
        self.emit(&job, JobEventKind::Added);
        Ok(handle)
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> QueueResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .get(&(queue.to_string(), job_id.to_string()))
            .cloned())
    }

    async fn next_job(&self, queue: &str) -> QueueResult<Option<Delivery>> {
        let job = {
            let mut state = self.state.lock().await;
            state.promote_due(queue, Instant::now());

            let Some(job_id) = state.ready.get_mut(queue).and_then(VecDeque::pop_front) else {
                return Ok(None);
            };

            let job = state.job_mut(queue, &job_id)?;
            job.mark_active();
            job.clone()
        };

        self.emit(
            &job,
            JobEventKind::Active {
                attempt: job.attempt(),
            },
        );
        Ok(Some(Delivery {
            job,
            token: DeliveryToken::Memory,
        }))
    }

    async fn complete(&self, delivery: Delivery) -> QueueResult<()> {
        let job = {
            let mut state = self.state.lock().await;
            let job = state.job_mut(&delivery.job.queue, &delivery.job.id)?;
            job.mark_completed();
            let job = job.clone();
            state.retire(&job.queue, &job.id, self.retain_finished);
            job
        };
        self.emit(&job, JobEventKind::Completed);
        Ok(())
    }

    async fn fail(
        &self,
        delivery: Delivery,
        reason: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome> {
        let (job, outcome) = {
            let mut state = self.state.lock().await;
            let job = state.job_mut(&delivery.job.queue, &delivery.job.id)?;
            let outcome = job.register_failure(reason, retryable);
            let job = job.clone();

            match outcome {
                FailOutcome::Retrying { delay, .. } => {
                    state
                        .delayed
                        .push((job.queue.clone(), job.id.clone(), Instant::now() + delay));
                }
                FailOutcome::Failed { .. } => {
                    state.retire(&job.queue, &job.id, self.retain_finished);
                }
            }
            (job, outcome)
        };

        self.emit(&job, JobEventKind::from_outcome(outcome, reason));
        Ok(outcome)
    }

    async fn release(&self, delivery: Delivery) -> QueueResult<()> {
        let job = {
            let mut state = self.state.lock().await;
            let job = state.job_mut(&delivery.job.queue, &delivery.job.id)?;
            job.mark_released();
            let job = job.clone();
            state
                .ready
                .entry(job.queue.clone())
                .or_default()
                .push_front(job.id.clone());
            job
        };
        self.emit(&job, JobEventKind::Released);
        Ok(())
    }

    async fn touch(&self, delivery: &Delivery) -> QueueResult<()> {
        // Deliveries never time out here; only the event is observable.
        self.emit(&delivery.job, JobEventKind::Progress);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
