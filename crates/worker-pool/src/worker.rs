//! Worker lifecycle management.
//!
//! The worker pulls jobs from one queue and hands each to the job handler
//! in its own task. A semaphore bounds how many run at once. On shutdown
//! it stops pulling, cancels in-flight jobs through child tokens and waits
//! for every permit to come back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use flowrun_control_plane::queue::{Delivery, FailOutcome, JobQueue};

use crate::config::WorkerConfig;
use crate::handler::JobHandler;

/// Worker that processes jobs from one queue.
pub struct Worker {
    /// Worker configuration.
    config: WorkerConfig,

    /// Queue jobs are pulled from and settled on.
    queue: Arc<dyn JobQueue>,

    /// Runs each job.
    handler: Arc<dyn JobHandler>,

    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
}

impl Worker {
    pub fn new(config: WorkerConfig, queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            queue,
            handler,
            semaphore,
        }
    }

    /// Process jobs until `shutdown` is cancelled, then drain.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue_name = self.config.queue.name.clone();
        tracing::info!(
            worker_id = %self.config.worker_id,
            queue = %queue_name,
            concurrency = self.config.concurrency,
            "Worker started"
        );

        loop {
            // Wait for available slot
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => permit?,
            };

            match self.queue.next_job(&queue_name).await {
                Ok(Some(delivery)) => {
                    if shutdown.is_cancelled() {
                        if let Err(e) = self.queue.release(delivery).await {
                            tracing::warn!(error = %e, "Failed to release job");
                        }
                        break;
                    }

                    tracing::debug!(
                        job_id = %delivery.job.id,
                        name = %delivery.job.name,
                        attempt = delivery.job.attempt(),
                        "Received job"
                    );

                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    let cancel = shutdown.child_token();
                    let heartbeat = self.config.heartbeat_interval;

                    tokio::spawn(async move {
                        // Keep permit until done
                        let _permit = permit;
                        process(queue, handler, delivery, cancel, heartbeat).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&shutdown).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, queue = %queue_name, "Failed to fetch job");
                    drop(permit);
                    self.idle(&shutdown).await;
                }
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "Waiting for in-flight jobs");
        let permits = u32::try_from(self.config.concurrency.max(1)).unwrap_or(u32::MAX);
        let _all = self.semaphore.acquire_many(permits).await?;

        tracing::info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }
}

/// Run one job and settle its delivery, touching it every `heartbeat`
/// so the broker does not hand it to another worker meanwhile.
async fn process(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    delivery: Delivery,
    cancel: CancellationToken,
    heartbeat: Duration,
) {
    let job_id = delivery.job.id.clone();
    let result = {
        let mut handle = handler.handle(&delivery.job, &cancel);
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut handle => break result,
                _ = ticker.tick() => {
                    if let Err(e) = queue.touch(&delivery).await {
                        tracing::warn!(job_id = %job_id, error = %e, "Failed to extend job lease");
                    }
                }
            }
        }
    };

    let settled = match result {
        Ok(()) => queue.complete(delivery).await,
        Err(err) if err.is_cancelled() => {
            tracing::info!(job_id = %job_id, "Job interrupted by shutdown, releasing");
            queue.release(delivery).await
        }
        Err(err) => {
            let reason = err.to_string();
            match queue.fail(delivery, &reason, err.is_retryable()).await {
                Ok(FailOutcome::Retrying {
                    attempts_made,
                    delay,
                }) => {
                    tracing::warn!(
                        job_id = %job_id,
                        error = %reason,
                        attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        "Job failed, will retry"
                    );
                    Ok(())
                }
                Ok(FailOutcome::Failed { attempts_made }) => {
                    tracing::error!(
                        job_id = %job_id,
                        error = %reason,
                        attempts_made,
                        "Job failed permanently"
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = settled {
        tracing::error!(job_id = %job_id, error = %e, "Failed to settle job");
    }
}
