//! NATS JetStream job queue.
//!
//! Layout:
//! - one work-queue stream per queue, `{prefix}_{QUEUE}`, bound to subject
//!   `flowrun.jobs.{queue}`; each message is a small envelope naming the job
//! - one key-value bucket holding the job records under `{queue}.{job_id}`
//! - one durable pull consumer per queue, shared by every worker
//!
//! Retries use JetStream redelivery: a retryable failure is NAKed with the
//! backoff delay, a final failure is terminated.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as ConsumerConfig, Consumer},
    kv, AckKind, Context,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use super::{
    Delivery, DeliveryToken, FailOutcome, Job, JobEvent, JobEventKind, JobHandle, JobOptions,
    JobQueue, QueueError, QueueResult, EVENT_CHANNEL_CAPACITY,
};
use crate::config::QueueConfig;

/// Subject prefix for job envelopes.
pub const SUBJECT_PREFIX: &str = "flowrun.jobs";

/// How long a delivery may stay unsettled before JetStream redelivers it.
/// Workers reset it with [`JobQueue::touch`] while a job runs.
pub const ACK_WAIT: Duration = Duration::from_secs(600);

/// How long a fetch waits for a message before reporting an empty queue.
const FETCH_EXPIRES: Duration = Duration::from_millis(500);

/// Stream message pointing at a job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub queue: String,
    pub job_id: String,
}

/// JetStream-backed [`JobQueue`].
pub struct NatsJobQueue {
    js: Context,
    records: kv::Store,
    stream_prefix: String,
    consumers: Mutex<HashMap<String, Consumer<ConsumerConfig>>>,
    events: broadcast::Sender<JobEvent>,
}

impl NatsJobQueue {
    /// Connect to the broker and open (or create) the job record bucket.
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        let client = async_nats::connect(&config.nats_url)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let js = jetstream::new(client);

        let records = match js.get_key_value(&config.kv_bucket).await {
            Ok(store) => {
                tracing::debug!(bucket = %config.kv_bucket, "Using existing job bucket");
                store
            }
            Err(_) => {
                let store = js
                    .create_key_value(kv::Config {
                        bucket: config.kv_bucket.clone(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| QueueError::Broker(e.to_string()))?;
                tracing::info!(bucket = %config.kv_bucket, "Created job bucket");
                store
            }
        };

        tracing::info!(url = %config.nats_url, "Connected to NATS");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            js,
            records,
            stream_prefix: config.stream_prefix.clone(),
            consumers: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Ensure the stream for `queue` exists.
    async fn ensure_stream(&self, queue: &str) -> QueueResult<jetstream::stream::Stream> {
        let name = stream_name(&self.stream_prefix, queue);
        match self.js.get_stream(&name).await {
            Ok(stream) => Ok(stream),
            Err(_) => {
                let subject = subject_for(queue);
                let config = jetstream::stream::Config {
                    name: name.clone(),
                    subjects: vec![subject.clone()],
                    retention: jetstream::stream::RetentionPolicy::WorkQueue,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };
                let stream = self
                    .js
                    .create_stream(config)
                    .await
                    .map_err(|e| QueueError::Broker(e.to_string()))?;
                tracing::info!(stream = %name, subject = %subject, "Created NATS stream");
                Ok(stream)
            }
        }
    }

    /// Durable consumer shared by every worker of `queue`.
    async fn consumer(&self, queue: &str) -> QueueResult<Consumer<ConsumerConfig>> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(queue) {
            return Ok(consumer.clone());
        }

        let stream = self.ensure_stream(queue).await?;
        let durable = consumer_name(queue);
        let consumer = match stream.get_consumer(&durable).await {
            Ok(consumer) => consumer,
            Err(_) => {
                let config = ConsumerConfig {
                    durable_name: Some(durable.clone()),
                    filter_subject: subject_for(queue),
                    ack_wait: ACK_WAIT,
                    ..Default::default()
                };
                let consumer = stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| QueueError::Broker(e.to_string()))?;
                tracing::info!(consumer = %durable, "Created NATS consumer");
                consumer
            }
        };

        consumers.insert(queue.to_string(), consumer.clone());
        Ok(consumer)
    }

    async fn load(&self, queue: &str, job_id: &str) -> QueueResult<Option<Job>> {
        let entry = self
            .records
            .get(record_key(queue, job_id))
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        match entry {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, job: &Job) -> QueueResult<()> {
        let bytes = serde_json::to_vec(job)?;
        self.records
            .put(record_key(&job.queue, &job.id), bytes.into())
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn settle(&self, token: DeliveryToken, kind: AckKind) -> QueueResult<()> {
        match token {
            DeliveryToken::Nats(message) => message
                .ack_with(kind)
                .await
                .map_err(|e| QueueError::Broker(e.to_string())),
            DeliveryToken::Memory => Err(QueueError::Broker(
                "delivery was not issued by this queue".to_string(),
            )),
        }
    }

    fn emit(&self, job: &Job, kind: JobEventKind) {
        let _ = self.events.send(JobEvent {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            kind,
        });
    }
}

#[async_trait]
impl JobQueue for NatsJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<JobHandle> {
        self.ensure_stream(queue).await?;

        let job = Job::new(queue, name, payload, options);
        self.store(&job).await?;

        let envelope = serde_json::to_vec(&JobEnvelope {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
        })?;
        self.js
            .publish(subject_for(queue), envelope.into())
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        tracing::debug!(queue = %queue, job_id = %job.id, name = %name, "Published job");
        self.emit(&job, JobEventKind::Added);

        Ok(JobHandle {
            id: job.id,
            queue: job.queue,
            name: job.name,
        })
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> QueueResult<Option<Job>> {
        self.load(queue, job_id).await
    }

    async fn next_job(&self, queue: &str) -> QueueResult<Option<Delivery>> {
        let consumer = self.consumer(queue).await?;
        let mut messages = consumer
            .fetch()
            .max_messages(1)
            .expires(FETCH_EXPIRES)
            .messages()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let Some(message) = messages.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| QueueError::Broker(e.to_string()))?;

        let envelope: JobEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed job envelope");
                self.settle(DeliveryToken::Nats(Box::new(message)), AckKind::Term)
                    .await?;
                return Ok(None);
            }
        };

        let Some(mut job) = self.load(&envelope.queue, &envelope.job_id).await? else {
            tracing::warn!(job_id = %envelope.job_id, "Dropping envelope without job record");
            self.settle(DeliveryToken::Nats(Box::new(message)), AckKind::Term)
                .await?;
            return Ok(None);
        };

        job.mark_active();
        self.store(&job).await?;
        self.emit(
            &job,
            JobEventKind::Active {
                attempt: job.attempt(),
            },
        );

        Ok(Some(Delivery {
            job,
            token: DeliveryToken::Nats(Box::new(message)),
        }))
    }

    async fn complete(&self, delivery: Delivery) -> QueueResult<()> {
        let Delivery { mut job, token } = delivery;
        job.mark_completed();
        self.store(&job).await?;
        self.settle(token, AckKind::Ack).await?;
        self.emit(&job, JobEventKind::Completed);
        Ok(())
    }

    async fn fail(
        &self,
        delivery: Delivery,
        reason: &str,
        retryable: bool,
    ) -> QueueResult<FailOutcome> {
        let Delivery { mut job, token } = delivery;
        let outcome = job.register_failure(reason, retryable);
        self.store(&job).await?;

        let kind = match outcome {
            FailOutcome::Retrying { delay, .. } => AckKind::Nak(Some(delay)),
            FailOutcome::Failed { .. } => AckKind::Term,
        };
        self.settle(token, kind).await?;

        self.emit(&job, JobEventKind::from_outcome(outcome, reason));
        Ok(outcome)
    }

    async fn release(&self, delivery: Delivery) -> QueueResult<()> {
        let Delivery { mut job, token } = delivery;
        job.mark_released();
        self.store(&job).await?;
        self.settle(token, AckKind::Nak(None)).await?;
        self.emit(&job, JobEventKind::Released);
        Ok(())
    }

    async fn touch(&self, delivery: &Delivery) -> QueueResult<()> {
        match &delivery.token {
            DeliveryToken::Nats(message) => message
                .ack_with(AckKind::Progress)
                .await
                .map_err(|e| QueueError::Broker(e.to_string()))?,
            DeliveryToken::Memory => {
                return Err(QueueError::Broker(
                    "delivery was not issued by this queue".to_string(),
                ))
            }
        }
        tracing::trace!(job_id = %delivery.job.id, "Extended ack wait");
        self.emit(&delivery.job, JobEventKind::Progress);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}

/// Replace characters NATS does not allow in a subject token or key.
fn sanitize(queue: &str) -> String {
    queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn stream_name(prefix: &str, queue: &str) -> String {
    format!("{}_{}", prefix, sanitize(queue).replace('-', "_")).to_uppercase()
}

fn consumer_name(queue: &str) -> String {
    format!("{}-workers", sanitize(queue))
}

fn subject_for(queue: &str) -> String {
    format!("{}.{}", SUBJECT_PREFIX, sanitize(queue))
}

fn record_key(queue: &str, job_id: &str) -> String {
    format!("{}.{}", sanitize(queue), job_id)
}
