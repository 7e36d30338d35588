//! Execution orchestrator.
//!
//! Two entry points:
//! - [`ExecutionOrchestrator::request_execution`] turns a stored flow into a
//!   PENDING execution with one PENDING step per enabled node and enqueues a
//!   run job for it.
//! - [`ExecutionOrchestrator::run_execution`] is called by a worker for each
//!   delivered job. It walks the steps in order, dispatches each node,
//!   persists every transition and finally updates the flow's counters.
//!
//! A node error is an outcome, not an error: it fails its step and the
//! execution, and `run_execution` returns `Ok`. Anything else that goes
//! wrong (store or queue trouble) forces the execution to FAILED and is
//! returned to the worker so the job can be retried. Redelivered jobs resume
//! where the previous attempt stopped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::nodes::{NodeError, NodeExecutor};
use super::plan::{plan_steps, validate_flow};
use super::state::{ExecutionStatus, StepStatus};
use crate::config::QueueConfig;
use crate::db::models::{Execution, ExecutionPatch, NewExecution, StepPatch};
use crate::error::{AppError, AppResult};
use crate::queue::{JobOptions, JobQueue};
use crate::store::FlowStore;

/// Payload of an `execute-flow` job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub execution_id: Uuid,
    pub flow_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub trigger_data: Map<String, Value>,
}

/// Where run jobs go and how they are retried.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub queue_name: String,
    pub job_name: String,
    pub job_options: JobOptions,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for OrchestratorSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            queue_name: config.name.clone(),
            job_name: config.job_name.clone(),
            job_options: config.job_options(),
        }
    }
}

/// How a run job ended, when it did not return an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The execution ran to a terminal status on this delivery.
    Finished(ExecutionStatus),
    /// The execution was already finished; nothing was touched.
    AlreadyFinished(ExecutionStatus),
}

impl RunOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match *self {
            RunOutcome::Finished(status) | RunOutcome::AlreadyFinished(status) => status,
        }
    }
}

/// Drives executions from request to final status.
pub struct ExecutionOrchestrator {
    store: Arc<dyn FlowStore>,
    queue: Arc<dyn JobQueue>,
    executor: Arc<dyn NodeExecutor>,
    settings: OrchestratorSettings,
}

impl ExecutionOrchestrator {
    pub fn new(
        store: Arc<dyn FlowStore>,
        queue: Arc<dyn JobQueue>,
        executor: Arc<dyn NodeExecutor>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            executor,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Create a PENDING execution of `flow_id` and enqueue its run.
    pub async fn request_execution(
        &self,
        flow_id: Uuid,
        user_id: Uuid,
        trigger_data: Option<Map<String, Value>>,
    ) -> AppResult<Execution> {
        let flow = self
            .store
            .find_flow_with_nodes(flow_id, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Flow {}", flow_id)))?;

        if !flow.is_active {
            return Err(AppError::InvalidState(format!(
                "Flow {} is not active",
                flow_id
            )));
        }
        validate_flow(&flow)?;

        let trigger_data = trigger_data.unwrap_or_default();
        let execution = self
            .store
            .create_execution_with_steps(NewExecution {
                flow_id,
                user_id,
                trigger_data: trigger_data.clone(),
                steps: plan_steps(&flow),
            })
            .await?;

        let payload = serde_json::to_value(ExecutionJob {
            execution_id: execution.id,
            flow_id,
            user_id,
            trigger_data,
        })?;

        match self
            .queue
            .enqueue(
                &self.settings.queue_name,
                &self.settings.job_name,
                payload,
                self.settings.job_options,
            )
            .await
        {
            Ok(handle) => {
                info!(
                    execution_id = %execution.id,
                    flow_id = %flow_id,
                    job_id = %handle.id,
                    steps = execution.steps.len(),
                    "Execution requested"
                );
                Ok(execution)
            }
            Err(err) => {
                warn!(execution_id = %execution.id, error = %err, "Failed to enqueue execution");
                let patch = ExecutionPatch {
                    status: Some(ExecutionStatus::Failed),
                    error_message: Some(Some(format!("failed to enqueue execution: {}", err))),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                };
                if let Err(mark_err) = self.store.update_execution(execution.id, patch).await {
                    warn!(execution_id = %execution.id, error = %mark_err, "Failed to mark execution as failed");
                }
                Err(err.into())
            }
        }
    }

    /// Run (or resume) the execution named by `job`.
    pub async fn run_execution(
        &self,
        job: &ExecutionJob,
        cancel: &CancellationToken,
    ) -> AppResult<RunOutcome> {
        let execution = self
            .store
            .find_execution(job.execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution {}", job.execution_id)))?;

        if is_settled(&execution) {
            debug!(
                execution_id = %execution.id,
                status = %execution.status,
                "Execution already finished, ignoring delivery"
            );
            return Ok(RunOutcome::AlreadyFinished(execution.status));
        }

        // FAILED without a failed step: an earlier attempt was force-failed
        // and its run was already counted.
        let counted = execution.status == ExecutionStatus::Failed && execution.started_at.is_some();

        match self.drive(&execution, counted, cancel).await {
            Ok(status) => Ok(RunOutcome::Finished(status)),
            Err(Interrupted {
                error: AppError::Cancelled,
                ..
            }) => {
                info!(execution_id = %execution.id, "Execution interrupted, left RUNNING");
                Err(AppError::Cancelled)
            }
            Err(Interrupted {
                error,
                finished: Some((success, completed_at)),
            }) => {
                // The terminal status is stored, so a redelivery will skip
                // this execution. Count the run now or it is never counted.
                warn!(execution_id = %execution.id, error = %error, "Failed to update flow statistics, retrying once");
                match self
                    .record_statistics(execution.flow_id, success, completed_at, counted)
                    .await
                {
                    Ok(()) if success => Ok(RunOutcome::Finished(ExecutionStatus::Success)),
                    Ok(()) => Ok(RunOutcome::Finished(ExecutionStatus::Failed)),
                    Err(stats_err) => {
                        warn!(flow_id = %execution.flow_id, error = %stats_err, "Failed to update flow statistics");
                        Err(error)
                    }
                }
            }
            Err(Interrupted {
                error,
                finished: None,
            }) => {
                self.force_fail(&execution, counted, &error).await;
                Err(error)
            }
        }
    }

    /// Count one finished run of `flow_id`.
    pub async fn update_flow_statistics(
        &self,
        flow_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.store.increment_flow_counters(flow_id, success, at).await
    }

    async fn record_statistics(
        &self,
        flow_id: Uuid,
        success: bool,
        at: DateTime<Utc>,
        counted: bool,
    ) -> AppResult<()> {
        if counted {
            self.store.amend_flow_counters(flow_id, success, at).await
        } else {
            self.update_flow_statistics(flow_id, success, at).await
        }
    }

    async fn drive(
        &self,
        execution: &Execution,
        counted: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionStatus, Interrupted> {
        ensure_transition(execution.status, ExecutionStatus::Running)?;

        let started_at = execution.started_at.unwrap_or_else(Utc::now);
        self.store
            .update_execution(
                execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    started_at: Some(started_at),
                    error_message: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            execution_id = %execution.id,
            flow_id = %execution.flow_id,
            resumed = execution.status != ExecutionStatus::Pending,
            "Execution started"
        );

        let mut current = execution.trigger_data.clone();
        let mut failure: Option<String> = None;

        for step in &execution.steps {
            match step.status {
                StepStatus::Success => {
                    if let Some(Value::Object(output)) = &step.output {
                        merge(&mut current, output.clone());
                    }
                    debug!(execution_id = %execution.id, step = step.step_number, "Step already done");
                    continue;
                }
                StepStatus::Failed => {
                    failure = Some(step.error_message.clone().unwrap_or_default());
                    break;
                }
                StepStatus::Pending | StepStatus::Running => {}
            }

            if cancel.is_cancelled() {
                return Err(AppError::Cancelled.into());
            }

            let step_started = Utc::now();
            self.store
                .update_step(
                    step.id,
                    StepPatch {
                        status: Some(StepStatus::Running),
                        input: Some(Value::Object(current.clone())),
                        started_at: Some(step_started),
                        error_message: Some(None),
                        ..Default::default()
                    },
                )
                .await?;

            debug!(
                execution_id = %execution.id,
                step = step.step_number,
                node_id = %step.node_id,
                node_type = %step.node.node_type,
                "Running step"
            );

            let result = self.executor.execute(&step.node, &current, cancel).await;
            let step_completed = Utc::now();
            let duration_ms = (step_completed - step_started).num_milliseconds();

            match result {
                Ok(output) => {
                    self.store
                        .update_step(
                            step.id,
                            StepPatch {
                                status: Some(StepStatus::Success),
                                output: Some(Value::Object(output.clone())),
                                completed_at: Some(step_completed),
                                duration_ms: Some(duration_ms),
                                ..Default::default()
                            },
                        )
                        .await?;
                    merge(&mut current, output);
                }
                Err(NodeError::Cancelled) => return Err(AppError::Cancelled.into()),
                Err(err) => {
                    let message = err.to_string();
                    warn!(
                        execution_id = %execution.id,
                        step = step.step_number,
                        node_id = %step.node_id,
                        error = %message,
                        "Step failed"
                    );
                    self.store
                        .update_step(
                            step.id,
                            StepPatch {
                                status: Some(StepStatus::Failed),
                                error_message: Some(Some(message.clone())),
                                completed_at: Some(step_completed),
                                duration_ms: Some(duration_ms),
                                ..Default::default()
                            },
                        )
                        .await?;
                    failure = Some(message);
                    break;
                }
            }
        }

        let success = failure.is_none();
        let status = if success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        ensure_transition(ExecutionStatus::Running, status)?;

        let completed_at = Utc::now();
        self.store
            .update_execution(
                execution.id,
                ExecutionPatch {
                    status: Some(status),
                    output: Some(Value::Object(current)),
                    error_message: Some(failure),
                    completed_at: Some(completed_at),
                    duration_ms: Some((completed_at - started_at).num_milliseconds()),
                    ..Default::default()
                },
            )
            .await?;

        self.record_statistics(execution.flow_id, success, completed_at, counted)
            .await
            .map_err(|error| Interrupted {
                error,
                finished: Some((success, completed_at)),
            })?;

        info!(
            execution_id = %execution.id,
            status = %status,
            duration_ms = (completed_at - started_at).num_milliseconds(),
            "Execution finished"
        );
        Ok(status)
    }

    /// Best effort: mark the execution FAILED with `err` and count the run.
    async fn force_fail(&self, execution: &Execution, counted: bool, err: &AppError) {
        warn!(execution_id = %execution.id, error = %err, "Forcing execution to FAILED");

        let step_error = match self.store.find_execution(execution.id).await {
            Ok(Some(current)) if current.status == ExecutionStatus::Success => {
                // The final write landed even though it reported an error.
                warn!(
                    execution_id = %execution.id,
                    status = %current.status,
                    "Execution already finished, not overriding"
                );
                let completed_at = current.completed_at.unwrap_or_else(Utc::now);
                if let Err(stats_err) = self
                    .record_statistics(execution.flow_id, true, completed_at, counted)
                    .await
                {
                    warn!(flow_id = %execution.flow_id, error = %stats_err, "Failed to update flow statistics");
                }
                return;
            }
            Ok(Some(current)) => current
                .failed_step()
                .and_then(|step| step.error_message.clone()),
            Ok(None) => return,
            Err(_) => None,
        };

        // A failed step's message wins over the infrastructure error.
        let message = step_error.unwrap_or_else(|| err.to_string());
        let completed_at = Utc::now();
        let started_at = execution.started_at.unwrap_or(completed_at);
        let patch = ExecutionPatch {
            status: Some(ExecutionStatus::Failed),
            error_message: Some(Some(message)),
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
            ..Default::default()
        };
        if let Err(update_err) = self.store.update_execution(execution.id, patch).await {
            warn!(execution_id = %execution.id, error = %update_err, "Failed to mark execution as failed");
        }

        if let Err(stats_err) = self
            .record_statistics(execution.flow_id, false, completed_at, counted)
            .await
        {
            warn!(flow_id = %execution.flow_id, error = %stats_err, "Failed to update flow statistics");
        }
    }
}

/// Why `drive` stopped without a terminal outcome. `finished` carries
/// `(success, completed_at)` once the terminal status has been stored.
struct Interrupted {
    error: AppError,
    finished: Option<(bool, DateTime<Utc>)>,
}

impl From<AppError> for Interrupted {
    fn from(error: AppError) -> Self {
        Self {
            error,
            finished: None,
        }
    }
}

/// SUCCESS, or FAILED because a step failed. A redelivered job for such an
/// execution is a duplicate.
fn is_settled(execution: &Execution) -> bool {
    match execution.status {
        ExecutionStatus::Success => true,
        ExecutionStatus::Failed => execution.failed_step().is_some(),
        ExecutionStatus::Pending | ExecutionStatus::Running => false,
    }
}

fn ensure_transition(from: ExecutionStatus, to: ExecutionStatus) -> AppResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(AppError::InvalidState(format!(
            "Execution cannot move from {} to {}",
            from, to
        )))
    }
}

/// Shallow merge; later keys win.
fn merge(current: &mut Map<String, Value>, output: Map<String, Value>) {
    for (key, value) in output {
        current.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Flow, FlowNode};
    use crate::engine::nodes::{DefaultNodeExecutor, NodeOutput};
    use crate::queue::{JobState, MemoryJobQueue, QueueError};
    use crate::store::MemoryFlowStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn node(id: &str, node_type: &str, config: Value) -> FlowNode {
        FlowNode {
            id: id.to_string(),
            node_type: node_type.to_string(),
            name: id.to_uppercase(),
            config: match config {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            enabled: true,
            integration_id: None,
        }
    }

    fn scenario_flow(user_id: Uuid) -> Flow {
        Flow::new(
            user_id,
            "welcome",
            vec![
                node("t1", "TRIGGER", json!({})),
                node("a1", "ACTION", json!({})),
                node("d1", "DELAY", json!({ "delayMs": 10 })),
            ],
        )
    }

    /// Default behaviour, except the named node raises `message`.
    struct FailingExecutor {
        node_id: &'static str,
        message: &'static str,
    }

    #[async_trait]
    impl NodeExecutor for FailingExecutor {
        async fn execute(
            &self,
            node: &FlowNode,
            input: &Map<String, Value>,
            cancel: &CancellationToken,
        ) -> Result<NodeOutput, NodeError> {
            if node.id == self.node_id {
                return Err(NodeError::execution(self.message));
            }
            DefaultNodeExecutor.execute(node, input, cancel).await
        }
    }

    /// Counts dispatches per node id.
    #[derive(Default)]
    struct CountingExecutor {
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeExecutor for CountingExecutor {
        async fn execute(
            &self,
            node: &FlowNode,
            input: &Map<String, Value>,
            cancel: &CancellationToken,
        ) -> Result<NodeOutput, NodeError> {
            self.calls.lock().unwrap().push(node.id.clone());
            DefaultNodeExecutor.execute(node, input, cancel).await
        }
    }

    /// Memory store with one-shot write failures.
    struct FlakyStore {
        inner: MemoryFlowStore,
        fail_next_step_update: AtomicBool,
        step_updates: AtomicUsize,
        fail_at_update: usize,
        fail_counters: AtomicBool,
        fail_final_update: AtomicBool,
    }

    impl FlakyStore {
        /// The `fail_at_update`-th step update fails (1-based, 0 never).
        fn failing_at(fail_at_update: usize) -> Self {
            Self {
                inner: MemoryFlowStore::new(),
                fail_next_step_update: AtomicBool::new(true),
                step_updates: AtomicUsize::new(0),
                fail_at_update,
                fail_counters: AtomicBool::new(false),
                fail_final_update: AtomicBool::new(false),
            }
        }

        /// The next counter increment fails.
        fn failing_counters() -> Self {
            let store = Self::failing_at(0);
            store.fail_counters.store(true, Ordering::SeqCst);
            store
        }

        /// The next execution update that stores an output fails.
        fn failing_final_update() -> Self {
            let store = Self::failing_at(0);
            store.fail_final_update.store(true, Ordering::SeqCst);
            store
        }
    }

    #[async_trait]
    impl FlowStore for FlakyStore {
        async fn find_flow_with_nodes(&self, flow_id: Uuid, user_id: Uuid) -> AppResult<Option<Flow>> {
            self.inner.find_flow_with_nodes(flow_id, user_id).await
        }

        async fn find_flow_summary(
            &self,
            flow_id: Uuid,
        ) -> AppResult<Option<crate::db::models::FlowSummary>> {
            self.inner.find_flow_summary(flow_id).await
        }

        async fn create_execution_with_steps(&self, new: NewExecution) -> AppResult<Execution> {
            self.inner.create_execution_with_steps(new).await
        }

        async fn find_execution(&self, execution_id: Uuid) -> AppResult<Option<Execution>> {
            self.inner.find_execution(execution_id).await
        }

        async fn list_executions(
            &self,
            flow_id: Uuid,
            user_id: Uuid,
            limit: i64,
        ) -> AppResult<Vec<Execution>> {
            self.inner.list_executions(flow_id, user_id, limit).await
        }

        async fn update_execution(&self, execution_id: Uuid, patch: ExecutionPatch) -> AppResult<()> {
            if patch.output.is_some() && self.fail_final_update.swap(false, Ordering::SeqCst) {
                return Err(AppError::Internal("connection reset".to_string()));
            }
            self.inner.update_execution(execution_id, patch).await
        }

        async fn update_step(&self, step_id: Uuid, patch: StepPatch) -> AppResult<()> {
            let n = self.step_updates.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_at_update && self.fail_next_step_update.swap(false, Ordering::SeqCst) {
                return Err(AppError::Internal("connection reset".to_string()));
            }
            self.inner.update_step(step_id, patch).await
        }

        async fn increment_flow_counters(
            &self,
            flow_id: Uuid,
            success: bool,
            at: DateTime<Utc>,
        ) -> AppResult<()> {
            if self.fail_counters.swap(false, Ordering::SeqCst) {
                return Err(AppError::Internal("db blip".to_string()));
            }
            self.inner.increment_flow_counters(flow_id, success, at).await
        }

        async fn amend_flow_counters(
            &self,
            flow_id: Uuid,
            success: bool,
            at: DateTime<Utc>,
        ) -> AppResult<()> {
            self.inner.amend_flow_counters(flow_id, success, at).await
        }
    }

    /// Queue that refuses every job.
    struct DownQueue(MemoryJobQueue);

    #[async_trait]
    impl JobQueue for DownQueue {
        async fn enqueue(
            &self,
            _queue: &str,
            _name: &str,
            _payload: Value,
            _options: JobOptions,
        ) -> crate::queue::QueueResult<crate::queue::JobHandle> {
            Err(QueueError::Connection("broker unreachable".to_string()))
        }

        async fn get_job(
            &self,
            queue: &str,
            job_id: &str,
        ) -> crate::queue::QueueResult<Option<crate::queue::Job>> {
            self.0.get_job(queue, job_id).await
        }

        async fn next_job(
            &self,
            queue: &str,
        ) -> crate::queue::QueueResult<Option<crate::queue::Delivery>> {
            self.0.next_job(queue).await
        }

        async fn complete(&self, delivery: crate::queue::Delivery) -> crate::queue::QueueResult<()> {
            self.0.complete(delivery).await
        }

        async fn fail(
            &self,
            delivery: crate::queue::Delivery,
            reason: &str,
            retryable: bool,
        ) -> crate::queue::QueueResult<crate::queue::FailOutcome> {
            self.0.fail(delivery, reason, retryable).await
        }

        async fn release(&self, delivery: crate::queue::Delivery) -> crate::queue::QueueResult<()> {
            self.0.release(delivery).await
        }

        async fn touch(&self, delivery: &crate::queue::Delivery) -> crate::queue::QueueResult<()> {
            self.0.touch(delivery).await
        }

        fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<crate::queue::JobEvent> {
            self.0.subscribe_events()
        }
    }

    struct Harness {
        store: Arc<MemoryFlowStore>,
        queue: Arc<MemoryJobQueue>,
        orchestrator: ExecutionOrchestrator,
    }

    fn harness(executor: Arc<dyn NodeExecutor>) -> Harness {
        let store = Arc::new(MemoryFlowStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let orchestrator = ExecutionOrchestrator::new(
            store.clone(),
            queue.clone(),
            executor,
            OrchestratorSettings::default(),
        );
        Harness {
            store,
            queue,
            orchestrator,
        }
    }

    async fn next_job(queue: &MemoryJobQueue) -> ExecutionJob {
        let delivery = queue.next_job("flow-execution").await.unwrap().unwrap();
        assert_eq!(delivery.job.name, "execute-flow");
        serde_json::from_value(delivery.job.payload.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_request_creates_pending_execution_and_job() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        h.store.insert_flow(flow.clone()).await;

        let trigger = json!({ "email": "a@b.c" }).as_object().cloned();
        let execution = h
            .orchestrator
            .request_execution(flow.id, user, trigger.clone())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Pending);
        let ids: Vec<_> = execution.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "a1", "d1"]);
        assert!(execution
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Pending));

        let job = next_job(&h.queue).await;
        assert_eq!(job.execution_id, execution.id);
        assert_eq!(job.flow_id, flow.id);
        assert_eq!(job.user_id, user);
        assert_eq!(Some(job.trigger_data), trigger);
    }

    #[tokio::test]
    async fn test_job_options_attached() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        h.store.insert_flow(flow.clone()).await;
        h.orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap();

        let delivery = h.queue.next_job("flow-execution").await.unwrap().unwrap();
        assert_eq!(delivery.job.options, JobOptions::default());
    }

    #[tokio::test]
    async fn test_request_rejects_missing_and_foreign_flow() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        h.store.insert_flow(flow.clone()).await;

        let err = h
            .orchestrator
            .request_execution(Uuid::new_v4(), user, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = h
            .orchestrator
            .request_execution(flow.id, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(h.store.execution_count().await, 0);
    }

    #[tokio::test]
    async fn test_inactive_flow_creates_nothing() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let mut flow = scenario_flow(user);
        flow.is_active = false;
        h.store.insert_flow(flow.clone()).await;

        let err = h
            .orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(h.store.execution_count().await, 0);
        assert_eq!(h.queue.pending_count("flow-execution").await, 0);
    }

    #[tokio::test]
    async fn test_enqueue_failure_marks_execution_failed() {
        let store = Arc::new(MemoryFlowStore::new());
        let orchestrator = ExecutionOrchestrator::new(
            store.clone(),
            Arc::new(DownQueue(MemoryJobQueue::new())),
            Arc::new(DefaultNodeExecutor),
            OrchestratorSettings::default(),
        );
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        store.insert_flow(flow.clone()).await;

        let err = orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Queue(_)));

        let executions = store.list_executions(flow.id, user, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("failed to enqueue execution: "));
        assert_eq!(store.flow(flow.id).await.unwrap().total_runs, 0);
    }

    #[tokio::test]
    async fn test_successful_run() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        h.store.insert_flow(flow.clone()).await;
        h.orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap();

        let job = next_job(&h.queue).await;
        let outcome = h
            .orchestrator
            .run_execution(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));

        let execution = h.store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution.error_message.is_none());
        assert!(execution.started_at.is_some());
        assert!(execution.completed_at.is_some());
        assert!(execution.duration_ms.unwrap() >= 10);

        let output = execution.output.unwrap();
        assert_eq!(output["delayed"], json!(10));
        assert_eq!(output["executed"], json!(true));
        assert!(execution
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Success && s.duration_ms.is_some()));

        let flow = h.store.flow(flow.id).await.unwrap();
        assert_eq!(flow.total_runs, 1);
        assert_eq!(flow.successful_runs, 1);
        assert_eq!(flow.failed_runs, 0);
        assert_eq!(flow.last_run, execution.completed_at);
    }

    #[tokio::test]
    async fn test_failing_node_short_circuits() {
        let h = harness(Arc::new(FailingExecutor {
            node_id: "a1",
            message: "boom",
        }));
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        h.store.insert_flow(flow.clone()).await;
        h.orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap();

        let job = next_job(&h.queue).await;
        let outcome = h
            .orchestrator
            .run_execution(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Failed));

        let execution = h.store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_message.as_deref(), Some("boom"));

        let statuses: Vec<_> = execution.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Success, StepStatus::Failed, StepStatus::Pending]
        );
        assert_eq!(execution.steps[1].error_message.as_deref(), Some("boom"));

        let flow = h.store.flow(flow.id).await.unwrap();
        assert_eq!((flow.total_runs, flow.successful_runs, flow.failed_runs), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_unknown_node_type_fails_its_step() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = Flow::new(
            user,
            "f",
            vec![
                node("t1", "TRIGGER", json!({})),
                node("x1", "TELEPORT", json!({})),
            ],
        );
        h.store.insert_flow(flow.clone()).await;
        h.orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap();

        let job = next_job(&h.queue).await;
        h.orchestrator
            .run_execution(&job, &CancellationToken::new())
            .await
            .unwrap();
        let execution = h.store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(
            execution.error_message.as_deref(),
            Some("Unknown node type: TELEPORT")
        );
    }

    #[tokio::test]
    async fn test_step_inputs_accumulate_and_later_keys_win() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = Flow::new(
            user,
            "f",
            vec![
                node("t1", "TRIGGER", json!({})),
                node("a1", "ACTION", json!({ "color": "red" })),
                node("a2", "ACTION", json!({ "color": "blue" })),
            ],
        );
        h.store.insert_flow(flow.clone()).await;
        h.orchestrator
            .request_execution(flow.id, user, json!({ "color": "green" }).as_object().cloned())
            .await
            .unwrap();

        let job = next_job(&h.queue).await;
        h.orchestrator
            .run_execution(&job, &CancellationToken::new())
            .await
            .unwrap();

        let execution = h.store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.steps[0].input.as_ref().unwrap()["color"], json!("green"));
        assert_eq!(execution.steps[2].input.as_ref().unwrap()["color"], json!("red"));
        let output = execution.output.unwrap();
        assert_eq!(output["color"], json!("blue"));
        assert_eq!(output["nodeId"], json!("a2"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_ignored() {
        let executor = Arc::new(CountingExecutor::default());
        let h = harness(executor.clone());
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        h.store.insert_flow(flow.clone()).await;
        h.orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap();

        let job = next_job(&h.queue).await;
        let cancel = CancellationToken::new();
        h.orchestrator.run_execution(&job, &cancel).await.unwrap();
        let outcome = h.orchestrator.run_execution(&job, &cancel).await.unwrap();

        assert_eq!(outcome, RunOutcome::AlreadyFinished(ExecutionStatus::Success));
        assert_eq!(executor.calls.lock().unwrap().len(), 3);
        assert_eq!(h.store.flow(flow.id).await.unwrap().total_runs, 1);
    }

    #[tokio::test]
    async fn test_missing_execution_is_not_found() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let job = ExecutionJob {
            execution_id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            trigger_data: Map::new(),
        };
        let err = h
            .orchestrator
            .run_execution(&job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_forced_failure_then_resume_counts_once() {
        // Third step update is a1 -> RUNNING.
        let store = Arc::new(FlakyStore::failing_at(3));
        let queue = Arc::new(MemoryJobQueue::new());
        let executor = Arc::new(CountingExecutor::default());
        let orchestrator = ExecutionOrchestrator::new(
            store.clone(),
            queue.clone(),
            executor.clone(),
            OrchestratorSettings::default(),
        );
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        store.inner.insert_flow(flow.clone()).await;
        orchestrator.request_execution(flow.id, user, None).await.unwrap();

        let job = next_job(&queue).await;
        let cancel = CancellationToken::new();

        let err = orchestrator.run_execution(&job, &cancel).await.unwrap_err();
        assert!(err.is_retryable());

        let forced = store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(forced.status, ExecutionStatus::Failed);
        assert_eq!(
            forced.error_message.as_deref(),
            Some("Internal error: connection reset")
        );
        assert!(forced.failed_step().is_none());
        let counters = store.inner.flow(flow.id).await.unwrap();
        assert_eq!((counters.total_runs, counters.failed_runs), (1, 1));

        let outcome = orchestrator.run_execution(&job, &cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));

        let resumed = store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Success);
        assert!(resumed.error_message.is_none());
        assert_eq!(resumed.started_at, forced.started_at);

        // t1 was not dispatched twice.
        assert_eq!(*executor.calls.lock().unwrap(), vec!["t1", "a1", "d1"]);

        let counters = store.inner.flow(flow.id).await.unwrap();
        assert_eq!(
            (counters.total_runs, counters.successful_runs, counters.failed_runs),
            (1, 1, 0)
        );
    }

    fn flaky_orchestrator(
        store: Arc<FlakyStore>,
        executor: Arc<dyn NodeExecutor>,
    ) -> (ExecutionOrchestrator, Arc<MemoryJobQueue>) {
        let queue = Arc::new(MemoryJobQueue::new());
        let orchestrator = ExecutionOrchestrator::new(
            store,
            queue.clone(),
            executor,
            OrchestratorSettings::default(),
        );
        (orchestrator, queue)
    }

    #[tokio::test]
    async fn test_statistics_failure_still_counts_run() {
        let store = Arc::new(FlakyStore::failing_counters());
        let (orchestrator, queue) = flaky_orchestrator(store.clone(), Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        store.inner.insert_flow(flow.clone()).await;
        orchestrator.request_execution(flow.id, user, None).await.unwrap();

        let job = next_job(&queue).await;
        let cancel = CancellationToken::new();

        let outcome = orchestrator.run_execution(&job, &cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Success));

        let execution = store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);

        let counters = store.inner.flow(flow.id).await.unwrap();
        assert_eq!(
            (counters.total_runs, counters.successful_runs, counters.failed_runs),
            (1, 1, 0)
        );
        assert_eq!(counters.last_run, execution.completed_at);

        // A duplicate delivery finds the run settled and leaves the counters alone.
        let outcome = orchestrator.run_execution(&job, &cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::AlreadyFinished(ExecutionStatus::Success));
        let counters = store.inner.flow(flow.id).await.unwrap();
        assert_eq!(counters.total_runs, 1);
    }

    #[tokio::test]
    async fn test_forced_failure_keeps_step_error() {
        let store = Arc::new(FlakyStore::failing_final_update());
        let (orchestrator, queue) = flaky_orchestrator(
            store.clone(),
            Arc::new(FailingExecutor {
                node_id: "a1",
                message: "boom",
            }),
        );
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        store.inner.insert_flow(flow.clone()).await;
        orchestrator.request_execution(flow.id, user, None).await.unwrap();

        let job = next_job(&queue).await;
        let cancel = CancellationToken::new();

        let err = orchestrator.run_execution(&job, &cancel).await.unwrap_err();
        assert!(err.is_retryable());

        let execution = store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_message.as_deref(), Some("boom"));
        assert_eq!(execution.steps[1].error_message.as_deref(), Some("boom"));

        let outcome = orchestrator.run_execution(&job, &cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::AlreadyFinished(ExecutionStatus::Failed));

        let counters = store.inner.flow(flow.id).await.unwrap();
        assert_eq!(
            (counters.total_runs, counters.successful_runs, counters.failed_runs),
            (1, 0, 1)
        );
    }

    #[tokio::test]
    async fn test_cancellation_leaves_execution_running() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = Flow::new(
            user,
            "f",
            vec![
                node("t1", "TRIGGER", json!({})),
                node("d1", "DELAY", json!({ "delayMs": 60_000 })),
            ],
        );
        h.store.insert_flow(flow.clone()).await;
        h.orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap();

        let job = next_job(&h.queue).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = h.orchestrator.run_execution(&job, &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));

        let execution = h.store.find_execution(job.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.steps[0].status, StepStatus::Success);
        assert_eq!(execution.steps[1].status, StepStatus::Running);
        assert_eq!(h.store.flow(flow.id).await.unwrap().total_runs, 0);
    }

    #[tokio::test]
    async fn test_counters_across_runs() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = Flow::new(user, "f", vec![node("t1", "TRIGGER", json!({}))]);
        h.store.insert_flow(flow.clone()).await;

        let mut last_completed = None;
        for _ in 0..4 {
            h.orchestrator
                .request_execution(flow.id, user, None)
                .await
                .unwrap();
            let job = next_job(&h.queue).await;
            h.orchestrator
                .run_execution(&job, &CancellationToken::new())
                .await
                .unwrap();
            last_completed = h
                .store
                .find_execution(job.execution_id)
                .await
                .unwrap()
                .unwrap()
                .completed_at;
        }

        let flow = h.store.flow(flow.id).await.unwrap();
        assert_eq!(flow.total_runs, 4);
        assert_eq!(flow.successful_runs, 4);
        assert_eq!(flow.failed_runs, 0);
        assert_eq!(flow.last_run, last_completed);
    }

    #[tokio::test]
    async fn test_queued_job_state_visible() {
        let h = harness(Arc::new(DefaultNodeExecutor));
        let user = Uuid::new_v4();
        let flow = scenario_flow(user);
        h.store.insert_flow(flow.clone()).await;
        h.orchestrator
            .request_execution(flow.id, user, None)
            .await
            .unwrap();
        let delivery = h.queue.next_job("flow-execution").await.unwrap().unwrap();
        assert_eq!(delivery.job.state, JobState::Active);
    }
}
