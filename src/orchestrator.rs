//! The explicit orchestrator instance.
//!
//! Holds configuration and collaborator references, admits workflows up to
//! the concurrency limit, and applies every queue completion, human outcome
//! and sweep under the owning workflow's lock. Side effects that leave the
//! process (notifications) happen after the lock is released.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::builder::WorkflowBuilder;
use crate::config::RemediatorConfig;
use crate::decision::{DecisionEngine, RemediationType, Scorer};
use crate::error::{FailureKind, RemediatorError};
use crate::executor::{StepContext, StepExecutor, StepOutcome};
use crate::human::{Expiry, HumanTask, HumanTaskManager, TaskOutcome};
use crate::notify::{Notification, Notifier};
use crate::queue::{
    CompletionSink, Delivery, Dispatcher, Disposition, LeaseQueue, Poll, QueueBackend, QueueMessage,
};
use crate::runner::{Applied, Effect, GraphRunner};
use crate::signal::{Activity, Violation, ViolationSignal};
use crate::workflow::{
    AuditRecord, HistoryEntry, RemediationWorkflow, StepEvent, StepKind, StepStatus,
    WorkflowStatus,
};

/// Per-step view in a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub dependencies: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Answer to `get_status`: workflow state, per-step states and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: String,
    pub violation_id: String,
    pub framework: String,
    pub remediation_type: RemediationType,
    pub rationale: String,
    pub status: WorkflowStatus,
    pub failure_reason: Option<String>,
    /// A dispatch was refused by the queue and has not been retried yet.
    pub dispatch_degraded: bool,
    /// Still waiting for a free workflow slot.
    pub queued: bool,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepReport>,
    pub history: Vec<HistoryEntry>,
}

impl WorkflowStatusReport {
    fn from_workflow(wf: &RemediationWorkflow) -> Self {
        Self {
            workflow_id: wf.id.clone(),
            violation_id: wf.signal.id.clone(),
            framework: wf.signal.framework.clone(),
            remediation_type: wf.decision.remediation_type,
            rationale: wf.decision.rationale.clone(),
            status: wf.status,
            failure_reason: wf.failure_reason.clone(),
            dispatch_degraded: wf.dispatch_degraded,
            queued: wf.status == WorkflowStatus::Created,
            created_at: wf.created_at,
            deadline: wf.deadline,
            finished_at: wf.finished_at,
            steps: wf
                .steps
                .iter()
                .map(|s| StepReport {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    kind: s.kind,
                    status: s.status,
                    dependencies: s.dependencies.clone(),
                    retry_count: s.retry_count,
                    max_retries: s.max_retries,
                    error: s.error.clone(),
                    result: s.result.clone(),
                })
                .collect(),
            history: wf.history.clone(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// First failed step that no completed escalation has resolved.
    pub fn unresolved_failure(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| {
            s.status == StepStatus::Failed
                && !self.steps.iter().any(|e| {
                    e.id == format!("escalation-{}", s.id) && e.status == StepStatus::Completed
                })
        })
    }
}

/// One violation in a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub violation: Violation,
    pub activity: Activity,
    pub framework: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub violation_id: String,
    pub workflow_id: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub remediation_type: Option<RemediationType>,
    pub success: bool,
    pub failure_reason: Option<String>,
}

impl BatchItemResult {
    fn rejected(index: usize, violation_id: String, reason: String) -> Self {
        Self {
            index,
            violation_id,
            workflow_id: None,
            status: None,
            remediation_type: None,
            success: false,
            failure_reason: Some(reason),
        }
    }

    fn settled(index: usize, report: &WorkflowStatusReport) -> Self {
        let failure_reason = if report.queued {
            Some("not started: workflow capacity held by workflows awaiting humans".to_string())
        } else if matches!(report.status, WorkflowStatus::Failed | WorkflowStatus::Aborted) {
            Some(
                report
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| format!("workflow {}", report.status)),
            )
        } else {
            report.unresolved_failure().map(|s| {
                format!(
                    "step {} failed and was escalated: {}",
                    s.id,
                    s.error.as_deref().unwrap_or("unknown error")
                )
            })
        };
        Self {
            index,
            violation_id: report.violation_id.clone(),
            workflow_id: Some(report.workflow_id.clone()),
            status: Some(report.status),
            remediation_type: Some(report.remediation_type),
            success: failure_reason.is_none(),
            failure_reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub results: Vec<BatchItemResult>,
}

/// Aggregate counters over the workflows still inside the retention window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationMetrics {
    pub total_workflows: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_risk: BTreeMap<String, usize>,
    pub by_framework: BTreeMap<String, usize>,
    /// completed / (completed + failed); aborted workflows are left out.
    pub success_rate: f64,
    pub open_human_tasks: usize,
    pub total_retries: u32,
}

struct WorkflowEntry {
    workflow: Mutex<RemediationWorkflow>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    terminal: AtomicBool,
    /// Terminal, or waiting on nothing but people.
    settled: AtomicBool,
}

impl WorkflowEntry {
    fn new(wf: RemediationWorkflow) -> Self {
        Self {
            workflow: Mutex::new(wf),
            permit: Mutex::new(None),
            terminal: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        }
    }

    fn publish(&self, wf: &RemediationWorkflow) {
        let waiting_on_humans = wf.status != WorkflowStatus::Created
            && wf
                .steps
                .iter()
                .all(|s| s.status.is_terminal() || s.status == StepStatus::AwaitingHuman);
        self.terminal.store(wf.is_terminal(), Ordering::SeqCst);
        self.settled
            .store(wf.is_terminal() || waiting_on_humans, Ordering::SeqCst);
    }
}

/// What to do once the workflow lock is released.
#[derive(Default)]
struct Aftermath {
    notifications: Vec<Notification>,
    finished: bool,
}

struct Inner<S, E, N, Q> {
    config: RemediatorConfig,
    engine: DecisionEngine<S>,
    builder: WorkflowBuilder,
    runner: GraphRunner,
    executor: E,
    notifier: N,
    dispatcher: Dispatcher<Q>,
    humans: Mutex<HumanTaskManager>,
    workflows: RwLock<HashMap<String, Arc<WorkflowEntry>>>,
    /// (violation id, framework) → latest workflow id.
    index: Mutex<HashMap<(String, String), String>>,
    capacity: Arc<Semaphore>,
    waiting: Mutex<VecDeque<String>>,
    /// Bumped after every applied change.
    progress: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives violations from submission to a terminal workflow.
pub struct Orchestrator<S, E, N, Q = LeaseQueue> {
    inner: Arc<Inner<S, E, N, Q>>,
}

impl<S, E, N, Q> Clone for Orchestrator<S, E, N, Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, E, N> Orchestrator<S, E, N, LeaseQueue>
where
    S: Scorer + 'static,
    E: StepExecutor + 'static,
    N: Notifier + 'static,
{
    /// Orchestrator backed by the in-memory lease queue.
    pub fn in_memory(
        config: RemediatorConfig,
        scorer: S,
        executor: E,
        notifier: N,
    ) -> Result<Self, RemediatorError> {
        Self::new(config, scorer, executor, notifier, Arc::new(LeaseQueue::new()))
    }
}

impl<S, E, N, Q> Orchestrator<S, E, N, Q>
where
    S: Scorer + 'static,
    E: StepExecutor + 'static,
    N: Notifier + 'static,
    Q: QueueBackend + 'static,
{
    pub fn new(
        config: RemediatorConfig,
        scorer: S,
        executor: E,
        notifier: N,
        queue: Arc<Q>,
    ) -> Result<Self, RemediatorError> {
        config.validate()?;
        let dispatcher = Dispatcher::new(
            queue,
            config.visibility_timeout(),
            config.retry.max_retries + 1,
        );
        let inner = Inner {
            engine: DecisionEngine::new(scorer, config.scoring_timeout()),
            builder: WorkflowBuilder::from_config(&config),
            runner: GraphRunner::from_config(&config),
            executor,
            notifier,
            dispatcher,
            humans: Mutex::new(HumanTaskManager::new(config.human.clone())),
            workflows: RwLock::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
            capacity: Arc::new(Semaphore::new(config.max_concurrent_workflows)),
            waiting: Mutex::new(VecDeque::new()),
            progress: watch::channel(0).0,
            shutdown: watch::channel(false).0,
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &RemediatorConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<Q> {
        self.inner.dispatcher.queue()
    }

    /// Validate, classify, build and admit a violation. Resubmitting a
    /// violation whose workflow is still live returns the existing id.
    pub async fn submit(
        &self,
        violation: Violation,
        activity: Activity,
        framework: &str,
    ) -> Result<String, RemediatorError> {
        self.inner.submit(violation, activity, framework).await
    }

    pub async fn get_status(&self, workflow_id: &str) -> Result<WorkflowStatusReport, RemediatorError> {
        self.inner.get_status(workflow_id).await
    }

    /// Emergency stop.
    pub async fn abort(&self, workflow_id: &str, reason: &str) -> Result<(), RemediatorError> {
        self.inner.abort(workflow_id, reason).await
    }

    /// Submits every item, at most `max_concurrent` at a time, and waits for
    /// each workflow to settle. One item's failure never affects the others.
    pub async fn submit_batch(&self, items: Vec<BatchItem>, max_concurrent: usize) -> BatchReport {
        let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let violation_ids: Vec<String> = items.iter().map(|i| i.violation.id.clone()).collect();
        let mut set = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let this = self.clone();
            let limit = Arc::clone(&limit);
            set.spawn(async move {
                let _slot = limit.acquire_owned().await;
                this.process_item(index, item).await
            });
        }

        let mut results: Vec<Option<BatchItemResult>> = vec![None; violation_ids.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    let index = result.index;
                    results[index] = Some(result);
                }
                Err(e) => error!(error = %e, "batch item task failed"),
            }
        }
        let results: Vec<BatchItemResult> = results
            .into_iter()
            .zip(violation_ids)
            .enumerate()
            .map(|(index, (result, violation_id))| {
                result.unwrap_or_else(|| {
                    BatchItemResult::rejected(index, violation_id, "processing task panicked".into())
                })
            })
            .collect();

        let total_processed = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let success_rate = if total_processed == 0 {
            0.0
        } else {
            successful as f64 / total_processed as f64
        };
        info!(total_processed, successful, success_rate, "batch processed");
        BatchReport {
            total_processed,
            successful,
            failed: total_processed - successful,
            success_rate,
            results,
        }
    }

    async fn process_item(&self, index: usize, item: BatchItem) -> BatchItemResult {
        let violation_id = item.violation.id.clone();
        let workflow_id = match self
            .submit(item.violation, item.activity, &item.framework)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(index, %violation_id, error = %e, "batch item rejected");
                return BatchItemResult::rejected(index, violation_id, e.to_string());
            }
        };
        match self.wait_settled(&workflow_id).await {
            Ok(report) => BatchItemResult::settled(index, &report),
            Err(e) => BatchItemResult::rejected(index, violation_id, e.to_string()),
        }
    }

    /// Waits until the workflow is terminal or only waiting on people.
    pub async fn wait_settled(&self, workflow_id: &str) -> Result<WorkflowStatusReport, RemediatorError> {
        self.inner.wait_settled(workflow_id).await
    }

    pub async fn complete_human_task(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        actor: &str,
        note: Option<String>,
    ) -> Result<HumanTask, RemediatorError> {
        self.inner
            .complete_human_task(task_id, outcome, actor, note)
            .await
    }

    pub async fn list_human_tasks(&self, workflow_id: &str) -> Result<Vec<HumanTask>, RemediatorError> {
        self.inner.entry(workflow_id).await?;
        Ok(self.inner.humans.lock().await.tasks_for(workflow_id))
    }

    /// Manual override of a workflow's deadline.
    pub async fn extend_deadline(
        &self,
        workflow_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), RemediatorError> {
        self.inner.extend_deadline(workflow_id, deadline).await
    }

    pub async fn audit(&self, workflow_id: &str) -> Result<AuditRecord, RemediatorError> {
        let entry = self.inner.entry(workflow_id).await?;
        let wf = entry.workflow.lock().await;
        Ok(AuditRecord::from_workflow(&wf, Utc::now()))
    }

    pub async fn metrics(&self) -> RemediationMetrics {
        self.inner.metrics().await
    }

    /// Run one consumption cycle on the calling task.
    pub async fn run_once(&self) -> Poll {
        let inner = &*self.inner;
        inner.dispatcher.process_next(&inner.executor, inner).await
    }

    /// Reminders, task expiry, workflow deadlines and redispatch after a queue outage.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.inner.tick(now).await
    }

    /// Spawns the worker pool and the sweeper. Idempotent.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let config = &self.inner.config;
        let poll = Duration::from_millis(config.queue.poll_interval_ms);
        let sweep = Duration::from_millis(config.sweep_interval_ms);
        let mut handles = self.inner.handles.lock().await;

        for worker in 0..config.worker_count {
            let inner = Arc::clone(&self.inner);
            let shutdown = inner.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                debug!(worker, "queue worker started");
                inner
                    .dispatcher
                    .run(&inner.executor, &*inner, poll, shutdown)
                    .await;
                debug!(worker, "queue worker stopped");
            }));
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown = inner.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            while !*shutdown.borrow() {
                tokio::select! {
                    _ = tokio::time::sleep(sweep) => inner.tick(Utc::now()).await,
                    _ = shutdown.changed() => {}
                }
            }
        }));
        info!(workers = config.worker_count, "orchestrator started");
    }

    /// Stops workers and the sweeper after their current cycle.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "background task failed");
            }
        }
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(false);
        info!("orchestrator stopped");
    }
}

impl<S, E, N, Q> Inner<S, E, N, Q>
where
    S: Scorer,
    E: StepExecutor,
    N: Notifier,
    Q: QueueBackend,
{
    async fn entry(&self, workflow_id: &str) -> Result<Arc<WorkflowEntry>, RemediatorError> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| RemediatorError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn live_workflow(&self, key: &(String, String)) -> Option<String> {
        let id = self.index.lock().await.get(key).cloned()?;
        let entry = self.entry(&id).await.ok()?;
        (!entry.terminal.load(Ordering::SeqCst)).then_some(id)
    }

    async fn submit(
        &self,
        violation: Violation,
        activity: Activity,
        framework: &str,
    ) -> Result<String, RemediatorError> {
        let signal = ViolationSignal::new(violation, activity, framework)?;
        let key = signal.dedup_key();
        if let Some(id) = self.live_workflow(&key).await {
            info!(violation_id = %signal.id, workflow_id = %id, "violation already has a live workflow");
            return Ok(id);
        }

        let decision = self.engine.decide(&signal).await;
        let wf = self.builder.build(&decision, &signal, Utc::now())?;
        let id = wf.id.clone();

        {
            // A concurrent submit of the same violation may have won while scoring.
            let mut index = self.index.lock().await;
            if let Some(existing) = index.get(&key).cloned() {
                let live = match self.workflows.read().await.get(&existing) {
                    Some(entry) => !entry.terminal.load(Ordering::SeqCst),
                    None => false,
                };
                if live {
                    return Ok(existing);
                }
            }
            self.workflows
                .write()
                .await
                .insert(id.clone(), Arc::new(WorkflowEntry::new(wf)));
            index.insert(key, id.clone());
        }

        info!(
            workflow_id = %id,
            violation_id = %signal.id,
            remediation_type = %decision.remediation_type,
            "workflow created"
        );
        self.waiting.lock().await.push_back(id.clone());
        self.admit_waiting().await;
        Ok(id)
    }

    /// Starts queued workflows while capacity allows, oldest first.
    async fn admit_waiting(&self) {
        loop {
            let Ok(permit) = Arc::clone(&self.capacity).try_acquire_owned() else {
                let queued = self.waiting.lock().await.len();
                if queued > 0 {
                    debug!(queued, "workflow capacity exhausted");
                }
                return;
            };
            let Some(id) = self.waiting.lock().await.pop_front() else {
                return;
            };
            let Ok(entry) = self.entry(&id).await else {
                continue;
            };
            self.start_entry(&entry, permit).await;
        }
    }

    async fn start_entry(&self, entry: &Arc<WorkflowEntry>, permit: OwnedSemaphorePermit) {
        let now = Utc::now();
        let mut wf = entry.workflow.lock().await;
        if wf.is_terminal() {
            // Aborted while queued; the permit is dropped here.
            return;
        }
        *entry.permit.lock().await = Some(permit);
        let after = match self.runner.start(&mut wf, now) {
            Ok(effects) => self.perform(entry, &mut wf, &effects, now).await,
            Err(e) => {
                error!(workflow_id = %wf.id, error = %e, "workflow failed to start");
                Aftermath::default()
            }
        };
        drop(wf);
        // Capacity freed here is picked up by the caller's admission loop.
        self.settle(entry, after).await;
    }

    /// Carries out runner effects. Called with the workflow lock held.
    async fn perform(
        &self,
        entry: &WorkflowEntry,
        wf: &mut RemediationWorkflow,
        effects: &[Effect],
        now: DateTime<Utc>,
    ) -> Aftermath {
        let mut after = Aftermath::default();
        for effect in effects {
            match effect {
                Effect::Enqueue { step_id } => {
                    if let Err(e) = self.dispatcher.queue().enqueue(&wf.id, step_id).await {
                        self.runner.apply(
                            wf,
                            step_id,
                            StepEvent::Undispatched {
                                reason: e.to_string(),
                            },
                            now,
                        );
                    }
                }
                Effect::OpenHumanTask { step_id } => {
                    let Some(step) = wf.step(step_id) else {
                        continue;
                    };
                    let task = self.humans.lock().await.open(wf, step, now);
                    after.notifications.push(Notification::task_assigned(&task));
                }
                Effect::CloseHumanTasks => {
                    let reason = wf
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| format!("workflow {}", wf.status));
                    let closed = self.humans.lock().await.withdraw(&wf.id, &reason, now);
                    if !closed.is_empty() {
                        debug!(workflow_id = %wf.id, closed = closed.len(), "open human tasks withdrawn");
                    }
                }
                Effect::Escalate { step_id, reason } => {
                    let detail = match step_id {
                        Some(step_id) => format!("step {step_id}: {reason}"),
                        None => reason.clone(),
                    };
                    after.notifications.push(Notification::escalation(
                        &wf.id,
                        &self.config.human.escalation_role,
                        wf.signal.risk_level,
                        &detail,
                    ));
                }
                Effect::Finished { .. } => {
                    after.finished = true;
                    after.notifications.extend(Notification::workflow_finished(wf));
                }
                // Settled by the dispatcher through the report disposition.
                Effect::Requeue { .. } | Effect::DeadLetter { .. } => {}
            }
        }

        wf.dispatch_degraded = !wf.is_terminal()
            && wf
                .steps
                .iter()
                .any(|s| s.kind == StepKind::Automated && s.status == StepStatus::Ready);
        entry.publish(wf);
        after
    }

    /// Work done after the workflow lock is released. Returns whether the
    /// workflow finished and gave its capacity back.
    async fn settle(&self, entry: &WorkflowEntry, after: Aftermath) -> bool {
        for notification in &after.notifications {
            if let Err(e) = self.notifier.send(notification).await {
                warn!(
                    workflow_id = %notification.workflow_id,
                    recipient = %notification.recipient,
                    error = %e,
                    "notification failed"
                );
            }
        }
        if after.finished {
            entry.permit.lock().await.take();
        }
        self.progress.send_modify(|v| *v = v.wrapping_add(1));
        after.finished
    }

    /// Applies one event to one workflow and runs the consequences.
    async fn apply_event(
        &self,
        entry: &Arc<WorkflowEntry>,
        step_id: &str,
        event: StepEvent,
        now: DateTime<Utc>,
    ) -> Applied {
        let mut wf = entry.workflow.lock().await;
        let applied = self.runner.apply(&mut wf, step_id, event, now);
        let after = self.perform(entry, &mut wf, applied.effects(), now).await;
        drop(wf);
        if self.settle(entry, after).await {
            self.admit_waiting().await;
        }
        applied
    }

    async fn get_status(&self, workflow_id: &str) -> Result<WorkflowStatusReport, RemediatorError> {
        let entry = self.entry(workflow_id).await?;
        let wf = entry.workflow.lock().await;
        Ok(WorkflowStatusReport::from_workflow(&wf))
    }

    async fn abort(&self, workflow_id: &str, reason: &str) -> Result<(), RemediatorError> {
        let entry = self.entry(workflow_id).await?;
        let now = Utc::now();
        let mut wf = entry.workflow.lock().await;
        let effects = self.runner.abort(&mut wf, reason, now)?;
        let after = self.perform(&entry, &mut wf, &effects, now).await;
        drop(wf);
        if self.settle(&entry, after).await {
            self.admit_waiting().await;
        }
        Ok(())
    }

    async fn complete_human_task(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        actor: &str,
        note: Option<String>,
    ) -> Result<HumanTask, RemediatorError> {
        let now = Utc::now();
        let task = self
            .humans
            .lock()
            .await
            .resolve(task_id, outcome, actor, note.clone(), now)?;
        let entry = self.entry(&task.workflow_id).await?;
        let applied = self
            .apply_event(&entry, &task.step_id, StepEvent::HumanOutcome { outcome, note }, now)
            .await;
        if let Applied::Discarded(reason) = applied {
            warn!(task_id, %reason, "human outcome recorded but not applied");
        }
        Ok(task)
    }

    async fn extend_deadline(
        &self,
        workflow_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<(), RemediatorError> {
        let entry = self.entry(workflow_id).await?;
        let now = Utc::now();
        let mut wf = entry.workflow.lock().await;
        let previous = wf.deadline;
        self.runner.extend_deadline(&mut wf, deadline, now)?;
        self.humans
            .lock()
            .await
            .extend(workflow_id, previous, deadline, now);
        Ok(())
    }

    async fn wait_settled(&self, workflow_id: &str) -> Result<WorkflowStatusReport, RemediatorError> {
        let entry = self.entry(workflow_id).await?;
        let mut progress = self.progress.subscribe();
        loop {
            if self.is_settled(&entry).await {
                return self.get_status(workflow_id).await;
            }
            if progress.changed().await.is_err() {
                return self.get_status(workflow_id).await;
            }
        }
    }

    async fn is_settled(&self, entry: &WorkflowEntry) -> bool {
        if entry.settled.load(Ordering::SeqCst) {
            return true;
        }
        // Queued behind capacity that only people can free.
        let queued = entry.permit.lock().await.is_none() && !entry.terminal.load(Ordering::SeqCst);
        queued && self.capacity_stalled().await
    }

    async fn capacity_stalled(&self) -> bool {
        if self.capacity.available_permits() > 0 {
            return false;
        }
        let entries: Vec<Arc<WorkflowEntry>> = self.workflows.read().await.values().cloned().collect();
        for entry in entries {
            let admitted = entry.permit.lock().await.is_some();
            if admitted && !entry.settled.load(Ordering::SeqCst) {
                return false;
            }
        }
        true
    }

    async fn tick(&self, now: DateTime<Utc>) {
        // Workflow deadlines first: their tasks are withdrawn, not expired.
        let entries: Vec<Arc<WorkflowEntry>> = self.workflows.read().await.values().cloned().collect();
        let mut freed = false;
        for entry in entries {
            if entry.terminal.load(Ordering::SeqCst) {
                continue;
            }
            let mut wf = entry.workflow.lock().await;
            let mut effects = self.runner.enforce_deadline(&mut wf, now);
            if !wf.is_terminal() && wf.dispatch_degraded {
                debug!(workflow_id = %wf.id, "redispatching after queue outage");
                effects.extend(self.runner.advance(&mut wf, now));
            }
            if effects.is_empty() {
                continue;
            }
            let after = self.perform(&entry, &mut wf, &effects, now).await;
            drop(wf);
            freed |= self.settle(&entry, after).await;
        }
        if freed {
            self.admit_waiting().await;
        }

        let (reminders, expiries) = {
            let mut humans = self.humans.lock().await;
            (humans.due_reminders(now), humans.expire_overdue(now))
        };
        for due in &reminders {
            let notification = Notification::reminder(due);
            if let Err(e) = self.notifier.send(&notification).await {
                warn!(task_id = %due.task.id, error = %e, "reminder failed");
            }
        }
        for expiry in expiries {
            match expiry {
                Expiry::Expired(task) => {
                    if let Ok(entry) = self.entry(&task.workflow_id).await {
                        let event = StepEvent::HumanOutcome {
                            outcome: TaskOutcome::Expired,
                            note: None,
                        };
                        self.apply_event(&entry, &task.step_id, event, now).await;
                    }
                }
                Expiry::Reassigned(task) => {
                    let notification = Notification::task_assigned(&task);
                    if let Err(e) = self.notifier.send(&notification).await {
                        warn!(task_id = %task.id, error = %e, "reassignment notice failed");
                    }
                }
            }
        }

        self.evict_finished(now).await;
    }

    /// Forgets terminal workflows finished before the retention window, with their tasks.
    async fn evict_finished(&self, now: DateTime<Utc>) {
        let Some(cutoff) = self
            .config
            .retention()
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return;
        };

        let entries: Vec<Arc<WorkflowEntry>> = self
            .workflows
            .read()
            .await
            .values()
            .filter(|e| e.terminal.load(Ordering::SeqCst))
            .cloned()
            .collect();
        let mut expired = Vec::new();
        for entry in entries {
            let wf = entry.workflow.lock().await;
            if wf.finished_at.is_some_and(|at| at <= cutoff) {
                expired.push((wf.id.clone(), wf.signal.dedup_key()));
            }
        }
        if expired.is_empty() {
            return;
        }

        let mut index = self.index.lock().await;
        let mut workflows = self.workflows.write().await;
        let mut humans = self.humans.lock().await;
        for (id, key) in &expired {
            workflows.remove(id);
            if index.get(key) == Some(id) {
                index.remove(key);
            }
            humans.forget(id);
        }
        info!(evicted = expired.len(), "finished workflows past retention evicted");
    }

    async fn metrics(&self) -> RemediationMetrics {
        let entries: Vec<Arc<WorkflowEntry>> = self.workflows.read().await.values().cloned().collect();
        let mut m = RemediationMetrics::default();
        let (mut completed, mut failed) = (0usize, 0usize);

        for entry in entries {
            let wf = entry.workflow.lock().await;
            m.total_workflows += 1;
            *m.by_type
                .entry(wf.decision.remediation_type.to_string())
                .or_default() += 1;
            *m.by_status.entry(wf.status.to_string()).or_default() += 1;
            *m.by_risk.entry(wf.signal.risk_level.to_string()).or_default() += 1;
            *m.by_framework.entry(wf.signal.framework.clone()).or_default() += 1;
            m.total_retries += wf.steps.iter().map(|s| s.retry_count).sum::<u32>();
            match wf.status {
                WorkflowStatus::Completed => completed += 1,
                WorkflowStatus::Failed => failed += 1,
                _ => {}
            }
        }
        if completed + failed > 0 {
            m.success_rate = completed as f64 / (completed + failed) as f64;
        }
        m.open_human_tasks = self.humans.lock().await.open_count();
        m
    }
}

impl<S, E, N, Q> CompletionSink for Inner<S, E, N, Q>
where
    S: Scorer,
    E: StepExecutor,
    N: Notifier,
    Q: QueueBackend,
{
    async fn begin(&self, message: &QueueMessage) -> Option<Delivery> {
        let entry = self.entry(&message.workflow_id).await.ok()?;
        let mut wf = entry.workflow.lock().await;
        if let Err(reason) = self.runner.begin_attempt(&mut wf, &message.step_id, Utc::now()) {
            debug!(workflow_id = %message.workflow_id, step_id = %message.step_id, %reason, "stale delivery");
            return None;
        }
        let step = wf.step(&message.step_id)?;
        Some(Delivery {
            ctx: StepContext::new(&wf, step),
            timeout: step.timeout(),
        })
    }

    async fn report(&self, message: &QueueMessage, outcome: StepOutcome) -> Disposition {
        let Ok(entry) = self.entry(&message.workflow_id).await else {
            return Disposition::Ack;
        };
        let event = match outcome {
            StepOutcome::Success(result) => StepEvent::Succeeded { result },
            StepOutcome::Failure(FailureKind::Transient(reason)) => {
                StepEvent::TransientFailure { reason }
            }
            StepOutcome::Failure(FailureKind::Permanent(reason)) => {
                StepEvent::PermanentFailure { reason }
            }
        };

        let applied = self
            .apply_event(&entry, &message.step_id, event, Utc::now())
            .await;
        applied
            .effects()
            .iter()
            .find_map(|effect| match effect {
                Effect::Requeue { step_id, delay } if *step_id == message.step_id => {
                    Some(Disposition::Retry(*delay))
                }
                Effect::DeadLetter { step_id, reason } if *step_id == message.step_id => {
                    Some(Disposition::DeadLetter(reason.clone()))
                }
                _ => None,
            })
            .unwrap_or(Disposition::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{Scores, ScoringUnavailable};
    use crate::notify::NotifyError;
    use crate::signal::fixtures::{activity, violation};
    use crate::signal::RiskLevel;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    struct FixedScorer(Option<Scores>);

    impl Scorer for FixedScorer {
        async fn score(&self, _signal: &ViolationSignal) -> Result<Scores, ScoringUnavailable> {
            self.0
                .ok_or_else(|| ScoringUnavailable("model offline".into()))
        }
    }

    fn automatic() -> FixedScorer {
        FixedScorer(Some(Scores::new(0.9, 0.1, 0.9)))
    }

    fn human_in_loop() -> FixedScorer {
        FixedScorer(Some(Scores::new(0.5, 0.5, 0.7)))
    }

    /// Fails permanently for one violation, transiently for another, succeeds otherwise.
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: AtomicU32,
        fail_permanently: Option<String>,
        fail_transiently: Option<String>,
    }

    impl StepExecutor for ScriptedExecutor {
        async fn execute(&self, ctx: &StepContext) -> StepOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_permanently.as_deref() == Some(ctx.violation_id.as_str())
                && ctx.step_id == "execute-1"
            {
                return StepOutcome::Failure(FailureKind::Permanent("target table is read-only".into()));
            }
            if self.fail_transiently.as_deref() == Some(ctx.violation_id.as_str()) {
                return StepOutcome::Failure(FailureKind::Transient("connection reset".into()));
            }
            StepOutcome::Success(None)
        }
    }

    #[derive(Default)]
    struct CollectingNotifier {
        sent: StdMutex<Vec<Notification>>,
    }

    impl Notifier for CollectingNotifier {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    type TestOrchestrator = Orchestrator<FixedScorer, ScriptedExecutor, CollectingNotifier>;

    fn config() -> RemediatorConfig {
        let mut config = RemediatorConfig::default();
        config.retry.base_delay_ms = 10;
        config.retry.max_delay_ms = 10;
        config.retry.jitter_ratio = 0.0;
        config.queue.poll_interval_ms = 1;
        config.sweep_interval_ms = 20;
        config
    }

    fn orchestrator(scorer: FixedScorer, executor: ScriptedExecutor) -> TestOrchestrator {
        Orchestrator::in_memory(config(), scorer, executor, CollectingNotifier::default()).unwrap()
    }

    async fn submit(orch: &TestOrchestrator, id: &str, risk: RiskLevel) -> String {
        orch.submit(violation(id, risk, &["Delete expired records"]), activity("act-1"), "GDPR")
            .await
            .unwrap()
    }

    /// Runs consumption cycles on the test task until the queue has nothing visible.
    async fn drain(orch: &TestOrchestrator) {
        for _ in 0..200 {
            match orch.run_once().await {
                Poll::Idle => {
                    if orch.queue().is_empty().await {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Poll::Unavailable(_) => return,
                _ => {}
            }
        }
    }

    async fn open_task(orch: &TestOrchestrator, wf_id: &str) -> HumanTask {
        orch.list_human_tasks(wf_id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.is_open())
            .expect("an open human task")
    }

    #[tokio::test]
    async fn automatic_workflow_completes() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        let id = submit(&orch, "v-1", RiskLevel::Low).await;
        drain(&orch).await;

        let report = orch.get_status(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.remediation_type, RemediationType::Automatic);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(!report.history.is_empty());

        let audit = orch.audit(&id).await.unwrap();
        assert_eq!(audit.steps_completed, 3);
        let sent = orch.inner.notifier.sent.lock().unwrap().clone();
        assert!(sent.iter().any(|n| n.kind == crate::notify::NotificationKind::WorkflowCompleted));
    }

    #[tokio::test]
    async fn resubmission_returns_live_workflow() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        let first = submit(&orch, "v-1", RiskLevel::Low).await;
        let second = submit(&orch, "v-1", RiskLevel::Low).await;
        assert_eq!(first, second);
        assert_eq!(orch.metrics().await.total_workflows, 1);

        // Another framework is a different case.
        let other = orch
            .submit(violation("v-1", RiskLevel::Low, &[]), activity("act-1"), "CCPA")
            .await
            .unwrap();
        assert_ne!(first, other);

        // Once terminal, the same violation starts a fresh workflow.
        drain(&orch).await;
        assert_eq!(orch.get_status(&first).await.unwrap().status, WorkflowStatus::Completed);
        let third = submit(&orch, "v-1", RiskLevel::Low).await;
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn invalid_violation_is_rejected_before_workflow_exists() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        let err = orch
            .submit(violation("v-1", RiskLevel::Low, &[]), activity("act-9"), "GDPR")
            .await
            .unwrap_err();
        assert!(matches!(err, RemediatorError::Validation(_)));
        assert_eq!(orch.metrics().await.total_workflows, 0);
    }

    #[tokio::test]
    async fn scoring_outage_forces_manual_only() {
        let orch = orchestrator(FixedScorer(None), ScriptedExecutor::default());
        let id = submit(&orch, "v-1", RiskLevel::Low).await;
        let report = orch.get_status(&id).await.unwrap();
        assert_eq!(report.remediation_type, RemediationType::ManualOnly);
        assert!(report.rationale.contains("model offline"));
        assert_eq!(report.step("manual-remediation").unwrap().status, StepStatus::AwaitingHuman);

        let task = open_task(&orch, &id).await;
        assert_eq!(task.assignee_role, "compliance_team");
        orch.complete_human_task(&task.id, TaskOutcome::Approved, "alice", None)
            .await
            .unwrap();
        assert_eq!(orch.get_status(&id).await.unwrap().status, WorkflowStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_step_runs_exactly_max_retries_plus_one_times() {
        let executor = ScriptedExecutor {
            fail_transiently: Some("v-1".into()),
            ..Default::default()
        };
        let orch = orchestrator(automatic(), executor);
        let id = submit(&orch, "v-1", RiskLevel::Low).await;
        drain(&orch).await;

        assert_eq!(orch.inner.executor.calls.load(Ordering::SeqCst), 4);
        let report = orch.get_status(&id).await.unwrap();
        let step = report.step("precondition-check").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.retry_count, 3);
        assert_eq!(orch.queue().dead_letters().await.len(), 1);
        // Escalated to a person rather than failing silently.
        assert_eq!(
            report.step("escalation-precondition-check").unwrap().status,
            StepStatus::AwaitingHuman
        );
        let task = open_task(&orch, &id).await;
        assert_eq!(task.assignee_role, "senior_compliance_officer");
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_then_exhausted_deliveries_escalate() {
        let executor = ScriptedExecutor {
            fail_transiently: Some("v-1".into()),
            ..Default::default()
        };
        let orch = orchestrator(automatic(), executor);
        let id = submit(&orch, "v-1", RiskLevel::Low).await;

        // A worker takes the first delivery and dies without reporting.
        let lease = orch.queue().lease(Duration::from_secs(600)).await.unwrap().unwrap();
        orch.inner.begin(&lease.message).await.unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;
        drain(&orch).await;

        // The lost delivery used up one attempt, so only three executions fit.
        assert_eq!(orch.inner.executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(orch.queue().dead_letters().await.len(), 1);
        assert!(orch.queue().is_empty().await);

        let report = orch.get_status(&id).await.unwrap();
        let step = report.step("precondition-check").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(
            step.error
                .as_deref()
                .unwrap()
                .contains("delivery attempts exhausted")
        );
        assert_eq!(
            report.step("escalation-precondition-check").unwrap().status,
            StepStatus::AwaitingHuman
        );
        let task = open_task(&orch, &id).await;
        assert_eq!(task.assignee_role, "senior_compliance_officer");
    }

    #[tokio::test]
    async fn late_completion_after_abort_is_discarded() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        let id = submit(&orch, "v-1", RiskLevel::Low).await;

        // Lease the first step as a worker would, then stop the workflow.
        let lease = orch.queue().lease(Duration::from_secs(600)).await.unwrap().unwrap();
        let delivery = orch.inner.begin(&lease.message).await.unwrap();
        assert_eq!(delivery.ctx.step_id, "precondition-check");

        orch.abort(&id, "emergency stop").await.unwrap();
        let report = orch.get_status(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);
        let history_len = report.history.len();

        let disposition = orch
            .inner
            .report(&lease.message, StepOutcome::Success(None))
            .await;
        assert_eq!(disposition, Disposition::Ack);
        let report = orch.get_status(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);
        assert_eq!(report.history.len(), history_len);
        assert_eq!(report.step("precondition-check").unwrap().status, StepStatus::Running);
        assert!(matches!(
            orch.abort(&id, "again").await,
            Err(RemediatorError::WorkflowTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn approval_then_execution() {
        let orch = orchestrator(human_in_loop(), ScriptedExecutor::default());
        let id = submit(&orch, "v-1", RiskLevel::High).await;
        assert_eq!(orch.get_status(&id).await.unwrap().status, WorkflowStatus::AwaitingApproval);

        let task = open_task(&orch, &id).await;
        assert_eq!(task.assignee_role, "compliance_manager");
        orch.complete_human_task(&task.id, TaskOutcome::Approved, "carol", None)
            .await
            .unwrap();
        drain(&orch).await;
        assert_eq!(orch.get_status(&id).await.unwrap().status, WorkflowStatus::Completed);

        let err = orch
            .complete_human_task(&task.id, TaskOutcome::Rejected, "dave", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RemediatorError::TaskResolved { .. }));
    }

    #[tokio::test]
    async fn rejection_fails_workflow() {
        let orch = orchestrator(human_in_loop(), ScriptedExecutor::default());
        let id = submit(&orch, "v-1", RiskLevel::Medium).await;
        let task = open_task(&orch, &id).await;
        orch.complete_human_task(&task.id, TaskOutcome::Rejected, "carol", Some("not needed".into()))
            .await
            .unwrap();

        let report = orch.get_status(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(report.failure_reason.as_deref(), Some("rejected by approver"));
        assert!(orch.queue().is_empty().await);
    }

    #[tokio::test]
    async fn excess_workflows_wait_for_capacity() {
        let mut config = config();
        config.max_concurrent_workflows = 1;
        let orch = Orchestrator::in_memory(
            config,
            FixedScorer(None),
            ScriptedExecutor::default(),
            CollectingNotifier::default(),
        )
        .unwrap();

        let first = submit(&orch, "v-1", RiskLevel::Low).await;
        let second = submit(&orch, "v-2", RiskLevel::Low).await;
        assert_eq!(orch.get_status(&first).await.unwrap().status, WorkflowStatus::InProgress);
        let queued = orch.get_status(&second).await.unwrap();
        assert_eq!(queued.status, WorkflowStatus::Created);
        assert!(queued.queued);

        let task = open_task(&orch, &first).await;
        orch.complete_human_task(&task.id, TaskOutcome::Approved, "alice", None)
            .await
            .unwrap();
        assert_eq!(orch.get_status(&second).await.unwrap().status, WorkflowStatus::InProgress);
        assert_eq!(orch.list_human_tasks(&second).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aborting_a_queued_workflow_keeps_it_from_starting() {
        let mut config = config();
        config.max_concurrent_workflows = 1;
        let orch = Orchestrator::in_memory(
            config,
            FixedScorer(None),
            ScriptedExecutor::default(),
            CollectingNotifier::default(),
        )
        .unwrap();
        let first = submit(&orch, "v-1", RiskLevel::Low).await;
        let second = submit(&orch, "v-2", RiskLevel::Low).await;
        orch.abort(&second, "duplicate ticket").await.unwrap();
        orch.abort(&first, "emergency stop").await.unwrap();

        let report = orch.get_status(&second).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);
        assert!(orch.list_human_tasks(&second).await.unwrap().is_empty());
        assert_eq!(orch.metrics().await.open_human_tasks, 0);
    }

    #[tokio::test]
    async fn queue_outage_degrades_then_recovers() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        orch.queue().set_available(false).await;
        let id = submit(&orch, "v-1", RiskLevel::Low).await;

        let report = orch.get_status(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::InProgress);
        assert!(report.dispatch_degraded);
        assert_eq!(report.step("precondition-check").unwrap().status, StepStatus::Ready);

        orch.queue().set_available(true).await;
        orch.tick(Utc::now()).await;
        assert!(!orch.get_status(&id).await.unwrap().dispatch_degraded);
        drain(&orch).await;
        assert_eq!(orch.get_status(&id).await.unwrap().status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn deadline_sweep_fails_and_extension_defers() {
        let orch = orchestrator(FixedScorer(None), ScriptedExecutor::default());
        let id = submit(&orch, "v-1", RiskLevel::Low).await;
        let deadline = orch.get_status(&id).await.unwrap().deadline;

        let extended = deadline + chrono::Duration::hours(24);
        orch.extend_deadline(&id, extended).await.unwrap();
        orch.tick(deadline + chrono::Duration::minutes(1)).await;
        assert_eq!(orch.get_status(&id).await.unwrap().status, WorkflowStatus::InProgress);

        orch.tick(extended).await;
        let report = orch.get_status(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(report.failure_reason.as_deref(), Some("deadline exceeded"));
        assert_eq!(orch.metrics().await.open_human_tasks, 0);
    }

    #[tokio::test]
    async fn expired_manual_task_escalates() {
        let orch = orchestrator(FixedScorer(None), ScriptedExecutor::default());
        let id = submit(&orch, "v-1", RiskLevel::Low).await;
        let task = open_task(&orch, &id).await;

        orch.tick(task.deadline).await;
        let report = orch.get_status(&id).await.unwrap();
        assert_eq!(report.step("manual-remediation").unwrap().status, StepStatus::Failed);
        assert_eq!(
            report.step("escalation-manual-remediation").unwrap().status,
            StepStatus::AwaitingHuman
        );
        let escalation = open_task(&orch, &id).await;
        assert_eq!(escalation.step_id, "escalation-manual-remediation");
    }

    #[tokio::test]
    async fn batch_with_one_permanent_failure() {
        let executor = ScriptedExecutor {
            fail_permanently: Some("v-3".into()),
            ..Default::default()
        };
        let orch = orchestrator(automatic(), executor);
        orch.start().await;

        let items: Vec<BatchItem> = (1..=5)
            .map(|i| {
                let id = format!("v-{i}");
                BatchItem {
                    violation: violation(&id, RiskLevel::Low, &["Delete expired records"]),
                    activity: activity("act-1"),
                    framework: "GDPR".into(),
                }
            })
            .collect();
        let report = tokio::time::timeout(Duration::from_secs(30), orch.submit_batch(items, 2))
            .await
            .unwrap();
        orch.shutdown().await;

        assert_eq!(report.total_processed, 5);
        assert_eq!(report.successful, 4);
        assert!((report.success_rate - 0.8).abs() < 1e-9);
        let failed: Vec<&BatchItemResult> = report.results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].violation_id, "v-3");
        assert_eq!(failed[0].index, 2);
        assert!(failed[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("target table is read-only"));
    }

    #[tokio::test]
    async fn batch_reports_rejected_items() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        orch.start().await;
        let items = vec![
            BatchItem {
                violation: violation("v-1", RiskLevel::Low, &["Delete expired records"]),
                activity: activity("act-1"),
                framework: "GDPR".into(),
            },
            BatchItem {
                violation: violation("v-2", RiskLevel::Low, &[]),
                activity: activity("act-1"),
                framework: "".into(),
            },
        ];
        let report = tokio::time::timeout(Duration::from_secs(30), orch.submit_batch(items, 4))
            .await
            .unwrap();
        orch.shutdown().await;

        assert_eq!(report.total_processed, 2);
        assert!(report.results[0].success);
        assert!(!report.results[1].success);
        assert!(report.results[1].workflow_id.is_none());
        assert!(report.results[1].failure_reason.as_deref().unwrap().contains("framework"));
    }

    #[tokio::test]
    async fn metrics_summarise_workflows() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        submit(&orch, "v-1", RiskLevel::Low).await;
        submit(&orch, "v-2", RiskLevel::Critical).await;
        drain(&orch).await;

        let m = orch.metrics().await;
        assert_eq!(m.total_workflows, 2);
        assert_eq!(m.by_type.get("automatic"), Some(&1));
        assert_eq!(m.by_type.get("manual_only"), Some(&1));
        assert_eq!(m.by_framework.get("GDPR"), Some(&2));
        assert_eq!(m.by_status.get("COMPLETED"), Some(&1));
        assert_eq!(m.open_human_tasks, 1);
        assert!((m.success_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn finished_workflows_are_evicted_after_retention() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        let done = submit(&orch, "v-1", RiskLevel::Low).await;
        let manual = submit(&orch, "v-2", RiskLevel::Critical).await;
        drain(&orch).await;
        orch.abort(&manual, "handled elsewhere").await.unwrap();
        assert_eq!(orch.list_human_tasks(&manual).await.unwrap().len(), 1);

        let finished = orch.get_status(&manual).await.unwrap().finished_at.unwrap();
        orch.tick(finished + chrono::Duration::hours(167)).await;
        assert_eq!(orch.metrics().await.total_workflows, 2);

        orch.tick(finished + chrono::Duration::hours(168)).await;
        for id in [&done, &manual] {
            assert!(matches!(
                orch.get_status(id).await,
                Err(RemediatorError::WorkflowNotFound(_))
            ));
            assert!(orch.inner.humans.lock().await.tasks_for(id).is_empty());
        }
        assert_eq!(orch.metrics().await.total_workflows, 0);

        // The index no longer points at the evicted workflow.
        let again = submit(&orch, "v-1", RiskLevel::Low).await;
        assert_ne!(again, done);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let orch = orchestrator(automatic(), ScriptedExecutor::default());
        assert!(matches!(
            orch.get_status("nope").await,
            Err(RemediatorError::WorkflowNotFound(_))
        ));
        assert!(matches!(
            orch.complete_human_task("nope", TaskOutcome::Approved, "a", None).await,
            Err(RemediatorError::TaskNotFound(_))
        ));
    }
}
