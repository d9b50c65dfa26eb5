//! The graph runner: drives steps through their lifecycle and owns
//! workflow-level status.
//!
//! The runner is synchronous and side-effect free. Every mutation it makes
//! happens on a `&mut RemediationWorkflow` the caller holds under the
//! per-workflow lock, and every side effect (enqueue, open a human task,
//! notify) comes back as an [`Effect`] for the caller to carry out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::builder::WorkflowBuilder;
use crate::config::RemediatorConfig;
use crate::error::RemediatorError;
use crate::human::TaskOutcome;
use crate::workflow::{
    next_status, BackoffPolicy, HistoryEntry, RemediationWorkflow, StepEvent, StepKind,
    StepStatus, WorkflowStatus,
};

pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";
pub const REJECTED_BY_APPROVER: &str = "rejected by approver";
pub const REJECTED_BY_ASSIGNEE: &str = "rejected by assignee";

/// A side effect requested by the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Put an automated step on the queue.
    Enqueue { step_id: String },
    /// Create the human task bound to a step now in `AWAITING_HUMAN`.
    OpenHumanTask { step_id: String },
    /// Release the step's leased message, visible again after `delay`.
    Requeue { step_id: String, delay: Duration },
    /// Retries exhausted: move the step's message to the dead-letter store.
    DeadLetter { step_id: String, reason: String },
    /// Withdraw every open human task of the workflow.
    CloseHumanTasks,
    /// Alert the escalation role. `step_id` is `None` for workflow-level escalation.
    Escalate { step_id: Option<String>, reason: String },
    Finished { status: WorkflowStatus },
}

/// Result of offering an event to the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Accepted(Vec<Effect>),
    /// Ignored without touching state; carries the reason.
    Discarded(String),
}

impl Applied {
    pub fn effects(&self) -> &[Effect] {
        match self {
            Applied::Accepted(effects) => effects,
            Applied::Discarded(_) => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphRunner {
    backoff: BackoffPolicy,
    builder: WorkflowBuilder,
}

impl GraphRunner {
    pub fn new(backoff: BackoffPolicy, builder: WorkflowBuilder) -> Self {
        Self { backoff, builder }
    }

    pub fn from_config(config: &RemediatorConfig) -> Self {
        Self::new(config.retry.backoff(), WorkflowBuilder::from_config(config))
    }

    /// CREATED → IN_PROGRESS, then dispatch whatever is ready.
    pub fn start(
        &self,
        wf: &mut RemediationWorkflow,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, RemediatorError> {
        if wf.is_terminal() {
            return Err(RemediatorError::WorkflowTerminal {
                id: wf.id.clone(),
                status: wf.status,
            });
        }
        if wf.status != WorkflowStatus::Created {
            return Ok(Vec::new());
        }
        wf.topological_order()?;

        wf.started_at = Some(now);
        wf.set_status(now, WorkflowStatus::InProgress, None);
        info!(workflow_id = %wf.id, steps = wf.steps.len(), "workflow started");

        let mut effects = self.advance(wf, now);
        effects.extend(self.refresh(wf, now));
        Ok(effects)
    }

    /// Promote unblocked steps and dispatch every READY step.
    pub fn advance(&self, wf: &mut RemediationWorkflow, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        if wf.is_terminal() || wf.status == WorkflowStatus::Created {
            return effects;
        }

        for idx in 0..wf.steps.len() {
            if wf.steps[idx].status == StepStatus::Pending && dependencies_met(wf, idx) {
                self.transition(wf, idx, &StepEvent::Unblocked, now);
            }
            if wf.steps[idx].status != StepStatus::Ready {
                continue;
            }

            let step_id = wf.steps[idx].id.clone();
            self.transition(wf, idx, &StepEvent::Dispatched, now);
            if wf.steps[idx].kind.is_human() {
                self.transition(wf, idx, &StepEvent::AwaitHuman, now);
                effects.push(Effect::OpenHumanTask { step_id });
            } else {
                effects.push(Effect::Enqueue { step_id });
            }
        }
        effects
    }

    /// Called when a leased message is about to execute. Moves a step waiting
    /// out its backoff back to RUNNING; a step already RUNNING (first delivery,
    /// or redelivery after an expired lease) is accepted as is.
    pub fn begin_attempt(
        &self,
        wf: &mut RemediationWorkflow,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if wf.is_terminal() {
            return Err(format!("workflow {} is {}", wf.id, wf.status));
        }
        let idx = wf
            .step_index(step_id)
            .ok_or_else(|| format!("unknown step {step_id}"))?;

        match wf.steps[idx].status {
            StepStatus::Running => Ok(()),
            StepStatus::RetryScheduled => {
                self.transition(wf, idx, &StepEvent::RetryDue, now);
                self.transition(wf, idx, &StepEvent::Dispatched, now);
                Ok(())
            }
            other => Err(format!("step {step_id} is {other}")),
        }
    }

    /// Apply a completion, failure or human outcome to one step.
    ///
    /// Events for terminal workflows, unknown steps, or transitions the table
    /// does not allow are logged and discarded.
    pub fn apply(
        &self,
        wf: &mut RemediationWorkflow,
        step_id: &str,
        event: StepEvent,
        now: DateTime<Utc>,
    ) -> Applied {
        if wf.is_terminal() {
            let reason = format!("workflow {} is {}", wf.id, wf.status);
            warn!(workflow_id = %wf.id, step_id, event = event.name(), "discarding event: {reason}");
            return Applied::Discarded(reason);
        }
        let Some(idx) = wf.step_index(step_id) else {
            let reason = format!("unknown step {step_id}");
            warn!(workflow_id = %wf.id, step_id, event = event.name(), "discarding event: {reason}");
            return Applied::Discarded(reason);
        };
        let Some((_, to)) = self.transition(wf, idx, &event, now) else {
            let reason = format!(
                "{} not accepted in state {}",
                event.name(),
                wf.steps[idx].status
            );
            warn!(workflow_id = %wf.id, step_id, "discarding event: {reason}");
            return Applied::Discarded(reason);
        };

        let mut effects = Vec::new();
        match (&event, to) {
            (StepEvent::TransientFailure { .. }, StepStatus::RetryScheduled) => {
                let step = &wf.steps[idx];
                let delay = self.backoff.next_delay(step.retry_count);
                info!(
                    workflow_id = %wf.id,
                    step_id,
                    retry = step.retry_count,
                    max_retries = step.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "step retry scheduled"
                );
                effects.push(Effect::Requeue {
                    step_id: step_id.to_string(),
                    delay,
                });
            }
            (StepEvent::TransientFailure { .. }, StepStatus::Failed) => {
                let reason = wf.steps[idx].error.clone().unwrap_or_default();
                effects.push(Effect::DeadLetter {
                    step_id: step_id.to_string(),
                    reason,
                });
            }
            (StepEvent::Undispatched { reason }, _) => {
                warn!(workflow_id = %wf.id, step_id, %reason, "dispatch failed, step waits for redispatch");
                wf.dispatch_degraded = true;
                return Applied::Accepted(effects);
            }
            _ => {}
        }

        if to == StepStatus::Failed {
            effects.extend(self.on_step_failed(wf, idx, &event, now));
        }
        effects.extend(self.advance(wf, now));
        effects.extend(self.refresh(wf, now));
        Applied::Accepted(effects)
    }

    /// Emergency stop. Takes effect immediately; in-flight work is left to
    /// finish and its results are discarded.
    pub fn abort(
        &self,
        wf: &mut RemediationWorkflow,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>, RemediatorError> {
        if wf.is_terminal() {
            return Err(RemediatorError::WorkflowTerminal {
                id: wf.id.clone(),
                status: wf.status,
            });
        }
        wf.aborted = true;
        warn!(workflow_id = %wf.id, %reason, "workflow aborted");
        Ok(self.finish(wf, WorkflowStatus::Aborted, Some(reason.to_string()), now))
    }

    /// Fails a non-terminal workflow whose deadline has passed.
    pub fn enforce_deadline(&self, wf: &mut RemediationWorkflow, now: DateTime<Utc>) -> Vec<Effect> {
        if wf.is_terminal() || now < wf.deadline {
            return Vec::new();
        }
        warn!(workflow_id = %wf.id, deadline = %wf.deadline, "workflow deadline exceeded");
        for idx in 0..wf.steps.len() {
            self.transition(wf, idx, &StepEvent::DeadlineExceeded, now);
        }

        let mut effects = vec![Effect::Escalate {
            step_id: None,
            reason: DEADLINE_EXCEEDED.to_string(),
        }];
        effects.extend(self.finish(
            wf,
            WorkflowStatus::Failed,
            Some(DEADLINE_EXCEEDED.to_string()),
            now,
        ));
        effects
    }

    /// Manual override of the workflow deadline.
    pub fn extend_deadline(
        &self,
        wf: &mut RemediationWorkflow,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), RemediatorError> {
        if wf.is_terminal() {
            return Err(RemediatorError::WorkflowTerminal {
                id: wf.id.clone(),
                status: wf.status,
            });
        }
        if deadline <= now {
            return Err(RemediatorError::Validation(format!(
                "new deadline {deadline} is not in the future"
            )));
        }
        let previous = wf.deadline;
        wf.deadline = deadline;
        wf.history.push(HistoryEntry {
            at: now,
            step_id: None,
            from: wf.status.to_string(),
            to: wf.status.to_string(),
            detail: Some(format!("deadline moved from {previous} to {deadline}")),
        });
        info!(workflow_id = %wf.id, %previous, %deadline, "deadline extended");
        Ok(())
    }

    /// Runs one table transition and records it. Returns `None` when the
    /// event is not accepted in the step's current state.
    fn transition(
        &self,
        wf: &mut RemediationWorkflow,
        idx: usize,
        event: &StepEvent,
        now: DateTime<Utc>,
    ) -> Option<(StepStatus, StepStatus)> {
        let step = &mut wf.steps[idx];
        let from = step.status;
        let to = next_status(step.kind, from, event, step.retries_left())?;

        step.status = to;
        let detail = match event {
            StepEvent::Dispatched => {
                step.started_at.get_or_insert(now);
                None
            }
            StepEvent::Succeeded { result } => {
                step.result = result.clone();
                step.error = None;
                None
            }
            StepEvent::TransientFailure { reason } if to == StepStatus::RetryScheduled => {
                step.retry_count += 1;
                step.error = Some(reason.clone());
                Some(reason.clone())
            }
            StepEvent::TransientFailure { reason } => {
                let msg = format!("retries exhausted after {} attempts: {reason}", step.attempts());
                step.error = Some(msg.clone());
                Some(msg)
            }
            StepEvent::PermanentFailure { reason }
            | StepEvent::Undispatched { reason }
            | StepEvent::Cancel { reason } => {
                if to == StepStatus::Failed {
                    step.error = Some(reason.clone());
                }
                Some(reason.clone())
            }
            StepEvent::Skip { reason } => Some(reason.clone()),
            StepEvent::HumanOutcome { outcome, note } => {
                step.result = Some(json!({ "outcome": outcome, "note": note }));
                if to == StepStatus::Failed {
                    step.error = Some(format!("human task {outcome}"));
                }
                Some(outcome.to_string())
            }
            StepEvent::DeadlineExceeded => {
                step.error = Some(DEADLINE_EXCEEDED.to_string());
                Some(DEADLINE_EXCEEDED.to_string())
            }
            StepEvent::Unblocked | StepEvent::AwaitHuman | StepEvent::RetryDue => None,
        };
        if to.is_terminal() {
            step.finished_at = Some(now);
        }

        let step_id = step.id.clone();
        debug!(workflow_id = %wf.id, %step_id, %from, %to, event = event.name(), "step transition");
        wf.record_step(now, &step_id, from, to, detail);
        Some((from, to))
    }

    /// Consequences of a step reaching FAILED.
    fn on_step_failed(
        &self,
        wf: &mut RemediationWorkflow,
        idx: usize,
        event: &StepEvent,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        let failed = wf.steps[idx].clone();

        if let StepEvent::HumanOutcome {
            outcome: TaskOutcome::Rejected,
            ..
        } = event
        {
            let reason = if failed.kind == StepKind::Approval {
                REJECTED_BY_APPROVER
            } else {
                REJECTED_BY_ASSIGNEE
            };
            return self.fail(wf, reason, now);
        }

        let skip = StepEvent::Skip {
            reason: format!("upstream step {} failed", failed.id),
        };
        for id in wf.downstream_of(&failed.id) {
            if let Some(i) = wf.step_index(&id) {
                self.transition(wf, i, &skip, now);
            }
        }

        let reason = failed
            .error
            .clone()
            .unwrap_or_else(|| format!("step {} failed", failed.id));

        // Escalation steps do not escalate again.
        if failed.escalates().is_some() {
            return Vec::new();
        }

        let escalation = self.builder.escalation_step(&failed);
        if wf.step(&escalation.id).is_none() {
            warn!(
                workflow_id = %wf.id,
                step_id = %failed.id,
                escalation = %escalation.id,
                %reason,
                "step failed, escalating to manual intervention"
            );
            wf.steps.push(escalation);
        }
        vec![Effect::Escalate {
            step_id: Some(failed.id),
            reason,
        }]
    }

    /// Fails the whole workflow now, settling every remaining step.
    fn fail(&self, wf: &mut RemediationWorkflow, reason: &str, now: DateTime<Utc>) -> Vec<Effect> {
        let cancel = StepEvent::Cancel {
            reason: reason.to_string(),
        };
        for idx in 0..wf.steps.len() {
            self.transition(wf, idx, &cancel, now);
        }
        self.finish(wf, WorkflowStatus::Failed, Some(reason.to_string()), now)
    }

    fn finish(
        &self,
        wf: &mut RemediationWorkflow,
        status: WorkflowStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        if wf.failure_reason.is_none() {
            wf.failure_reason = reason.clone();
        }
        wf.set_status(now, status, reason);
        info!(
            workflow_id = %wf.id,
            %status,
            reason = wf.failure_reason.as_deref().unwrap_or(""),
            "workflow finished"
        );
        vec![Effect::CloseHumanTasks, Effect::Finished { status }]
    }

    /// Recompute the workflow status from its steps.
    fn refresh(&self, wf: &mut RemediationWorkflow, now: DateTime<Utc>) -> Vec<Effect> {
        if wf.is_terminal() || wf.status == WorkflowStatus::Created {
            return Vec::new();
        }

        if wf.steps.iter().all(|s| s.status.is_terminal()) {
            let unresolved = wf
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Failed && !wf.is_resolved(&s.id))
                .map(|s| {
                    format!(
                        "step {} failed: {}",
                        s.id,
                        s.error.as_deref().unwrap_or("unknown error")
                    )
                });
            return match unresolved {
                Some(reason) => self.finish(wf, WorkflowStatus::Failed, Some(reason), now),
                None => self.finish(wf, WorkflowStatus::Completed, None, now),
            };
        }

        let awaiting_approval = wf
            .steps
            .iter()
            .any(|s| s.kind == StepKind::Approval && s.status == StepStatus::AwaitingHuman);
        let status = if awaiting_approval {
            WorkflowStatus::AwaitingApproval
        } else {
            WorkflowStatus::InProgress
        };
        wf.set_status(now, status, None);
        Vec::new()
    }
}

fn dependencies_met(wf: &RemediationWorkflow, idx: usize) -> bool {
    wf.steps[idx].dependencies.iter().all(|dep| {
        wf.step(dep)
            .map(|s| s.status.unblocks_dependents())
            .unwrap_or(false)
    })
}
