//! Compiles a remediation decision into a concrete step graph.
//!
//! - automatic: `precondition-check → execute-1 → … → execute-N`, then one
//!   `verify-i` per action, all depending only on `execute-N` so they can run
//!   in parallel.
//! - human_in_loop: the same chain gated behind an `approval` step.
//! - manual_only: a single `manual-remediation` step.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::{RemediatorConfig, TimeoutConfig, hours};
use crate::decision::{RemediationDecision, RemediationType};
use crate::error::RemediatorError;
use crate::signal::{ActionKind, ViolationSignal};
use crate::workflow::{RemediationWorkflow, StepKind, StepRole, WorkflowStatus, WorkflowStep};

pub const PRECONDITION_STEP: &str = "precondition-check";
pub const APPROVAL_STEP: &str = "approval";
pub const MANUAL_STEP: &str = "manual-remediation";

#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    timeouts: TimeoutConfig,
    max_retries: u32,
    deadline_hours: u64,
}

impl WorkflowBuilder {
    pub fn from_config(config: &RemediatorConfig) -> Self {
        Self {
            timeouts: config.timeouts.clone(),
            max_retries: config.retry.max_retries,
            deadline_hours: config.workflow_deadline_hours,
        }
    }

    pub fn build(
        &self,
        decision: &RemediationDecision,
        signal: &ViolationSignal,
        now: DateTime<Utc>,
    ) -> Result<RemediationWorkflow, RemediatorError> {
        if decision.violation_id != signal.id {
            return Err(RemediatorError::Validation(format!(
                "decision for {} applied to violation {}",
                decision.violation_id, signal.id
            )));
        }

        let deadline = hours(self.deadline_hours)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| {
                RemediatorError::Config(format!(
                    "workflow deadline of {}h is out of range",
                    self.deadline_hours
                ))
            })?;

        let steps = match decision.remediation_type {
            RemediationType::Automatic => self.automatic_chain(signal, None),
            RemediationType::HumanInLoop => {
                let approval = self.human(
                    APPROVAL_STEP,
                    "Approve remediation plan",
                    StepKind::Approval,
                    StepRole::Approval,
                );
                let mut steps = vec![approval];
                steps.extend(self.automatic_chain(signal, Some(APPROVAL_STEP)));
                steps
            }
            RemediationType::ManualOnly => vec![self.human(
                MANUAL_STEP,
                "Manual remediation",
                StepKind::Manual,
                StepRole::ManualRemediation,
            )],
        };

        let workflow = RemediationWorkflow {
            id: Uuid::new_v4().to_string(),
            signal: signal.clone(),
            decision: decision.clone(),
            steps,
            status: WorkflowStatus::Created,
            created_at: now,
            started_at: None,
            finished_at: None,
            deadline,
            aborted: false,
            failure_reason: None,
            dispatch_degraded: false,
            history: Vec::new(),
        };
        workflow.topological_order()?;

        debug!(
            workflow_id = %workflow.id,
            violation_id = %signal.id,
            steps = workflow.steps.len(),
            remediation_type = %decision.remediation_type,
            "workflow built"
        );
        Ok(workflow)
    }

    fn automatic_chain(&self, signal: &ViolationSignal, gate: Option<&str>) -> Vec<WorkflowStep> {
        let actions: Vec<String> = if signal.recommended_actions.is_empty() {
            vec![format!("Apply remediation for rule {}", signal.rule_id)]
        } else {
            signal.recommended_actions.clone()
        };

        let mut steps = Vec::with_capacity(actions.len() * 2 + 1);
        steps.push(
            self.automated(PRECONDITION_STEP, "Precondition check", StepRole::PreconditionCheck)
                .depends_on(gate),
        );

        let mut previous = PRECONDITION_STEP.to_string();
        for (i, action) in actions.iter().enumerate() {
            let index = i + 1;
            let id = format!("execute-{index}");
            let role = StepRole::ExecuteAction {
                index,
                action: action.clone(),
                kind: ActionKind::infer(action),
            };
            steps.push(
                self.automated(&id, format!("Execute: {action}"), role)
                    .depends_on([previous.clone()]),
            );
            previous = id;
        }

        // Verification starts once the last action ran; checks are independent of each other.
        for (i, action) in actions.iter().enumerate() {
            let index = i + 1;
            let role = StepRole::Verify {
                index,
                action: action.clone(),
            };
            steps.push(
                self.automated(&format!("verify-{index}"), format!("Verify: {action}"), role)
                    .depends_on([previous.clone()]),
            );
        }
        steps
    }

    /// Manual step that takes over after `failed` could not complete.
    pub fn escalation_step(&self, failed: &WorkflowStep) -> WorkflowStep {
        self.human(
            &format!("escalation-{}", failed.id),
            format!("Escalation: {}", failed.name),
            StepKind::Manual,
            StepRole::Escalation {
                of: failed.id.clone(),
            },
        )
    }

    fn automated(&self, id: &str, name: impl Into<String>, role: StepRole) -> WorkflowStep {
        WorkflowStep::new(id, name, StepKind::Automated, role)
            .with_retries(self.max_retries)
            .with_timeout(self.timeouts.for_kind(StepKind::Automated))
    }

    fn human(&self, id: &str, name: impl Into<String>, kind: StepKind, role: StepRole) -> WorkflowStep {
        WorkflowStep::new(id, name, kind, role).with_timeout(self.timeouts.for_kind(kind))
    }
}
