use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::FailureKind;
use crate::signal::ActionKind;
use crate::workflow::{RemediationWorkflow, StepRole, WorkflowStep};

/// Everything an executor needs to run one attempt of an automated step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub workflow_id: String,
    pub step_id: String,
    pub name: String,
    pub role: StepRole,
    /// 1-based delivery attempt.
    pub attempt: u32,
    pub violation_id: String,
    pub rule_id: String,
    pub framework: String,
}

impl StepContext {
    pub fn new(wf: &RemediationWorkflow, step: &WorkflowStep) -> Self {
        Self {
            workflow_id: wf.id.clone(),
            step_id: step.id.clone(),
            name: step.name.clone(),
            role: step.role.clone(),
            attempt: step.attempts(),
            violation_id: wf.signal.id.clone(),
            rule_id: wf.signal.rule_id.clone(),
            framework: wf.signal.framework.clone(),
        }
    }

    pub fn action_kind(&self) -> Option<ActionKind> {
        match &self.role {
            StepRole::ExecuteAction { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Option<serde_json::Value>),
    Failure(FailureKind),
}

/// Runs the concrete remediation action behind an automated step.
///
/// Delivery is at-least-once, so implementations must be idempotent: the same
/// step may be executed again after a lost acknowledgement or an expired lease.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, ctx: &StepContext) -> impl Future<Output = StepOutcome> + Send;
}

/// Reports success for every step without touching anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

impl StepExecutor for DryRunExecutor {
    async fn execute(&self, ctx: &StepContext) -> StepOutcome {
        debug!(workflow_id = %ctx.workflow_id, step_id = %ctx.step_id, attempt = ctx.attempt, "dry run");
        StepOutcome::Success(Some(json!({
            "dry_run": true,
            "step": ctx.step_id,
            "action_kind": ctx.action_kind().map(|k| k.to_string()),
        })))
    }
}
