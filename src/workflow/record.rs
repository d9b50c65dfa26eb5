use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::WorkflowStatus;
use super::RemediationWorkflow;
use crate::decision::RemediationType;

/// One recorded state change, for a step or for the workflow itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    /// `None` for workflow-level transitions.
    pub step_id: Option<String>,
    pub from: String,
    pub to: String,
    pub detail: Option<String>,
}

impl HistoryEntry {
    pub fn workflow(at: DateTime<Utc>, from: WorkflowStatus, to: WorkflowStatus, detail: Option<String>) -> Self {
        Self {
            at,
            step_id: None,
            from: from.to_string(),
            to: to.to_string(),
            detail,
        }
    }
}

/// Structured audit record summarising a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub workflow_id: String,
    pub violation_id: String,
    pub rule_id: String,
    pub framework: String,
    pub remediation_type: RemediationType,
    pub status: WorkflowStatus,
    pub failure_reason: Option<String>,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub total_retries: u32,
    pub transitions: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

impl AuditRecord {
    /// Generate an audit record from a workflow in any state.
    pub fn from_workflow(wf: &RemediationWorkflow, now: DateTime<Utc>) -> Self {
        use super::StepStatus;

        let end = wf.finished_at.unwrap_or(now);
        Self {
            workflow_id: wf.id.clone(),
            violation_id: wf.signal.id.clone(),
            rule_id: wf.signal.rule_id.clone(),
            framework: wf.signal.framework.clone(),
            remediation_type: wf.decision.remediation_type,
            status: wf.status,
            failure_reason: wf.failure_reason.clone(),
            steps_total: wf.steps.len(),
            steps_completed: wf
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .count(),
            steps_failed: wf
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count(),
            total_retries: wf.steps.iter().map(|s| s.retry_count).sum(),
            transitions: wf.history.len(),
            created_at: wf.created_at,
            finished_at: wf.finished_at,
            duration_ms: (end - wf.created_at).num_milliseconds(),
        }
    }
}
