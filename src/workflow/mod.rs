mod record;
mod state;
mod step;

pub use record::{AuditRecord, HistoryEntry};
pub use state::{next_status, StepEvent, StepStatus, WorkflowStatus};
pub use step::{BackoffPolicy, StepKind, StepRole, WorkflowStep};

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::RemediationDecision;
use crate::error::RemediatorError;
use crate::signal::ViolationSignal;

/// A remediation case driven to completion as a graph of ordered steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationWorkflow {
    pub id: String,
    pub signal: ViolationSignal,
    pub decision: RemediationDecision,
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Absolute deadline; passing it while non-terminal fails the workflow.
    pub deadline: DateTime<Utc>,
    pub aborted: bool,
    pub failure_reason: Option<String>,
    /// The queue refused at least one dispatch that has not been retried yet.
    pub dispatch_degraded: bool,
    pub history: Vec<HistoryEntry>,
}

impl RemediationWorkflow {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Steps in dependency order (dependencies before dependents), using Kahn's algorithm.
    pub fn topological_order(&self) -> Result<Vec<String>, RemediatorError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for step in &self.steps {
            in_degree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.dependencies {
                if self.step(dep).is_none() {
                    return Err(RemediatorError::Validation(format!(
                        "step {} depends on unknown step {dep}",
                        step.id
                    )));
                }
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        // Seed in declaration order so the result is stable.
        let mut queue: VecDeque<&str> = self
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for next in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            return Err(RemediatorError::CyclicGraph(self.id.clone()));
        }
        Ok(order)
    }

    /// Ids of all steps that transitively depend on `id`.
    pub fn downstream_of(&self, id: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for step in &self.steps {
                if step.dependencies.iter().any(|d| *d == current) && !found.contains(&step.id) {
                    found.push(step.id.clone());
                    frontier.push(step.id.clone());
                }
            }
        }
        found
    }

    /// A failed step counts as resolved once its escalation step completed.
    pub fn is_resolved(&self, step_id: &str) -> bool {
        self.steps
            .iter()
            .any(|s| s.escalates() == Some(step_id) && s.status == StepStatus::Completed)
    }

    pub(crate) fn record_step(
        &mut self,
        at: DateTime<Utc>,
        step_id: &str,
        from: StepStatus,
        to: StepStatus,
        detail: Option<String>,
    ) {
        self.history.push(HistoryEntry {
            at,
            step_id: Some(step_id.to_string()),
            from: from.to_string(),
            to: to.to_string(),
            detail,
        });
    }

    pub(crate) fn set_status(&mut self, at: DateTime<Utc>, to: WorkflowStatus, detail: Option<String>) {
        if self.status == to {
            return;
        }
        self.history
            .push(HistoryEntry::workflow(at, self.status, to, detail));
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(at);
        }
    }
}
