//! Human task tracking for approval and manual steps.
//!
//! Each human step in `AWAITING_HUMAN` is bound to exactly one open
//! [`HumanTask`]. The manager keeps deadlines and reminder schedules and
//! applies the expiry policy; the orchestrator turns the results into step
//! events.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ExpiryPolicy, HumanConfig, hours};
use crate::error::RemediatorError;
use crate::signal::{DataCategory, RiskLevel, ViolationSignal};
use crate::workflow::{RemediationWorkflow, StepKind, StepRole, WorkflowStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Pending,
    Approved,
    Rejected,
    /// Approved with changes described in the note.
    Modified,
    Expired,
}

impl TaskOutcome {
    /// Outcomes a person may submit.
    pub fn is_decision(self) -> bool {
        matches!(
            self,
            TaskOutcome::Approved | TaskOutcome::Rejected | TaskOutcome::Modified
        )
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskOutcome::Pending => "pending",
            TaskOutcome::Approved => "approved",
            TaskOutcome::Rejected => "rejected",
            TaskOutcome::Modified => "modified",
            TaskOutcome::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub at: DateTime<Utc>,
    pub hours_before: u64,
    pub sent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanTask {
    pub id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub kind: StepKind,
    pub title: String,
    pub instructions: Vec<String>,
    pub assignee_role: String,
    pub priority: RiskLevel,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Ordered by `at`, earliest first.
    pub reminders: Vec<Reminder>,
    pub outcome: TaskOutcome,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub note: Option<String>,
    pub reassigned: bool,
}

impl HumanTask {
    pub fn is_open(&self) -> bool {
        self.outcome == TaskOutcome::Pending
    }
}

/// A reminder that just became due.
#[derive(Debug, Clone)]
pub struct DueReminder {
    pub task: HumanTask,
    pub hours_before: u64,
}

/// Result of applying the expiry policy to an overdue task.
#[derive(Debug, Clone)]
pub enum Expiry {
    /// Outcome set to `Expired`; the bound step must fail.
    Expired(HumanTask),
    /// Handed to the escalation role with a new deadline; the step keeps waiting.
    Reassigned(HumanTask),
}

pub struct HumanTaskManager {
    config: HumanConfig,
    tasks: HashMap<String, HumanTask>,
}

impl HumanTaskManager {
    pub fn new(config: HumanConfig) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
        }
    }

    /// Create the task bound to a human step that just entered `AWAITING_HUMAN`.
    ///
    /// deadline = min(now + step timeout, workflow deadline)
    pub fn open(
        &mut self,
        wf: &RemediationWorkflow,
        step: &WorkflowStep,
        now: DateTime<Utc>,
    ) -> HumanTask {
        let step_deadline = ChronoDuration::from_std(step.timeout())
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(wf.deadline);
        let deadline = step_deadline.min(wf.deadline);
        let priority = wf.signal.risk_level;

        let assignee_role = match &step.role {
            StepRole::Approval => approver_for(&wf.signal).to_string(),
            StepRole::Escalation { .. } => self.config.escalation_role.clone(),
            _ => manual_assignee_for(&wf.signal).to_string(),
        };

        let task = HumanTask {
            id: Uuid::new_v4().to_string(),
            workflow_id: wf.id.clone(),
            step_id: step.id.clone(),
            kind: step.kind,
            title: step.name.clone(),
            instructions: instructions_for(&wf.signal, step),
            assignee_role,
            priority,
            created_at: now,
            deadline,
            reminders: self.schedule(priority, deadline, now),
            outcome: TaskOutcome::Pending,
            resolved_at: None,
            resolved_by: None,
            note: None,
            reassigned: false,
        };

        info!(
            workflow_id = %task.workflow_id,
            step_id = %task.step_id,
            task_id = %task.id,
            assignee = %task.assignee_role,
            deadline = %task.deadline,
            "human task created"
        );
        self.tasks.insert(task.id.clone(), task.clone());
        task
    }

    /// Reminders at the configured offsets before the deadline, dropping any already in the past.
    fn schedule(&self, priority: RiskLevel, deadline: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Reminder> {
        let mut reminders: Vec<Reminder> = self
            .config
            .reminders
            .for_risk(priority)
            .iter()
            .filter_map(|&h| {
                let at = deadline.checked_sub_signed(hours(h).ok()?)?;
                Some(Reminder {
                    at,
                    hours_before: h,
                    sent: false,
                })
            })
            .filter(|r| r.at > now)
            .collect();
        reminders.sort_by_key(|r| r.at);
        reminders
    }

    /// Record a person's decision. A task resolves exactly once.
    pub fn resolve(
        &mut self,
        task_id: &str,
        outcome: TaskOutcome,
        actor: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<HumanTask, RemediatorError> {
        if !outcome.is_decision() {
            return Err(RemediatorError::Validation(format!(
                "{outcome} is not a decision a person can submit"
            )));
        }
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RemediatorError::TaskNotFound(task_id.to_string()))?;
        if !task.is_open() {
            return Err(RemediatorError::TaskResolved {
                id: task_id.to_string(),
                outcome: task.outcome.to_string(),
            });
        }

        task.outcome = outcome;
        task.resolved_at = Some(now);
        task.resolved_by = Some(actor.to_string());
        task.note = note;
        info!(task_id, %outcome, actor, step_id = %task.step_id, "human task resolved");
        Ok(task.clone())
    }

    /// Marks and returns every unsent reminder of an open task whose time has come.
    pub fn due_reminders(&mut self, now: DateTime<Utc>) -> Vec<DueReminder> {
        let mut due = Vec::new();
        for task in self.tasks.values_mut().filter(|t| t.is_open()) {
            let mut fired = Vec::new();
            for reminder in task.reminders.iter_mut().filter(|r| !r.sent && r.at <= now) {
                reminder.sent = true;
                fired.push(reminder.hours_before);
            }
            for hours_before in fired {
                debug!(task_id = %task.id, hours_before, "reminder due");
                due.push(DueReminder {
                    task: task.clone(),
                    hours_before,
                });
            }
        }
        due
    }

    /// Applies the expiry policy to every open task past its deadline.
    pub fn expire_overdue(&mut self, now: DateTime<Utc>) -> Vec<Expiry> {
        let mut out = Vec::new();
        let escalation_role = self.config.escalation_role.clone();
        let extension = hours(self.config.reassign_extension_hours).ok();

        let overdue: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.is_open() && t.deadline <= now)
            .map(|t| t.id.clone())
            .collect();

        for id in overdue {
            let reassign = self.config.on_expiry == ExpiryPolicy::Reassign;
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            let priority = task.priority;
            // An unrepresentable extension expires the task instead.
            let new_deadline = extension
                .filter(|_| reassign && !task.reassigned)
                .and_then(|d| now.checked_add_signed(d));
            let reminders = match new_deadline {
                Some(deadline) => self.schedule(priority, deadline, now),
                None => Vec::new(),
            };

            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if let Some(new_deadline) = new_deadline {
                warn!(task_id = %id, from = %task.assignee_role, to = %escalation_role, "human task overdue, reassigning");
                task.assignee_role = escalation_role.clone();
                task.deadline = new_deadline;
                task.reminders = reminders;
                task.reassigned = true;
                out.push(Expiry::Reassigned(task.clone()));
            } else {
                warn!(task_id = %id, step_id = %task.step_id, "human task expired");
                task.outcome = TaskOutcome::Expired;
                task.resolved_at = Some(now);
                out.push(Expiry::Expired(task.clone()));
            }
        }
        out
    }

    /// Expires every open task of a workflow that no longer needs them.
    pub fn withdraw(&mut self, workflow_id: &str, reason: &str, now: DateTime<Utc>) -> Vec<HumanTask> {
        let mut withdrawn = Vec::new();
        for task in self
            .tasks
            .values_mut()
            .filter(|t| t.workflow_id == workflow_id && t.is_open())
        {
            task.outcome = TaskOutcome::Expired;
            task.resolved_at = Some(now);
            task.note = Some(reason.to_string());
            withdrawn.push(task.clone());
        }
        withdrawn
    }

    /// Follows a workflow deadline extension: open tasks whose deadline was
    /// capped at the previous workflow deadline move to the new one.
    pub fn extend(
        &mut self,
        workflow_id: &str,
        previous: DateTime<Utc>,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> usize {
        let capped: Vec<(String, RiskLevel)> = self
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id && t.is_open() && t.deadline == previous)
            .map(|t| (t.id.clone(), t.priority))
            .collect();
        for (id, priority) in &capped {
            let reminders = self.schedule(*priority, deadline, now);
            if let Some(task) = self.tasks.get_mut(id) {
                task.deadline = deadline;
                task.reminders = reminders;
            }
        }
        capped.len()
    }

    pub fn get(&self, task_id: &str) -> Option<&HumanTask> {
        self.tasks.get(task_id)
    }

    /// All tasks of a workflow, oldest first.
    pub fn tasks_for(&self, workflow_id: &str) -> Vec<HumanTask> {
        let mut tasks: Vec<HumanTask> = self
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn open_count(&self) -> usize {
        self.tasks.values().filter(|t| t.is_open()).count()
    }

    /// Drops every task of an evicted workflow. Returns how many were removed.
    pub fn forget(&mut self, workflow_id: &str) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| t.workflow_id != workflow_id);
        before - self.tasks.len()
    }
}

/// Who approves a remediation plan, by risk.
pub fn approver_for(signal: &ViolationSignal) -> &'static str {
    match signal.risk_level {
        RiskLevel::Critical => "dpo",
        RiskLevel::High => "compliance_manager",
        _ => "senior_compliance_analyst",
    }
}

/// Who performs manual remediation, by data category then risk.
pub fn manual_assignee_for(signal: &ViolationSignal) -> &'static str {
    let categories = &signal.activity.data_categories;
    if categories
        .iter()
        .any(|c| matches!(c, DataCategory::HealthData | DataCategory::BiometricData))
    {
        "data_privacy_specialist"
    } else if categories.contains(&DataCategory::FinancialData) {
        "financial_compliance_specialist"
    } else if signal.risk_level == RiskLevel::Critical {
        "senior_compliance_officer"
    } else {
        "compliance_team"
    }
}

fn instructions_for(signal: &ViolationSignal, step: &WorkflowStep) -> Vec<String> {
    let actions = if signal.recommended_actions.is_empty() {
        "none recommended, determine appropriate remediation".to_string()
    } else {
        signal.recommended_actions.join(", ")
    };

    let mut out = match &step.role {
        StepRole::Approval => vec![
            "Review the proposed remediation plan for completeness and accuracy".to_string(),
            format!("Planned actions: {actions}"),
            format!("Verify compliance with {} requirements", signal.framework),
            "Approve, reject, or approve with modifications".to_string(),
        ],
        StepRole::Escalation { of } => vec![
            format!("Automated step {of} could not complete; remediate it manually"),
            format!("Planned actions: {actions}"),
            "Document all actions taken with timestamps".to_string(),
        ],
        _ => vec![
            format!("Execute the following remediation actions: {actions}"),
            format!("Ensure compliance with {} requirements", signal.framework),
            "Document all actions taken with timestamps".to_string(),
            "Verify data integrity before and after remediation".to_string(),
        ],
    };

    if signal.activity.data_categories.iter().any(|c| {
        matches!(c, DataCategory::HealthData | DataCategory::BiometricData)
    }) {
        out.push("Follow special procedures for sensitive health/biometric data".to_string());
    }
    if signal.activity.cross_border_transfers {
        out.push("Consider cross-border transfer restrictions and requirements".to_string());
    }
    if signal.risk_level >= RiskLevel::High && step.kind == StepKind::Approval {
        out.push("Assess regulatory notification requirements".to_string());
    }
    out
}
