use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::human::{DueReminder, HumanTask};
use crate::signal::RiskLevel;
use crate::workflow::{RemediationWorkflow, StepKind, WorkflowStatus};

/// Recipient for workflow-level announcements.
pub const COMPLIANCE_TEAM: &str = "compliance_team";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalNeeded,
    HumanInterventionRequired,
    DeadlineApproaching,
    UrgentAttention,
    WorkflowCompleted,
    WorkflowFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Slack,
}

impl Channel {
    /// Urgent work goes to chat, everything else to email.
    pub fn for_priority(priority: RiskLevel) -> Self {
        if priority >= RiskLevel::High {
            Channel::Slack
        } else {
            Channel::Email
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Slack => write!(f, "slack"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: String,
    pub channel: Channel,
    pub subject: String,
    pub body: String,
    pub workflow_id: String,
}

impl Notification {
    pub fn task_assigned(task: &HumanTask) -> Self {
        let kind = match task.kind {
            StepKind::Approval => NotificationKind::ApprovalNeeded,
            _ => NotificationKind::HumanInterventionRequired,
        };
        Self {
            kind,
            recipient: task.assignee_role.clone(),
            channel: Channel::for_priority(task.priority),
            subject: format!("[{}] {}", task.priority, task.title),
            body: format!(
                "Task {} is due {}.\n{}",
                task.id,
                task.deadline.to_rfc3339(),
                task.instructions.join("\n")
            ),
            workflow_id: task.workflow_id.clone(),
        }
    }

    pub fn reminder(due: &DueReminder) -> Self {
        let task = &due.task;
        Self {
            kind: NotificationKind::DeadlineApproaching,
            recipient: task.assignee_role.clone(),
            channel: Channel::for_priority(task.priority),
            subject: format!("Reminder: {} due in {}h", task.title, due.hours_before),
            body: format!("Task {} is due {}.", task.id, task.deadline.to_rfc3339()),
            workflow_id: task.workflow_id.clone(),
        }
    }

    pub fn escalation(
        workflow_id: &str,
        recipient: &str,
        priority: RiskLevel,
        reason: &str,
    ) -> Self {
        Self {
            kind: NotificationKind::UrgentAttention,
            recipient: recipient.to_string(),
            channel: Channel::for_priority(priority),
            subject: format!("Escalation on workflow {workflow_id}"),
            body: reason.to_string(),
            workflow_id: workflow_id.to_string(),
        }
    }

    /// Announcement for a workflow that reached COMPLETED or FAILED. Aborts are not announced.
    pub fn workflow_finished(wf: &RemediationWorkflow) -> Option<Self> {
        let kind = match wf.status {
            WorkflowStatus::Completed => NotificationKind::WorkflowCompleted,
            WorkflowStatus::Failed => NotificationKind::WorkflowFailed,
            _ => return None,
        };
        let body = match &wf.failure_reason {
            Some(reason) => format!("Violation {} remediation failed: {reason}", wf.signal.id),
            None => format!("Violation {} remediated.", wf.signal.id),
        };
        Some(Self {
            kind,
            recipient: COMPLIANCE_TEAM.to_string(),
            channel: Channel::for_priority(wf.signal.risk_level),
            subject: format!("Workflow {} {}", wf.id, wf.status),
            body,
            workflow_id: wf.id.clone(),
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("delivery to {recipient} via {channel} failed: {reason}")]
    Delivery {
        recipient: String,
        channel: Channel,
        reason: String,
    },
}

/// Delivery substrate for notifications. Fire-and-forget from the engine's
/// point of view: errors are logged, never propagated into workflow state.
pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            workflow_id = %notification.workflow_id,
            recipient = %notification.recipient,
            channel = %notification.channel,
            kind = ?notification.kind,
            "{}",
            notification.subject
        );
        Ok(())
    }
}
