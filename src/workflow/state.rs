use std::fmt;

use serde::{Deserialize, Serialize};

use super::step::StepKind;
use crate::human::TaskOutcome;

/// Lifecycle of a single workflow step.
///
/// `PENDING → READY → RUNNING → {COMPLETED | RETRY_SCHEDULED | FAILED | AWAITING_HUMAN}`,
/// `RETRY_SCHEDULED → READY`, and `SKIPPED` from `PENDING`/`READY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    RetryScheduled,
    AwaitingHuman,
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
        )
    }

    /// Satisfies a dependency edge.
    pub fn unblocks_dependents(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Ready => "READY",
            StepStatus::Running => "RUNNING",
            StepStatus::RetryScheduled => "RETRY_SCHEDULED",
            StepStatus::AwaitingHuman => "AWAITING_HUMAN",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a whole workflow.
///
/// `CREATED → IN_PROGRESS → {AWAITING_APPROVAL} → {COMPLETED | FAILED | ABORTED}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Created,
    InProgress,
    AwaitingApproval,
    Completed,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Aborted
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Created => "CREATED",
            WorkflowStatus::InProgress => "IN_PROGRESS",
            WorkflowStatus::AwaitingApproval => "AWAITING_APPROVAL",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Something that happened to a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    /// Every dependency is completed or skipped.
    Unblocked,
    /// Handed to the queue (automated) or the human task manager.
    Dispatched,
    /// A human task now exists for the step.
    AwaitHuman,
    Succeeded { result: Option<serde_json::Value> },
    TransientFailure { reason: String },
    PermanentFailure { reason: String },
    /// The queue refused the message; the step goes back to waiting for dispatch.
    Undispatched { reason: String },
    /// Backoff elapsed for a scheduled retry.
    RetryDue,
    HumanOutcome { outcome: TaskOutcome, note: Option<String> },
    /// An upstream branch made the step moot.
    Skip { reason: String },
    /// The workflow failed as a whole; unstarted steps are skipped, live ones fail.
    Cancel { reason: String },
    DeadlineExceeded,
}

impl StepEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StepEvent::Unblocked => "unblocked",
            StepEvent::Dispatched => "dispatched",
            StepEvent::AwaitHuman => "await_human",
            StepEvent::Succeeded { .. } => "succeeded",
            StepEvent::TransientFailure { .. } => "transient_failure",
            StepEvent::PermanentFailure { .. } => "permanent_failure",
            StepEvent::Undispatched { .. } => "undispatched",
            StepEvent::RetryDue => "retry_due",
            StepEvent::HumanOutcome { .. } => "human_outcome",
            StepEvent::Skip { .. } => "skip",
            StepEvent::Cancel { .. } => "cancel",
            StepEvent::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// The step transition table.
///
/// Returns the target status for `event` in state `from`, or `None` when the
/// event is not accepted there. `retries_left` only matters for transient
/// failures of automated steps.
pub fn next_status(
    kind: StepKind,
    from: StepStatus,
    event: &StepEvent,
    retries_left: bool,
) -> Option<StepStatus> {
    use StepStatus::*;

    let human = kind != StepKind::Automated;

    match (from, event) {
        (Pending, StepEvent::Unblocked) => Some(Ready),
        (Ready, StepEvent::Dispatched) => Some(Running),
        (RetryScheduled, StepEvent::RetryDue) => Some(Ready),
        (Running, StepEvent::AwaitHuman) if human => Some(AwaitingHuman),
        (Running, StepEvent::Undispatched { .. }) if !human => Some(Ready),
        (Running, StepEvent::Succeeded { .. }) if !human => Some(Completed),
        (Running, StepEvent::TransientFailure { .. }) if !human => {
            Some(if retries_left { RetryScheduled } else { Failed })
        }
        (Running, StepEvent::PermanentFailure { .. }) if !human => Some(Failed),
        // Dead-lettered deliveries report against steps that are between attempts.
        (RetryScheduled | Ready, StepEvent::PermanentFailure { .. }) if !human => Some(Failed),
        (AwaitingHuman, StepEvent::HumanOutcome { outcome, .. }) => match outcome {
            TaskOutcome::Approved | TaskOutcome::Modified => Some(Completed),
            TaskOutcome::Rejected | TaskOutcome::Expired => Some(Failed),
            TaskOutcome::Pending => None,
        },
        (Pending | Ready, StepEvent::Skip { .. } | StepEvent::Cancel { .. }) => Some(Skipped),
        (s, StepEvent::Cancel { .. } | StepEvent::DeadlineExceeded) if !s.is_terminal() => {
            Some(Failed)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> StepEvent {
        StepEvent::TransientFailure {
            reason: "timeout".into(),
        }
    }

    #[test]
    fn automated_happy_path() {
        let k = StepKind::Automated;
        assert_eq!(
            next_status(k, StepStatus::Pending, &StepEvent::Unblocked, true),
            Some(StepStatus::Ready)
        );
        assert_eq!(
            next_status(k, StepStatus::Ready, &StepEvent::Dispatched, true),
            Some(StepStatus::Running)
        );
        assert_eq!(
            next_status(
                k,
                StepStatus::Running,
                &StepEvent::Succeeded { result: None },
                true
            ),
            Some(StepStatus::Completed)
        );
    }

    #[test]
    fn transient_failure_depends_on_retry_budget() {
        let k = StepKind::Automated;
        assert_eq!(
            next_status(k, StepStatus::Running, &transient(), true),
            Some(StepStatus::RetryScheduled)
        );
        assert_eq!(
            next_status(k, StepStatus::Running, &transient(), false),
            Some(StepStatus::Failed)
        );
        assert_eq!(
            next_status(k, StepStatus::RetryScheduled, &StepEvent::RetryDue, true),
            Some(StepStatus::Ready)
        );
    }

    #[test]
    fn permanent_failure_settles_step_between_attempts() {
        let exhausted = StepEvent::PermanentFailure {
            reason: "delivery attempts exhausted (4)".into(),
        };
        for from in [StepStatus::RetryScheduled, StepStatus::Ready] {
            assert_eq!(
                next_status(StepKind::Automated, from, &exhausted, true),
                Some(StepStatus::Failed)
            );
            assert_eq!(next_status(StepKind::Manual, from, &exhausted, true), None);
        }
        assert_eq!(
            next_status(StepKind::Automated, StepStatus::Pending, &exhausted, true),
            None
        );
    }

    #[test]
    fn human_steps_wait_for_outcomes() {
        let k = StepKind::Approval;
        assert_eq!(
            next_status(k, StepStatus::Running, &StepEvent::AwaitHuman, true),
            Some(StepStatus::AwaitingHuman)
        );
        let approved = StepEvent::HumanOutcome {
            outcome: TaskOutcome::Approved,
            note: None,
        };
        let rejected = StepEvent::HumanOutcome {
            outcome: TaskOutcome::Rejected,
            note: None,
        };
        assert_eq!(
            next_status(k, StepStatus::AwaitingHuman, &approved, true),
            Some(StepStatus::Completed)
        );
        assert_eq!(
            next_status(k, StepStatus::AwaitingHuman, &rejected, true),
            Some(StepStatus::Failed)
        );
        // Queue results never apply to human steps.
        assert_eq!(
            next_status(
                k,
                StepStatus::Running,
                &StepEvent::Succeeded { result: None },
                true
            ),
            None
        );
    }

    #[test]
    fn skip_only_from_pending_or_ready() {
        let skip = StepEvent::Skip {
            reason: "upstream".into(),
        };
        let k = StepKind::Automated;
        assert_eq!(
            next_status(k, StepStatus::Pending, &skip, true),
            Some(StepStatus::Skipped)
        );
        assert_eq!(
            next_status(k, StepStatus::Ready, &skip, true),
            Some(StepStatus::Skipped)
        );
        assert_eq!(next_status(k, StepStatus::Running, &skip, true), None);
    }

    #[test]
    fn cancel_skips_unstarted_and_fails_live_steps() {
        let cancel = StepEvent::Cancel {
            reason: "rejected by approver".into(),
        };
        let k = StepKind::Automated;
        assert_eq!(
            next_status(k, StepStatus::Pending, &cancel, true),
            Some(StepStatus::Skipped)
        );
        assert_eq!(
            next_status(k, StepStatus::RetryScheduled, &cancel, true),
            Some(StepStatus::Failed)
        );
        assert_eq!(next_status(k, StepStatus::Completed, &cancel, true), None);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for from in [StepStatus::Completed, StepStatus::Skipped, StepStatus::Failed] {
            for event in [
                StepEvent::Dispatched,
                StepEvent::Succeeded { result: None },
                StepEvent::DeadlineExceeded,
                transient(),
            ] {
                assert_eq!(next_status(StepKind::Automated, from, &event, true), None);
            }
        }
    }

    #[test]
    fn deadline_fails_any_live_step() {
        for from in [
            StepStatus::Pending,
            StepStatus::Ready,
            StepStatus::Running,
            StepStatus::RetryScheduled,
            StepStatus::AwaitingHuman,
        ] {
            assert_eq!(
                next_status(StepKind::Manual, from, &StepEvent::DeadlineExceeded, true),
                Some(StepStatus::Failed)
            );
        }
    }

    #[test]
    fn status_display() {
        assert_eq!(StepStatus::RetryScheduled.to_string(), "RETRY_SCHEDULED");
        assert_eq!(StepStatus::AwaitingHuman.to_string(), "AWAITING_HUMAN");
        assert_eq!(WorkflowStatus::AwaitingApproval.to_string(), "AWAITING_APPROVAL");
        assert!(WorkflowStatus::Aborted.is_terminal());
        assert!(!WorkflowStatus::InProgress.is_terminal());
    }
}
