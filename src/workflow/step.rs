use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::state::StepStatus;
use crate::signal::ActionKind;

/// Closed set of step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Executed by the step-execution collaborator through the queue.
    Automated,
    /// Performed by a person, tracked as a human task.
    Manual,
    /// A person approves, rejects or modifies the remediation.
    Approval,
}

impl StepKind {
    pub fn is_human(self) -> bool {
        self != StepKind::Automated
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Automated => write!(f, "automated"),
            StepKind::Manual => write!(f, "manual"),
            StepKind::Approval => write!(f, "approval"),
        }
    }
}

/// What a step does within its workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum StepRole {
    PreconditionCheck,
    ExecuteAction { index: usize, action: String, kind: ActionKind },
    Verify { index: usize, action: String },
    Approval,
    ManualRemediation,
    /// Manual intervention for a step that failed permanently or expired.
    Escalation { of: String },
}

/// One node of a workflow's step DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    pub role: StepRole,
    pub status: StepStatus,
    /// Ids of steps that must be completed or skipped first.
    pub dependencies: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind, role: StepRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            role,
            status: StepStatus::Pending,
            dependencies: Vec::new(),
            retry_count: 0,
            max_retries: 0,
            timeout_secs: 0,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Total executions so far, including the one in flight.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// The step this one escalates, if it is an escalation step.
    pub fn escalates(&self) -> Option<&str> {
        match &self.role {
            StepRole::Escalation { of } => Some(of),
            _ => None,
        }
    }
}

/// Exponential backoff with a cap and symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based), without jitter.
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exp;
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Applies jitter with `sample` in `[-1, 1]`.
    pub fn jittered(&self, delay: Duration, sample: f64) -> Duration {
        let spread = delay.as_millis() as f64 * self.jitter_ratio * sample.clamp(-1.0, 1.0);
        let millis = (delay.as_millis() as f64 + spread).max(0.0);
        Duration::from_millis(millis.round() as u64)
    }

    /// Randomised delay before retry `attempt`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.jittered(delay, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_step_defaults() {
        let step = WorkflowStep::new("verify-1", "Verify", StepKind::Automated, StepRole::PreconditionCheck)
            .depends_on(["execute-1"])
            .with_retries(3)
            .with_timeout(Duration::from_secs(300));
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.dependencies, vec!["execute-1".to_string()]);
        assert_eq!(step.timeout(), Duration::from_secs(300));
        assert!(step.retries_left());
        assert_eq!(step.attempts(), 1);
        assert!(step.escalates().is_none());
    }

    #[test]
    fn exponential_backoff() {
        let policy = BackoffPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter_ratio: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(5000));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = BackoffPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.1,
        };
        let d = Duration::from_millis(2000);
        assert_eq!(policy.jittered(d, 1.0), Duration::from_millis(2200));
        assert_eq!(policy.jittered(d, -1.0), Duration::from_millis(1800));
        for _ in 0..100 {
            let got = policy.next_delay(2);
            assert!(got >= Duration::from_millis(1800) && got <= Duration::from_millis(2200));
        }
    }

    #[test]
    fn step_role_serializes_tagged() {
        let role = StepRole::Escalation {
            of: "execute-1".into(),
        };
        let json = serde_json::to_value(&role).unwrap();
        assert_eq!(json["role"], "escalation");
        assert_eq!(json["of"], "execute-1");
    }
}
