use thiserror::Error;
use uuid::Uuid;

use crate::workflow::WorkflowStatus;

#[derive(Debug, Error)]
pub enum RemediatorError {
    #[error("Invalid violation signal: {0}")]
    Validation(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow {id} is already terminal ({status})")]
    WorkflowTerminal { id: String, status: WorkflowStatus },

    #[error("Human task not found: {0}")]
    TaskNotFound(String),

    #[error("Human task {id} was already resolved as {outcome}")]
    TaskResolved { id: String, outcome: String },

    #[error("Step graph of workflow {0} contains a dependency cycle")]
    CyclicGraph(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors reported by the queueing substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The substrate cannot accept or hand out messages right now.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The receipt does not match an active lease (already acked, or re-leased elsewhere).
    #[error("unknown lease receipt {0}")]
    UnknownReceipt(Uuid),
}

/// Classifies a step failure for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Recoverable condition (timeout, unavailable dependency). Retried with backoff.
    Transient(String),
    /// The action cannot succeed. No retry; escalates.
    Permanent(String),
}

impl FailureKind {
    pub fn reason(&self) -> &str {
        match self {
            FailureKind::Transient(msg) | FailureKind::Permanent(msg) => msg,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient(msg) => write!(f, "Transient failure: {msg}"),
            FailureKind::Permanent(msg) => write!(f, "Permanent failure: {msg}"),
        }
    }
}
