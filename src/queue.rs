//! Lease-based, at-least-once delivery of automated steps.
//!
//! A leased message is invisible to other consumers until it is acked,
//! released, dead-lettered, or its lease expires. An expired lease makes the
//! message deliverable again with a fresh receipt, so at most one execution
//! attempt per step holds a valid lease at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{FailureKind, QueueError};
use crate::executor::{StepContext, StepExecutor, StepOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: Uuid,
    pub workflow_id: String,
    pub step_id: String,
    /// Number of times the message has been leased.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: Instant,
    pub lease_expires_at: Option<Instant>,
}

/// A time-bounded claim on one message.
#[derive(Debug, Clone)]
pub struct Lease {
    pub receipt: Uuid,
    pub message: QueueMessage,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message: QueueMessage,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The queueing substrate: enqueue, lease, ack, release with delay, dead-letter.
pub trait QueueBackend: Send + Sync {
    fn enqueue(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> impl Future<Output = Result<Uuid, QueueError>> + Send;

    /// Leases the oldest visible message, or `None` if nothing is deliverable.
    fn lease(
        &self,
        visibility: Duration,
    ) -> impl Future<Output = Result<Option<Lease>, QueueError>> + Send;

    fn ack(&self, receipt: Uuid) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Gives the lease back; the message becomes visible again after `delay`.
    fn release(
        &self,
        receipt: Uuid,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn dead_letter(
        &self,
        receipt: Uuid,
        reason: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;
}

#[derive(Debug)]
struct Stored {
    message: QueueMessage,
    receipt: Option<Uuid>,
}

#[derive(Debug)]
struct QueueState {
    messages: Vec<Stored>,
    dead: Vec<DeadLetter>,
    available: bool,
}

/// In-memory [`QueueBackend`].
#[derive(Debug)]
pub struct LeaseQueue {
    state: Mutex<QueueState>,
}

impl Default for LeaseQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: Vec::new(),
                dead: Vec::new(),
                available: true,
            }),
        }
    }

    /// Simulates an outage: every operation fails with `Unavailable` while off.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }
}

fn check(state: &QueueState) -> Result<(), QueueError> {
    if state.available {
        Ok(())
    } else {
        Err(QueueError::Unavailable("in-memory queue switched off".into()))
    }
}

fn position(state: &QueueState, receipt: Uuid) -> Result<usize, QueueError> {
    state
        .messages
        .iter()
        .position(|s| s.receipt == Some(receipt))
        .ok_or(QueueError::UnknownReceipt(receipt))
}

impl QueueBackend for LeaseQueue {
    async fn enqueue(&self, workflow_id: &str, step_id: &str) -> Result<Uuid, QueueError> {
        let mut state = self.state.lock().await;
        check(&state)?;
        let message = QueueMessage {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            attempts: 0,
            enqueued_at: Utc::now(),
            visible_at: Instant::now(),
            lease_expires_at: None,
        };
        let id = message.id;
        debug!(workflow_id, step_id, message_id = %id, "enqueued");
        state.messages.push(Stored {
            message,
            receipt: None,
        });
        Ok(id)
    }

    async fn lease(&self, visibility: Duration) -> Result<Option<Lease>, QueueError> {
        let mut state = self.state.lock().await;
        check(&state)?;
        let now = Instant::now();

        let deliverable = state.messages.iter_mut().find(|s| {
            s.message.visible_at <= now
                && s.message.lease_expires_at.map(|t| t <= now).unwrap_or(true)
        });
        let Some(stored) = deliverable else {
            return Ok(None);
        };

        if stored.receipt.is_some() {
            warn!(
                message_id = %stored.message.id,
                step_id = %stored.message.step_id,
                "lease expired, redelivering"
            );
        }
        let receipt = Uuid::new_v4();
        let expires_at = now + visibility;
        stored.receipt = Some(receipt);
        stored.message.attempts += 1;
        stored.message.lease_expires_at = Some(expires_at);

        Ok(Some(Lease {
            receipt,
            message: stored.message.clone(),
            expires_at,
        }))
    }

    async fn ack(&self, receipt: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        check(&state)?;
        let idx = position(&state, receipt)?;
        state.messages.remove(idx);
        Ok(())
    }

    async fn release(&self, receipt: Uuid, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        check(&state)?;
        let idx = position(&state, receipt)?;
        let stored = &mut state.messages[idx];
        stored.receipt = None;
        stored.message.lease_expires_at = None;
        stored.message.visible_at = Instant::now() + delay;
        Ok(())
    }

    async fn dead_letter(&self, receipt: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        check(&state)?;
        let idx = position(&state, receipt)?;
        let stored = state.messages.remove(idx);
        state.dead.push(DeadLetter {
            message: stored.message,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

/// An accepted delivery: what to run and how long it may take.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub ctx: StepContext,
    pub timeout: Duration,
}

/// What to do with a leased message once its attempt has been reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack,
    Retry(Duration),
    DeadLetter(String),
}

/// The consumer side of the graph runner, applied under the per-workflow lock.
pub trait CompletionSink: Send + Sync {
    /// Claims the step for execution. `None` means the message is stale
    /// (workflow terminal or aborted, step already settled) and is dropped.
    fn begin(&self, message: &QueueMessage) -> impl Future<Output = Option<Delivery>> + Send;

    fn report(
        &self,
        message: &QueueMessage,
        outcome: StepOutcome,
    ) -> impl Future<Output = Disposition> + Send;
}

/// Outcome of one consumption cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    Idle,
    Processed(Disposition),
    Stale,
    /// Delivery attempts ran out before an execution could be reported.
    Exhausted,
    Unavailable(QueueError),
}

pub struct Dispatcher<Q> {
    queue: Arc<Q>,
    visibility: Duration,
    max_attempts: u32,
}

impl<Q: QueueBackend> Dispatcher<Q> {
    pub fn new(queue: Arc<Q>, visibility: Duration, max_attempts: u32) -> Self {
        Self {
            queue,
            visibility,
            max_attempts,
        }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Lease one message, run it, and settle the lease as the sink decides.
    pub async fn process_next<E, S>(&self, executor: &E, sink: &S) -> Poll
    where
        E: StepExecutor,
        S: CompletionSink,
    {
        let lease = match self.queue.lease(self.visibility).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return Poll::Idle,
            Err(e) => return Poll::Unavailable(e),
        };
        let msg = &lease.message;

        if msg.attempts > self.max_attempts {
            let reason = format!("delivery attempts exhausted ({})", msg.attempts - 1);
            warn!(workflow_id = %msg.workflow_id, step_id = %msg.step_id, %reason, "dead-lettering message");
            self.settle(&lease, &Disposition::DeadLetter(reason.clone())).await;
            sink.report(msg, StepOutcome::Failure(FailureKind::Permanent(reason)))
                .await;
            return Poll::Exhausted;
        }

        let Some(delivery) = sink.begin(msg).await else {
            debug!(workflow_id = %msg.workflow_id, step_id = %msg.step_id, "dropping stale message");
            self.settle(&lease, &Disposition::Ack).await;
            return Poll::Stale;
        };

        let outcome = match tokio::time::timeout(delivery.timeout, executor.execute(&delivery.ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => StepOutcome::Failure(FailureKind::Transient(format!(
                "step timed out after {}s",
                delivery.timeout.as_secs()
            ))),
        };

        let disposition = sink.report(msg, outcome).await;
        self.settle(&lease, &disposition).await;
        Poll::Processed(disposition)
    }

    async fn settle(&self, lease: &Lease, disposition: &Disposition) {
        let result = match disposition {
            Disposition::Ack => self.queue.ack(lease.receipt).await,
            Disposition::Retry(delay) => self.queue.release(lease.receipt, *delay).await,
            Disposition::DeadLetter(reason) => self.queue.dead_letter(lease.receipt, reason).await,
        };
        // The lease expires on its own and the message is redelivered.
        if let Err(e) = result {
            error!(
                message_id = %lease.message.id,
                step_id = %lease.message.step_id,
                error = %e,
                "failed to settle lease"
            );
        }
    }

    /// Consumption loop for one worker. Stops when `shutdown` turns true.
    pub async fn run<E, S>(
        &self,
        executor: &E,
        sink: &S,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) where
        E: StepExecutor,
        S: CompletionSink,
    {
        while !*shutdown.borrow() {
            match self.process_next(executor, sink).await {
                Poll::Idle => {}
                Poll::Unavailable(e) => debug!(error = %e, "queue unavailable, backing off"),
                _ => continue,
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}
