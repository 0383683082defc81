//! Proposal Execution Queue
//!
//! Holds one task per execution target (a passed proposal, or the payout of
//! an approved funding request / verified milestone). Tasks become due a
//! fixed delay after enqueue and are drained by a single worker, one at a
//! time, in scheduled order.
//!
//! ## Task lifecycle
//!
//! ```text
//! Pending ──claim──> Executing ──ok──> Completed
//!    ^                   │
//!    └──retry (n < max)──┤──error (n == max)──> Failed
//!                        └──shutdown before commit──> Cancelled
//! Pending ──cancel──> Cancelled
//! ```
//!
//! Claiming and cancelling both run under the queue lock, so a cancel either
//! lands before the dispatcher sees the task or is rejected. Settling a task
//! also syncs its target under that lock: a target is only left in its
//! executing state while its task is active.
//!
//! Tasks live in memory. On shutdown every active task is released and its
//! target returned to the ready state; after a crash the sweeper calls
//! [`ExecutionQueue::recover`] for targets that have no task.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::dispatcher::ExecutionDispatcher;
use crate::error::{GovernanceError, GovernanceResult};
use crate::notifier::{EventBroadcaster, GovernanceEvent};

/// What an execution task acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ExecutionTarget {
    Proposal(String),
    FundingPayout(String),
    MilestonePayout(String),
}

impl ExecutionTarget {
    pub fn id(&self) -> &str {
        match self {
            ExecutionTarget::Proposal(id)
            | ExecutionTarget::FundingPayout(id)
            | ExecutionTarget::MilestonePayout(id) => id,
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTarget::Proposal(id) => write!(f, "proposal:{}", id),
            ExecutionTarget::FundingPayout(id) => write!(f, "funding_payout:{}", id),
            ExecutionTarget::MilestonePayout(id) => write!(f, "milestone_payout:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub target: ExecutionTarget,
    pub status: TaskStatus,
    pub enqueued_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Enqueue order, breaks ties between tasks due at the same instant
    pub sequence: u64,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Another drain was already running
    pub skipped: bool,
    pub processed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Result of [`ExecutionQueue::recover`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// The target was stuck executing and went back to its ready state
    pub restored: bool,
    /// Task queued for the target, if asked to
    pub task: Option<ExecutionTask>,
}

/// Read side of the engine's shutdown channel
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create a signal and the sender that triggers it
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. Pends forever if the sender is gone.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct QueueState {
    active: HashMap<ExecutionTarget, ExecutionTask>,
    /// Most recent terminal tasks; the oldest are evicted first
    finished: LruCache<ExecutionTarget, ExecutionTask>,
    /// Cancelled by an operator; only an explicit enqueue queues them again
    held: HashSet<ExecutionTarget>,
    next_sequence: u64,
}

enum Settlement {
    Done,
    Cancelled(String),
    Failed(String),
}

const SHUTDOWN_REASON: &str = "engine shut down";

pub struct ExecutionQueue {
    config: QueueConfig,
    dispatcher: Arc<ExecutionDispatcher>,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn EventBroadcaster>,
    state: Mutex<QueueState>,
    /// Held for the whole drain; `try_lock` keeps drains from overlapping
    drain_lock: Mutex<()>,
    shutdown: ShutdownSignal,
}

impl ExecutionQueue {
    pub fn new(
        config: QueueConfig,
        dispatcher: Arc<ExecutionDispatcher>,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn EventBroadcaster>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_terminal_tasks.max(1)).unwrap_or(NonZeroUsize::MIN);

        info!(
            "Creating execution queue (delay: {}s, retry delay: {}s, max retries: {}, retained: {})",
            config.execution_delay_secs,
            config.retry_delay_secs,
            config.max_retries,
            capacity
        );

        Self {
            config,
            dispatcher,
            clock,
            broadcaster,
            state: Mutex::new(QueueState {
                active: HashMap::new(),
                finished: LruCache::new(capacity),
                held: HashSet::new(),
                next_sequence: 0,
            }),
            drain_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Queue a passed proposal for execution
    pub async fn enqueue(&self, proposal_id: &str) -> GovernanceResult<ExecutionTask> {
        self.enqueue_target(ExecutionTarget::Proposal(proposal_id.to_string()))
            .await
    }

    /// Queue any execution target. Re-enqueuing an active target is a no-op
    /// that returns the existing task.
    pub async fn enqueue_target(&self, target: ExecutionTarget) -> GovernanceResult<ExecutionTask> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.active.get(&target) {
            debug!("{} already queued ({:?}), ignoring enqueue", target, existing.status);
            return Ok(existing.clone());
        }

        self.dispatcher.check_ready(&target).await?;
        state.held.remove(&target);
        Ok(self.insert_task(&mut state, target))
    }

    fn insert_task(&self, state: &mut QueueState, target: ExecutionTarget) -> ExecutionTask {
        let now = self.clock.now();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let task = ExecutionTask {
            target: target.clone(),
            status: TaskStatus::Pending,
            enqueued_at: now,
            scheduled_at: now + secs(self.config.execution_delay_secs),
            started_at: None,
            finished_at: None,
            retry_count: 0,
            max_retries: self.config.max_retries,
            last_error: None,
            sequence,
        };

        // A fresh enqueue supersedes any finished record for the same target
        state.finished.pop(&target);
        state.active.insert(target.clone(), task.clone());

        info!("Enqueued {} (due at {})", target, task.scheduled_at);
        task
    }

    /// Pick up a target that has no task, e.g. after a restart or a failed
    /// enqueue. A target left executing goes back to its ready state; with
    /// `enqueue` set a ready target is then queued unless an operator
    /// cancelled it. Targets with an active task are left alone.
    pub async fn recover(&self, target: ExecutionTarget, enqueue: bool) -> GovernanceResult<Recovery> {
        let mut state = self.state.lock().await;
        if state.active.contains_key(&target) {
            return Ok(Recovery::default());
        }

        let restored = self.dispatcher.restore_ready(&target).await?;
        if restored {
            warn!("Recovered {} from an interrupted execution", target);
        }

        let task = if enqueue && !state.held.contains(&target) {
            self.dispatcher.check_ready(&target).await?;
            Some(self.insert_task(&mut state, target))
        } else {
            None
        };

        Ok(Recovery { restored, task })
    }

    /// Drop every active task once shutdown has fired and return its target
    /// to the ready state. Waits for a drain in flight. Returns how many
    /// tasks were released.
    pub async fn release_on_shutdown(&self) -> usize {
        let _drain = self.drain_lock.lock().await;
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let mut tasks: Vec<ExecutionTask> = state.active.drain().map(|(_, task)| task).collect();
        tasks.sort_by_key(|t| t.sequence);
        let released = tasks.len();

        for mut task in tasks {
            if let Err(e) = self.dispatcher.restore_ready(&task.target).await {
                error!("Failed to restore {} on shutdown: {}", task.target, e);
            }
            task.status = TaskStatus::Cancelled;
            task.finished_at = Some(now);
            task.last_error = Some(SHUTDOWN_REASON.to_string());

            self.broadcaster.broadcast(GovernanceEvent::ExecutionCancelled {
                target: task.target.to_string(),
                reason: SHUTDOWN_REASON.to_string(),
            });
            state.finished.put(task.target.clone(), task);
        }

        if released > 0 {
            info!("Released {} queued executions on shutdown", released);
        }
        released
    }

    /// Cancel the pending execution of a proposal
    pub async fn cancel(&self, proposal_id: &str) -> GovernanceResult<ExecutionTask> {
        self.cancel_target(&ExecutionTarget::Proposal(proposal_id.to_string()))
            .await
    }

    /// Cancel a pending task. Executing or finished tasks are left alone.
    pub async fn cancel_target(&self, target: &ExecutionTarget) -> GovernanceResult<ExecutionTask> {
        let mut state = self.state.lock().await;

        let status = match state.active.get(target) {
            Some(task) => task.status,
            None => {
                return match state.finished.peek(target) {
                    Some(task) => Err(GovernanceError::StateConflict(format!(
                        "{} already finished as {:?}",
                        target, task.status
                    ))),
                    None => Err(GovernanceError::not_found("Execution task", target.to_string())),
                };
            }
        };

        if status != TaskStatus::Pending {
            return Err(GovernanceError::StateConflict(format!(
                "{} is already executing and cannot be cancelled",
                target
            )));
        }

        // Update the target before dropping the task so a store failure leaves both intact
        self.dispatcher.cancel(target).await?;

        let mut task = match state.active.remove(target) {
            Some(task) => task,
            None => return Err(GovernanceError::not_found("Execution task", target.to_string())),
        };
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(self.clock.now());
        state.finished.put(target.clone(), task.clone());
        state.held.insert(target.clone());
        drop(state);

        info!("Cancelled pending execution of {}", target);
        self.broadcaster.broadcast(GovernanceEvent::ExecutionCancelled {
            target: target.to_string(),
            reason: "cancelled by operator".to_string(),
        });

        Ok(task)
    }

    /// Snapshot of all tracked tasks in enqueue order
    pub async fn status(&self) -> Vec<ExecutionTask> {
        let state = self.state.lock().await;
        let mut tasks: Vec<ExecutionTask> = state
            .active
            .values()
            .cloned()
            .chain(state.finished.iter().map(|(_, t)| t.clone()))
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Latest task for a target, active or finished
    pub async fn task(&self, target: &ExecutionTarget) -> Option<ExecutionTask> {
        let state = self.state.lock().await;
        state
            .active
            .get(target)
            .or_else(|| state.finished.peek(target))
            .cloned()
    }

    pub async fn pending_count(&self) -> usize {
        let state = self.state.lock().await;
        state
            .active
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Execute every task that is due, one at a time
    pub async fn process_due(&self) -> DrainReport {
        let _drain = match self.drain_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Queue drain already in progress, skipping");
                return DrainReport {
                    skipped: true,
                    ..Default::default()
                };
            }
        };

        let mut report = DrainReport::default();

        while let Some(task) = self.claim_next_due().await {
            report.processed += 1;
            debug!(
                "Dispatching {} (attempt {} of {})",
                task.target,
                task.retry_count + 1,
                task.max_retries + 1
            );

            let result = self.dispatcher.execute(&task.target, &self.shutdown).await;
            self.settle(&task.target, result, &mut report).await;
        }

        if report.processed > 0 {
            info!(
                "Queue drain finished: {} processed, {} completed, {} retried, {} failed, {} cancelled",
                report.processed, report.completed, report.retried, report.failed, report.cancelled
            );
        }

        report
    }

    /// Mark the earliest due pending task as executing and hand it out
    async fn claim_next_due(&self) -> Option<ExecutionTask> {
        if self.shutdown.is_triggered() {
            return None;
        }

        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let target = state
            .active
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.scheduled_at <= now)
            .min_by(|a, b| {
                a.scheduled_at
                    .cmp(&b.scheduled_at)
                    .then_with(|| a.sequence.cmp(&b.sequence))
            })
            .map(|t| t.target.clone())?;

        let task = state.active.get_mut(&target)?;
        task.status = TaskStatus::Executing;
        task.started_at = Some(now);
        Some(task.clone())
    }

    /// Record the result of a dispatch on the task, then sync the target
    async fn settle(
        &self,
        target: &ExecutionTarget,
        result: GovernanceResult<()>,
        report: &mut DrainReport,
    ) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let settlement = {
            let mut task = match state.active.remove(target) {
                Some(task) => task,
                None => {
                    warn!("Settled {} but it was no longer tracked", target);
                    return;
                }
            };

            match result {
                Ok(()) => {
                    task.status = TaskStatus::Completed;
                    task.finished_at = Some(now);
                    report.completed += 1;
                    info!("Execution of {} completed", target);
                    state.finished.put(target.clone(), task);
                    Settlement::Done
                }
                Err(GovernanceError::Cancelled(reason)) => {
                    task.status = TaskStatus::Cancelled;
                    task.finished_at = Some(now);
                    task.last_error = Some(reason.clone());
                    report.cancelled += 1;
                    warn!("Execution of {} cancelled: {}", target, reason);
                    state.finished.put(target.clone(), task);
                    Settlement::Cancelled(reason)
                }
                Err(e) if e.is_retryable() && task.retry_count < task.max_retries => {
                    task.retry_count += 1;
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                    task.last_error = Some(e.to_string());
                    task.scheduled_at = now + secs(self.config.retry_delay_secs);
                    report.retried += 1;
                    warn!(
                        "Execution of {} failed (retry {}/{} at {}): {}",
                        target, task.retry_count, task.max_retries, task.scheduled_at, e
                    );
                    state.active.insert(target.clone(), task);
                    Settlement::Done
                }
                Err(e) => {
                    let message = e.to_string();
                    task.status = TaskStatus::Failed;
                    task.finished_at = Some(now);
                    task.last_error = Some(message.clone());
                    report.failed += 1;
                    error!(
                        "Execution of {} failed permanently after {} retries: {}",
                        target, task.retry_count, message
                    );
                    state.finished.put(target.clone(), task);
                    Settlement::Failed(message)
                }
            }
        };

        // Still under the queue lock, so `recover` never sees an executing
        // target without its task
        match settlement {
            Settlement::Done => {}
            Settlement::Cancelled(reason) => {
                if let Err(e) = self.dispatcher.restore_ready(target).await {
                    error!("Failed to restore {} after cancellation: {}", target, e);
                }
                self.broadcaster.broadcast(GovernanceEvent::ExecutionCancelled {
                    target: target.to_string(),
                    reason,
                });
            }
            Settlement::Failed(message) => {
                if let Err(e) = self.dispatcher.mark_failed(target, &message).await {
                    error!("Failed to record failure of {}: {}", target, e);
                }
            }
        }
    }

    /// Spawn the background driver that drains due tasks until shutdown
    pub fn spawn_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        info!("Starting execution queue driver (interval: {:?})", poll_interval);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.triggered() => {
                        info!("Execution queue driver stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        queue.process_due().await;
                    }
                }
            }
        })
    }
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_display() {
        assert_eq!(
            ExecutionTarget::Proposal("prop_1".to_string()).to_string(),
            "proposal:prop_1"
        );
        assert_eq!(
            ExecutionTarget::MilestonePayout("ms_9".to_string()).id(),
            "ms_9"
        );
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (tx, mut signal) = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        tx.send(true).unwrap();
        signal.triggered().await;
        assert!(signal.is_triggered());

        assert!(!ShutdownSignal::never().is_triggered());
    }
}
