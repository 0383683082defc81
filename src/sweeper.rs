//! Deadline sweeper
//!
//! Periodically closes votes whose window has ended, queues newly passed
//! proposals, and expires funding requests and milestones left unreviewed
//! past their deadline.
//!
//! Each pass also recovers execution targets with no queue task: items left
//! executing by a crash go back to their ready state, and ready items are
//! queued when auto execution is on.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::WorkflowConfig;
use crate::error::GovernanceResult;
use crate::execution_queue::{ExecutionQueue, ExecutionTarget, ShutdownSignal};
use crate::funding::{FundingStatus, FundingWorkflow};
use crate::milestone::{MilestoneStatus, MilestoneWorkflow};
use crate::proposals::ProposalService;
use crate::store::GovernanceStore;
use crate::types::{ProposalStatus, RecordFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub finalized: usize,
    /// Targets returned from an interrupted execution
    pub recovered: usize,
    pub enqueued: usize,
    pub expired_funding: usize,
    pub expired_milestones: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct DeadlineSweeper {
    store: Arc<dyn GovernanceStore>,
    proposals: Arc<ProposalService>,
    queue: Arc<ExecutionQueue>,
    funding: Arc<FundingWorkflow>,
    milestones: Arc<MilestoneWorkflow>,
    clock: Arc<dyn Clock>,
    config: WorkflowConfig,
}

impl DeadlineSweeper {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        proposals: Arc<ProposalService>,
        queue: Arc<ExecutionQueue>,
        funding: Arc<FundingWorkflow>,
        milestones: Arc<MilestoneWorkflow>,
        clock: Arc<dyn Clock>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            proposals,
            queue,
            funding,
            milestones,
            clock,
            config,
        }
    }

    /// Run one pass. Failures on individual items are logged and skipped.
    pub async fn sweep(&self) -> GovernanceResult<SweepReport> {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        for proposal in self
            .store
            .proposals(&RecordFilter::status(ProposalStatus::Active))
            .await?
        {
            if proposal.vote_end.map_or(true, |end| end > now) {
                continue;
            }
            match self.proposals.finalize(&proposal.id).await {
                Ok(_) => report.finalized += 1,
                Err(e) => warn!("Failed to finalize {}: {}", proposal.id, e),
            }
        }

        let mut targets = Vec::new();
        for proposal in self
            .store
            .proposals(&RecordFilter::status(ProposalStatus::Executing))
            .await?
        {
            targets.push((ExecutionTarget::Proposal(proposal.id), self.config.auto_enqueue_passed));
        }
        if self.config.auto_enqueue_passed {
            for proposal in self
                .store
                .proposals(&RecordFilter::status(ProposalStatus::Passed))
                .await?
            {
                targets.push((ExecutionTarget::Proposal(proposal.id), true));
            }
        }

        let auto_pay = self.config.auto_execute_payouts;
        for status in [FundingStatus::Executing, FundingStatus::Approved] {
            if status == FundingStatus::Approved && !auto_pay {
                continue;
            }
            for request in self.store.funding_requests(&RecordFilter::status(status)).await? {
                targets.push((ExecutionTarget::FundingPayout(request.id), auto_pay));
            }
        }
        for status in [MilestoneStatus::Executing, MilestoneStatus::Verified] {
            if status == MilestoneStatus::Verified && !auto_pay {
                continue;
            }
            for milestone in self.store.milestones(&RecordFilter::status(status)).await? {
                targets.push((ExecutionTarget::MilestonePayout(milestone.id), auto_pay));
            }
        }

        for (target, enqueue) in targets {
            match self.queue.recover(target.clone(), enqueue).await {
                Ok(recovery) => {
                    if recovery.restored {
                        report.recovered += 1;
                    }
                    if recovery.task.is_some() {
                        report.enqueued += 1;
                    }
                }
                Err(e) => warn!("Failed to recover {}: {}", target, e),
            }
        }

        if self.config.expire_overdue_reviews {
            report.expired_funding = self.funding.expire_overdue().await?.len();
            report.expired_milestones = self.milestones.expire_overdue().await?.len();
        }

        if !report.is_empty() {
            info!(
                "Sweep: {} finalized, {} recovered, {} enqueued, {} funding expired, {} milestones expired",
                report.finalized,
                report.recovered,
                report.enqueued,
                report.expired_funding,
                report.expired_milestones
            );
        }
        Ok(report)
    }

    /// Spawn the periodic sweep loop
    pub fn spawn(self: &Arc<Self>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        info!("Starting deadline sweeper (interval: {:?})", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.triggered() => {
                        info!("Deadline sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        match sweeper.sweep().await {
                            Ok(report) => debug!("Sweep finished: {:?}", report),
                            Err(e) => warn!("Sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
