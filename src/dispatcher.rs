//! Execution Dispatcher
//!
//! Turns a claimed execution task into store writes. Each branch re-reads
//! its target, builds a [`Plan`] against that snapshot and commits it as a
//! single atomic batch; nothing is written when any step fails.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{GovernanceError, GovernanceResult};
use crate::execution_queue::{ExecutionTarget, ShutdownSignal};
use crate::funding::{FundingRequest, FundingStatus};
use crate::milestone::{MilestoneStatus, MilestoneVerification};
use crate::notifier::{EventBroadcaster, GovernanceEvent};
use crate::store::{GovernanceStore, StoreOp};
use crate::types::{
    generate_id, Dao, DaoMember, InvestmentAllocation, MemberRole, MembershipOperation,
    ParameterChange, Proposal, ProposalPayload, ProposalStatus, TransactionKind,
    TreasuryTransaction,
};
use crate::voting_power::VotingPowerCalculator;

/// Store writes and the events to emit once they are committed
#[derive(Debug, Default)]
struct Plan {
    ops: Vec<StoreOp>,
    events: Vec<GovernanceEvent>,
}

pub struct ExecutionDispatcher {
    store: Arc<dyn GovernanceStore>,
    calculator: VotingPowerCalculator,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn EventBroadcaster>,
    /// Serializes read-modify-write cycles on proposals, funding requests and milestones
    record_lock: Mutex<()>,
}

impl ExecutionDispatcher {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        calculator: VotingPowerCalculator,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn EventBroadcaster>,
    ) -> Self {
        Self {
            store,
            calculator,
            clock,
            broadcaster,
            record_lock: Mutex::new(()),
        }
    }

    /// Held by workflows while they rewrite a record the dispatcher also writes
    pub(crate) async fn lock_records(&self) -> MutexGuard<'_, ()> {
        self.record_lock.lock().await
    }

    /// Check a target may be queued: the proposal is Passed with a valid
    /// payload, or the payout item is Approved / Verified.
    pub async fn check_ready(&self, target: &ExecutionTarget) -> GovernanceResult<()> {
        match target {
            ExecutionTarget::Proposal(id) => {
                let proposal = self.load_proposal(id).await?;
                if proposal.status != ProposalStatus::Passed {
                    return Err(GovernanceError::StateConflict(format!(
                        "proposal {} is {}, only passed proposals can be executed",
                        id, proposal.status
                    )));
                }
                proposal.payload.validate()?;
                if proposal.payload.proposal_type() != proposal.proposal_type {
                    return Err(GovernanceError::Validation(format!(
                        "proposal {} is {} but carries a {} payload",
                        id,
                        proposal.proposal_type,
                        proposal.payload.proposal_type()
                    )));
                }
                Ok(())
            }
            ExecutionTarget::FundingPayout(id) => {
                let request = self.load_funding(id).await?;
                if request.status != FundingStatus::Approved {
                    return Err(GovernanceError::StateConflict(format!(
                        "funding request {} is {}, only approved requests can be paid",
                        id, request.status
                    )));
                }
                Ok(())
            }
            ExecutionTarget::MilestonePayout(id) => {
                let milestone = self.load_milestone(id).await?;
                if milestone.status != MilestoneStatus::Verified {
                    return Err(GovernanceError::StateConflict(format!(
                        "milestone {} is {}, only verified milestones can be paid",
                        id, milestone.status
                    )));
                }
                Ok(())
            }
        }
    }

    /// Run one execution attempt.
    ///
    /// The target is moved to its executing state first, then its effect is
    /// planned and committed in one batch. If `shutdown` fires before the
    /// commit the attempt returns `Cancelled` without writing the effect.
    pub async fn execute(
        &self,
        target: &ExecutionTarget,
        shutdown: &ShutdownSignal,
    ) -> GovernanceResult<()> {
        let _records = self.record_lock.lock().await;
        let now = self.clock.now();

        let plan = match target {
            ExecutionTarget::Proposal(id) => self.plan_proposal(id, now).await?,
            ExecutionTarget::FundingPayout(id) => self.plan_funding_payout(id, now).await?,
            ExecutionTarget::MilestonePayout(id) => self.plan_milestone_payout(id, now).await?,
        };

        if shutdown.is_triggered() {
            return Err(GovernanceError::Cancelled(format!(
                "shutdown requested before {} was committed",
                target
            )));
        }

        let count = plan.ops.len();
        self.store.commit(plan.ops).await?;
        debug!("Committed {} operations for {}", count, target);

        for event in plan.events {
            self.broadcaster.broadcast(event);
        }
        Ok(())
    }

    /// Operator cancelled a pending task
    pub async fn cancel(&self, target: &ExecutionTarget) -> GovernanceResult<()> {
        let _records = self.record_lock.lock().await;
        let now = self.clock.now();

        match target {
            ExecutionTarget::Proposal(id) => {
                let mut proposal = self.load_proposal(id).await?;
                if matches!(proposal.status, ProposalStatus::Passed | ProposalStatus::Executing) {
                    proposal.transition(ProposalStatus::Cancelled, now);
                    self.store.commit(vec![StoreOp::PutProposal(proposal)]).await?;
                }
                Ok(())
            }
            // Payout items stay approved so they can be queued again
            ExecutionTarget::FundingPayout(_) | ExecutionTarget::MilestonePayout(_) => {
                self.restore_locked(target, now).await.map(|_| ())
            }
        }
    }

    /// Return an interrupted target to its ready state. Returns whether the
    /// target was executing.
    pub async fn restore_ready(&self, target: &ExecutionTarget) -> GovernanceResult<bool> {
        let _records = self.record_lock.lock().await;
        let now = self.clock.now();
        self.restore_locked(target, now).await
    }

    async fn restore_locked(&self, target: &ExecutionTarget, now: DateTime<Utc>) -> GovernanceResult<bool> {
        let op = match target {
            ExecutionTarget::Proposal(id) => {
                let mut proposal = self.load_proposal(id).await?;
                if proposal.status != ProposalStatus::Executing {
                    return Ok(false);
                }
                proposal.transition(ProposalStatus::Passed, now);
                StoreOp::PutProposal(proposal)
            }
            ExecutionTarget::FundingPayout(id) => {
                let mut request = self.load_funding(id).await?;
                if request.status != FundingStatus::Executing {
                    return Ok(false);
                }
                request.transition(FundingStatus::Approved, now);
                StoreOp::PutFundingRequest(request)
            }
            ExecutionTarget::MilestonePayout(id) => {
                let mut milestone = self.load_milestone(id).await?;
                if milestone.status != MilestoneStatus::Executing {
                    return Ok(false);
                }
                milestone.transition(MilestoneStatus::Verified, now);
                StoreOp::PutMilestone(milestone)
            }
        };

        self.store.commit(vec![op]).await?;
        info!("Restored {} to its ready state", target);
        Ok(true)
    }

    /// Record the final failure of a target after its task gave up
    pub async fn mark_failed(&self, target: &ExecutionTarget, error: &str) -> GovernanceResult<()> {
        let _records = self.record_lock.lock().await;
        let now = self.clock.now();

        let (op, event) = match target {
            ExecutionTarget::Proposal(id) => {
                let mut proposal = self.load_proposal(id).await?;
                if !matches!(proposal.status, ProposalStatus::Passed | ProposalStatus::Executing) {
                    warn!("Not marking proposal {} failed, it is already {}", id, proposal.status);
                    return Ok(());
                }
                proposal.transition(ProposalStatus::Failed, now);
                proposal.failure_reason = Some(error.to_string());
                let event = GovernanceEvent::ProposalExecutionFailed {
                    proposal_id: proposal.id.clone(),
                    dao_id: proposal.dao_id.clone(),
                    error: error.to_string(),
                };
                (StoreOp::PutProposal(proposal), event)
            }
            ExecutionTarget::FundingPayout(id) => {
                let mut request = self.load_funding(id).await?;
                if !matches!(request.status, FundingStatus::Approved | FundingStatus::Executing) {
                    warn!("Not marking funding request {} failed, it is already {}", id, request.status);
                    return Ok(());
                }
                request.transition(FundingStatus::Failed, now);
                request.failure_reason = Some(error.to_string());
                let event = GovernanceEvent::PayoutFailed {
                    target: target.to_string(),
                    error: error.to_string(),
                };
                (StoreOp::PutFundingRequest(request), event)
            }
            ExecutionTarget::MilestonePayout(id) => {
                let mut milestone = self.load_milestone(id).await?;
                if !matches!(milestone.status, MilestoneStatus::Verified | MilestoneStatus::Executing) {
                    warn!("Not marking milestone {} failed, it is already {}", id, milestone.status);
                    return Ok(());
                }
                milestone.transition(MilestoneStatus::Failed, now);
                milestone.failure_reason = Some(error.to_string());
                let event = GovernanceEvent::PayoutFailed {
                    target: target.to_string(),
                    error: error.to_string(),
                };
                (StoreOp::PutMilestone(milestone), event)
            }
        };

        self.store.commit(vec![op]).await?;
        self.broadcaster.broadcast(event);
        Ok(())
    }

    // =========================================================================
    // Planning
    // =========================================================================

    async fn plan_proposal(&self, id: &str, now: DateTime<Utc>) -> GovernanceResult<Plan> {
        let mut proposal = self.load_proposal(id).await?;
        match proposal.status {
            ProposalStatus::Passed => {
                proposal.transition(ProposalStatus::Executing, now);
                self.store
                    .commit(vec![StoreOp::PutProposal(proposal.clone())])
                    .await?;
            }
            // Retry of an earlier attempt
            ProposalStatus::Executing => {}
            other => {
                return Err(GovernanceError::StateConflict(format!(
                    "proposal {} is {} and cannot be executed",
                    id, other
                )));
            }
        }

        let dao = self.load_dao(&proposal.dao_id).await?;

        let mut plan = match &proposal.payload {
            ProposalPayload::TreasuryTransfer { recipient, amount, .. } => Plan {
                ops: debit_treasury(
                    &dao,
                    *amount,
                    TransactionKind::Transfer,
                    recipient,
                    &proposal.id,
                    now,
                )?,
                events: Vec::new(),
            },
            ProposalPayload::Investment {
                target,
                amount,
                expected_apy_bps,
            } => {
                let mut ops = debit_treasury(
                    &dao,
                    *amount,
                    TransactionKind::Investment,
                    target,
                    &proposal.id,
                    now,
                )?;
                ops.push(StoreOp::RecordInvestment(InvestmentAllocation {
                    id: generate_id("inv"),
                    dao_id: dao.id.clone(),
                    proposal_id: proposal.id.clone(),
                    target: target.clone(),
                    amount: *amount,
                    expected_apy_bps: *expected_apy_bps,
                    created_at: now,
                }));
                Plan {
                    ops,
                    events: Vec::new(),
                }
            }
            ProposalPayload::ParameterChange { changes } => plan_parameter_change(&dao, changes)?,
            ProposalPayload::MembershipChange { operations } => {
                self.plan_membership(&dao, operations, now).await?
            }
        };

        proposal.transition(ProposalStatus::Executed, now);
        proposal.executed_at = Some(now);
        proposal.failure_reason = None;

        plan.events.push(GovernanceEvent::ProposalExecuted {
            proposal_id: proposal.id.clone(),
            dao_id: proposal.dao_id.clone(),
        });
        plan.ops.push(StoreOp::PutProposal(proposal));

        Ok(plan)
    }

    /// Apply membership operations in order on a snapshot of the roster.
    /// Any invalid step rejects the whole change.
    async fn plan_membership(
        &self,
        dao: &Dao,
        operations: &[MembershipOperation],
        now: DateTime<Utc>,
    ) -> GovernanceResult<Plan> {
        let mut roster: HashMap<String, DaoMember> = self
            .store
            .members(&dao.id)
            .await?
            .into_iter()
            .map(|m| (m.user_id.clone(), m))
            .collect();
        let mut touched = Vec::with_capacity(operations.len());

        for operation in operations {
            match operation {
                MembershipOperation::Add {
                    user_id,
                    role,
                    contribution_score,
                } => {
                    if roster.contains_key(user_id) {
                        return Err(GovernanceError::Validation(format!(
                            "{} is already a member of {}",
                            user_id, dao.id
                        )));
                    }
                    let member = DaoMember {
                        user_id: user_id.clone(),
                        dao_id: dao.id.clone(),
                        role: *role,
                        voting_power: self.calculator.calculate(*role, *contribution_score),
                        contribution_score: *contribution_score,
                        joined_at: now,
                        updated_at: now,
                    };
                    roster.insert(user_id.clone(), member);
                }
                MembershipOperation::Remove { user_id } => {
                    if roster.remove(user_id).is_none() {
                        return Err(GovernanceError::Validation(format!(
                            "{} is not a member of {}",
                            user_id, dao.id
                        )));
                    }
                }
                MembershipOperation::ChangeRole { user_id, role } => {
                    let member = roster.get_mut(user_id).ok_or_else(|| {
                        GovernanceError::Validation(format!("{} is not a member of {}", user_id, dao.id))
                    })?;
                    member.role = *role;
                    member.updated_at = now;
                    self.calculator.recompute(member);
                }
            }
            touched.push(operation.user_id().to_string());
        }

        if !roster.values().any(|m| m.role == MemberRole::Admin) {
            return Err(GovernanceError::Validation(format!(
                "membership change would leave {} without an admin",
                dao.id
            )));
        }

        let mut plan = Plan::default();
        for user_id in touched {
            match roster.get(&user_id) {
                Some(member) => {
                    plan.events.push(GovernanceEvent::MemberUpdated {
                        dao_id: dao.id.clone(),
                        user_id: user_id.clone(),
                        voting_power: member.voting_power,
                    });
                    plan.ops.push(StoreOp::PutMember(member.clone()));
                }
                None => {
                    plan.events.push(GovernanceEvent::MemberUpdated {
                        dao_id: dao.id.clone(),
                        user_id: user_id.clone(),
                        voting_power: 0,
                    });
                    plan.ops.push(StoreOp::RemoveMember {
                        dao_id: dao.id.clone(),
                        user_id,
                    });
                }
            }
        }
        Ok(plan)
    }

    async fn plan_funding_payout(&self, id: &str, now: DateTime<Utc>) -> GovernanceResult<Plan> {
        let mut request = self.load_funding(id).await?;
        match request.status {
            FundingStatus::Approved => {
                request.transition(FundingStatus::Executing, now);
                self.store
                    .commit(vec![StoreOp::PutFundingRequest(request.clone())])
                    .await?;
            }
            FundingStatus::Executing => {}
            other => {
                return Err(GovernanceError::StateConflict(format!(
                    "funding request {} is {} and cannot be paid",
                    id, other
                )));
            }
        }

        let dao = self.load_dao(&request.dao_id).await?;
        let mut ops = debit_treasury(
            &dao,
            request.amount,
            TransactionKind::FundingPayout,
            &request.recipient,
            &request.id,
            now,
        )?;

        request.transition(FundingStatus::Executed, now);
        request.executed_at = Some(now);
        request.failure_reason = None;

        let event = GovernanceEvent::FundingPaid {
            request_id: request.id.clone(),
            dao_id: request.dao_id.clone(),
            amount: request.amount,
        };
        ops.push(StoreOp::PutFundingRequest(request));

        Ok(Plan {
            ops,
            events: vec![event],
        })
    }

    async fn plan_milestone_payout(&self, id: &str, now: DateTime<Utc>) -> GovernanceResult<Plan> {
        let mut milestone = self.load_milestone(id).await?;
        match milestone.status {
            MilestoneStatus::Verified => {
                milestone.transition(MilestoneStatus::Executing, now);
                self.store
                    .commit(vec![StoreOp::PutMilestone(milestone.clone())])
                    .await?;
            }
            MilestoneStatus::Executing => {}
            other => {
                return Err(GovernanceError::StateConflict(format!(
                    "milestone {} is {} and cannot be paid",
                    id, other
                )));
            }
        }

        let dao = self.load_dao(&milestone.dao_id).await?;
        let mut ops = debit_treasury(
            &dao,
            milestone.payout_amount,
            TransactionKind::MilestonePayout,
            &milestone.recipient,
            &milestone.id,
            now,
        )?;

        milestone.transition(MilestoneStatus::PaymentProcessed, now);
        milestone.paid_at = Some(now);
        milestone.failure_reason = None;

        let event = GovernanceEvent::MilestonePaid {
            milestone_id: milestone.id.clone(),
            dao_id: milestone.dao_id.clone(),
            payout_amount: milestone.payout_amount,
        };
        ops.push(StoreOp::PutMilestone(milestone));

        Ok(Plan {
            ops,
            events: vec![event],
        })
    }

    // =========================================================================
    // Loading
    // =========================================================================

    async fn load_dao(&self, dao_id: &str) -> GovernanceResult<Dao> {
        self.store
            .dao(dao_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("DAO", dao_id))
    }

    async fn load_proposal(&self, id: &str) -> GovernanceResult<Proposal> {
        self.store
            .proposal(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("Proposal", id))
    }

    async fn load_funding(&self, id: &str) -> GovernanceResult<FundingRequest> {
        self.store
            .funding_request(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("Funding request", id))
    }

    async fn load_milestone(&self, id: &str) -> GovernanceResult<MilestoneVerification> {
        self.store
            .milestone(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("Milestone", id))
    }
}

/// Debit plus ledger entry. Fails early when the snapshot balance is short.
fn debit_treasury(
    dao: &Dao,
    amount: u64,
    kind: TransactionKind,
    counterparty: &str,
    reference: &str,
    now: DateTime<Utc>,
) -> GovernanceResult<Vec<StoreOp>> {
    let balance_after = dao
        .treasury_balance
        .checked_sub(amount)
        .ok_or(GovernanceError::InsufficientTreasury {
            need: amount,
            have: dao.treasury_balance,
        })?;

    Ok(vec![
        StoreOp::DebitTreasury {
            dao_id: dao.id.clone(),
            amount,
        },
        StoreOp::RecordTransaction(TreasuryTransaction {
            id: generate_id("tx"),
            dao_id: dao.id.clone(),
            kind,
            amount,
            counterparty: counterparty.to_string(),
            reference: reference.to_string(),
            balance_after,
            created_at: now,
        }),
    ])
}

fn plan_parameter_change(dao: &Dao, changes: &[ParameterChange]) -> GovernanceResult<Plan> {
    let mut parameters = dao.parameters.clone();
    for change in changes {
        parameters.apply(change);
    }
    parameters.validate()?;

    Ok(Plan {
        ops: vec![StoreOp::UpdateDaoParameters {
            dao_id: dao.id.clone(),
            parameters,
        }],
        events: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DaoParameters;

    #[test]
    fn test_debit_treasury_checks_balance() {
        let mut dao = Dao::new("Hivemapper Ops", DaoParameters::default(), Utc::now());
        dao.treasury_balance = 1000;

        let ops = debit_treasury(&dao, 400, TransactionKind::Transfer, "0xabc", "prop_1", Utc::now())
            .unwrap();
        assert_eq!(ops.len(), 2);
        match &ops[1] {
            StoreOp::RecordTransaction(tx) => assert_eq!(tx.balance_after, 600),
            other => panic!("unexpected op {}", other.name()),
        }

        assert_eq!(
            debit_treasury(&dao, 2000, TransactionKind::Transfer, "0xabc", "prop_1", Utc::now()),
            Err(GovernanceError::InsufficientTreasury { need: 2000, have: 1000 })
        );
    }

    #[test]
    fn test_parameter_change_validates_result() {
        let dao = Dao::new("Render Guild", DaoParameters::default(), Utc::now());

        let plan = plan_parameter_change(&dao, &[ParameterChange::QuorumPercentage(35)]).unwrap();
        match &plan.ops[0] {
            StoreOp::UpdateDaoParameters { parameters, .. } => {
                assert_eq!(parameters.quorum_percentage, 35);
                assert_eq!(parameters.approval_threshold, 51);
            }
            other => panic!("unexpected op {}", other.name()),
        }

        assert!(plan_parameter_change(&dao, &[ParameterChange::QuorumPercentage(0)]).is_err());
    }
}
