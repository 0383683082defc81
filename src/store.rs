//! Governance storage seam
//!
//! Reads are keyed by id or by DAO with optional status filters. Writes go
//! through [`GovernanceStore::commit`], which applies a batch of
//! [`StoreOp`]s atomically: either every operation lands or none does.
//! Dispatch branches build their whole effect as one batch, so a failure
//! halfway through a membership change leaves nothing behind.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{GovernanceError, GovernanceResult};
use crate::funding::{FundingRequest, FundingStatus};
use crate::milestone::{MilestoneStatus, MilestoneVerification};
use crate::types::{
    Dao, DaoMember, DaoParameters, InvestmentAllocation, Proposal, ProposalStatus, RecordFilter,
    TreasuryTransaction, Vote,
};

/// A single write inside an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    PutDao(Dao),
    UpdateDaoParameters {
        dao_id: String,
        parameters: DaoParameters,
    },
    /// Fails the batch if the balance is short
    DebitTreasury {
        dao_id: String,
        amount: u64,
    },
    CreditTreasury {
        dao_id: String,
        amount: u64,
    },
    PutMember(DaoMember),
    /// Fails the batch if the member does not exist
    RemoveMember {
        dao_id: String,
        user_id: String,
    },
    PutProposal(Proposal),
    /// Fails the batch if the voter already voted on the proposal
    PutVote(Vote),
    PutFundingRequest(FundingRequest),
    PutMilestone(MilestoneVerification),
    RecordTransaction(TreasuryTransaction),
    RecordInvestment(InvestmentAllocation),
}

impl StoreOp {
    pub fn name(&self) -> &'static str {
        match self {
            StoreOp::PutDao(_) => "put_dao",
            StoreOp::UpdateDaoParameters { .. } => "update_dao_parameters",
            StoreOp::DebitTreasury { .. } => "debit_treasury",
            StoreOp::CreditTreasury { .. } => "credit_treasury",
            StoreOp::PutMember(_) => "put_member",
            StoreOp::RemoveMember { .. } => "remove_member",
            StoreOp::PutProposal(_) => "put_proposal",
            StoreOp::PutVote(_) => "put_vote",
            StoreOp::PutFundingRequest(_) => "put_funding_request",
            StoreOp::PutMilestone(_) => "put_milestone",
            StoreOp::RecordTransaction(_) => "record_transaction",
            StoreOp::RecordInvestment(_) => "record_investment",
        }
    }
}

#[async_trait]
pub trait GovernanceStore: Send + Sync {
    async fn dao(&self, dao_id: &str) -> GovernanceResult<Option<Dao>>;
    async fn daos(&self) -> GovernanceResult<Vec<Dao>>;

    async fn member(&self, dao_id: &str, user_id: &str) -> GovernanceResult<Option<DaoMember>>;
    /// Members of a DAO ordered by join date
    async fn members(&self, dao_id: &str) -> GovernanceResult<Vec<DaoMember>>;

    async fn proposal(&self, proposal_id: &str) -> GovernanceResult<Option<Proposal>>;
    /// Proposals ordered by creation time
    async fn proposals(&self, filter: &RecordFilter<ProposalStatus>) -> GovernanceResult<Vec<Proposal>>;
    async fn votes(&self, proposal_id: &str) -> GovernanceResult<Vec<Vote>>;

    async fn funding_request(&self, request_id: &str) -> GovernanceResult<Option<FundingRequest>>;
    async fn funding_requests(
        &self,
        filter: &RecordFilter<FundingStatus>,
    ) -> GovernanceResult<Vec<FundingRequest>>;

    async fn milestone(&self, milestone_id: &str) -> GovernanceResult<Option<MilestoneVerification>>;
    async fn milestones(
        &self,
        filter: &RecordFilter<MilestoneStatus>,
    ) -> GovernanceResult<Vec<MilestoneVerification>>;

    /// Treasury ledger of a DAO, oldest first
    async fn transactions(&self, dao_id: &str) -> GovernanceResult<Vec<TreasuryTransaction>>;
    async fn investments(&self, dao_id: &str) -> GovernanceResult<Vec<InvestmentAllocation>>;

    /// Apply a batch of writes atomically
    async fn commit(&self, ops: Vec<StoreOp>) -> GovernanceResult<()>;
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    daos: HashMap<String, Dao>,
    members: HashMap<(String, String), DaoMember>,
    proposals: HashMap<String, Proposal>,
    votes: HashMap<(String, String), Vote>,
    funding: HashMap<String, FundingRequest>,
    milestones: HashMap<String, MilestoneVerification>,
    transactions: Vec<TreasuryTransaction>,
    investments: Vec<InvestmentAllocation>,
}

impl MemoryState {
    fn apply(&mut self, op: StoreOp) -> GovernanceResult<()> {
        match op {
            StoreOp::PutDao(dao) => {
                self.daos.insert(dao.id.clone(), dao);
            }
            StoreOp::UpdateDaoParameters { dao_id, parameters } => {
                let dao = self
                    .daos
                    .get_mut(&dao_id)
                    .ok_or_else(|| GovernanceError::not_found("DAO", &dao_id))?;
                dao.parameters = parameters;
            }
            StoreOp::DebitTreasury { dao_id, amount } => {
                let dao = self
                    .daos
                    .get_mut(&dao_id)
                    .ok_or_else(|| GovernanceError::not_found("DAO", &dao_id))?;
                if dao.treasury_balance < amount {
                    return Err(GovernanceError::InsufficientTreasury {
                        need: amount,
                        have: dao.treasury_balance,
                    });
                }
                dao.treasury_balance -= amount;
            }
            StoreOp::CreditTreasury { dao_id, amount } => {
                let dao = self
                    .daos
                    .get_mut(&dao_id)
                    .ok_or_else(|| GovernanceError::not_found("DAO", &dao_id))?;
                dao.treasury_balance = dao.treasury_balance.checked_add(amount).ok_or_else(|| {
                    GovernanceError::Validation("treasury balance overflow".to_string())
                })?;
            }
            StoreOp::PutMember(member) => {
                self.members
                    .insert((member.dao_id.clone(), member.user_id.clone()), member);
            }
            StoreOp::RemoveMember { dao_id, user_id } => {
                if self.members.remove(&(dao_id.clone(), user_id.clone())).is_none() {
                    return Err(GovernanceError::not_found("Member", format!("{}/{}", dao_id, user_id)));
                }
            }
            StoreOp::PutProposal(proposal) => {
                self.proposals.insert(proposal.id.clone(), proposal);
            }
            StoreOp::PutVote(vote) => {
                let key = (vote.proposal_id.clone(), vote.voter.clone());
                if self.votes.contains_key(&key) {
                    return Err(GovernanceError::StateConflict(format!(
                        "{} already voted on {}",
                        vote.voter, vote.proposal_id
                    )));
                }
                self.votes.insert(key, vote);
            }
            StoreOp::PutFundingRequest(request) => {
                self.funding.insert(request.id.clone(), request);
            }
            StoreOp::PutMilestone(milestone) => {
                self.milestones.insert(milestone.id.clone(), milestone);
            }
            StoreOp::RecordTransaction(tx) => self.transactions.push(tx),
            StoreOp::RecordInvestment(allocation) => self.investments.push(allocation),
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
///
/// Commits apply to a copy of the state which replaces the live state only
/// when every operation succeeded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GovernanceStore for MemoryStore {
    async fn dao(&self, dao_id: &str) -> GovernanceResult<Option<Dao>> {
        Ok(self.state.read().await.daos.get(dao_id).cloned())
    }

    async fn daos(&self) -> GovernanceResult<Vec<Dao>> {
        let state = self.state.read().await;
        let mut daos: Vec<Dao> = state.daos.values().cloned().collect();
        daos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(daos)
    }

    async fn member(&self, dao_id: &str, user_id: &str) -> GovernanceResult<Option<DaoMember>> {
        let state = self.state.read().await;
        Ok(state
            .members
            .get(&(dao_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn members(&self, dao_id: &str) -> GovernanceResult<Vec<DaoMember>> {
        let state = self.state.read().await;
        let mut members: Vec<DaoMember> = state
            .members
            .values()
            .filter(|m| m.dao_id == dao_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.user_id.cmp(&b.user_id)));
        Ok(members)
    }

    async fn proposal(&self, proposal_id: &str) -> GovernanceResult<Option<Proposal>> {
        Ok(self.state.read().await.proposals.get(proposal_id).cloned())
    }

    async fn proposals(&self, filter: &RecordFilter<ProposalStatus>) -> GovernanceResult<Vec<Proposal>> {
        let state = self.state.read().await;
        let mut proposals: Vec<Proposal> = state
            .proposals
            .values()
            .filter(|p| filter.matches(&p.dao_id, p.status))
            .cloned()
            .collect();
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(proposals)
    }

    async fn votes(&self, proposal_id: &str) -> GovernanceResult<Vec<Vote>> {
        let state = self.state.read().await;
        let mut votes: Vec<Vote> = state
            .votes
            .values()
            .filter(|v| v.proposal_id == proposal_id)
            .cloned()
            .collect();
        votes.sort_by(|a, b| a.cast_at.cmp(&b.cast_at).then_with(|| a.voter.cmp(&b.voter)));
        Ok(votes)
    }

    async fn funding_request(&self, request_id: &str) -> GovernanceResult<Option<FundingRequest>> {
        Ok(self.state.read().await.funding.get(request_id).cloned())
    }

    async fn funding_requests(
        &self,
        filter: &RecordFilter<FundingStatus>,
    ) -> GovernanceResult<Vec<FundingRequest>> {
        let state = self.state.read().await;
        let mut requests: Vec<FundingRequest> = state
            .funding
            .values()
            .filter(|r| filter.matches(&r.dao_id, r.status))
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn milestone(&self, milestone_id: &str) -> GovernanceResult<Option<MilestoneVerification>> {
        Ok(self.state.read().await.milestones.get(milestone_id).cloned())
    }

    async fn milestones(
        &self,
        filter: &RecordFilter<MilestoneStatus>,
    ) -> GovernanceResult<Vec<MilestoneVerification>> {
        let state = self.state.read().await;
        let mut milestones: Vec<MilestoneVerification> = state
            .milestones
            .values()
            .filter(|m| filter.matches(&m.dao_id, m.status))
            .cloned()
            .collect();
        milestones.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(milestones)
    }

    async fn transactions(&self, dao_id: &str) -> GovernanceResult<Vec<TreasuryTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.dao_id == dao_id)
            .cloned()
            .collect())
    }

    async fn investments(&self, dao_id: &str) -> GovernanceResult<Vec<InvestmentAllocation>> {
        let state = self.state.read().await;
        Ok(state
            .investments
            .iter()
            .filter(|i| i.dao_id == dao_id)
            .cloned()
            .collect())
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> GovernanceResult<()> {
        let mut state = self.state.write().await;
        let mut staged = state.clone();
        let count = ops.len();

        for op in ops {
            let name = op.name();
            staged.apply(op).map_err(|e| {
                debug!("Commit aborted at {}: {}", name, e);
                e
            })?;
        }

        *state = staged;
        debug!("Committed {} store operations", count);
        Ok(())
    }
}
