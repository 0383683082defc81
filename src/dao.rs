//! DAO registry
//!
//! Creates DAOs, manages their member rosters and treasury deposits, and
//! answers voting-power questions (per member, DAO total, leaderboard,
//! quorum status of a proposal).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::dispatcher::ExecutionDispatcher;
use crate::error::{GovernanceError, GovernanceResult};
use crate::notifier::{EventBroadcaster, GovernanceEvent};
use crate::store::{GovernanceStore, StoreOp};
use crate::types::{
    generate_id, require_text, Dao, DaoMember, DaoParameters, InvestmentAllocation, MemberRole,
    TransactionKind, TreasuryTransaction,
};
use crate::voting_power::{evaluate_quorum, rank_members, total_power, QuorumOutcome, RankedMember, VotingPowerCalculator};

/// Initial member of a new DAO
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Founder {
    pub user_id: String,
    pub role: MemberRole,
    #[serde(default)]
    pub contribution_score: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDao {
    pub name: String,
    #[serde(default)]
    pub parameters: DaoParameters,
    /// At least one founder must be an admin
    pub founders: Vec<Founder>,
}

pub struct DaoService {
    store: Arc<dyn GovernanceStore>,
    dispatcher: Arc<ExecutionDispatcher>,
    calculator: VotingPowerCalculator,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn EventBroadcaster>,
}

impl DaoService {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        dispatcher: Arc<ExecutionDispatcher>,
        calculator: VotingPowerCalculator,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn EventBroadcaster>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            calculator,
            clock,
            broadcaster,
        }
    }

    pub fn calculator(&self) -> &VotingPowerCalculator {
        &self.calculator
    }

    pub async fn create_dao(&self, new_dao: NewDao) -> GovernanceResult<Dao> {
        require_text("name", &new_dao.name)?;
        new_dao.parameters.validate()?;

        if !new_dao.founders.iter().any(|f| f.role == MemberRole::Admin) {
            return Err(GovernanceError::Validation(
                "a DAO needs at least one admin founder".to_string(),
            ));
        }

        let now = self.clock.now();
        let dao = Dao::new(new_dao.name, new_dao.parameters, now);

        let mut ops = vec![StoreOp::PutDao(dao.clone())];
        let mut seen = std::collections::HashSet::new();
        for founder in &new_dao.founders {
            require_text("user_id", &founder.user_id)?;
            if !seen.insert(founder.user_id.as_str()) {
                return Err(GovernanceError::Validation(format!(
                    "founder {} listed twice",
                    founder.user_id
                )));
            }
            ops.push(StoreOp::PutMember(self.new_member(
                &dao.id,
                &founder.user_id,
                founder.role,
                founder.contribution_score,
            )));
        }

        self.store.commit(ops).await?;
        info!(
            "Created DAO {} ({}) with {} founders",
            dao.id,
            dao.name,
            new_dao.founders.len()
        );
        Ok(dao)
    }

    pub async fn dao(&self, dao_id: &str) -> GovernanceResult<Dao> {
        self.store
            .dao(dao_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("DAO", dao_id))
    }

    pub async fn daos(&self) -> GovernanceResult<Vec<Dao>> {
        self.store.daos().await
    }

    /// Credit the treasury and record the deposit
    pub async fn deposit(&self, dao_id: &str, from: &str, amount: u64) -> GovernanceResult<TreasuryTransaction> {
        if amount == 0 {
            return Err(GovernanceError::Validation("deposit must be greater than 0".to_string()));
        }

        let _records = self.dispatcher.lock_records().await;
        let dao = self.dao(dao_id).await?;
        let balance_after = dao.treasury_balance.checked_add(amount).ok_or_else(|| {
            GovernanceError::Validation("treasury balance overflow".to_string())
        })?;

        let tx = TreasuryTransaction {
            id: generate_id("tx"),
            dao_id: dao_id.to_string(),
            kind: TransactionKind::Deposit,
            amount,
            counterparty: from.to_string(),
            reference: dao_id.to_string(),
            balance_after,
            created_at: self.clock.now(),
        };

        self.store
            .commit(vec![
                StoreOp::CreditTreasury {
                    dao_id: dao_id.to_string(),
                    amount,
                },
                StoreOp::RecordTransaction(tx.clone()),
            ])
            .await?;

        info!("Deposited {} into {} (balance {})", amount, dao_id, balance_after);
        Ok(tx)
    }

    pub async fn add_member(
        &self,
        dao_id: &str,
        user_id: &str,
        role: MemberRole,
        contribution_score: u64,
    ) -> GovernanceResult<DaoMember> {
        require_text("user_id", user_id)?;

        let _records = self.dispatcher.lock_records().await;
        self.dao(dao_id).await?;
        if self.store.member(dao_id, user_id).await?.is_some() {
            return Err(GovernanceError::StateConflict(format!(
                "{} is already a member of {}",
                user_id, dao_id
            )));
        }

        let member = self.new_member(dao_id, user_id, role, contribution_score);
        self.store
            .commit(vec![StoreOp::PutMember(member.clone())])
            .await?;

        info!("Added {} to {} as {} (power {})", user_id, dao_id, role, member.voting_power);
        self.announce(&member);
        Ok(member)
    }

    pub async fn remove_member(&self, dao_id: &str, user_id: &str) -> GovernanceResult<()> {
        let _records = self.dispatcher.lock_records().await;
        let member = self.require_member(dao_id, user_id).await?;

        if member.role == MemberRole::Admin {
            self.ensure_other_admin(dao_id, user_id).await?;
        }

        self.store
            .commit(vec![StoreOp::RemoveMember {
                dao_id: dao_id.to_string(),
                user_id: user_id.to_string(),
            }])
            .await?;

        info!("Removed {} from {}", user_id, dao_id);
        self.broadcaster.broadcast(GovernanceEvent::MemberUpdated {
            dao_id: dao_id.to_string(),
            user_id: user_id.to_string(),
            voting_power: 0,
        });
        Ok(())
    }

    /// Change a member's role and recompute their voting power
    pub async fn update_role(&self, dao_id: &str, user_id: &str, role: MemberRole) -> GovernanceResult<DaoMember> {
        let _records = self.dispatcher.lock_records().await;
        let mut member = self.require_member(dao_id, user_id).await?;

        if member.role == MemberRole::Admin && role != MemberRole::Admin {
            self.ensure_other_admin(dao_id, user_id).await?;
        }

        member.role = role;
        member.updated_at = self.clock.now();
        self.calculator.recompute(&mut member);

        self.store
            .commit(vec![StoreOp::PutMember(member.clone())])
            .await?;

        info!("{} in {} is now {} (power {})", user_id, dao_id, role, member.voting_power);
        self.announce(&member);
        Ok(member)
    }

    /// Add contribution points and recompute voting power
    pub async fn record_contribution(&self, dao_id: &str, user_id: &str, points: u64) -> GovernanceResult<DaoMember> {
        let _records = self.dispatcher.lock_records().await;
        let mut member = self.require_member(dao_id, user_id).await?;

        member.contribution_score = member.contribution_score.saturating_add(points);
        member.updated_at = self.clock.now();
        let changed = self.calculator.recompute(&mut member);

        self.store
            .commit(vec![StoreOp::PutMember(member.clone())])
            .await?;

        debug!(
            "{} earned {} contribution points in {} (score {}, power {})",
            user_id, points, dao_id, member.contribution_score, member.voting_power
        );
        if changed {
            self.announce(&member);
        }
        Ok(member)
    }

    /// Recompute every member's power from the current weights. Returns how many changed.
    pub async fn recompute_voting_power(&self, dao_id: &str) -> GovernanceResult<usize> {
        let _records = self.dispatcher.lock_records().await;
        self.dao(dao_id).await?;
        let now = self.clock.now();

        let mut changed = Vec::new();
        for mut member in self.store.members(dao_id).await? {
            if self.calculator.recompute(&mut member) {
                member.updated_at = now;
                changed.push(member);
            }
        }

        if !changed.is_empty() {
            self.store
                .commit(changed.iter().cloned().map(StoreOp::PutMember).collect())
                .await?;
            for member in &changed {
                self.announce(member);
            }
        }

        info!("Recomputed voting power in {}: {} members changed", dao_id, changed.len());
        Ok(changed.len())
    }

    pub async fn member(&self, dao_id: &str, user_id: &str) -> GovernanceResult<DaoMember> {
        self.require_member(dao_id, user_id).await
    }

    pub async fn members(&self, dao_id: &str) -> GovernanceResult<Vec<DaoMember>> {
        self.store.members(dao_id).await
    }

    pub async fn member_power(&self, dao_id: &str, user_id: &str) -> GovernanceResult<u64> {
        Ok(self.require_member(dao_id, user_id).await?.voting_power)
    }

    pub async fn total_voting_power(&self, dao_id: &str) -> GovernanceResult<u64> {
        Ok(total_power(&self.store.members(dao_id).await?))
    }

    /// Voting-power leaderboard
    pub async fn ranking(&self, dao_id: &str) -> GovernanceResult<Vec<RankedMember>> {
        self.dao(dao_id).await?;
        Ok(rank_members(self.store.members(dao_id).await?))
    }

    /// Quorum and approval status of a proposal's current tally
    pub async fn quorum_for(&self, proposal_id: &str) -> GovernanceResult<QuorumOutcome> {
        let proposal = self
            .store
            .proposal(proposal_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("Proposal", proposal_id))?;
        let dao = self.dao(&proposal.dao_id).await?;
        let total = self.total_voting_power(&dao.id).await?;

        Ok(evaluate_quorum(
            &proposal.tally,
            total,
            dao.parameters.quorum_percentage,
            dao.parameters.approval_threshold,
        ))
    }

    pub async fn transactions(&self, dao_id: &str) -> GovernanceResult<Vec<TreasuryTransaction>> {
        self.store.transactions(dao_id).await
    }

    pub async fn investments(&self, dao_id: &str) -> GovernanceResult<Vec<InvestmentAllocation>> {
        self.store.investments(dao_id).await
    }

    fn new_member(&self, dao_id: &str, user_id: &str, role: MemberRole, contribution_score: u64) -> DaoMember {
        let now = self.clock.now();
        DaoMember {
            user_id: user_id.to_string(),
            dao_id: dao_id.to_string(),
            role,
            voting_power: self.calculator.calculate(role, contribution_score),
            contribution_score,
            joined_at: now,
            updated_at: now,
        }
    }

    async fn require_member(&self, dao_id: &str, user_id: &str) -> GovernanceResult<DaoMember> {
        self.store
            .member(dao_id, user_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("Member", format!("{}/{}", dao_id, user_id)))
    }

    async fn ensure_other_admin(&self, dao_id: &str, user_id: &str) -> GovernanceResult<()> {
        let members = self.store.members(dao_id).await?;
        if members
            .iter()
            .any(|m| m.role == MemberRole::Admin && m.user_id != user_id)
        {
            Ok(())
        } else {
            Err(GovernanceError::StateConflict(format!(
                "{} is the last admin of {}",
                user_id, dao_id
            )))
        }
    }

    fn announce(&self, member: &DaoMember) {
        self.broadcaster.broadcast(GovernanceEvent::MemberUpdated {
            dao_id: member.dao_id.clone(),
            user_id: member.user_id.clone(),
            voting_power: member.voting_power,
        });
    }
}
