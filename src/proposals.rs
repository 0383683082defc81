//! Proposal lifecycle up to the vote result
//!
//! `Draft -> Active -> Passed | Defeated`, with `Cancelled` reachable from
//! Draft and Active. Passed proposals are handed to the execution queue.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::dispatcher::ExecutionDispatcher;
use crate::error::{GovernanceError, GovernanceResult};
use crate::notifier::{EventBroadcaster, GovernanceEvent};
use crate::store::{GovernanceStore, StoreOp};
use crate::types::{
    generate_id, require_text, DaoMember, MemberRole, Proposal, ProposalPayload, ProposalStatus,
    ProposalType, RecordFilter, Vote, VoteChoice, VoteTally,
};
use crate::voting_power::{evaluate_quorum, total_power, QuorumOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProposal {
    pub dao_id: String,
    pub proposer: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub proposal_type: ProposalType,
    pub payload: ProposalPayload,
}

/// A finalized proposal and how the vote was evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finalization {
    pub proposal: Proposal,
    pub outcome: QuorumOutcome,
}

pub struct ProposalService {
    store: Arc<dyn GovernanceStore>,
    dispatcher: Arc<ExecutionDispatcher>,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn EventBroadcaster>,
}

impl ProposalService {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        dispatcher: Arc<ExecutionDispatcher>,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn EventBroadcaster>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            broadcaster,
        }
    }

    pub async fn create(&self, new_proposal: NewProposal) -> GovernanceResult<Proposal> {
        require_text("title", &new_proposal.title)?;
        new_proposal.payload.validate()?;
        if new_proposal.payload.proposal_type() != new_proposal.proposal_type {
            return Err(GovernanceError::Validation(format!(
                "{} proposal cannot carry a {} payload",
                new_proposal.proposal_type,
                new_proposal.payload.proposal_type()
            )));
        }

        let dao = self
            .store
            .dao(&new_proposal.dao_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("DAO", &new_proposal.dao_id))?;
        let proposer = self.require_member(&dao.id, &new_proposal.proposer).await?;
        if proposer.voting_power < dao.parameters.min_proposer_power {
            return Err(GovernanceError::Unauthorized(format!(
                "{} has {} voting power, {} is required to propose",
                proposer.user_id, proposer.voting_power, dao.parameters.min_proposer_power
            )));
        }

        let now = self.clock.now();
        let proposal = Proposal {
            id: generate_id("prop"),
            dao_id: dao.id,
            proposer: new_proposal.proposer,
            title: new_proposal.title,
            description: new_proposal.description,
            proposal_type: new_proposal.proposal_type,
            payload: new_proposal.payload,
            status: ProposalStatus::Draft,
            tally: VoteTally::default(),
            vote_start: None,
            vote_end: None,
            created_at: now,
            updated_at: now,
            executed_at: None,
            failure_reason: None,
        };

        self.store
            .commit(vec![StoreOp::PutProposal(proposal.clone())])
            .await?;

        info!(
            "Proposal {} ({}) created in {} by {}",
            proposal.id, proposal.proposal_type, proposal.dao_id, proposal.proposer
        );
        Ok(proposal)
    }

    /// Open voting for the DAO's configured voting period
    pub async fn activate(&self, proposal_id: &str, actor: &str) -> GovernanceResult<Proposal> {
        let _records = self.dispatcher.lock_records().await;
        let mut proposal = self.get(proposal_id).await?;
        self.require_member(&proposal.dao_id, actor).await?;

        if proposal.status != ProposalStatus::Draft {
            return Err(GovernanceError::StateConflict(format!(
                "proposal {} is {}, only drafts can be activated",
                proposal_id, proposal.status
            )));
        }

        let dao = self
            .store
            .dao(&proposal.dao_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("DAO", &proposal.dao_id))?;

        let now = self.clock.now();
        let period = i64::try_from(dao.parameters.voting_period_secs).unwrap_or(i64::MAX / 1000);
        proposal.vote_start = Some(now);
        proposal.vote_end = Some(now + Duration::seconds(period));
        proposal.transition(ProposalStatus::Active, now);

        self.store
            .commit(vec![StoreOp::PutProposal(proposal.clone())])
            .await?;

        info!("Voting opened on {} until {:?}", proposal.id, proposal.vote_end);
        Ok(proposal)
    }

    /// Cast a vote weighted by the voter's current power
    pub async fn cast_vote(&self, proposal_id: &str, voter: &str, choice: VoteChoice) -> GovernanceResult<Vote> {
        let _records = self.dispatcher.lock_records().await;
        let mut proposal = self.get(proposal_id).await?;
        let now = self.clock.now();

        if proposal.status != ProposalStatus::Active {
            return Err(GovernanceError::StateConflict(format!(
                "proposal {} is {}, votes are only accepted while active",
                proposal_id, proposal.status
            )));
        }
        if proposal.vote_end.map_or(false, |end| now >= end) {
            return Err(GovernanceError::StateConflict(format!(
                "voting on {} has closed",
                proposal_id
            )));
        }

        let member = self.require_member(&proposal.dao_id, voter).await?;
        if member.voting_power == 0 {
            return Err(GovernanceError::Unauthorized(format!(
                "{} has no voting power in {}",
                voter, proposal.dao_id
            )));
        }

        let vote = Vote {
            proposal_id: proposal.id.clone(),
            voter: voter.to_string(),
            choice,
            voting_power: member.voting_power,
            cast_at: now,
        };
        proposal.tally.record(choice, member.voting_power);
        proposal.updated_at = now;

        // The vote insert rejects a second vote and takes the tally update down with it
        self.store
            .commit(vec![
                StoreOp::PutVote(vote.clone()),
                StoreOp::PutProposal(proposal),
            ])
            .await?;

        debug!("{} voted {:?} on {} with power {}", voter, choice, proposal_id, vote.voting_power);
        Ok(vote)
    }

    /// Close voting and record the result. Requires the window to have ended.
    pub async fn finalize(&self, proposal_id: &str) -> GovernanceResult<Finalization> {
        let finalization = {
            let _records = self.dispatcher.lock_records().await;
            let mut proposal = self.get(proposal_id).await?;
            let now = self.clock.now();

            if proposal.status != ProposalStatus::Active {
                return Err(GovernanceError::StateConflict(format!(
                    "proposal {} is {}, only active proposals can be finalized",
                    proposal_id, proposal.status
                )));
            }
            if let Some(end) = proposal.vote_end {
                if now < end {
                    return Err(GovernanceError::StateConflict(format!(
                        "voting on {} is open until {}",
                        proposal_id, end
                    )));
                }
            }

            let dao = self
                .store
                .dao(&proposal.dao_id)
                .await?
                .ok_or_else(|| GovernanceError::not_found("DAO", &proposal.dao_id))?;
            let members = self.store.members(&dao.id).await?;
            let outcome = evaluate_quorum(
                &proposal.tally,
                total_power(&members),
                dao.parameters.quorum_percentage,
                dao.parameters.approval_threshold,
            );

            let status = if outcome.passed() {
                ProposalStatus::Passed
            } else {
                ProposalStatus::Defeated
            };
            proposal.transition(status, now);

            self.store
                .commit(vec![StoreOp::PutProposal(proposal.clone())])
                .await?;
            Finalization { proposal, outcome }
        };

        let proposal = &finalization.proposal;
        info!("Proposal {} finalized as {}", proposal.id, proposal.status);
        self.broadcaster.broadcast(GovernanceEvent::ProposalFinalized {
            proposal_id: proposal.id.clone(),
            dao_id: proposal.dao_id.clone(),
            status: proposal.status,
        });

        Ok(finalization)
    }

    /// Withdraw a draft or active proposal. Only the proposer or an admin may.
    pub async fn cancel(&self, proposal_id: &str, actor: &str) -> GovernanceResult<Proposal> {
        let _records = self.dispatcher.lock_records().await;
        let mut proposal = self.get(proposal_id).await?;

        if !matches!(proposal.status, ProposalStatus::Draft | ProposalStatus::Active) {
            return Err(GovernanceError::StateConflict(format!(
                "proposal {} is {} and cannot be withdrawn",
                proposal_id, proposal.status
            )));
        }

        if proposal.proposer != actor {
            let member = self.require_member(&proposal.dao_id, actor).await?;
            if member.role != MemberRole::Admin {
                return Err(GovernanceError::Unauthorized(format!(
                    "only the proposer or an admin can cancel {}",
                    proposal_id
                )));
            }
        }

        proposal.transition(ProposalStatus::Cancelled, self.clock.now());
        self.store
            .commit(vec![StoreOp::PutProposal(proposal.clone())])
            .await?;

        info!("Proposal {} cancelled by {}", proposal_id, actor);
        Ok(proposal)
    }

    pub async fn get(&self, proposal_id: &str) -> GovernanceResult<Proposal> {
        self.store
            .proposal(proposal_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("Proposal", proposal_id))
    }

    pub async fn list(&self, filter: &RecordFilter<ProposalStatus>) -> GovernanceResult<Vec<Proposal>> {
        self.store.proposals(filter).await
    }

    pub async fn votes(&self, proposal_id: &str) -> GovernanceResult<Vec<Vote>> {
        self.store.votes(proposal_id).await
    }

    async fn require_member(&self, dao_id: &str, user_id: &str) -> GovernanceResult<DaoMember> {
        self.store.member(dao_id, user_id).await?.ok_or_else(|| {
            GovernanceError::Unauthorized(format!("{} is not a member of {}", user_id, dao_id))
        })
    }
}
