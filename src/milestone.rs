//! Milestone verification
//!
//! Grantees submit evidence that a milestone (a batch of deployed hotspots,
//! a coverage target, a firmware release) was delivered. Reviewers verify
//! it and a verified milestone releases its payout through the execution
//! queue.
//!
//! ```text
//! Submitted -> UnderReview -> Verified -> Executing -> PaymentProcessed | Failed
//!                          \-> Rejected
//! Submitted | UnderReview -> Expired (deadline passed)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::approval::{
    panel_for_dao, review_window, ApprovalOutcome, ApprovalThreshold, ReviewDecision, ReviewPanel, ReviewReceipt,
};
use crate::clock::Clock;
use crate::config::WorkflowConfig;
use crate::dispatcher::ExecutionDispatcher;
use crate::error::{GovernanceError, GovernanceResult};
use crate::execution_queue::{ExecutionQueue, ExecutionTarget, ExecutionTask};
use crate::notifier::{EventBroadcaster, GovernanceEvent};
use crate::store::{GovernanceStore, StoreOp};
use crate::types::{generate_id, require_text, validate_amount, RecordFilter, StatusLabel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Submitted,
    UnderReview,
    Verified,
    Rejected,
    Executing,
    PaymentProcessed,
    Failed,
    Expired,
}

impl MilestoneStatus {
    pub fn is_undecided(&self) -> bool {
        matches!(self, MilestoneStatus::Submitted | MilestoneStatus::UnderReview)
    }

    pub fn accepts_reviews(&self) -> bool {
        matches!(
            self,
            MilestoneStatus::Submitted
                | MilestoneStatus::UnderReview
                | MilestoneStatus::Verified
                | MilestoneStatus::Executing
        )
    }
}

impl StatusLabel for MilestoneStatus {
    fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Submitted => "submitted",
            MilestoneStatus::UnderReview => "under_review",
            MilestoneStatus::Verified => "verified",
            MilestoneStatus::Rejected => "rejected",
            MilestoneStatus::Executing => "executing",
            MilestoneStatus::PaymentProcessed => "payment_processed",
            MilestoneStatus::Failed => "failed",
            MilestoneStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A piece of delivery evidence (dashboard link, coverage map, IPFS report)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub uri: String,
    pub description: String,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneVerification {
    pub id: String,
    pub dao_id: String,
    /// Funding request this milestone belongs to, if any
    pub funding_request_id: Option<String>,
    pub milestone_index: u32,
    pub submitted_by: String,
    pub title: String,
    pub description: String,
    pub evidence: Vec<EvidenceItem>,
    pub payout_amount: u64,
    pub recipient: String,
    pub panel: ReviewPanel,
    pub status: MilestoneStatus,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl MilestoneVerification {
    pub fn transition(&mut self, status: MilestoneStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Evidence attached at submission time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceInput {
    pub uri: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneSubmission {
    pub dao_id: String,
    pub submitted_by: String,
    #[serde(default)]
    pub funding_request_id: Option<String>,
    #[serde(default)]
    pub milestone_index: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceInput>,
    pub payout_amount: u64,
    pub recipient: String,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub threshold: Option<ApprovalThreshold>,
    #[serde(default)]
    pub review_window_secs: Option<u64>,
}

pub struct MilestoneWorkflow {
    store: Arc<dyn GovernanceStore>,
    dispatcher: Arc<ExecutionDispatcher>,
    queue: Arc<ExecutionQueue>,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn EventBroadcaster>,
    config: WorkflowConfig,
}

impl MilestoneWorkflow {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        dispatcher: Arc<ExecutionDispatcher>,
        queue: Arc<ExecutionQueue>,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn EventBroadcaster>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            queue,
            clock,
            broadcaster,
            config,
        }
    }

    pub async fn submit(&self, submission: MilestoneSubmission) -> GovernanceResult<MilestoneVerification> {
        require_text("title", &submission.title)?;
        require_text("recipient", &submission.recipient)?;
        validate_amount(submission.payout_amount)?;
        for item in &submission.evidence {
            require_text("evidence uri", &item.uri)?;
        }

        if self.store.dao(&submission.dao_id).await?.is_none() {
            return Err(GovernanceError::not_found("DAO", &submission.dao_id));
        }
        self.require_member(&submission.dao_id, &submission.submitted_by)
            .await?;

        if let Some(request_id) = &submission.funding_request_id {
            let request = self
                .store
                .funding_request(request_id)
                .await?
                .ok_or_else(|| GovernanceError::not_found("Funding request", request_id))?;
            if request.dao_id != submission.dao_id {
                return Err(GovernanceError::Validation(format!(
                    "funding request {} belongs to {}, not {}",
                    request_id, request.dao_id, submission.dao_id
                )));
            }
        }

        let window = review_window(
            submission
                .review_window_secs
                .unwrap_or(self.config.default_review_window_secs),
        )?;

        let threshold = submission.threshold.unwrap_or(self.config.default_threshold);
        let panel = panel_for_dao(
            self.store.as_ref(),
            &submission.dao_id,
            &submission.reviewers,
            threshold,
        )
        .await?;

        let now = self.clock.now();
        let evidence = submission
            .evidence
            .into_iter()
            .map(|item| EvidenceItem {
                uri: item.uri,
                description: item.description,
                submitted_by: submission.submitted_by.clone(),
                submitted_at: now,
            })
            .collect();

        let milestone = MilestoneVerification {
            id: generate_id("ms"),
            dao_id: submission.dao_id,
            funding_request_id: submission.funding_request_id,
            milestone_index: submission.milestone_index,
            submitted_by: submission.submitted_by,
            title: submission.title,
            description: submission.description,
            evidence,
            payout_amount: submission.payout_amount,
            recipient: submission.recipient,
            panel,
            status: MilestoneStatus::Submitted,
            deadline: now + window,
            created_at: now,
            updated_at: now,
            decided_at: None,
            paid_at: None,
            failure_reason: None,
        };

        self.store
            .commit(vec![StoreOp::PutMilestone(milestone.clone())])
            .await?;

        info!(
            "Milestone {} #{} submitted to {} (payout {}, {} evidence items)",
            milestone.id,
            milestone.milestone_index,
            milestone.dao_id,
            milestone.payout_amount,
            milestone.evidence.len()
        );
        Ok(milestone)
    }

    /// Attach more evidence while the milestone is still under review
    pub async fn add_evidence(
        &self,
        milestone_id: &str,
        submitted_by: &str,
        uri: &str,
        description: &str,
    ) -> GovernanceResult<MilestoneVerification> {
        require_text("evidence uri", uri)?;

        let _records = self.dispatcher.lock_records().await;
        let mut milestone = self.get(milestone_id).await?;

        if !milestone.status.is_undecided() {
            return Err(GovernanceError::StateConflict(format!(
                "milestone {} is {}, evidence can only be added before a decision",
                milestone_id, milestone.status
            )));
        }
        self.require_member(&milestone.dao_id, submitted_by).await?;

        let now = self.clock.now();
        milestone.evidence.push(EvidenceItem {
            uri: uri.to_string(),
            description: description.to_string(),
            submitted_by: submitted_by.to_string(),
            submitted_at: now,
        });
        milestone.updated_at = now;

        self.store
            .commit(vec![StoreOp::PutMilestone(milestone.clone())])
            .await?;

        debug!("Evidence {} added to milestone {}", uri, milestone_id);
        Ok(milestone)
    }

    /// Record a review. The verify decision happens once.
    pub async fn review(
        &self,
        milestone_id: &str,
        reviewer_id: &str,
        decision: ReviewDecision,
        comment: Option<String>,
    ) -> GovernanceResult<ReviewReceipt<MilestoneStatus>> {
        let (review, milestone, transitioned) = {
            let _records = self.dispatcher.lock_records().await;
            let mut milestone = self.get(milestone_id).await?;
            let now = self.clock.now();

            if !milestone.status.accepts_reviews() {
                return Err(GovernanceError::StateConflict(format!(
                    "milestone {} is {} and no longer accepts reviews",
                    milestone_id, milestone.status
                )));
            }
            if milestone.status.is_undecided() && now > milestone.deadline {
                return Err(GovernanceError::StateConflict(format!(
                    "review window for {} closed at {}",
                    milestone_id, milestone.deadline
                )));
            }

            let review = milestone.panel.record(reviewer_id, decision, comment, now)?;

            if milestone.status == MilestoneStatus::Submitted {
                milestone.transition(MilestoneStatus::UnderReview, now);
            }

            let mut transitioned = false;
            if milestone.status == MilestoneStatus::UnderReview {
                let decided = match milestone.panel.outcome() {
                    ApprovalOutcome::Approved => Some(MilestoneStatus::Verified),
                    ApprovalOutcome::Rejected => Some(MilestoneStatus::Rejected),
                    ApprovalOutcome::Pending => None,
                };
                if let Some(status) = decided {
                    milestone.transition(status, now);
                    milestone.decided_at = Some(now);
                    transitioned = true;
                }
            }

            self.store
                .commit(vec![StoreOp::PutMilestone(milestone.clone())])
                .await?;
            (review, milestone, transitioned)
        };

        debug!(
            "{} reviewed milestone {} ({:?}), now {}",
            reviewer_id, milestone.id, review.decision, milestone.status
        );

        let mut payout = None;
        if transitioned {
            info!("Milestone {} {}", milestone.id, milestone.status);
            if milestone.status == MilestoneStatus::Verified {
                self.broadcaster.broadcast(GovernanceEvent::MilestoneVerified {
                    milestone_id: milestone.id.clone(),
                    dao_id: milestone.dao_id.clone(),
                    payout_amount: milestone.payout_amount,
                });
                if self.config.auto_execute_payouts {
                    payout = self.queue_payout(&milestone.id).await;
                }
            } else {
                self.broadcaster.broadcast(GovernanceEvent::MilestoneRejected {
                    milestone_id: milestone.id.clone(),
                    dao_id: milestone.dao_id.clone(),
                });
            }
        }

        Ok(ReviewReceipt {
            review,
            status: milestone.status,
            tally: milestone.panel.tally(),
            transitioned,
            payout,
        })
    }

    async fn queue_payout(&self, milestone_id: &str) -> Option<ExecutionTask> {
        match self
            .queue
            .enqueue_target(ExecutionTarget::MilestonePayout(milestone_id.to_string()))
            .await
        {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("Verified milestone {} but could not queue payout: {}", milestone_id, e);
                None
            }
        }
    }

    /// Queue the payout of a verified milestone by hand
    pub async fn execute(&self, milestone_id: &str) -> GovernanceResult<ExecutionTask> {
        self.queue
            .enqueue_target(ExecutionTarget::MilestonePayout(milestone_id.to_string()))
            .await
    }

    pub async fn get(&self, milestone_id: &str) -> GovernanceResult<MilestoneVerification> {
        self.store
            .milestone(milestone_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("Milestone", milestone_id))
    }

    pub async fn status(&self, milestone_id: &str) -> GovernanceResult<MilestoneStatus> {
        Ok(self.get(milestone_id).await?.status)
    }

    pub async fn list(
        &self,
        filter: &RecordFilter<MilestoneStatus>,
    ) -> GovernanceResult<Vec<MilestoneVerification>> {
        self.store.milestones(filter).await
    }

    /// Expire undecided milestones whose deadline has passed. Returns their ids.
    pub async fn expire_overdue(&self) -> GovernanceResult<Vec<String>> {
        let expired = {
            let _records = self.dispatcher.lock_records().await;
            let now = self.clock.now();

            let mut expired = Vec::new();
            for status in [MilestoneStatus::Submitted, MilestoneStatus::UnderReview] {
                for mut milestone in self.store.milestones(&RecordFilter::status(status)).await? {
                    if milestone.deadline < now {
                        milestone.transition(MilestoneStatus::Expired, now);
                        expired.push(milestone);
                    }
                }
            }

            if expired.is_empty() {
                return Ok(Vec::new());
            }

            self.store
                .commit(expired.iter().cloned().map(StoreOp::PutMilestone).collect())
                .await?;
            expired
        };

        info!("Expired {} overdue milestones", expired.len());
        for milestone in &expired {
            self.broadcaster.broadcast(GovernanceEvent::MilestoneExpired {
                milestone_id: milestone.id.clone(),
                dao_id: milestone.dao_id.clone(),
            });
        }

        Ok(expired.into_iter().map(|m| m.id).collect())
    }

    async fn require_member(&self, dao_id: &str, user_id: &str) -> GovernanceResult<()> {
        match self.store.member(dao_id, user_id).await? {
            Some(_) => Ok(()),
            None => Err(GovernanceError::Unauthorized(format!(
                "{} is not a member of {}",
                user_id, dao_id
            ))),
        }
    }
}
