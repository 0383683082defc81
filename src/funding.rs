//! Funding requests
//!
//! A member asks the DAO treasury for an amount. The request goes before a
//! review panel; once the approve threshold is crossed it is Approved exactly
//! once and its payout is queued on the execution queue.
//!
//! ```text
//! Submitted -> UnderReview -> Approved -> Executing -> Executed | Failed
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
pub enum FundingStatus {
    Submitted,
    UnderReview,
    Approved,
    Rejected,
    Executing,
    Executed,
    Failed,
    Expired,
}

impl FundingStatus {
    /// Still waiting on a decision
    pub fn is_undecided(&self) -> bool {
        matches!(self, FundingStatus::Submitted | FundingStatus::UnderReview)
    }

    /// Reviews are recorded until the payout has settled
    pub fn accepts_reviews(&self) -> bool {
        matches!(
            self,
            FundingStatus::Submitted
                | FundingStatus::UnderReview
                | FundingStatus::Approved
                | FundingStatus::Executing
        )
    }
}

impl StatusLabel for FundingStatus {
    fn as_str(&self) -> &'static str {
        match self {
            FundingStatus::Submitted => "submitted",
            FundingStatus::UnderReview => "under_review",
            FundingStatus::Approved => "approved",
            FundingStatus::Rejected => "rejected",
            FundingStatus::Executing => "executing",
            FundingStatus::Executed => "executed",
            FundingStatus::Failed => "failed",
            FundingStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for FundingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRequest {
    pub id: String,
    pub dao_id: String,
    pub requester: String,
    pub title: String,
    pub description: String,
    pub amount: u64,
    pub recipient: String,
    pub panel: ReviewPanel,
    pub status: FundingStatus,
    /// Reviews close at this time
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl FundingRequest {
    pub fn transition(&mut self, status: FundingStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Input for a new funding request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingSubmission {
    pub dao_id: String,
    pub requester: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub amount: u64,
    pub recipient: String,
    /// Empty means every member with voting power
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub threshold: Option<ApprovalThreshold>,
    #[serde(default)]
    pub review_window_secs: Option<u64>,
}

pub struct FundingWorkflow {
    store: Arc<dyn GovernanceStore>,
    dispatcher: Arc<ExecutionDispatcher>,
    queue: Arc<ExecutionQueue>,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<dyn EventBroadcaster>,
    config: WorkflowConfig,
}

impl FundingWorkflow {
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

    pub async fn submit(&self, submission: FundingSubmission) -> GovernanceResult<FundingRequest> {
        require_text("title", &submission.title)?;
        require_text("recipient", &submission.recipient)?;
        validate_amount(submission.amount)?;

        if self.store.dao(&submission.dao_id).await?.is_none() {
            return Err(GovernanceError::not_found("DAO", &submission.dao_id));
        }
        if self
            .store
            .member(&submission.dao_id, &submission.requester)
            .await?
            .is_none()
        {
            return Err(GovernanceError::Unauthorized(format!(
                "{} is not a member of {}",
                submission.requester, submission.dao_id
            )));
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
        let request = FundingRequest {
            id: generate_id("fund"),
            dao_id: submission.dao_id,
            requester: submission.requester,
            title: submission.title,
            description: submission.description,
            amount: submission.amount,
            recipient: submission.recipient,
            panel,
            status: FundingStatus::Submitted,
            deadline: now + window,
            created_at: now,
            updated_at: now,
            decided_at: None,
            executed_at: None,
            failure_reason: None,
        };

        self.store
            .commit(vec![StoreOp::PutFundingRequest(request.clone())])
            .await?;

        info!(
            "Funding request {} submitted to {} for {} ({} reviewers, deadline {})",
            request.id,
            request.dao_id,
            request.amount,
            request.panel.reviewers.len(),
            request.deadline
        );
        Ok(request)
    }

    /// Record a review. Crossing a threshold decides the request once;
    /// later reviews are recorded without changing the decision.
    pub async fn review(
        &self,
        request_id: &str,
        reviewer_id: &str,
        decision: ReviewDecision,
        comment: Option<String>,
    ) -> GovernanceResult<ReviewReceipt<FundingStatus>> {
        let (review, request, transitioned) = {
            let _records = self.dispatcher.lock_records().await;
            let mut request = self.get(request_id).await?;
            let now = self.clock.now();

            if !request.status.accepts_reviews() {
                return Err(GovernanceError::StateConflict(format!(
                    "funding request {} is {} and no longer accepts reviews",
                    request_id, request.status
                )));
            }
            if request.status.is_undecided() && now > request.deadline {
                return Err(GovernanceError::StateConflict(format!(
                    "review window for {} closed at {}",
                    request_id, request.deadline
                )));
            }

            let review = request.panel.record(reviewer_id, decision, comment, now)?;

            if request.status == FundingStatus::Submitted {
                request.transition(FundingStatus::UnderReview, now);
            }

            let mut transitioned = false;
            if request.status == FundingStatus::UnderReview {
                let decided = match request.panel.outcome() {
                    ApprovalOutcome::Approved => Some(FundingStatus::Approved),
                    ApprovalOutcome::Rejected => Some(FundingStatus::Rejected),
                    ApprovalOutcome::Pending => None,
                };
                if let Some(status) = decided {
                    request.transition(status, now);
                    request.decided_at = Some(now);
                    transitioned = true;
                }
            }

            self.store
                .commit(vec![StoreOp::PutFundingRequest(request.clone())])
                .await?;
            (review, request, transitioned)
        };

        debug!(
            "{} reviewed funding request {} ({:?}), now {}",
            reviewer_id, request.id, review.decision, request.status
        );

        let mut payout = None;
        if transitioned {
            info!("Funding request {} {}", request.id, request.status);
            match request.status {
                FundingStatus::Approved => {
                    self.broadcaster.broadcast(GovernanceEvent::FundingApproved {
                        request_id: request.id.clone(),
                        dao_id: request.dao_id.clone(),
                        amount: request.amount,
                    });
                    if self.config.auto_execute_payouts {
                        payout = self.queue_payout(&request.id).await;
                    }
                }
                _ => {
                    self.broadcaster.broadcast(GovernanceEvent::FundingRejected {
                        request_id: request.id.clone(),
                        dao_id: request.dao_id.clone(),
                    });
                }
            }
        }

        Ok(ReviewReceipt {
            review,
            status: request.status,
            tally: request.panel.tally(),
            transitioned,
            payout,
        })
    }

    async fn queue_payout(&self, request_id: &str) -> Option<ExecutionTask> {
        match self
            .queue
            .enqueue_target(ExecutionTarget::FundingPayout(request_id.to_string()))
            .await
        {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("Approved funding request {} but could not queue payout: {}", request_id, e);
                None
            }
        }
    }

    /// Queue the payout of an approved request by hand
    pub async fn execute(&self, request_id: &str) -> GovernanceResult<ExecutionTask> {
        self.queue
            .enqueue_target(ExecutionTarget::FundingPayout(request_id.to_string()))
            .await
    }

    pub async fn get(&self, request_id: &str) -> GovernanceResult<FundingRequest> {
        self.store
            .funding_request(request_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("Funding request", request_id))
    }

    pub async fn status(&self, request_id: &str) -> GovernanceResult<FundingStatus> {
        Ok(self.get(request_id).await?.status)
    }

    pub async fn list(&self, filter: &RecordFilter<FundingStatus>) -> GovernanceResult<Vec<FundingRequest>> {
        self.store.funding_requests(filter).await
    }

    /// Expire undecided requests whose deadline has passed. Returns their ids.
    pub async fn expire_overdue(&self) -> GovernanceResult<Vec<String>> {
        let expired = {
            let _records = self.dispatcher.lock_records().await;
            let now = self.clock.now();

            let mut expired = Vec::new();
            for status in [FundingStatus::Submitted, FundingStatus::UnderReview] {
                for mut request in self.store.funding_requests(&RecordFilter::status(status)).await? {
                    if request.deadline < now {
                        request.transition(FundingStatus::Expired, now);
                        expired.push(request);
                    }
                }
            }

            if expired.is_empty() {
                return Ok(Vec::new());
            }

            self.store
                .commit(expired.iter().cloned().map(StoreOp::PutFundingRequest).collect())
                .await?;
            expired
        };

        info!("Expired {} overdue funding requests", expired.len());
        for request in &expired {
            self.broadcaster.broadcast(GovernanceEvent::FundingExpired {
                request_id: request.id.clone(),
                dao_id: request.dao_id.clone(),
            });
        }

        Ok(expired.into_iter().map(|r| r.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_review_window() {
        assert!(FundingStatus::Submitted.accepts_reviews());
        assert!(FundingStatus::Executing.accepts_reviews());
        assert!(!FundingStatus::Executed.accepts_reviews());
        assert!(!FundingStatus::Expired.accepts_reviews());

        assert!(FundingStatus::UnderReview.is_undecided());
        assert!(!FundingStatus::Approved.is_undecided());
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(FundingStatus::UnderReview.as_str(), "under_review");
        assert_eq!(
            serde_json::to_string(&FundingStatus::UnderReview).unwrap(),
            "\"under_review\""
        );
    }

    #[test]
    fn test_submission_defaults_from_json() {
        let submission: FundingSubmission = serde_json::from_str(
            r#"{"dao_id": "dao_1", "requester": "alice", "title": "Hotspots", "amount": 500, "recipient": "0xabc"}"#,
        )
        .unwrap();
        assert!(submission.reviewers.is_empty());
        assert!(submission.threshold.is_none());
        assert_eq!(submission.description, "");
    }
}
