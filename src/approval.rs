//! Review panels shared by funding requests and milestone verifications
//!
//! A panel holds the eligible reviewers (with their voting power frozen at
//! submission), the approval threshold, and the append-only review log.
//! Reject thresholds mirror approve thresholds.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{GovernanceError, GovernanceResult};
use crate::execution_queue::ExecutionTask;
use crate::store::GovernanceStore;

/// Longest review window a submitter may ask for (90 days)
pub const MAX_REVIEW_WINDOW_SECS: u64 = 90 * 24 * 3_600;

/// Check a requested review window and turn it into a duration
pub fn review_window(secs: u64) -> GovernanceResult<Duration> {
    if secs == 0 || secs > MAX_REVIEW_WINDOW_SECS {
        return Err(GovernanceError::Validation(format!(
            "review window must be between 1 and {} seconds, got {}",
            MAX_REVIEW_WINDOW_SECS, secs
        )));
    }
    Ok(Duration::seconds(secs as i64))
}

/// How many approvals an item needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalThreshold {
    /// Flat number of approving reviews
    Count { approvals: u32 },
    /// Percentage of the panel's total voting power
    PowerPercentage { percentage: u8 },
}

impl ApprovalThreshold {
    /// Check the threshold on its own
    pub fn validate_shape(&self) -> GovernanceResult<()> {
        match *self {
            ApprovalThreshold::Count { approvals } if approvals == 0 => Err(
                GovernanceError::Validation("approval count must be at least 1".to_string()),
            ),
            ApprovalThreshold::PowerPercentage { percentage } if percentage == 0 || percentage > 100 => {
                Err(GovernanceError::Validation(format!(
                    "approval percentage must be between 1 and 100, got {}",
                    percentage
                )))
            }
            _ => Ok(()),
        }
    }

    /// Check the threshold can be reached by a given panel
    pub fn validate_for(&self, reviewer_count: usize, total_power: u64) -> GovernanceResult<()> {
        self.validate_shape()?;
        match *self {
            ApprovalThreshold::Count { approvals } if approvals as usize > reviewer_count => {
                Err(GovernanceError::Validation(format!(
                    "threshold of {} approvals exceeds the {} eligible reviewers",
                    approvals, reviewer_count
                )))
            }
            ApprovalThreshold::PowerPercentage { .. } if total_power == 0 => Err(
                GovernanceError::Validation("reviewers hold no voting power".to_string()),
            ),
            _ => Ok(()),
        }
    }

    fn is_met(&self, count: u32, power: u64, total_power: u64) -> bool {
        match *self {
            ApprovalThreshold::Count { approvals } => count >= approvals,
            ApprovalThreshold::PowerPercentage { percentage } => {
                total_power > 0
                    && power as u128 * 100 >= percentage as u128 * total_power as u128
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    Abstain,
}

/// Immutable review entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewer_id: String,
    pub decision: ReviewDecision,
    /// Reviewer's voting power when the item was submitted
    pub voting_power: u64,
    pub comment: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTally {
    pub approvals: u32,
    pub rejections: u32,
    pub abstentions: u32,
    pub approving_power: u64,
    pub rejecting_power: u64,
    pub total_power: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Pending,
    Approved,
    Rejected,
}

/// Eligible reviewers, threshold and review log of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPanel {
    /// Reviewer id -> voting power snapshot
    pub reviewers: BTreeMap<String, u64>,
    pub threshold: ApprovalThreshold,
    pub reviews: Vec<ReviewRecord>,
}

impl ReviewPanel {
    pub fn new(reviewers: BTreeMap<String, u64>, threshold: ApprovalThreshold) -> GovernanceResult<Self> {
        if reviewers.is_empty() {
            return Err(GovernanceError::Validation(
                "at least one eligible reviewer is required".to_string(),
            ));
        }
        let panel = Self {
            reviewers,
            threshold,
            reviews: Vec::new(),
        };
        threshold.validate_for(panel.reviewers.len(), panel.total_power())?;
        Ok(panel)
    }

    pub fn total_power(&self) -> u64 {
        self.reviewers
            .values()
            .fold(0u64, |acc, p| acc.saturating_add(*p))
    }

    pub fn has_reviewed(&self, reviewer_id: &str) -> bool {
        self.reviews.iter().any(|r| r.reviewer_id == reviewer_id)
    }

    /// Append a review from an eligible reviewer who has not reviewed yet
    pub fn record(
        &mut self,
        reviewer_id: &str,
        decision: ReviewDecision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> GovernanceResult<ReviewRecord> {
        let voting_power = *self.reviewers.get(reviewer_id).ok_or_else(|| {
            GovernanceError::Unauthorized(format!("{} is not an eligible reviewer", reviewer_id))
        })?;

        if self.has_reviewed(reviewer_id) {
            return Err(GovernanceError::DuplicateReview(reviewer_id.to_string()));
        }

        let record = ReviewRecord {
            reviewer_id: reviewer_id.to_string(),
            decision,
            voting_power,
            comment,
            reviewed_at: now,
        };
        self.reviews.push(record.clone());
        Ok(record)
    }

    pub fn tally(&self) -> ApprovalTally {
        let mut tally = ApprovalTally {
            total_power: self.total_power(),
            ..Default::default()
        };
        for review in &self.reviews {
            match review.decision {
                ReviewDecision::Approve => {
                    tally.approvals += 1;
                    tally.approving_power = tally.approving_power.saturating_add(review.voting_power);
                }
                ReviewDecision::Reject => {
                    tally.rejections += 1;
                    tally.rejecting_power = tally.rejecting_power.saturating_add(review.voting_power);
                }
                ReviewDecision::Abstain => tally.abstentions += 1,
            }
        }
        tally
    }

    /// Where the panel currently stands; approval wins if both sides qualify
    pub fn outcome(&self) -> ApprovalOutcome {
        let tally = self.tally();
        if self
            .threshold
            .is_met(tally.approvals, tally.approving_power, tally.total_power)
        {
            ApprovalOutcome::Approved
        } else if self
            .threshold
            .is_met(tally.rejections, tally.rejecting_power, tally.total_power)
        {
            ApprovalOutcome::Rejected
        } else {
            ApprovalOutcome::Pending
        }
    }
}

/// Result of recording a review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReceipt<S> {
    pub review: ReviewRecord,
    /// Item status after the review
    pub status: S,
    pub tally: ApprovalTally,
    /// This review moved the item to a decision
    pub transitioned: bool,
    /// Payout task queued because of this review
    pub payout: Option<ExecutionTask>,
}

/// Build a review panel from DAO members.
///
/// An empty `reviewers` list means every member holding voting power.
/// Named reviewers must all be members of the DAO.
pub async fn panel_for_dao(
    store: &dyn GovernanceStore,
    dao_id: &str,
    reviewers: &[String],
    threshold: ApprovalThreshold,
) -> GovernanceResult<ReviewPanel> {
    let members = store.members(dao_id).await?;

    let eligible: BTreeMap<String, u64> = if reviewers.is_empty() {
        members
            .iter()
            .filter(|m| m.voting_power > 0)
            .map(|m| (m.user_id.clone(), m.voting_power))
            .collect()
    } else {
        let mut eligible = BTreeMap::new();
        for reviewer in reviewers {
            let member = members
                .iter()
                .find(|m| &m.user_id == reviewer)
                .ok_or_else(|| {
                    GovernanceError::Validation(format!(
                        "reviewer {} is not a member of {}",
                        reviewer, dao_id
                    ))
                })?;
            eligible.insert(member.user_id.clone(), member.voting_power);
        }
        eligible
    };

    ReviewPanel::new(eligible, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panel(threshold: ApprovalThreshold) -> ReviewPanel {
        let reviewers = [("a", 100), ("b", 100), ("c", 200), ("d", 600)]
            .iter()
            .map(|(id, p)| (id.to_string(), *p))
            .collect();
        ReviewPanel::new(reviewers, threshold).unwrap()
    }

    #[test]
    fn test_count_threshold() {
        let mut p = panel(ApprovalThreshold::Count { approvals: 2 });
        let now = Utc::now();

        p.record("a", ReviewDecision::Approve, None, now).unwrap();
        assert_eq!(p.outcome(), ApprovalOutcome::Pending);

        p.record("b", ReviewDecision::Approve, Some("lgtm".into()), now).unwrap();
        assert_eq!(p.outcome(), ApprovalOutcome::Approved);
    }

    #[test]
    fn test_power_threshold() {
        let mut p = panel(ApprovalThreshold::PowerPercentage { percentage: 50 });
        let now = Utc::now();

        p.record("a", ReviewDecision::Approve, None, now).unwrap();
        p.record("c", ReviewDecision::Approve, None, now).unwrap();
        // 300 of 1000
        assert_eq!(p.outcome(), ApprovalOutcome::Pending);

        p.record("d", ReviewDecision::Reject, None, now).unwrap();
        // 600 of 1000 rejecting
        assert_eq!(p.outcome(), ApprovalOutcome::Rejected);
    }

    #[test]
    fn test_duplicate_and_ineligible_reviews() {
        let mut p = panel(ApprovalThreshold::Count { approvals: 1 });
        let now = Utc::now();

        p.record("a", ReviewDecision::Abstain, None, now).unwrap();
        assert_eq!(
            p.record("a", ReviewDecision::Approve, None, now),
            Err(GovernanceError::DuplicateReview("a".to_string()))
        );
        assert!(matches!(
            p.record("mallory", ReviewDecision::Approve, None, now),
            Err(GovernanceError::Unauthorized(_))
        ));
        assert_eq!(p.reviews.len(), 1);
    }

    #[test]
    fn test_unreachable_threshold_rejected() {
        let reviewers: BTreeMap<String, u64> = [("a".to_string(), 100)].into_iter().collect();
        assert!(ReviewPanel::new(reviewers.clone(), ApprovalThreshold::Count { approvals: 2 }).is_err());

        let powerless: BTreeMap<String, u64> = [("a".to_string(), 0)].into_iter().collect();
        assert!(ReviewPanel::new(powerless, ApprovalThreshold::PowerPercentage { percentage: 50 }).is_err());

        assert!(ReviewPanel::new(BTreeMap::new(), ApprovalThreshold::Count { approvals: 1 }).is_err());
    }
}
