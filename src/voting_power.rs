//! Voting Weight Calculator
//!
//! Voting power is `base_weight(role) * (100 + bonus) / 100`, where the bonus
//! is the contribution score converted to percent and capped. The formula is
//! integer-only so recomputing with the same inputs always yields the same
//! value.
//!
//! Also home to the quorum/approval evaluation used when finalizing
//! proposals, and the member ranking used by the dashboard leaderboard.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::VotingConfig;
use crate::types::{DaoMember, MemberRole, VoteTally};

/// Derives voting power from role and contribution score
#[derive(Debug, Clone)]
pub struct VotingPowerCalculator {
    config: VotingConfig,
}

impl Default for VotingPowerCalculator {
    fn default() -> Self {
        Self::new(VotingConfig::default())
    }
}

impl VotingPowerCalculator {
    pub fn new(config: VotingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VotingConfig {
        &self.config
    }

    /// Base weight granted by a role
    pub fn base_weight(&self, role: MemberRole) -> u64 {
        match role {
            MemberRole::Admin => self.config.admin_weight,
            MemberRole::Council => self.config.council_weight,
            MemberRole::Member => self.config.member_weight,
            MemberRole::Observer => self.config.observer_weight,
        }
    }

    /// Contribution bonus in percent of the base weight
    pub fn contribution_bonus_percent(&self, contribution_score: u64) -> u64 {
        let per_percent = self.config.contribution_points_per_percent.max(1);
        (contribution_score / per_percent).min(self.config.max_contribution_bonus_percent)
    }

    /// Voting power for a role and contribution score
    pub fn calculate(&self, role: MemberRole, contribution_score: u64) -> u64 {
        let base = self.base_weight(role);
        let multiplier = 100u64.saturating_add(self.contribution_bonus_percent(contribution_score));
        base.saturating_mul(multiplier) / 100
    }

    /// Recompute a member's stored power. Returns true if it changed.
    pub fn recompute(&self, member: &mut DaoMember) -> bool {
        let power = self.calculate(member.role, member.contribution_score);
        if power != member.voting_power {
            member.voting_power = power;
            true
        } else {
            false
        }
    }
}

/// Result of checking a tally against quorum and approval thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QuorumOutcome {
    /// Total voting power is zero; participation cannot be measured
    Indeterminate,
    Evaluated(QuorumReport),
}

impl QuorumOutcome {
    pub fn passed(&self) -> bool {
        match self {
            QuorumOutcome::Indeterminate => false,
            QuorumOutcome::Evaluated(report) => report.passed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumReport {
    pub total_power: u64,
    pub votes_cast: u64,
    pub quorum_required: u64,
    pub quorum_met: bool,
    /// YES share of decisive votes, in whole percent
    pub approval_percentage: u64,
    pub approval_met: bool,
}

impl QuorumReport {
    pub fn passed(&self) -> bool {
        self.quorum_met && self.approval_met
    }
}

/// Check a tally against a DAO's quorum and approval thresholds.
///
/// Quorum counts every vote including abstentions; approval is YES over
/// YES + NO. A DAO with zero total power yields `Indeterminate`.
pub fn evaluate_quorum(
    tally: &VoteTally,
    total_power: u64,
    quorum_percentage: u8,
    approval_threshold: u8,
) -> QuorumOutcome {
    if total_power == 0 {
        return QuorumOutcome::Indeterminate;
    }

    let votes_cast = tally.total_cast();
    // u128 keeps the multiplication exact for very large power totals
    let quorum_required =
        ((total_power as u128 * quorum_percentage as u128 + 99) / 100) as u64;
    let quorum_met = votes_cast >= quorum_required;

    let decisive = tally.decisive();
    let approval_percentage = if decisive > 0 {
        (tally.yes as u128 * 100 / decisive as u128) as u64
    } else {
        0
    };
    let approval_met = decisive > 0 && approval_percentage >= approval_threshold as u64;

    QuorumOutcome::Evaluated(QuorumReport {
        total_power,
        votes_cast,
        quorum_required,
        quorum_met,
        approval_percentage,
        approval_met,
    })
}

/// Member position on the voting-power leaderboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedMember {
    /// 1-based position
    pub rank: usize,
    pub member: DaoMember,
}

fn ranking_order(a: &DaoMember, b: &DaoMember) -> Ordering {
    b.voting_power
        .cmp(&a.voting_power)
        .then_with(|| a.joined_at.cmp(&b.joined_at))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Sort members by voting power, highest first. Ties go to the earlier member.
pub fn rank_members(mut members: Vec<DaoMember>) -> Vec<RankedMember> {
    members.sort_by(ranking_order);
    members
        .into_iter()
        .enumerate()
        .map(|(i, member)| RankedMember { rank: i + 1, member })
        .collect()
}

/// Sum of all members' voting power
pub fn total_power(members: &[DaoMember]) -> u64 {
    members
        .iter()
        .fold(0u64, |acc, m| acc.saturating_add(m.voting_power))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn member(user: &str, power: u64, joined_offset_days: i64) -> DaoMember {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        DaoMember {
            user_id: user.to_string(),
            dao_id: "dao_test".to_string(),
            role: MemberRole::Member,
            voting_power: power,
            contribution_score: 0,
            joined_at: base + Duration::days(joined_offset_days),
            updated_at: base,
        }
    }

    #[test]
    fn test_calculate_role_weights() {
        let calc = VotingPowerCalculator::default();
        assert_eq!(calc.calculate(MemberRole::Admin, 0), 300);
        assert_eq!(calc.calculate(MemberRole::Council, 0), 200);
        assert_eq!(calc.calculate(MemberRole::Member, 0), 100);
        assert_eq!(calc.calculate(MemberRole::Observer, 5_000), 0);
    }

    #[test]
    fn test_contribution_bonus_is_capped() {
        let calc = VotingPowerCalculator::default();
        // 250 points = 25% bonus
        assert_eq!(calc.calculate(MemberRole::Member, 250), 125);
        // Cap at 100% bonus
        assert_eq!(calc.calculate(MemberRole::Member, 1_000_000), 200);
    }

    #[test]
    fn test_recompute_reports_change() {
        let calc = VotingPowerCalculator::default();
        let mut m = member("alice", 0, 0);
        m.contribution_score = 100;

        assert!(calc.recompute(&mut m));
        assert_eq!(m.voting_power, 110);
        assert!(!calc.recompute(&mut m));
    }

    #[test]
    fn test_quorum_zero_power_is_indeterminate() {
        let tally = VoteTally::default();
        assert_eq!(evaluate_quorum(&tally, 0, 20, 51), QuorumOutcome::Indeterminate);
        assert!(!evaluate_quorum(&tally, 0, 20, 51).passed());
    }

    #[test]
    fn test_quorum_and_approval() {
        let tally = VoteTally {
            yes: 300,
            no: 100,
            abstain: 100,
        };

        let outcome = evaluate_quorum(&tally, 1000, 50, 51);
        match outcome {
            QuorumOutcome::Evaluated(report) => {
                assert_eq!(report.votes_cast, 500);
                assert_eq!(report.quorum_required, 500);
                assert!(report.quorum_met);
                assert_eq!(report.approval_percentage, 75);
                assert!(report.approval_met);
                assert!(report.passed());
            }
            QuorumOutcome::Indeterminate => panic!("expected evaluation"),
        }

        // Same votes but quorum 60% of 1000 is not reached
        assert!(!evaluate_quorum(&tally, 1000, 60, 51).passed());
    }

    #[test]
    fn test_only_abstentions_never_pass() {
        let tally = VoteTally {
            yes: 0,
            no: 0,
            abstain: 1000,
        };
        assert!(!evaluate_quorum(&tally, 1000, 10, 1).passed());
    }

    #[test]
    fn test_ranking_breaks_ties_by_join_date() {
        let ranked = rank_members(vec![
            member("late", 200, 10),
            member("top", 500, 20),
            member("early", 200, 1),
        ]);

        let order: Vec<&str> = ranked.iter().map(|r| r.member.user_id.as_str()).collect();
        assert_eq!(order, vec!["top", "early", "late"]);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[2].rank, 3);
    }

    mod proptest_voting_power {
        use super::*;
        use proptest::prelude::*;

        fn role_strategy() -> impl Strategy<Value = MemberRole> {
            prop_oneof![
                Just(MemberRole::Admin),
                Just(MemberRole::Council),
                Just(MemberRole::Member),
                Just(MemberRole::Observer),
            ]
        }

        proptest! {
            #[test]
            fn calculate_is_deterministic(role in role_strategy(), score in 0u64..10_000_000) {
                let calc = VotingPowerCalculator::default();
                prop_assert_eq!(calc.calculate(role, score), calc.calculate(role, score));
            }

            #[test]
            fn power_is_monotonic_in_contribution(role in role_strategy(), a in 0u64..100_000, b in 0u64..100_000) {
                let calc = VotingPowerCalculator::default();
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                prop_assert!(calc.calculate(role, lo) <= calc.calculate(role, hi));
            }

            #[test]
            fn ranking_is_sorted(powers in proptest::collection::vec((0u64..1_000, 0i64..365), 0..30)) {
                let members: Vec<DaoMember> = powers
                    .iter()
                    .enumerate()
                    .map(|(i, (p, d))| member(&format!("user{}", i), *p, *d))
                    .collect();
                let ranked = rank_members(members);
                for pair in ranked.windows(2) {
                    let (a, b) = (&pair[0].member, &pair[1].member);
                    prop_assert!(a.voting_power > b.voting_power
                        || (a.voting_power == b.voting_power && a.joined_at <= b.joined_at));
                }
            }
        }
    }
}
