//! Governance domain types
//!
//! DAOs, members, proposals and their payloads, votes and treasury records.
//! Funding requests and milestone verifications live in their own modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{GovernanceError, GovernanceResult};

/// Upper bound for a single treasury movement (guards against overflow in tallies)
pub const MAX_TRANSFER_AMOUNT: u64 = 1_000_000_000_000_000;

/// Shortest voting window a governance change may configure (1 hour)
pub const MIN_VOTING_PERIOD_SECS: u64 = 3_600;

/// Longest voting window a governance change may configure (30 days)
pub const MAX_VOTING_PERIOD_SECS: u64 = 30 * 24 * 3_600;

/// Generate a prefixed random identifier (e.g. `prop_1f2e3d4c5b6a7988`)
pub fn generate_id(prefix: &str) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    format!("{}_{}", prefix, hex::encode(bytes))
}

/// Status enums that are stored and filtered by their label
pub trait StatusLabel: Copy + PartialEq {
    fn as_str(&self) -> &'static str;
}

/// Filter for listing records by DAO and status
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter<S> {
    pub dao_id: Option<String>,
    pub status: Option<S>,
}

impl<S: StatusLabel> RecordFilter<S> {
    pub fn all() -> Self {
        Self {
            dao_id: None,
            status: None,
        }
    }

    pub fn dao(dao_id: impl Into<String>) -> Self {
        Self {
            dao_id: Some(dao_id.into()),
            status: None,
        }
    }

    pub fn status(status: S) -> Self {
        Self {
            dao_id: None,
            status: Some(status),
        }
    }

    pub fn with_status(mut self, status: S) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, dao_id: &str, status: S) -> bool {
        self.dao_id.as_deref().map_or(true, |d| d == dao_id)
            && self.status.map_or(true, |s| s == status)
    }
}

// =============================================================================
// DAO
// =============================================================================

/// Tunable governance parameters of a DAO
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaoParameters {
    /// Percentage of total voting power that must participate (1-100)
    pub quorum_percentage: u8,
    /// Percentage of decisive votes that must be YES (1-100)
    pub approval_threshold: u8,
    /// Length of the voting window in seconds
    pub voting_period_secs: u64,
    /// Voting power a member needs to create proposals
    pub min_proposer_power: u64,
}

impl Default for DaoParameters {
    fn default() -> Self {
        Self {
            quorum_percentage: 20,
            approval_threshold: 51,
            voting_period_secs: 3 * 24 * 3_600,
            min_proposer_power: 0,
        }
    }
}

impl DaoParameters {
    pub fn validate(&self) -> GovernanceResult<()> {
        if self.quorum_percentage == 0 || self.quorum_percentage > 100 {
            return Err(GovernanceError::Validation(format!(
                "quorum_percentage must be between 1 and 100, got {}",
                self.quorum_percentage
            )));
        }
        if self.approval_threshold == 0 || self.approval_threshold > 100 {
            return Err(GovernanceError::Validation(format!(
                "approval_threshold must be between 1 and 100, got {}",
                self.approval_threshold
            )));
        }
        if !(MIN_VOTING_PERIOD_SECS..=MAX_VOTING_PERIOD_SECS).contains(&self.voting_period_secs) {
            return Err(GovernanceError::Validation(format!(
                "voting_period_secs must be between {} and {}, got {}",
                MIN_VOTING_PERIOD_SECS, MAX_VOTING_PERIOD_SECS, self.voting_period_secs
            )));
        }
        Ok(())
    }

    /// Apply a single parameter change
    pub fn apply(&mut self, change: &ParameterChange) {
        match *change {
            ParameterChange::QuorumPercentage(v) => self.quorum_percentage = v,
            ParameterChange::ApprovalThreshold(v) => self.approval_threshold = v,
            ParameterChange::VotingPeriodSecs(v) => self.voting_period_secs = v,
            ParameterChange::MinProposerPower(v) => self.min_proposer_power = v,
        }
    }
}

/// A DAO with its parameters and treasury
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dao {
    pub id: String,
    pub name: String,
    pub parameters: DaoParameters,
    /// Treasury balance in token base units
    pub treasury_balance: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dao {
    pub fn new(name: impl Into<String>, parameters: DaoParameters, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_id("dao"),
            name: name.into(),
            parameters,
            treasury_balance: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// MEMBERS
// =============================================================================

/// Member roles, from most to least privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Council,
    Member,
    Observer,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Council => "council",
            MemberRole::Member => "member",
            MemberRole::Observer => "observer",
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberRole {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(MemberRole::Admin),
            "council" => Ok(MemberRole::Council),
            "member" => Ok(MemberRole::Member),
            "observer" => Ok(MemberRole::Observer),
            other => Err(GovernanceError::Validation(format!("unknown role: {}", other))),
        }
    }
}

/// Membership of a user in a DAO
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaoMember {
    pub user_id: String,
    pub dao_id: String,
    pub role: MemberRole,
    /// Derived from role and contribution score; see `VotingPowerCalculator`
    pub voting_power: u64,
    pub contribution_score: u64,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// PROPOSALS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    Treasury,
    Investment,
    Governance,
    Membership,
}

impl fmt::Display for ProposalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalType::Treasury => "treasury",
            ProposalType::Investment => "investment",
            ProposalType::Governance => "governance",
            ProposalType::Membership => "membership",
        };
        f.write_str(s)
    }
}

impl FromStr for ProposalType {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "treasury" => Ok(ProposalType::Treasury),
            "investment" => Ok(ProposalType::Investment),
            "governance" => Ok(ProposalType::Governance),
            "membership" => Ok(ProposalType::Membership),
            other => Err(GovernanceError::Validation(format!(
                "unknown proposal type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Draft,
    Active,
    Passed,
    /// Finalized without meeting quorum or approval
    Defeated,
    Executing,
    Executed,
    Failed,
    Cancelled,
}

impl ProposalStatus {
    pub const ALL: [ProposalStatus; 8] = [
        ProposalStatus::Draft,
        ProposalStatus::Active,
        ProposalStatus::Passed,
        ProposalStatus::Defeated,
        ProposalStatus::Executing,
        ProposalStatus::Executed,
        ProposalStatus::Failed,
        ProposalStatus::Cancelled,
    ];
}

impl FromStr for ProposalStatus {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| GovernanceError::Validation(format!("unknown proposal status: {}", s)))
    }
}

impl StatusLabel for ProposalStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::Active => "active",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Defeated => "defeated",
            ProposalStatus::Executing => "executing",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Failed => "failed",
            ProposalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single governance parameter change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "parameter", content = "value", rename_all = "snake_case")]
pub enum ParameterChange {
    QuorumPercentage(u8),
    ApprovalThreshold(u8),
    VotingPeriodSecs(u64),
    MinProposerPower(u64),
}

/// A single membership operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MembershipOperation {
    Add {
        user_id: String,
        role: MemberRole,
        #[serde(default)]
        contribution_score: u64,
    },
    Remove {
        user_id: String,
    },
    ChangeRole {
        user_id: String,
        role: MemberRole,
    },
}

impl MembershipOperation {
    pub fn user_id(&self) -> &str {
        match self {
            MembershipOperation::Add { user_id, .. }
            | MembershipOperation::Remove { user_id }
            | MembershipOperation::ChangeRole { user_id, .. } => user_id,
        }
    }
}

/// Type-specific description of what a proposal changes when executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProposalPayload {
    TreasuryTransfer {
        recipient: String,
        amount: u64,
        #[serde(default)]
        memo: Option<String>,
    },
    Investment {
        /// DePIN network or node program receiving the allocation
        target: String,
        amount: u64,
        #[serde(default)]
        expected_apy_bps: Option<u32>,
    },
    ParameterChange {
        changes: Vec<ParameterChange>,
    },
    MembershipChange {
        operations: Vec<MembershipOperation>,
    },
}

impl ProposalPayload {
    pub fn proposal_type(&self) -> ProposalType {
        match self {
            ProposalPayload::TreasuryTransfer { .. } => ProposalType::Treasury,
            ProposalPayload::Investment { .. } => ProposalType::Investment,
            ProposalPayload::ParameterChange { .. } => ProposalType::Governance,
            ProposalPayload::MembershipChange { .. } => ProposalType::Membership,
        }
    }

    /// Structural validation, independent of current DAO state
    pub fn validate(&self) -> GovernanceResult<()> {
        match self {
            ProposalPayload::TreasuryTransfer { recipient, amount, .. } => {
                require_text("recipient", recipient)?;
                validate_amount(*amount)
            }
            ProposalPayload::Investment { target, amount, .. } => {
                require_text("target", target)?;
                validate_amount(*amount)
            }
            ProposalPayload::ParameterChange { changes } => {
                if changes.is_empty() {
                    return Err(GovernanceError::Validation(
                        "parameter change proposal has no changes".to_string(),
                    ));
                }
                // Check each value in isolation against the default ranges
                for change in changes {
                    let mut params = DaoParameters::default();
                    params.apply(change);
                    params.validate()?;
                }
                Ok(())
            }
            ProposalPayload::MembershipChange { operations } => {
                if operations.is_empty() {
                    return Err(GovernanceError::Validation(
                        "membership proposal has no operations".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                for op in operations {
                    require_text("user_id", op.user_id())?;
                    if !seen.insert(op.user_id()) {
                        return Err(GovernanceError::Validation(format!(
                            "user {} appears in more than one membership operation",
                            op.user_id()
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

pub(crate) fn require_text(field: &str, value: &str) -> GovernanceResult<()> {
    if value.trim().is_empty() {
        return Err(GovernanceError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

pub(crate) fn validate_amount(amount: u64) -> GovernanceResult<()> {
    if amount == 0 {
        return Err(GovernanceError::Validation("amount must be greater than 0".to_string()));
    }
    if amount > MAX_TRANSFER_AMOUNT {
        return Err(GovernanceError::Validation(format!(
            "amount {} exceeds maximum of {}",
            amount, MAX_TRANSFER_AMOUNT
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

/// Voting-power weighted tally of a proposal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub yes: u64,
    pub no: u64,
    pub abstain: u64,
}

impl VoteTally {
    pub fn record(&mut self, choice: VoteChoice, power: u64) {
        match choice {
            VoteChoice::Yes => self.yes = self.yes.saturating_add(power),
            VoteChoice::No => self.no = self.no.saturating_add(power),
            VoteChoice::Abstain => self.abstain = self.abstain.saturating_add(power),
        }
    }

    /// All power that participated, abstentions included
    pub fn total_cast(&self) -> u64 {
        self.yes.saturating_add(self.no).saturating_add(self.abstain)
    }

    /// Power that took a side
    pub fn decisive(&self) -> u64 {
        self.yes.saturating_add(self.no)
    }
}

/// A member's vote on a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_id: String,
    pub voter: String,
    pub choice: VoteChoice,
    /// Voting power at the time the vote was cast
    pub voting_power: u64,
    pub cast_at: DateTime<Utc>,
}

/// A governance proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub dao_id: String,
    pub proposer: String,
    pub title: String,
    pub description: String,
    pub proposal_type: ProposalType,
    pub payload: ProposalPayload,
    pub status: ProposalStatus,
    pub tally: VoteTally,
    pub vote_start: Option<DateTime<Utc>>,
    pub vote_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Last execution error when the proposal ended in `Failed`
    pub failure_reason: Option<String>,
}

impl Proposal {
    /// Move to a new status, stamping the update time
    pub fn transition(&mut self, status: ProposalStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

// =============================================================================
// TREASURY RECORDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Transfer,
    Investment,
    FundingPayout,
    MilestonePayout,
}

/// Append-only ledger entry for treasury movements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryTransaction {
    pub id: String,
    pub dao_id: String,
    pub kind: TransactionKind,
    pub amount: u64,
    /// Recipient for outflows, depositor for inflows
    pub counterparty: String,
    /// Proposal, funding request or milestone that caused the movement
    pub reference: String,
    pub balance_after: u64,
    pub created_at: DateTime<Utc>,
}

/// Treasury funds allocated to a DePIN investment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentAllocation {
    pub id: String,
    pub dao_id: String,
    pub proposal_id: String,
    pub target: String,
    pub amount: u64,
    pub expected_apy_bps: Option<u32>,
    pub created_at: DateTime<Utc>,
}
