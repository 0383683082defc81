//! Broadcast seam for governance state transitions
//!
//! The WebSocket layer subscribes to a [`ChannelBroadcaster`] and fans
//! events out to dashboard clients. Headless runs use [`LogBroadcaster`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::types::ProposalStatus;

/// Default buffer for the broadcast channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GovernanceEvent {
    ProposalFinalized {
        proposal_id: String,
        dao_id: String,
        status: ProposalStatus,
    },
    ProposalExecuted {
        proposal_id: String,
        dao_id: String,
    },
    ProposalExecutionFailed {
        proposal_id: String,
        dao_id: String,
        error: String,
    },
    ExecutionCancelled {
        target: String,
        reason: String,
    },
    FundingApproved {
        request_id: String,
        dao_id: String,
        amount: u64,
    },
    FundingRejected {
        request_id: String,
        dao_id: String,
    },
    FundingPaid {
        request_id: String,
        dao_id: String,
        amount: u64,
    },
    FundingExpired {
        request_id: String,
        dao_id: String,
    },
    MilestoneVerified {
        milestone_id: String,
        dao_id: String,
        payout_amount: u64,
    },
    MilestoneRejected {
        milestone_id: String,
        dao_id: String,
    },
    MilestonePaid {
        milestone_id: String,
        dao_id: String,
        payout_amount: u64,
    },
    MilestoneExpired {
        milestone_id: String,
        dao_id: String,
    },
    PayoutFailed {
        target: String,
        error: String,
    },
    MemberUpdated {
        dao_id: String,
        user_id: String,
        voting_power: u64,
    },
}

impl GovernanceEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            GovernanceEvent::ProposalFinalized { .. } => "proposal_finalized",
            GovernanceEvent::ProposalExecuted { .. } => "proposal_executed",
            GovernanceEvent::ProposalExecutionFailed { .. } => "proposal_execution_failed",
            GovernanceEvent::ExecutionCancelled { .. } => "execution_cancelled",
            GovernanceEvent::FundingApproved { .. } => "funding_approved",
            GovernanceEvent::FundingRejected { .. } => "funding_rejected",
            GovernanceEvent::FundingPaid { .. } => "funding_paid",
            GovernanceEvent::FundingExpired { .. } => "funding_expired",
            GovernanceEvent::MilestoneVerified { .. } => "milestone_verified",
            GovernanceEvent::MilestoneRejected { .. } => "milestone_rejected",
            GovernanceEvent::MilestonePaid { .. } => "milestone_paid",
            GovernanceEvent::MilestoneExpired { .. } => "milestone_expired",
            GovernanceEvent::PayoutFailed { .. } => "payout_failed",
            GovernanceEvent::MemberUpdated { .. } => "member_updated",
        }
    }
}

/// Event plus the time it was emitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GovernanceEvent,
}

pub trait EventBroadcaster: Send + Sync {
    fn broadcast(&self, event: GovernanceEvent);
}

/// Fan-out over a tokio broadcast channel. Envelopes are stamped with the
/// engine's clock.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<EventEnvelope>,
    clock: Arc<dyn Clock>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, clock }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: GovernanceEvent) {
        let kind = event.event_type();
        let envelope = EventEnvelope {
            emitted_at: self.clock.now(),
            event,
        };
        // No subscribers is not an error
        match self.tx.send(envelope) {
            Ok(n) => debug!("Broadcast {} to {} subscribers", kind, n),
            Err(_) => debug!("Broadcast {} dropped (no subscribers)", kind),
        }
    }
}

/// Writes events to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBroadcaster;

impl EventBroadcaster for LogBroadcaster {
    fn broadcast(&self, event: GovernanceEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(event = event.event_type(), "{}", json),
            Err(_) => info!(event = event.event_type(), "governance event"),
        }
    }
}
