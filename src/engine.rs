//! Engine wiring
//!
//! Builds every service over one store, clock and broadcaster, and owns the
//! background tasks (queue driver, deadline sweeper) and their shutdown
//! channel.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StorageBackend, StorageConfig};
use crate::dao::DaoService;
use crate::dispatcher::ExecutionDispatcher;
use crate::error::GovernanceResult;
use crate::execution_queue::{ExecutionQueue, ShutdownSignal};
use crate::funding::FundingWorkflow;
use crate::milestone::MilestoneWorkflow;
use crate::notifier::EventBroadcaster;
use crate::persistence::SqliteStore;
use crate::proposals::ProposalService;
use crate::store::{GovernanceStore, MemoryStore};
use crate::sweeper::DeadlineSweeper;
use crate::voting_power::VotingPowerCalculator;

/// Open the store selected by the storage config
pub fn open_store(config: &StorageConfig) -> GovernanceResult<Arc<dyn GovernanceStore>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory governance store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::new(&config.sqlite_path)?)),
    }
}

pub struct GovernanceEngine {
    config: Config,
    store: Arc<dyn GovernanceStore>,
    clock: Arc<dyn Clock>,
    dao: Arc<DaoService>,
    proposals: Arc<ProposalService>,
    queue: Arc<ExecutionQueue>,
    funding: Arc<FundingWorkflow>,
    milestones: Arc<MilestoneWorkflow>,
    sweeper: Arc<DeadlineSweeper>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: ShutdownSignal,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl GovernanceEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn GovernanceStore>,
        broadcaster: Arc<dyn EventBroadcaster>,
    ) -> Self {
        Self::with_clock(config, store, broadcaster, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: Config,
        store: Arc<dyn GovernanceStore>,
        broadcaster: Arc<dyn EventBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, shutdown) = ShutdownSignal::new();
        let calculator = VotingPowerCalculator::new(config.voting.clone());

        let dispatcher = Arc::new(ExecutionDispatcher::new(
            store.clone(),
            calculator.clone(),
            clock.clone(),
            broadcaster.clone(),
        ));
        let queue = Arc::new(ExecutionQueue::new(
            config.queue.clone(),
            dispatcher.clone(),
            clock.clone(),
            broadcaster.clone(),
            shutdown.clone(),
        ));
        let dao = Arc::new(DaoService::new(
            store.clone(),
            dispatcher.clone(),
            calculator,
            clock.clone(),
            broadcaster.clone(),
        ));
        let proposals = Arc::new(ProposalService::new(
            store.clone(),
            dispatcher.clone(),
            clock.clone(),
            broadcaster.clone(),
        ));
        let funding = Arc::new(FundingWorkflow::new(
            store.clone(),
            dispatcher.clone(),
            queue.clone(),
            clock.clone(),
            broadcaster.clone(),
            config.workflow.clone(),
        ));
        let milestones = Arc::new(MilestoneWorkflow::new(
            store.clone(),
            dispatcher,
            queue.clone(),
            clock.clone(),
            broadcaster,
            config.workflow.clone(),
        ));
        let sweeper = Arc::new(DeadlineSweeper::new(
            store.clone(),
            proposals.clone(),
            queue.clone(),
            funding.clone(),
            milestones.clone(),
            clock.clone(),
            config.workflow.clone(),
        ));

        Self {
            config,
            store,
            clock,
            dao,
            proposals,
            queue,
            funding,
            milestones,
            sweeper,
            shutdown_tx,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GovernanceStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn dao(&self) -> &Arc<DaoService> {
        &self.dao
    }

    pub fn proposals(&self) -> &Arc<ProposalService> {
        &self.proposals
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    pub fn funding(&self) -> &Arc<FundingWorkflow> {
        &self.funding
    }

    pub fn milestones(&self) -> &Arc<MilestoneWorkflow> {
        &self.milestones
    }

    pub fn sweeper(&self) -> &Arc<DeadlineSweeper> {
        &self.sweeper
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Spawn the queue driver and, if enabled, the deadline sweeper
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            info!("Governance engine already running");
            return;
        }

        handles.push(self.queue.spawn_driver());
        if self.config.workflow.sweep_interval_secs > 0 {
            handles.push(self.sweeper.spawn(self.shutdown.clone()));
        }

        info!("Governance engine started ({} background tasks)", handles.len());
    }

    /// Signal shutdown and wait for background tasks to stop.
    ///
    /// An execution in flight finishes its planning but is cancelled before
    /// committing. Queued tasks, including those waiting to retry, are
    /// released and every target returns to its ready state.
    pub async fn shutdown(&self) {
        info!("Shutting down governance engine");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }

        self.queue.release_on_shutdown().await;

        info!("Governance engine stopped");
    }
}
