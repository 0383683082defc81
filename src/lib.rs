// Library interface for the DePIN governance engine
// The daemon binary and the HTTP/WebSocket layer both build on these modules
//
// Data flow:
//   proposals / funding / milestone  ->  execution_queue  ->  dispatcher  ->  store
//                                                  \-> notifier (events)

pub mod approval;
pub mod clock;
pub mod config;
pub mod dao;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod execution_queue;
pub mod funding;
pub mod milestone;
pub mod notifier;
pub mod persistence;
pub mod proposals;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod voting_power;

pub use engine::GovernanceEngine;
pub use error::{GovernanceError, GovernanceResult};
