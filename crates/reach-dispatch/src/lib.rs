//! Scheduler loop that drains due outreach tasks through an execution agent.
//!
//! Each cycle polls the store per provider, re-checks mission state, consumes
//! admission quota, claims the task with a conditional transition, and
//! reconciles the agent's acknowledgment. Recovery is explicit: failed tasks
//! are re-admitted through [`Dispatcher::retry_task`] and abandoned ones are
//! failed by the staleness sweep.

use reach_quota::QuotaError;
use reach_store::StoreError;
use thiserror::Error;

mod admission;
mod agent;
mod runner;

pub use admission::{admit_task, readmit_task, AdmissionOutcome};
pub use agent::{AgentAck, ExecutionAgent, HttpRelayAgent};
pub use runner::{
    DispatchReport, Dispatcher, DispatcherConfig, DEFAULT_BATCH_SIZE, DEFAULT_POLL_INTERVAL,
    DEFAULT_STALE_AFTER,
};

/// Errors surfaced by the dispatcher and its agents.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
