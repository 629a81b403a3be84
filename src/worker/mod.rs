//! Execution side of the scheduler.
//!
//! - [`backend`]: the submit/monitor contract and the Docker implementation
//! - [`executor`]: attempt, retry and backoff loop for one job
//! - [`pool`]: workers draining the dispatch queue under lock and caps
//!
//! # Worker flow
//!
//! 1. Dequeue the highest-priority entry
//! 2. Reserve a slot in the [`RunningSet`](crate::scheduler::RunningSet)
//! 3. Take the distributed lock for the job (contention discards the entry)
//! 4. Run the [`Executor`] to completion
//! 5. Release the lock and the slot, mark the entry done

pub mod backend;
pub mod executor;
pub mod pool;

pub use backend::{DockerBackend, ExecutionRequest, ExecutorBackend};
pub use executor::{BackoffPolicy, ExecutionOutcome, Executor};
pub use pool::{DispatchOutcome, Worker, WorkerContext};
