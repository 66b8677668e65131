//! Job scheduling for Shipyard image builds.
//!
//! Admits build jobs into a bounded set of active slots, parks the overflow
//! in a bounded pending set, and drives each job through its pipeline
//! (authorize, assemble, build, push). A periodic reconciliation pass
//! promotes pending jobs, prunes finished ones and reclaims engine resources.

pub mod job;
pub mod queue;
pub mod stage;

#[cfg(test)]
mod testing;

pub use job::{CancelReason, Job, JobTimeouts};
pub use queue::{JobQueue, QueueError, QueueStats, ReconcileStats};
pub use stage::{Stage, StageContext};
