//! # Execution Layer
//!
//! External-command invocation with output-existence idempotence, and the
//! fixed-size worker groups that stripe per-camera work across cooperating
//! workers with a barrier at every stage boundary.

pub mod runner;
pub mod worker_pool;

pub use runner::{runcmd, CommandRunner, DryRunRunner, ProcessRunner, RecordingRunner, RunOutcome, StageCommand};
pub use worker_pool::{SubGroup, WorkerGroup};
