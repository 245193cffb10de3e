#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Allocation engine for `rv`: remote execution, scheduler adaptation,
//! strategy fan-out, batch-script synthesis, and log tailing.

/// Public data model shared by the engine's components.
pub mod api;

pub mod allocator;
pub mod remote;
pub mod script;
pub mod slurm;
pub mod tailer;

pub use api::{
    AllocationOutcome, BackfillProbe, GresCheck, Strategy, StrategyKind, Submission,
    SubmissionState, Topology, UserRequest,
};
pub use remote::{RemoteExecutor, SyncOptions};
pub use slurm::{Job, JobState, Slurm};
