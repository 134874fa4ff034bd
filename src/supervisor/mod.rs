//! Supervision of external tool processes.
//!
//! A [`ProcessSupervisor`] keeps one [`Job`] per avatar name, launches its
//! process with output captured to a log, watches it from a background
//! task and tears down the whole process tree on stop, timeout or shutdown.

mod job;
mod process;
mod registry;
mod state;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;

pub use job::{Job, JobOutcome, JobSpec, JobStatus, SharedHandle, StartedJob, StopOutcome};
pub use process::{OsPlatform, OsProcess, Platform, ProcessHandle, Signal, exit_code};
pub use registry::{
    ArtifactPublisher, JobCounts, ProcessSupervisor, SupervisorSettings, read_tail,
};
pub use state::{JobKind, JobState};
