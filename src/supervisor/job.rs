use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::commands::CommandSpec;
use crate::error::{FailureReason, SupervisorError};

use super::state::{JobKind, JobState};

/// A process handle shared between the registry, its monitor and stop calls.
pub type SharedHandle<H> = Arc<Mutex<H>>;

/// What to launch for a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub kind: JobKind,
    pub command: CommandSpec,
    pub log_path: PathBuf,
}

/// Result of a successful start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedJob {
    pub pid: u32,
    pub run_id: Uuid,
}

/// How an awaited run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(FailureReason),
    /// Stopped (or removed) before it finished.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32 },
    NotRunning,
}

/// Snapshot of a job, safe to hand out of the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub kind: JobKind,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub history: Vec<JobState>,
}

/// One named unit of external work, as held in the registry.
#[derive(Debug)]
pub struct Job<H> {
    pub name: String,
    pub kind: JobKind,
    pub state: JobState,
    pub pid: Option<u32>,
    pub run_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub log_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub history: Vec<JobState>,
    pub(super) handle: Option<SharedHandle<H>>,
    pub(super) monitor: Option<JoinHandle<()>>,
    pub(super) cancel: CancellationToken,
    pub(super) updates: watch::Sender<JobState>,
}

impl<H> Job<H> {
    pub fn new(name: String, kind: JobKind) -> Self {
        let (updates, _) = watch::channel(JobState::Idle);
        Self {
            name,
            kind,
            state: JobState::Idle,
            pid: None,
            run_id: Uuid::nil(),
            started_at: None,
            log_path: None,
            exit_code: None,
            failure: None,
            history: Vec::new(),
            handle: None,
            monitor: None,
            cancel: CancellationToken::new(),
            updates,
        }
    }

    /// Applies a validated state change and notifies waiters.
    pub fn transition(&mut self, next: JobState) -> Result<(), SupervisorError> {
        if !self.state.can_transition_to(next) {
            return Err(SupervisorError::InvalidTransition {
                kind: self.kind,
                from: self.state,
                to: next,
            });
        }
        self.history.push(self.state);
        self.state = next;
        self.updates.send_replace(next);
        Ok(())
    }

    /// Drops process ownership. Only called once the process is reaped.
    pub(super) fn release(&mut self) {
        self.handle = None;
        self.pid = None;
        self.monitor = None;
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            name: self.name.clone(),
            kind: self.kind,
            state: self.state,
            pid: self.pid,
            error: self.failure.as_ref().map(ToString::to_string),
            failure: self.failure.clone(),
            exit_code: self.exit_code,
            started_at: self.started_at,
            log_path: self.log_path.clone(),
            history: self.history.iter().copied().chain([self.state]).collect(),
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        match self.state {
            JobState::Succeeded => JobOutcome::Succeeded,
            JobState::Failed => JobOutcome::Failed(
                self.failure
                    .clone()
                    .unwrap_or(FailureReason::Spawn {
                        message: "unknown failure".into(),
                    }),
            ),
            JobState::Idle | JobState::Running => JobOutcome::Stopped,
        }
    }
}
