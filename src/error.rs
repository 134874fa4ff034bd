use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::{JobKind, JobState};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Job already running: {0}")]
    AlreadyRunning(String),

    #[error("Process for {name} exited during startup (code {code})")]
    StartupExited { name: String, code: i32 },

    #[error("Job {name} timed out after {after_secs}s")]
    Timeout { name: String, after_secs: u64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Avatar not found: {0}")]
    AvatarNotFound(String),

    #[error("Training produced no artifact at {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("Publish failed for {name}: {message}")]
    PublishFailed { name: String, message: String },

    #[error("Invalid transition for {kind} job: {from} -> {to}")]
    InvalidTransition {
        kind: JobKind,
        from: JobState,
        to: JobState,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("Transcode failed: {0}")]
    Transcode(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a job ended up in the `Failed` state.
///
/// Stored on the job and returned verbatim by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The process exited inside the startup grace window.
    StartupExited { code: i32 },
    /// The job ran past its deadline and was tree-terminated.
    Timeout { after_secs: u64 },
    /// The external tool reported failure.
    NonZeroExit { code: i32, log_tail: String },
    /// Exit 0, but nothing at the staging path.
    ArtifactMissing { path: PathBuf },
    /// The staged artifact could not be relocated. It is left in place.
    PublishFailed { message: String },
    /// The command could not be launched at all.
    Spawn { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::StartupExited { code } => {
                write!(f, "process exited during startup (code {code})")
            }
            FailureReason::Timeout { after_secs } => write!(f, "timed out after {after_secs}s"),
            FailureReason::NonZeroExit { code, log_tail } if log_tail.is_empty() => {
                write!(f, "exited with code {code}")
            }
            FailureReason::NonZeroExit { code, log_tail } => {
                write!(f, "exited with code {code}: {log_tail}")
            }
            FailureReason::ArtifactMissing { path } => {
                write!(f, "no artifact at {}", path.display())
            }
            FailureReason::PublishFailed { message } => write!(f, "publish failed: {message}"),
            FailureReason::Spawn { message } => write!(f, "spawn failed: {message}"),
        }
    }
}

impl From<&SupervisorError> for FailureReason {
    fn from(err: &SupervisorError) -> Self {
        match err {
            SupervisorError::ArtifactMissing(path) => FailureReason::ArtifactMissing {
                path: path.clone(),
            },
            SupervisorError::StartupExited { code, .. } => {
                FailureReason::StartupExited { code: *code }
            }
            SupervisorError::Timeout { after_secs, .. } => FailureReason::Timeout {
                after_secs: *after_secs,
            },
            SupervisorError::Spawn { source, .. } => FailureReason::Spawn {
                message: source.to_string(),
            },
            other => FailureReason::PublishFailed {
                message: other.to_string(),
            },
        }
    }
}
