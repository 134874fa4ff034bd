use std::fmt;

use serde::{Deserialize, Serialize};

/// What a job does with its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One-shot: consumes media, writes an artifact, exits.
    Training,
    /// Long-running: renders until stopped.
    Serving,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Training => write!(f, "training"),
            JobKind::Serving => write!(f, "serving"),
        }
    }
}

/// The four states of a supervised job.
///
/// Each run flows through: IDLE → RUNNING → {SUCCEEDED, FAILED} → IDLE,
/// or RUNNING → IDLE when stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Idle => write!(f, "IDLE"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

impl JobState {
    /// Whether `self -> next` is one of the permitted edges.
    ///
    /// - `Idle` may only start running.
    /// - `Running` may finish (either way) or be stopped back to `Idle`.
    /// - Terminal states may only be re-armed to `Idle`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Idle, JobState::Running)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Idle)
                | (JobState::Succeeded, JobState::Idle)
                | (JobState::Failed, JobState::Idle)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn is_running(self) -> bool {
        self == JobState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 4] = [
        JobState::Idle,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
    ];

    #[test]
    fn happy_path_edges_are_allowed() {
        assert!(JobState::Idle.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
        assert!(JobState::Succeeded.can_transition_to(JobState::Idle));
    }

    #[test]
    fn stop_and_failure_edges_are_allowed() {
        assert!(JobState::Running.can_transition_to(JobState::Idle));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Failed.can_transition_to(JobState::Idle));
    }

    #[test]
    fn running_cannot_restart() {
        assert!(!JobState::Running.can_transition_to(JobState::Running));
    }

    #[test]
    fn terminal_states_must_rearm_first() {
        for terminal in [JobState::Succeeded, JobState::Failed] {
            assert!(!terminal.can_transition_to(JobState::Running));
            assert!(!terminal.can_transition_to(JobState::Succeeded));
            assert!(!terminal.can_transition_to(JobState::Failed));
        }
    }

    #[test]
    fn idle_only_leads_to_running() {
        let targets: Vec<JobState> = ALL
            .into_iter()
            .filter(|s| JobState::Idle.can_transition_to(*s))
            .collect();
        assert_eq!(targets, vec![JobState::Running]);
    }

    #[test]
    fn state_display() {
        assert_eq!(JobState::Idle.to_string(), "IDLE");
        assert_eq!(JobState::Running.to_string(), "RUNNING");
        assert_eq!(JobState::Succeeded.to_string(), "SUCCEEDED");
        assert_eq!(JobState::Failed.to_string(), "FAILED");
        assert_eq!(JobKind::Training.to_string(), "training");
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobState::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(serde_json::to_string(&JobKind::Serving).unwrap(), "\"serving\"");
    }
}
