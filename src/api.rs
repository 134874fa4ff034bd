//! Request and response bodies of the control API.
//!
//! Shared by the server and by [`crate::client::SupervisorClient`].

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::avatar::AvatarInfo;
use crate::supervisor::{JobKind, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub status: String,
    pub name: String,
    pub pid: u32,
    pub webrtc_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    /// `stopped` or `not_running`.
    pub status: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub name: String,
    /// Video, or a still image that is converted to one first.
    pub input_media_path: PathBuf,
    pub reference_audio_path: PathBuf,
    #[serde(default)]
    pub reference_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainResponse {
    pub status: String,
    pub name: String,
}

/// What `GET /status/{name}` reports.
///
/// `state` is one of `idle`, `running`, `succeeded`, `failed` or `not_found`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarStatus {
    pub name: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<JobKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Whether a trained artifact is in the published directory.
    #[serde(default)]
    pub published: bool,
}

impl AvatarStatus {
    pub fn from_job(job: JobStatus, published: bool) -> Self {
        Self {
            state: job.state.to_string().to_ascii_lowercase(),
            kind: Some(job.kind),
            pid: job.pid,
            error: job.error,
            exit_code: job.exit_code,
            started_at: job.started_at,
            log_path: job.log_path,
            name: job.name,
            published,
        }
    }

    /// No job on record.
    pub fn without_job(name: String, state: &str, published: bool) -> Self {
        Self {
            name,
            state: state.to_string(),
            kind: None,
            pid: None,
            error: None,
            exit_code: None,
            started_at: None,
            log_path: None,
            published,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state.as_str(), "succeeded" | "failed")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Published avatars.
    pub avatars: usize,
    /// Serving jobs running.
    pub running: usize,
    /// Training jobs running.
    pub training: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarsResponse {
    pub avatars: Vec<AvatarInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub id: Uuid,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
