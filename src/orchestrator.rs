use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local, Utc};
use tracing::{error, info, warn};

use crate::api::{AvatarStatus, HealthResponse, TrainRequest};
use crate::avatar::{AvatarInfo, AvatarRepository, Transcoder, is_image};
use crate::commands::{log_path, serving_command, training_command};
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::supervisor::{
    JobKind, JobOutcome, JobSpec, OsPlatform, Platform, ProcessSupervisor, StopOutcome,
    SupervisorSettings,
};

/// Inputs remembered from a training request.
#[derive(Debug, Clone)]
pub struct TrainingSession {
    pub reference_text: String,
    pub audio_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Set while the request is still being prepared or trained.
    pub pending: bool,
    /// Failure before the training job could be started.
    pub error: Option<String>,
}

/// A serving job that survived its startup grace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedAvatar {
    pub name: String,
    pub pid: u32,
    pub webrtc_url: String,
}

/// Ties the supervisor to avatars on disk: what to run, with which inputs,
/// and what to do with the result.
pub struct AvatarOrchestrator<P: Platform = OsPlatform> {
    config: Arc<SupervisorConfig>,
    supervisor: ProcessSupervisor<P>,
    repository: AvatarRepository,
    transcoder: Transcoder,
    sessions: Arc<Mutex<HashMap<String, TrainingSession>>>,
}

impl<P: Platform> Clone for AvatarOrchestrator<P> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            supervisor: self.supervisor.clone(),
            repository: self.repository.clone(),
            transcoder: self.transcoder.clone(),
            sessions: Arc::clone(&self.sessions),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AvatarOrchestrator<OsPlatform> {
    pub fn new(config: SupervisorConfig) -> Self {
        let settings = SupervisorSettings::from_config(&config);
        Self::with_platform(config, OsPlatform, settings)
    }
}

impl<P: Platform> AvatarOrchestrator<P> {
    pub fn with_platform(config: SupervisorConfig, platform: P, settings: SupervisorSettings) -> Self {
        let repository = AvatarRepository::new(&config);
        let supervisor = ProcessSupervisor::new(platform, settings, Arc::new(repository.clone()));
        Self {
            transcoder: Transcoder::new(&config),
            config: Arc::new(config),
            supervisor,
            repository,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor<P> {
        &self.supervisor
    }

    pub fn repository(&self) -> &AvatarRepository {
        &self.repository
    }

    /// Launches the renderer for a published avatar.
    ///
    /// Reference text falls back to the training session, then to the
    /// configured default. Reference audio falls back to whatever the
    /// repository has on file.
    pub async fn start_avatar(
        &self,
        name: &str,
        ref_file: Option<String>,
        ref_text: Option<String>,
    ) -> Result<StartedAvatar, SupervisorError> {
        let id = self.repository.canonical_id(name);
        if !self.repository.exists(&id) {
            return Err(SupervisorError::AvatarNotFound(id));
        }

        let session = lock(&self.sessions).get(&id).cloned();
        let ref_text = ref_text
            .filter(|text| !text.trim().is_empty())
            .or_else(|| session.map(|s| s.reference_text))
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| self.config.default_ref_text.clone());
        let ref_file = match ref_file.filter(|file| !file.trim().is_empty()) {
            Some(file) => file,
            None => {
                let found = self.repository.reference_audio(&id).ok_or_else(|| {
                    SupervisorError::InvalidRequest(format!("no reference audio available for {id}"))
                })?;
                // The renderer runs with the tool root as its working directory.
                std::path::absolute(found)?.to_string_lossy().to_string()
            }
        };

        let spec = JobSpec {
            name: id.clone(),
            kind: JobKind::Serving,
            command: serving_command(&self.config, &id, &ref_file, &ref_text),
            log_path: log_path(&self.config, JobKind::Serving, &id),
        };
        let started = self.supervisor.start_job(spec).await?;
        info!(name = %id, pid = started.pid, "avatar serving");

        Ok(StartedAvatar {
            name: id,
            pid: started.pid,
            webrtc_url: self.config.webrtc_url.clone(),
        })
    }

    pub async fn stop_avatar(&self, name: &str) -> Result<(String, StopOutcome), SupervisorError> {
        let id = self.repository.canonical_id(name);
        let outcome = self.supervisor.stop_job(&id).await?;
        Ok((id, outcome))
    }

    pub async fn status(&self, name: &str) -> AvatarStatus {
        let id = self.repository.canonical_id(name);
        let published = self.repository.exists(&id);
        let job = self.supervisor.query_job(&id).await;
        let session = lock(&self.sessions).get(&id).cloned();

        // A preparation failure is newer than any job it never got to start,
        // but never masks a live process.
        if let Some(session) = session
            && let Some(err) = session.error
            && job.as_ref().is_none_or(|job| {
                !job.state.is_running() && job.started_at.is_none_or(|at| at < session.created_at)
            })
        {
            let mut status = AvatarStatus::without_job(id, "failed", published);
            status.kind = Some(JobKind::Training);
            status.error = Some(err);
            return status;
        }

        match job {
            Some(job) => AvatarStatus::from_job(job, published),
            None if published => AvatarStatus::without_job(id, "idle", true),
            None => AvatarStatus::without_job(id, "not_found", false),
        }
    }

    pub fn avatars(&self) -> Result<Vec<AvatarInfo>, SupervisorError> {
        Ok(self.repository.list()?)
    }

    pub fn health(&self) -> HealthResponse {
        let counts = self.supervisor.counts();
        let avatars = match self.repository.list() {
            Ok(avatars) => avatars.len(),
            Err(err) => {
                warn!(error = %err, "could not list avatars for health check");
                0
            }
        };
        HealthResponse {
            status: "ok".to_string(),
            avatars,
            running: counts.running,
            training: counts.training,
        }
    }

    /// Accepts a training request and runs it in the background.
    ///
    /// Returns the canonical avatar id as soon as the request is recorded.
    pub async fn train_avatar(&self, request: TrainRequest) -> Result<String, SupervisorError> {
        if request.name.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest("name must not be empty".into()));
        }
        if !request.input_media_path.is_file() {
            return Err(SupervisorError::InvalidRequest(format!(
                "input media not found: {}",
                request.input_media_path.display()
            )));
        }
        if !request.reference_audio_path.is_file() {
            return Err(SupervisorError::InvalidRequest(format!(
                "reference audio not found: {}",
                request.reference_audio_path.display()
            )));
        }

        let id = self.repository.canonical_id(&request.name);
        if self
            .supervisor
            .query_job(&id)
            .await
            .is_some_and(|job| job.state.is_running())
        {
            return Err(SupervisorError::AlreadyRunning(id));
        }

        {
            let mut sessions = lock(&self.sessions);
            if sessions.get(&id).is_some_and(|s| s.pending) {
                return Err(SupervisorError::AlreadyRunning(id));
            }
            let reference_text = if request.reference_text.trim().is_empty() {
                self.config.default_ref_text.clone()
            } else {
                request.reference_text.clone()
            };
            sessions.insert(
                id.clone(),
                TrainingSession {
                    reference_text,
                    audio_path: request.reference_audio_path.clone(),
                    created_at: Utc::now(),
                    pending: true,
                    error: None,
                },
            );
        }

        info!(name = %id, input = %request.input_media_path.display(), "training accepted");
        let this = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let result = this.run_training(&task_id, &request).await;
            let mut sessions = lock(&this.sessions);
            if let Some(session) = sessions.get_mut(&task_id) {
                session.pending = false;
                if let Err(err) = result {
                    session.error = Some(err.to_string());
                }
            }
        });

        Ok(id)
    }

    /// Transcode if needed, train, wait, install the reference audio.
    ///
    /// Errors returned here happened before the job existed; failures of the
    /// job itself are on its status.
    async fn run_training(&self, id: &str, request: &TrainRequest) -> Result<(), SupervisorError> {
        let video = self.prepare_video(id, &request.input_media_path).await?;
        // The training script runs from its own directory.
        let video = std::path::absolute(video)?;

        let spec = JobSpec {
            name: id.to_string(),
            kind: JobKind::Training,
            command: training_command(&self.config, id, &video),
            log_path: log_path(&self.config, JobKind::Training, id),
        };
        if let Err(err) = self.supervisor.start_job(spec).await {
            error!(name = id, error = %err, "training could not start");
            return Err(err);
        }

        match self
            .supervisor
            .await_job(id, self.config.training_timeout())
            .await
        {
            Ok(JobOutcome::Succeeded) => {
                match self
                    .repository
                    .install_reference_audio(id, &request.reference_audio_path)
                {
                    Ok(path) => info!(name = id, audio = %path.display(), "training complete"),
                    Err(err) => warn!(name = id, error = %err, "trained, but reference audio not installed"),
                }
            }
            Ok(JobOutcome::Failed(reason)) => warn!(name = id, reason = %reason, "training failed"),
            Ok(JobOutcome::Stopped) => info!(name = id, "training stopped"),
            Err(err) => warn!(name = id, error = %err, "training did not finish"),
        }
        Ok(())
    }

    async fn prepare_video(&self, id: &str, input: &Path) -> Result<PathBuf, SupervisorError> {
        if !is_image(input) {
            return Ok(input.to_path_buf());
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let output = self
            .config
            .upload_dir
            .join("video")
            .join(format!("{stamp}_{id}_from_image.mp4"));
        self.transcoder.image_to_video(input, &output).await
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown_all().await;
    }
}
