//! The job registry and everything that mutates it.
//!
//! Locking: `jobs` is a plain mutex held only for short read-modify-write
//! sections, never across an await. Start, stop, expire and remove for the
//! same name are additionally serialized by a per-name async gate, so a stop
//! that returns has fully reaped the old tree before the next start runs.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{FailureReason, SupervisorError};

use super::job::{Job, JobOutcome, JobSpec, JobStatus, SharedHandle, StartedJob, StopOutcome};
use super::process::{OsPlatform, Platform, ProcessHandle};
use super::state::{JobKind, JobState};
use super::tree::terminate_tree;

/// Relocates a finished training artifact to where serving jobs read it.
pub trait ArtifactPublisher: Send + Sync + 'static {
    fn publish(&self, name: &str) -> Result<PathBuf, SupervisorError>;

    /// Drops whatever an earlier run of `name` left staged, so a new run
    /// can only ever publish its own output.
    fn discard(&self, name: &str) -> Result<(), SupervisorError>;
}

/// Timing knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub startup_grace: Duration,
    pub stop_grace: Duration,
    pub poll_interval: Duration,
    pub training_timeout: Option<Duration>,
    pub serving_timeout: Option<Duration>,
    pub log_tail_lines: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            startup_grace: config.startup_grace(),
            stop_grace: config.stop_grace(),
            poll_interval: config.poll_interval(),
            training_timeout: Some(config.training_timeout()),
            serving_timeout: config.serving_timeout(),
            log_tail_lines: config.log_tail_lines,
        }
    }

    /// Default deadline for a job of `kind`; `None` means watch liveness only.
    pub fn timeout_for(&self, kind: JobKind) -> Option<Duration> {
        match kind {
            JobKind::Training => self.training_timeout,
            JobKind::Serving => self.serving_timeout,
        }
    }
}

/// Running totals for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Serving jobs currently running.
    pub running: usize,
    /// Training jobs currently running.
    pub training: usize,
}

struct Inner<P: Platform> {
    platform: P,
    settings: SupervisorSettings,
    publisher: Arc<dyn ArtifactPublisher>,
    jobs: Mutex<HashMap<String, Job<P::Handle>>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Owns every external process this service launched.
///
/// Cheap to clone; clones share one registry.
pub struct ProcessSupervisor<P: Platform = OsPlatform> {
    inner: Arc<Inner<P>>,
}

impl<P: Platform> Clone for ProcessSupervisor<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: Platform> ProcessSupervisor<P> {
    pub fn new(
        platform: P,
        settings: SupervisorSettings,
        publisher: Arc<dyn ArtifactPublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                settings,
                publisher,
                jobs: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    fn gate(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = lock(&self.inner.gates);
        Arc::clone(gates.entry(name.to_string()).or_default())
    }

    /// Launches `spec` unless a job with the same name is already running.
    ///
    /// Serving jobs are re-checked after the startup grace interval; a process
    /// that already exited is reaped, the job is left `Idle` and the start
    /// fails with [`SupervisorError::StartupExited`]. Training jobs start from
    /// an empty staging slot.
    pub async fn start_job(&self, spec: JobSpec) -> Result<StartedJob, SupervisorError> {
        let gate = self.gate(&spec.name);
        let _guard = gate.lock().await;

        self.reconcile(&spec.name).await;
        if lock(&self.inner.jobs)
            .get(&spec.name)
            .is_some_and(|job| job.state.is_running())
        {
            return Err(SupervisorError::AlreadyRunning(spec.name));
        }
        if spec.kind == JobKind::Training {
            self.inner.publisher.discard(&spec.name)?;
        }

        let log = open_log(&spec.log_path)?;
        let handle = self
            .inner
            .platform
            .spawn(&spec.command, log)
            .map_err(|source| SupervisorError::Spawn {
                program: spec.command.program.clone(),
                source,
            })?;
        let pid = handle.id();
        let handle: SharedHandle<P::Handle> = Arc::new(tokio::sync::Mutex::new(handle));
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        info!(name = %spec.name, kind = %spec.kind, pid, command = %spec.command, "job started");

        {
            let mut jobs = lock(&self.inner.jobs);
            let job = jobs
                .entry(spec.name.clone())
                .or_insert_with(|| Job::new(spec.name.clone(), spec.kind));
            if job.state.is_terminal() {
                job.transition(JobState::Idle)?;
            }
            job.kind = spec.kind;
            job.transition(JobState::Running)?;
            job.pid = Some(pid);
            job.run_id = run_id;
            job.started_at = Some(Utc::now());
            job.log_path = Some(spec.log_path.clone());
            job.exit_code = None;
            job.failure = None;
            job.handle = Some(Arc::clone(&handle));
            job.cancel = cancel.clone();

            let monitor = tokio::spawn(monitor(
                Arc::clone(&self.inner),
                spec.name.clone(),
                spec.kind,
                run_id,
                Arc::clone(&handle),
                cancel,
                spec.log_path.clone(),
            ));
            job.monitor = Some(monitor);
        }

        let grace = self.inner.settings.startup_grace;
        if spec.kind == JobKind::Serving && !grace.is_zero() {
            tokio::time::sleep(grace).await;
            let exited = handle.lock().await.try_wait()?;
            if let Some(code) = exited {
                warn!(name = %spec.name, pid, code, "process exited during startup");
                self.abort_run(&spec.name, run_id, code).await;
                return Err(SupervisorError::StartupExited {
                    name: spec.name,
                    code,
                });
            }
        }

        Ok(StartedJob { pid, run_id })
    }

    /// Waits for the current run of `name` to finish.
    ///
    /// If `timeout` elapses first the process tree is terminated, the job is
    /// marked `Failed` with [`FailureReason::Timeout`] and the call fails with
    /// [`SupervisorError::Timeout`].
    pub async fn await_job(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<JobOutcome, SupervisorError> {
        let (mut updates, run_id) = {
            let jobs = lock(&self.inner.jobs);
            let job = jobs
                .get(name)
                .ok_or_else(|| SupervisorError::JobNotFound(name.to_string()))?;
            if !job.state.is_running() {
                return Ok(job.outcome());
            }
            (job.updates.subscribe(), job.run_id)
        };

        // A closed channel means the job was removed; treat it as finished.
        let finished = tokio::time::timeout(timeout, updates.wait_for(|state| !state.is_running()))
            .await
            .is_ok();
        if finished {
            return Ok(self.outcome_of(name, run_id));
        }

        let after_secs = timeout.as_secs();
        warn!(name, after_secs, "job timed out, terminating");
        let gate = self.gate(name);
        let _guard = gate.lock().await;
        match self
            .halt(name, Some(run_id), Some(FailureReason::Timeout { after_secs }))
            .await?
        {
            StopOutcome::Stopped { .. } => Err(SupervisorError::Timeout {
                name: name.to_string(),
                after_secs,
            }),
            // Finished while we were acquiring the gate.
            StopOutcome::NotRunning => Ok(self.outcome_of(name, run_id)),
        }
    }

    /// Terminates the process tree of `name` and re-arms the job to `Idle`.
    /// A tree that resists signals is logged; the job is re-armed anyway.
    pub async fn stop_job(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        let gate = self.gate(name);
        let _guard = gate.lock().await;
        self.halt(name, None, None).await
    }

    /// Current status of `name`, reconciling a stale `Running` first.
    pub async fn query_job(&self, name: &str) -> Option<JobStatus> {
        self.reconcile(name).await;
        lock(&self.inner.jobs).get(name).map(Job::status)
    }

    pub fn list_jobs(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = lock(&self.inner.jobs).values().map(Job::status).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn counts(&self) -> JobCounts {
        let jobs = lock(&self.inner.jobs);
        let mut counts = JobCounts::default();
        for job in jobs.values().filter(|job| job.state.is_running()) {
            match job.kind {
                JobKind::Serving => counts.running += 1,
                JobKind::Training => counts.training += 1,
            }
        }
        counts
    }

    /// Forgets a finished or idle job.
    pub async fn remove_job(&self, name: &str) -> Result<JobStatus, SupervisorError> {
        let gate = self.gate(name);
        let _guard = gate.lock().await;
        self.reconcile(name).await;

        let mut jobs = lock(&self.inner.jobs);
        match jobs.get(name) {
            None => Err(SupervisorError::JobNotFound(name.to_string())),
            Some(job) if job.state.is_running() => {
                Err(SupervisorError::AlreadyRunning(name.to_string()))
            }
            Some(_) => jobs
                .remove(name)
                .map(|job| job.status())
                .ok_or_else(|| SupervisorError::JobNotFound(name.to_string())),
        }
    }

    /// Stops every running job, best-effort and concurrently.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = lock(&self.inner.jobs)
            .values()
            .filter(|job| job.state.is_running())
            .map(|job| job.name.clone())
            .collect();
        if names.is_empty() {
            return;
        }
        info!(count = names.len(), "stopping all running jobs");

        // Descendants, parent terminate and parent kill each wait at most one
        // grace period; the extra second covers the process-table scans.
        let bound = self.inner.settings.stop_grace * 4 + Duration::from_secs(1);
        let mut stops = JoinSet::new();
        for name in names {
            let supervisor = self.clone();
            stops.spawn(async move {
                let result = tokio::time::timeout(bound, supervisor.stop_job(&name)).await;
                (name, result)
            });
        }

        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((name, Ok(Ok(_)))) => debug!(name = %name, "stopped during shutdown"),
                Ok((name, Ok(Err(err)))) => {
                    error!(name = %name, error = %err, "stop failed during shutdown")
                },
                Ok((name, Err(_))) => error!(name = %name, "stop timed out during shutdown"),
                Err(err) => error!(error = %err, "stop task panicked during shutdown"),
            }
        }
    }

    /// Shared stop path. `expected_run` restricts it to one specific run;
    /// `failure` makes the final state `Failed` instead of `Idle`.
    async fn halt(
        &self,
        name: &str,
        expected_run: Option<Uuid>,
        failure: Option<FailureReason>,
    ) -> Result<StopOutcome, SupervisorError> {
        let (handle, monitor, run_id, pid) = {
            let mut jobs = lock(&self.inner.jobs);
            let Some(job) = jobs.get_mut(name) else {
                return Ok(StopOutcome::NotRunning);
            };
            if !job.state.is_running() || expected_run.is_some_and(|run| run != job.run_id) {
                return Ok(StopOutcome::NotRunning);
            }
            job.cancel.cancel();
            (job.handle.clone(), job.monitor.take(), job.run_id, job.pid)
        };

        if let Some(monitor) = monitor
            && let Err(err) = monitor.await
        {
            warn!(name, error = %err, "monitor task ended abnormally");
        }

        let mut exit_code = None;
        if let Some(handle) = handle {
            let mut guard = handle.lock().await;
            match terminate_tree(
                &self.inner.platform,
                &mut *guard,
                self.inner.settings.stop_grace,
                self.inner.settings.poll_interval,
            )
            .await
            {
                Ok(report) => {
                    debug!(name, ?report, "process tree terminated");
                    exit_code = report.exit_code;
                }
                // The run is over for the registry either way; whatever
                // survived is only logged.
                Err(err) => {
                    error!(name, pid = ?pid, error = %err, "failed to terminate process tree")
                }
            }
        }

        {
            let mut jobs = lock(&self.inner.jobs);
            if let Some(job) = jobs.get_mut(name)
                && job.run_id == run_id
                && job.state.is_running()
            {
                match failure {
                    Some(reason) => {
                        job.transition(JobState::Failed)?;
                        job.failure = Some(reason);
                    }
                    None => job.transition(JobState::Idle)?,
                }
                job.exit_code = exit_code;
                job.release();
            }
        }

        info!(name, pid = ?pid, "job stopped");
        Ok(StopOutcome::Stopped {
            pid: pid.unwrap_or_default(),
        })
    }

    /// Undo a start whose process died inside the grace window.
    async fn abort_run(&self, name: &str, run_id: Uuid, code: i32) {
        let (monitor, handle) = {
            let mut jobs = lock(&self.inner.jobs);
            let Some(job) = jobs.get_mut(name) else {
                return;
            };
            if job.run_id != run_id {
                return;
            }
            job.cancel.cancel();
            (job.monitor.take(), job.handle.clone())
        };
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        if let Some(handle) = handle {
            // Reaps it if the grace check has not already.
            let _ = handle.lock().await.try_wait();
        }

        let mut jobs = lock(&self.inner.jobs);
        if let Some(job) = jobs.get_mut(name)
            && job.run_id == run_id
        {
            if job.state != JobState::Idle
                && let Err(err) = job.transition(JobState::Idle)
            {
                error!(name, error = %err, "failed to re-arm job after startup exit");
            }
            // Idle again, but the next status read still says why.
            job.exit_code = Some(code);
            job.failure = Some(FailureReason::StartupExited { code });
            job.release();
        }
    }

    /// If the registry says `Running` but the process is gone, record it now
    /// instead of waiting for the monitor's next tick. Successful training
    /// exits are left to the monitor, which owns the publish step.
    async fn reconcile(&self, name: &str) {
        let (handle, kind, run_id, cancel, log_path) = {
            let jobs = lock(&self.inner.jobs);
            let Some(job) = jobs.get(name) else {
                return;
            };
            let Some(handle) = job.handle.clone() else {
                return;
            };
            if !job.state.is_running() {
                return;
            }
            (handle, job.kind, job.run_id, job.cancel.clone(), job.log_path.clone())
        };

        // Busy means a stop or the monitor is mid-operation; they will settle it.
        let Ok(mut guard) = handle.try_lock() else {
            return;
        };
        let code = match guard.try_wait() {
            Ok(Some(code)) => code,
            _ => return,
        };
        drop(guard);

        if kind == JobKind::Training && code == 0 {
            return;
        }
        let outcome = if code == 0 {
            Ok(())
        } else {
            Err(nonzero_exit(code, log_path.as_deref(), self.inner.settings.log_tail_lines).await)
        };
        debug!(name, code, "reconciled exited process");
        self.inner.finish(name, run_id, &cancel, outcome, Some(code));
    }

    fn outcome_of(&self, name: &str, run_id: Uuid) -> JobOutcome {
        lock(&self.inner.jobs)
            .get(name)
            .filter(|job| job.run_id == run_id)
            .map_or(JobOutcome::Stopped, Job::outcome)
    }
}

impl<P: Platform> Inner<P> {
    /// Records the end of a run. Ignored when the run was cancelled,
    /// superseded, or already finished by someone else.
    fn finish(
        &self,
        name: &str,
        run_id: Uuid,
        cancel: &CancellationToken,
        outcome: Result<(), FailureReason>,
        exit_code: Option<i32>,
    ) -> bool {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(name) else {
            return false;
        };
        if cancel.is_cancelled() || job.run_id != run_id || !job.state.is_running() {
            return false;
        }

        let result = match outcome {
            Ok(()) => job.transition(JobState::Succeeded),
            Err(reason) => {
                let applied = job.transition(JobState::Failed);
                if applied.is_ok() {
                    warn!(name, kind = %job.kind, reason = %reason, "job failed");
                    job.failure = Some(reason);
                }
                applied
            }
        };
        if let Err(err) = result {
            error!(name, error = %err, "could not record job outcome");
            return false;
        }

        job.exit_code = exit_code;
        job.release();
        info!(name, kind = %job.kind, state = %job.state, "job finished");
        true
    }
}

/// The single background task watching one run.
async fn monitor<P: Platform>(
    inner: Arc<Inner<P>>,
    name: String,
    kind: JobKind,
    run_id: Uuid,
    handle: SharedHandle<P::Handle>,
    cancel: CancellationToken,
    log_path: PathBuf,
) {
    let started = Instant::now();
    let deadline = inner.settings.timeout_for(kind);

    let code = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.settings.poll_interval) => {}
        }

        match handle.lock().await.try_wait() {
            Ok(Some(code)) => break code,
            Ok(None) => {}
            Err(err) => warn!(name = %name, error = %err, "failed to poll process"),
        }

        if let Some(limit) = deadline
            && started.elapsed() >= limit
        {
            let after_secs = limit.as_secs();
            warn!(name = %name, after_secs, "job exceeded its deadline, terminating");
            let exit_code = {
                let mut guard = handle.lock().await;
                match terminate_tree(
                    &inner.platform,
                    &mut *guard,
                    inner.settings.stop_grace,
                    inner.settings.poll_interval,
                )
                .await
                {
                    Ok(report) => report.exit_code,
                    Err(err) => {
                        error!(name = %name, error = %err, "failed to terminate timed out job");
                        None
                    }
                }
            };
            inner.finish(
                &name,
                run_id,
                &cancel,
                Err(FailureReason::Timeout { after_secs }),
                exit_code,
            );
            return;
        }
    };

    let outcome = if code != 0 {
        Err(nonzero_exit(code, Some(&log_path), inner.settings.log_tail_lines).await)
    } else if kind == JobKind::Training {
        if cancel.is_cancelled() {
            return;
        }
        let publisher = Arc::clone(&inner.publisher);
        let artifact = name.clone();
        match tokio::task::spawn_blocking(move || publisher.publish(&artifact)).await {
            Ok(Ok(path)) => {
                info!(name = %name, path = %path.display(), "artifact published");
                Ok(())
            }
            Ok(Err(err)) => Err(FailureReason::from(&err)),
            Err(err) => Err(FailureReason::PublishFailed {
                message: err.to_string(),
            }),
        }
    } else {
        Ok(())
    };

    inner.finish(&name, run_id, &cancel, outcome, Some(code));
}

fn open_log(path: &Path) -> Result<File, SupervisorError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(File::create(path)?)
}

async fn nonzero_exit(code: i32, log_path: Option<&Path>, lines: usize) -> FailureReason {
    let log_tail = match log_path {
        Some(path) => read_tail(path, lines).await,
        None => String::new(),
    };
    FailureReason::NonZeroExit { code, log_tail }
}

/// Last `lines` lines of a log, lossily decoded.
pub async fn read_tail(path: &Path, lines: usize) -> String {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n").trim().to_string()
}
