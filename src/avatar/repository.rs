//! Published avatars on disk.
//!
//! Training writes to `<results_dir>/<id>`; the renderer reads
//! `<avatars_dir>/<id>`. [`AvatarRepository::publish`] moves one into the
//! other without ever leaving the destination half-written.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::supervisor::ArtifactPublisher;

/// One published avatar as listed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarInfo {
    /// Full id, prefix included.
    pub id: String,
    /// Id without the model prefix.
    pub name: String,
    pub path: PathBuf,
    /// Whether a reference wav was installed for it.
    pub has_audio: bool,
}

#[derive(Debug, Clone)]
pub struct AvatarRepository {
    results_dir: PathBuf,
    avatars_dir: PathBuf,
    wav_dir: PathBuf,
    prefix: String,
}

impl AvatarRepository {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self::with_dirs(
            config.results_dir(),
            config.avatars_dir(),
            config.wav_dir(),
            config.avatar_prefix.clone(),
        )
    }

    pub fn with_dirs(
        results_dir: impl Into<PathBuf>,
        avatars_dir: impl Into<PathBuf>,
        wav_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            results_dir: results_dir.into(),
            avatars_dir: avatars_dir.into(),
            wav_dir: wav_dir.into(),
            prefix: prefix.into(),
        }
    }

    /// `anna` becomes `wav2lip256_anna`; already prefixed ids pass through.
    pub fn canonical_id(&self, raw: &str) -> String {
        let raw = raw.trim();
        if raw.starts_with(&self.prefix) {
            raw.to_string()
        } else {
            format!("{}{raw}", self.prefix)
        }
    }

    pub fn staged_path(&self, name: &str) -> PathBuf {
        self.results_dir.join(name)
    }

    pub fn published_path(&self, name: &str) -> PathBuf {
        self.avatars_dir.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.published_path(name).is_dir()
    }

    /// Every published avatar, sorted by id. Backups are skipped.
    pub fn list(&self) -> io::Result<Vec<AvatarInfo>> {
        let entries = match fs::read_dir(&self.avatars_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut avatars = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if !id.starts_with(&self.prefix) || id.contains("_backup_") {
                continue;
            }
            avatars.push(AvatarInfo {
                name: id[self.prefix.len()..].to_string(),
                path: entry.path(),
                has_audio: self.wav_dir.join(format!("{id}.wav")).is_file(),
                id,
            });
        }
        avatars.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(avatars)
    }

    /// Removes the staged output of `name`, if any. Leftovers of a stopped or
    /// timed-out run must never be published by a later run.
    pub fn discard_staged(&self, name: &str) -> Result<(), SupervisorError> {
        let staged = self.staged_path(name);
        match fs::remove_dir_all(&staged) {
            Ok(()) => {
                debug!(name, path = %staged.display(), "discarded stale staged output");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Moves the staged artifact of `name` into the published directory.
    pub fn publish(&self, name: &str) -> Result<PathBuf, SupervisorError> {
        self.publish_using(name, |from, to| fs::rename(from, to))
    }

    /// [`publish`](Self::publish) with the final staged-to-published move
    /// supplied by the caller.
    ///
    /// On failure the previously published artifact is put back and the
    /// staged directory is left where training wrote it.
    pub fn publish_using<F>(&self, name: &str, move_into: F) -> Result<PathBuf, SupervisorError>
    where
        F: Fn(&Path, &Path) -> io::Result<()>,
    {
        let staged = self.staged_path(name);
        if !staged.is_dir() {
            return Err(SupervisorError::ArtifactMissing(staged));
        }
        fs::create_dir_all(&self.avatars_dir)?;
        let dest = self.published_path(name);

        let backup = if dest.exists() {
            let backup = self.backup_path(name);
            fs::rename(&dest, &backup)?;
            info!(name, backup = %backup.display(), "displaced existing avatar");
            Some(backup)
        } else {
            None
        };

        let moved = match move_into(&staged, &dest) {
            Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                debug!(name, "staged artifact is on another filesystem, copying");
                self.copy_across(name, &staged, &dest)
            }
            other => other,
        };

        match moved {
            Ok(()) => {
                info!(name, path = %dest.display(), "avatar published");
                Ok(dest)
            }
            Err(err) => {
                if let Some(backup) = backup
                    && let Err(restore) = fs::rename(&backup, &dest)
                {
                    error!(
                        name,
                        backup = %backup.display(),
                        error = %restore,
                        "could not restore displaced avatar"
                    );
                }
                Err(SupervisorError::PublishFailed {
                    name: name.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Copies the staged tree into a hidden sibling of `dest`, renames that
    /// into place, and only then removes the staged original.
    fn copy_across(&self, name: &str, staged: &Path, dest: &Path) -> io::Result<()> {
        let incoming = self
            .avatars_dir
            .join(format!(".{name}.incoming-{}", short_id()));
        if let Err(err) = copy_tree(staged, &incoming).and_then(|()| fs::rename(&incoming, dest)) {
            let _ = fs::remove_dir_all(&incoming);
            return Err(err);
        }
        if let Err(err) = fs::remove_dir_all(staged) {
            warn!(name, error = %err, "published, but could not remove staged copy");
        }
        Ok(())
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup = self.avatars_dir.join(format!("{name}_backup_{stamp}"));
        if backup.exists() {
            self.avatars_dir
                .join(format!("{name}_backup_{stamp}_{}", short_id()))
        } else {
            backup
        }
    }

    /// Installs `source` as the reference wav of `name`.
    pub fn install_reference_audio(
        &self,
        name: &str,
        source: &Path,
    ) -> Result<PathBuf, SupervisorError> {
        fs::create_dir_all(&self.wav_dir)?;
        let target = self.wav_dir.join(format!("{name}.wav"));
        let tmp = self.wav_dir.join(format!(".{name}.wav.{}", short_id()));
        if let Err(err) = fs::copy(source, &tmp).and_then(|_| fs::rename(&tmp, &target)) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        debug!(name, path = %target.display(), "reference audio installed");
        Ok(target)
    }

    /// The avatar's own wav, else the first wav available, else nothing.
    pub fn reference_audio(&self, name: &str) -> Option<PathBuf> {
        let own = self.wav_dir.join(format!("{name}.wav"));
        if own.is_file() {
            return Some(own);
        }
        let mut wavs: Vec<PathBuf> = fs::read_dir(&self.wav_dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().is_some_and(|ext| ext == "wav")
                    && !path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            })
            .collect();
        wavs.sort();
        wavs.into_iter().next()
    }
}

impl ArtifactPublisher for AvatarRepository {
    fn publish(&self, name: &str) -> Result<PathBuf, SupervisorError> {
        AvatarRepository::publish(self, name)
    }

    fn discard(&self, name: &str) -> Result<(), SupervisorError> {
        self.discard_staged(name)
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
