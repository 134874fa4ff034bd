//! Storage for uploaded media.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::SupervisorError;

/// Media accepted by the upload endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Video,
    Audio,
    Image,
}

impl UploadKind {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            UploadKind::Video => &["mp4"],
            UploadKind::Audio => &["wav"],
            UploadKind::Image => &["png", "jpg", "jpeg"],
        }
    }

    pub fn accepts(self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for UploadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadKind::Video => write!(f, "video"),
            UploadKind::Audio => write!(f, "audio"),
            UploadKind::Image => write!(f, "image"),
        }
    }
}

impl FromStr for UploadKind {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(UploadKind::Video),
            "audio" => Ok(UploadKind::Audio),
            "image" => Ok(UploadKind::Image),
            other => Err(SupervisorError::UnsupportedMedia(format!(
                "unknown upload kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredBlob {
    pub id: Uuid,
    pub path: PathBuf,
}

/// Writes uploads under `<root>/<kind>/`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn save(
        &self,
        kind: UploadKind,
        original_filename: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob, SupervisorError> {
        if !kind.accepts(original_filename) {
            return Err(SupervisorError::UnsupportedMedia(format!(
                "{original_filename}: expected {} ({})",
                kind,
                kind.extensions().join(", ")
            )));
        }

        let id = Uuid::new_v4();
        let dir = self.root.join(kind.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let short = &id.simple().to_string()[..8];
        let path = dir.join(format!(
            "{stamp}_{short}_{}",
            sanitize_filename(original_filename)
        ));
        tokio::fs::write(&path, bytes).await?;

        debug!(kind = %kind, path = %path.display(), size = bytes.len(), "upload stored");
        Ok(StoredBlob { id, path })
    }
}

/// Keeps the final path component and replaces anything unusual with `_`.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
