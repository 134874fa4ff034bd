//! Still image to looping clip, via ffmpeg.
//!
//! The training script only takes video, so image uploads are turned into a
//! short fixed-size clip first.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;

const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(30);
const STDERR_TAIL_LINES: usize = 10;

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: String,
    clip_secs: u32,
    size: u32,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_bin.clone(),
            clip_secs: config.clip_secs,
            size: config.img_size,
            timeout: TRANSCODE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn args(&self, image: &Path, output: &Path) -> Vec<String> {
        vec![
            "-loop".into(),
            "1".into(),
            "-i".into(),
            image.to_string_lossy().to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-t".into(),
            self.clip_secs.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-vf".into(),
            format!("scale={0}:{0}", self.size),
            "-y".into(),
            output.to_string_lossy().to_string(),
        ]
    }

    pub async fn image_to_video(
        &self,
        image: &Path,
        output: &Path,
    ) -> Result<PathBuf, SupervisorError> {
        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(image = %image.display(), output = %output.display(), "transcoding image");
        let child = Command::new(&self.ffmpeg)
            .args(self.args(image, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.ffmpeg.clone(),
                source,
            })?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                SupervisorError::Transcode(format!(
                    "{} timed out after {}s",
                    self.ffmpeg,
                    self.timeout.as_secs()
                ))
            })??;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            return Err(SupervisorError::Transcode(format!(
                "{} exited with {}: {}",
                self.ffmpeg,
                result.status,
                tail.trim()
            )));
        }
        if !output.is_file() {
            return Err(SupervisorError::Transcode(format!(
                "{} produced no output at {}",
                self.ffmpeg,
                output.display()
            )));
        }

        info!(output = %output.display(), "image converted to video");
        Ok(output.to_path_buf())
    }
}

/// Whether `path` names a still image by its extension.
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| matches!(ext.as_str(), "png" | "jpg" | "jpeg"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn transcoder(bin: &str) -> Transcoder {
        Transcoder::new(&SupervisorConfig {
            ffmpeg_bin: bin.to_string(),
            ..SupervisorConfig::default()
        })
    }

    #[test]
    fn image_detection_by_extension() {
        assert!(is_image(Path::new("/up/face.PNG")));
        assert!(is_image(Path::new("face.jpg")));
        assert!(is_image(Path::new("face.jpeg")));
        assert!(!is_image(Path::new("clip.mp4")));
        assert!(!is_image(Path::new("noext")));
    }

    #[test]
    fn ffmpeg_arguments() {
        let args = transcoder("ffmpeg").args(Path::new("in.png"), Path::new("out.mp4"));
        assert_eq!(
            args.join(" "),
            "-loop 1 -i in.png -c:v libx264 -t 3 -pix_fmt yuv420p -vf scale=256:256 -y out.mp4"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let err = transcoder("definitely-not-ffmpeg-xyz")
            .image_to_video(&dir.path().join("a.png"), &dir.path().join("a.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_binary_is_transcode_error() {
        let dir = TempDir::new().unwrap();
        let err = transcoder("false")
            .image_to_video(&dir.path().join("a.png"), &dir.path().join("a.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Transcode(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn success_without_output_is_error() {
        let dir = TempDir::new().unwrap();
        let err = transcoder("true")
            .image_to_video(&dir.path().join("a.png"), &dir.path().join("a.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Transcode(msg) if msg.contains("no output")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn writes_output_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("fake-ffmpeg");
        std::fs::write(&fake, "#!/bin/sh\nfor a; do last=\"$a\"; done\n: > \"$last\"\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let output = dir.path().join("clips").join("a.mp4");
        let written = transcoder(&fake.to_string_lossy())
            .image_to_video(&dir.path().join("a.png"), &output)
            .await
            .unwrap();
        assert_eq!(written, output);
        assert!(output.is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_binary_times_out() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("slow-ffmpeg");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let err = transcoder(&script.to_string_lossy())
            .with_timeout(Duration::from_millis(200))
            .image_to_video(&dir.path().join("a.png"), &dir.path().join("a.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Transcode(msg) if msg.contains("timed out")));
    }
}
