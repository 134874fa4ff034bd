//! Supervisor configuration loaded from `avatar-supervisor.toml`.
//!
//! [`SupervisorConfig`] holds every tunable. Fields missing from the file fall
//! back to the defaults below. `AVATAR_TOOL_ROOT` and `AVATAR_SUPERVISOR_BIND`
//! take precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "avatar-supervisor.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Address the control API listens on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Installation root of the external avatar tool.
    #[serde(default = "default_tool_root")]
    pub tool_root: PathBuf,

    /// Interpreter used to launch both scripts.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    /// Training entry point, relative to `<tool_root>/wav2lip`.
    #[serde(default = "default_training_script")]
    pub training_script: String,

    /// Renderer entry point, relative to `tool_root`.
    #[serde(default = "default_serving_script")]
    pub serving_script: String,

    #[serde(default = "default_img_size")]
    pub img_size: u32,

    #[serde(default = "default_transport")]
    pub transport: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_tts")]
    pub tts: String,

    #[serde(default = "default_tts_server")]
    pub tts_server: String,

    /// Returned to the browser after a successful start.
    #[serde(default = "default_webrtc_url")]
    pub webrtc_url: String,

    /// Prefix every avatar id carries on disk.
    #[serde(default = "default_avatar_prefix")]
    pub avatar_prefix: String,

    /// Used when neither the request nor a training session has one.
    #[serde(default = "default_ref_text")]
    pub default_ref_text: String,

    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,

    /// Length of the looping clip made from a still image.
    #[serde(default = "default_clip_secs")]
    pub clip_secs: u32,

    #[serde(default = "default_training_timeout_secs")]
    pub training_timeout_secs: u64,

    /// Serving jobs are only watched for liveness unless this is set.
    #[serde(default)]
    pub serving_timeout_secs: Option<u64>,

    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Bounded wait for each step of tree termination.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Lines of a failed job's log surfaced in its status.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_tool_root() -> PathBuf {
    PathBuf::from("LiveTalking")
}

fn default_python_bin() -> String {
    "python".to_string()
}

fn default_training_script() -> String {
    "genavatar.py".to_string()
}

fn default_serving_script() -> String {
    "app.py".to_string()
}

fn default_img_size() -> u32 {
    256
}

fn default_transport() -> String {
    "webrtc".to_string()
}

fn default_model() -> String {
    "wav2lip".to_string()
}

fn default_tts() -> String {
    "cosyvoice".to_string()
}

fn default_tts_server() -> String {
    "http://127.0.0.1:50000".to_string()
}

fn default_webrtc_url() -> String {
    "http://localhost:8010".to_string()
}

fn default_avatar_prefix() -> String {
    "wav2lip256_".to_string()
}

fn default_ref_text() -> String {
    "Hello, I am a digital avatar.".to_string()
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}

fn default_clip_secs() -> u32 {
    3
}

// 30 minutes.
fn default_training_timeout_secs() -> u64 {
    1800
}

fn default_startup_grace_ms() -> u64 {
    3000
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_log_tail_lines() -> usize {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tool_root: default_tool_root(),
            python_bin: default_python_bin(),
            training_script: default_training_script(),
            serving_script: default_serving_script(),
            img_size: default_img_size(),
            transport: default_transport(),
            model: default_model(),
            tts: default_tts(),
            tts_server: default_tts_server(),
            webrtc_url: default_webrtc_url(),
            avatar_prefix: default_avatar_prefix(),
            default_ref_text: default_ref_text(),
            upload_dir: default_upload_dir(),
            logs_dir: default_logs_dir(),
            ffmpeg_bin: default_ffmpeg_bin(),
            clip_secs: default_clip_secs(),
            training_timeout_secs: default_training_timeout_secs(),
            serving_timeout_secs: None,
            startup_grace_ms: default_startup_grace_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            log_tail_lines: default_log_tail_lines(),
            log_level: default_log_level(),
        }
    }
}

impl SupervisorConfig {
    /// Loads `path`, or `avatar-supervisor.toml` in the current directory.
    /// Falls back to defaults when the default file does not exist; an
    /// explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(root) = std::env::var("AVATAR_TOOL_ROOT")
            && !root.is_empty()
        {
            config.tool_root = PathBuf::from(root);
        }
        if let Ok(bind) = std::env::var("AVATAR_SUPERVISOR_BIND")
            && !bind.is_empty()
        {
            config.bind = bind;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Published avatars the renderer reads from.
    pub fn avatars_dir(&self) -> PathBuf {
        self.tool_root.join("data").join("avatars")
    }

    /// Where the training script leaves its output.
    pub fn results_dir(&self) -> PathBuf {
        self.training_dir().join("results").join("avatars")
    }

    /// Reference audio, one `<id>.wav` per avatar.
    pub fn wav_dir(&self) -> PathBuf {
        self.tool_root.join("wav")
    }

    pub fn training_dir(&self) -> PathBuf {
        self.tool_root.join("wav2lip")
    }

    pub fn training_timeout(&self) -> Duration {
        Duration::from_secs(self.training_timeout_secs)
    }

    pub fn serving_timeout(&self) -> Option<Duration> {
        self.serving_timeout_secs.map(Duration::from_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = SupervisorConfig::default();
        assert_eq!(config.bind, "0.0.0.0:8000");
        assert_eq!(config.python_bin, "python");
        assert_eq!(config.training_timeout_secs, 1800);
        assert_eq!(config.startup_grace_ms, 3000);
        assert_eq!(config.stop_grace_ms, 5000);
        assert!(config.serving_timeout_secs.is_none());
        assert_eq!(config.avatar_prefix, "wav2lip256_");
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            tool_root = "/srv/livetalking"
            training_timeout_secs = 600
            serving_timeout_secs = 7200
        "#;
        let config: SupervisorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tool_root, PathBuf::from("/srv/livetalking"));
        assert_eq!(config.training_timeout(), Duration::from_secs(600));
        assert_eq!(config.serving_timeout(), Some(Duration::from_secs(7200)));
        assert_eq!(config.tts, "cosyvoice");
        assert_eq!(config.poll_interval_ms, 200);
    }

    #[test]
    fn derived_directories_hang_off_tool_root() {
        let config = SupervisorConfig {
            tool_root: PathBuf::from("/srv/lt"),
            ..SupervisorConfig::default()
        };
        assert_eq!(config.avatars_dir(), PathBuf::from("/srv/lt/data/avatars"));
        assert_eq!(
            config.results_dir(),
            PathBuf::from("/srv/lt/wav2lip/results/avatars")
        );
        assert_eq!(config.wav_dir(), PathBuf::from("/srv/lt/wav"));
        assert_eq!(config.training_dir(), PathBuf::from("/srv/lt/wav2lip"));
    }

    #[test]
    fn load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "python_bin = \"python3\"\nstop_grace_ms = 1000\n").unwrap();

        let config = SupervisorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.python_bin, "python3");
        assert_eq!(config.stop_grace(), Duration::from_secs(1));
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let result = SupervisorConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        // The crate root carries no avatar-supervisor.toml.
        let config = SupervisorConfig::load(None).unwrap();
        assert_eq!(config.img_size, 256);
    }
}
