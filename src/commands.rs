//! Command lines for the external avatar tool.
//!
//! The training script and the realtime renderer are opaque; this module only
//! knows their flag sets, working directories and where their logs go.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::config::SupervisorConfig;
use crate::supervisor::JobKind;

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn flag(self, name: &str, value: impl Into<String>) -> Self {
        self.arg(name).arg(value)
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// `genavatar.py`: turns a video into an avatar artifact under the results dir.
pub fn training_command(config: &SupervisorConfig, avatar_id: &str, video: &Path) -> CommandSpec {
    CommandSpec::new(&config.python_bin)
        .arg(&config.training_script)
        .flag("--video_path", video.to_string_lossy())
        .flag("--img_size", config.img_size.to_string())
        .flag("--avatar_id", avatar_id)
        .current_dir(config.training_dir())
}

/// `app.py`: the realtime renderer for one published avatar.
pub fn serving_command(
    config: &SupervisorConfig,
    avatar_id: &str,
    ref_file: &str,
    ref_text: &str,
) -> CommandSpec {
    CommandSpec::new(&config.python_bin)
        .arg(&config.serving_script)
        .flag("--transport", &config.transport)
        .flag("--model", &config.model)
        .flag("--avatar_id", avatar_id)
        .flag("--tts", &config.tts)
        .flag("--TTS_SERVER", &config.tts_server)
        .flag("--REF_FILE", ref_file)
        .flag("--REF_TEXT", ref_text)
        .current_dir(&config.tool_root)
}

/// Per-invocation log file: `<logs_dir>/{train|run}_<id>_<timestamp>.log`.
pub fn log_path(config: &SupervisorConfig, kind: JobKind, avatar_id: &str) -> PathBuf {
    let prefix = match kind {
        JobKind::Training => "train",
        JobKind::Serving => "run",
    };
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    config
        .logs_dir
        .join(format!("{prefix}_{avatar_id}_{stamp}.log"))
}
