//! Command line interface.
//!
//! `serve` runs the supervisor itself; every other subcommand is a thin
//! client of a running one.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::avatar::UploadKind;
use crate::client::DEFAULT_SERVER;

/// Supervisor for avatar training and realtime rendering processes.
#[derive(Debug, Parser)]
#[command(name = "avatar-supervisor", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Base URL of a running supervisor.
    #[arg(long, global = true, default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Path to a TOML config file (default: ./avatar-supervisor.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the control API and supervises jobs until interrupted.
    Serve {
        /// Overrides `bind` from the config.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Starts the renderer for a published avatar.
    Start {
        name: String,

        /// Reference audio for the voice clone.
        #[arg(long)]
        ref_file: Option<String>,

        /// Transcript of the reference audio.
        #[arg(long)]
        ref_text: Option<String>,
    },

    /// Stops an avatar's renderer or training.
    Stop { name: String },

    /// Trains an avatar from a video or a still image.
    Train {
        name: String,

        /// Video or image to train from.
        #[arg(long)]
        input: PathBuf,

        /// Reference audio (wav).
        #[arg(long)]
        audio: PathBuf,

        /// Transcript of the reference audio.
        #[arg(long, default_value = "")]
        text: String,

        /// Upload the inputs first instead of passing server-side paths.
        #[arg(long, default_value_t = false)]
        upload: bool,

        /// Block until training finishes.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },

    /// Shows the state of one avatar.
    Status { name: String },

    /// Lists published avatars.
    Avatars,

    /// Shows running and training counts.
    Health,

    /// Uploads a media file.
    Upload {
        kind: UploadArg,
        file: PathBuf,
    },

    /// Forgets a finished job.
    Remove { name: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UploadArg {
    Video,
    Audio,
    Image,
}

impl From<UploadArg> for UploadKind {
    fn from(arg: UploadArg) -> Self {
        match arg {
            UploadArg::Video => UploadKind::Video,
            UploadArg::Audio => UploadKind::Audio,
            UploadArg::Image => UploadKind::Image,
        }
    }
}
