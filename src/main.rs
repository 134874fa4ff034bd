mod api;
mod avatar;
mod cli;
mod client;
mod commands;
mod config;
mod error;
mod logging;
mod orchestrator;
mod server;
mod supervisor;
mod ui;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use api::{StartRequest, TrainRequest};
use avatar::{UploadKind, is_image};
use cli::{Cli, Command};
use client::SupervisorClient;
use config::SupervisorConfig;

const TRAIN_POLL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SupervisorConfig::load(cli.config.as_deref())?;
    logging::init(cli.verbose, &config.log_level);

    match cli.command {
        Command::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            server::serve(config).await
        }
        command => run_client(SupervisorClient::new(&cli.server)?, command).await,
    }
}

async fn run_client(client: SupervisorClient, command: Command) -> Result<()> {
    match command {
        Command::Serve { .. } => bail!("serve runs locally, not through --server"),
        Command::Start {
            name,
            ref_file,
            ref_text,
        } => {
            let started = client
                .start(&StartRequest {
                    name,
                    ref_file,
                    ref_text,
                })
                .await?;
            ui::success(&format!(
                "{} running (pid {}), open {}",
                started.name, started.pid, started.webrtc_url
            ));
        }
        Command::Stop { name } => {
            let stopped = client.stop(&name).await?;
            match stopped.pid {
                Some(pid) => ui::success(&format!("{} stopped (pid {pid})", stopped.name)),
                None => ui::success(&format!("{} was not running", stopped.name)),
            }
        }
        Command::Train {
            name,
            input,
            audio,
            text,
            upload,
            wait,
        } => {
            let (input, audio) = if upload {
                let kind = if is_image(&input) {
                    UploadKind::Image
                } else {
                    UploadKind::Video
                };
                let input = client.upload(kind, &input).await?.path;
                let audio = client.upload(UploadKind::Audio, &audio).await?.path;
                (input, audio)
            } else {
                (absolute(&input)?, absolute(&audio)?)
            };

            let previous = client.status(&name).await?.started_at;
            let accepted = client
                .train(&TrainRequest {
                    name,
                    input_media_path: input,
                    reference_audio_path: audio,
                    reference_text: text,
                })
                .await?;
            ui::success(&format!("training {} started", accepted.name));

            if wait {
                wait_for_training(&client, &accepted.name, previous).await?;
            }
        }
        Command::Status { name } => {
            let status = client.status(&name).await?;
            println!("{}", ui::render_status(&status));
        }
        Command::Avatars => {
            let avatars = client.avatars().await?;
            if avatars.avatars.is_empty() {
                println!("no published avatars");
            }
            for avatar in avatars.avatars {
                let audio = if avatar.has_audio { "" } else { " (no reference audio)" };
                println!("  {}{audio}", avatar.id);
            }
        }
        Command::Health => ui::print_json(&client.health().await?),
        Command::Upload { kind, file } => ui::print_json(&client.upload(kind.into(), &file).await?),
        Command::Remove { name } => {
            client.remove_job(&name).await?;
            ui::success(&format!("{name} removed"));
        }
    }
    Ok(())
}

/// Polls until the run started by this invocation is over.
async fn wait_for_training(
    client: &SupervisorClient,
    name: &str,
    previous: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    let progress = ui::TrainingProgress::start(name);
    let mut seen_running = false;
    loop {
        tokio::time::sleep(TRAIN_POLL).await;
        let status = client.status(name).await?;
        progress.update(&status);
        seen_running |= status.is_running();

        let this_run = seen_running
            || status.started_at != previous
            || (status.state == "failed" && status.started_at.is_none());
        if this_run && status.is_finished() {
            progress.finish(&status);
            if status.state == "failed" {
                bail!("training of {name} failed");
            }
            return Ok(());
        }
    }
}

fn absolute(path: &Path) -> Result<std::path::PathBuf> {
    std::path::absolute(path).with_context(|| format!("invalid path {}", path.display()))
}
