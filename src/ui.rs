//! Terminal output: spinners and colored state lines.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::api::AvatarStatus;

/// Spinner shown while waiting on a training job.
pub struct TrainingProgress {
    pb: ProgressBar,
}

impl TrainingProgress {
    pub fn start(name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]") {
            pb.set_style(style);
        }
        pb.set_message(format!("training {name}"));
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    pub fn update(&self, status: &AvatarStatus) {
        self.pb
            .set_message(format!("{}: {}", status.name, status.state));
    }

    /// Clears the spinner and prints the final state.
    pub fn finish(&self, status: &AvatarStatus) {
        self.pb.finish_and_clear();
        println!("{}", render_status(status));
    }
}

fn state_style(state: &str) -> Style {
    match state {
        "running" => Style::new().cyan().bold(),
        "succeeded" => Style::new().green().bold(),
        "failed" => Style::new().red().bold(),
        "not_found" => Style::new().dim(),
        _ => Style::new().yellow(),
    }
}

/// One line per avatar: marker, id, state, then pid or error.
pub fn render_status(status: &AvatarStatus) -> String {
    let marker = match status.state.as_str() {
        "succeeded" => "✓",
        "failed" => "✗",
        "running" => "●",
        _ => "○",
    };
    let style = state_style(&status.state);
    let mut line = format!(
        "  {} {} {}",
        style.apply_to(marker),
        status.name,
        style.apply_to(status.state.to_uppercase())
    );
    if let Some(pid) = status.pid {
        line.push_str(&format!(" (pid {pid})"));
    }
    if let Some(error) = &status.error {
        line.push_str(&format!(": {error}"));
    }
    line
}

pub fn success(message: &str) {
    println!("  {} {message}", Style::new().green().bold().apply_to("✓"));
}

pub fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}
