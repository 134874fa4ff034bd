//! Tree termination: stop a process and everything it forked.
//!
//! Children go first. The external tools are supervisors of their own
//! (render workers, media pipelines) and killing the parent first leaves
//! orphans holding the camera, GPU or listening port.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::process::{Platform, ProcessHandle, Signal};

/// What [`terminate_tree`] had to do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreeReport {
    /// Descendants found when the call started.
    pub descendants: usize,
    /// Descendants that ignored the graceful signal and were killed.
    pub forced_descendants: usize,
    /// The parent ignored the graceful signal and was killed.
    pub forced_parent: bool,
    /// Exit code of the reaped parent.
    pub exit_code: Option<i32>,
}

/// Terminates `handle` and all of its descendants, then reaps it.
///
/// 1. snapshot descendants of the parent pid
/// 2. graceful-terminate every descendant
/// 3. wait up to `grace` for them to go away
/// 4. kill the survivors
/// 5. graceful-terminate the parent, wait up to `grace`, kill if needed
/// 6. reap the parent
pub async fn terminate_tree<P: Platform>(
    platform: &P,
    handle: &mut P::Handle,
    grace: Duration,
    poll: Duration,
) -> io::Result<TreeReport> {
    let pid = handle.id();
    let mut report = TreeReport::default();

    // Already exited and reaped: the pid may belong to someone else now.
    if let Some(code) = handle.try_wait()? {
        report.exit_code = Some(code);
        return Ok(report);
    }

    let descendants = platform.descendants(pid);
    report.descendants = descendants.len();
    debug!(pid, descendants = ?descendants, "terminating process tree");

    for &child in &descendants {
        platform.signal(child, Signal::Terminate);
    }

    let deadline = Instant::now() + grace;
    let mut alive: Vec<u32> = descendants;
    loop {
        alive.retain(|child| platform.is_alive(*child));
        if alive.is_empty() || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(poll).await;
    }

    for &child in &alive {
        warn!(pid, child, "descendant ignored terminate, killing");
        platform.signal(child, Signal::Kill);
    }
    report.forced_descendants = alive.len();

    handle.terminate()?;
    let mut exit = handle.wait(grace).await?;
    if exit.is_none() {
        warn!(pid, "process ignored terminate, killing");
        report.forced_parent = true;
        handle.kill()?;
        exit = handle.wait(grace).await?;
    }

    match exit {
        Some(code) => {
            report.exit_code = Some(code);
            Ok(report)
        }
        None => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("process {pid} still running after kill"),
        )),
    }
}
