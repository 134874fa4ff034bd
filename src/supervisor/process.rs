//! Platform seam for spawning and signalling external processes.
//!
//! The supervisor only talks to [`Platform`] and [`ProcessHandle`]; the OS
//! specifics (process table, signal delivery) live in [`OsPlatform`], which
//! uses `sysinfo` so the same code path works on Linux, macOS and Windows.

use std::fs::File;
use std::future::Future;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use crate::commands::CommandSpec;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Signals the supervisor can deliver to an arbitrary pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to exit (SIGTERM).
    Terminate,
    /// Force it (SIGKILL).
    Kill,
}

/// Exclusive ownership of one spawned OS process.
pub trait ProcessHandle: Send + Sync + 'static {
    fn id(&self) -> u32;

    /// Non-blocking exit check. Reaps the process the first time it reports
    /// an exit; later calls return the same code.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Graceful terminate.
    fn terminate(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;

    fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Polls [`try_wait`](Self::try_wait) until the process exits or `timeout`
    /// elapses. `Ok(None)` means it is still running.
    fn wait(&mut self, timeout: Duration) -> impl Future<Output = io::Result<Option<i32>>> + Send
    where
        Self: Sized,
    {
        async move {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(code) = self.try_wait()? {
                    return Ok(Some(code));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(WAIT_POLL).await;
            }
        }
    }
}

/// Everything the supervisor needs from the operating system.
pub trait Platform: Send + Sync + 'static {
    type Handle: ProcessHandle;

    /// Launch `command` with stdout and stderr both redirected to `log`.
    fn spawn(&self, command: &CommandSpec, log: File) -> io::Result<Self::Handle>;

    /// Transitive children of `pid`, parents before children.
    fn descendants(&self, pid: u32) -> Vec<u32>;

    /// Returns whether the signal was delivered.
    fn signal(&self, pid: u32, signal: Signal) -> bool;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Collapse an exit status into a single code. Signal deaths on unix follow
/// the shell convention of `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signo) = status.signal() {
            return 128 + signo;
        }
    }
    -1
}

/// A child spawned through [`OsPlatform`].
#[derive(Debug)]
pub struct OsProcess {
    child: Child,
}

impl ProcessHandle for OsProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        if OsPlatform.signal(self.id(), Signal::Terminate) {
            Ok(())
        } else {
            // No graceful signal on this platform (or the pid vanished).
            self.kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// The real process table, backed by `std::process` and `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPlatform;

fn live_entry(process: &sysinfo::Process) -> bool {
    process.thread_kind().is_none() && process.status() != ProcessStatus::Zombie
}

impl Platform for OsPlatform {
    type Handle = OsProcess;

    fn spawn(&self, command: &CommandSpec, log: File) -> io::Result<OsProcess> {
        let stderr = log.try_clone()?;
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn()?;
        Ok(OsProcess { child })
    }

    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut children: std::collections::HashMap<u32, Vec<u32>> =
            std::collections::HashMap::new();
        for (child_pid, process) in sys.processes() {
            if !live_entry(process) {
                continue;
            }
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(child_pid.as_u32());
            }
        }

        let mut found = Vec::new();
        let mut frontier = vec![pid];
        while let Some(current) = frontier.pop() {
            if let Some(kids) = children.get(&current) {
                for &kid in kids {
                    if kid != pid && !found.contains(&kid) {
                        found.push(kid);
                        frontier.push(kid);
                    }
                }
            }
        }
        found
    }

    fn signal(&self, pid: u32, signal: Signal) -> bool {
        let spid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
        let Some(process) = sys.process(spid) else {
            return false;
        };
        match signal {
            Signal::Terminate => process
                .kill_with(sysinfo::Signal::Term)
                .unwrap_or(false),
            Signal::Kill => process.kill(),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let spid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
        sys.process(spid).is_some_and(live_entry)
    }
}
