//! In-memory process table for exercising the supervisor without real processes.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::commands::CommandSpec;

use super::process::{Platform, ProcessHandle, Signal};

const TERMINATED: i32 = 128 + 15;
const KILLED: i32 = 128 + 9;

/// How a fake process reacts over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Runs until terminated or killed.
    RunsUntilSignalled,
    /// Only a kill stops it.
    IgnoresTerminate,
    /// Exits on its own after `polls` calls to `try_wait`.
    ExitsAfter { polls: u32, code: i32 },
    /// `spawn` fails.
    SpawnError,
    /// Terminate and kill both fail with a permission error.
    RefusesSignals,
}

#[derive(Debug)]
struct FakeProc {
    parent: Option<u32>,
    stubborn: bool,
    exit: Option<i32>,
}

#[derive(Debug, Default)]
struct FakeState {
    next_pid: u32,
    procs: HashMap<u32, FakeProc>,
    queued: VecDeque<FakeBehavior>,
    spawned: Vec<CommandSpec>,
    signals: Vec<(u32, Signal)>,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct FakePlatform {
    state: Arc<Mutex<FakeState>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                next_pid: 5000,
                ..FakeState::default()
            })),
        }
    }

    /// Behavior for the next `spawn`. Unqueued spawns run until signalled.
    pub fn push(&self, behavior: FakeBehavior) {
        lock(&self.state).queued.push_back(behavior);
    }

    pub fn spawn_fake(&self, behavior: FakeBehavior) -> FakeHandle {
        let mut state = lock(&self.state);
        let pid = state.next_pid;
        state.next_pid += 1;
        state.procs.insert(
            pid,
            FakeProc {
                parent: None,
                stubborn: behavior == FakeBehavior::IgnoresTerminate,
                exit: None,
            },
        );
        FakeHandle {
            pid,
            behavior,
            polls: 0,
            state: Arc::clone(&self.state),
        }
    }

    pub fn add_child(&self, parent: u32, pid: u32, stubborn: bool) {
        lock(&self.state).procs.insert(
            pid,
            FakeProc {
                parent: Some(parent),
                stubborn,
                exit: None,
            },
        );
    }

    /// Makes a live fake process exit on its own with `code`.
    pub fn exit(&self, pid: u32, code: i32) {
        if let Some(proc_) = lock(&self.state).procs.get_mut(&pid)
            && proc_.exit.is_none()
        {
            proc_.exit = Some(code);
        }
    }

    pub fn signal_log(&self) -> Vec<(u32, Signal)> {
        lock(&self.state).signals.clone()
    }

    pub fn spawned(&self) -> Vec<CommandSpec> {
        lock(&self.state).spawned.clone()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.state)
            .procs
            .values()
            .filter(|p| p.exit.is_none())
            .count()
    }
}

impl Platform for FakePlatform {
    type Handle = FakeHandle;

    fn spawn(&self, command: &CommandSpec, mut log: File) -> io::Result<FakeHandle> {
        let behavior = {
            let mut state = lock(&self.state);
            state.spawned.push(command.clone());
            state
                .queued
                .pop_front()
                .unwrap_or(FakeBehavior::RunsUntilSignalled)
        };
        if behavior == FakeBehavior::SpawnError {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }
        writeln!(log, "spawned: {command}")?;
        Ok(self.spawn_fake(behavior))
    }

    fn descendants(&self, pid: u32) -> Vec<u32> {
        let state = lock(&self.state);
        let mut found = Vec::new();
        let mut frontier = vec![pid];
        while let Some(current) = frontier.pop() {
            for (child, proc_) in &state.procs {
                if proc_.parent == Some(current) && proc_.exit.is_none() && !found.contains(child)
                {
                    found.push(*child);
                    frontier.push(*child);
                }
            }
        }
        found
    }

    fn signal(&self, pid: u32, signal: Signal) -> bool {
        let mut state = lock(&self.state);
        state.signals.push((pid, signal));
        let Some(proc_) = state.procs.get_mut(&pid) else {
            return false;
        };
        if proc_.exit.is_some() {
            return false;
        }
        match signal {
            Signal::Terminate if proc_.stubborn => {}
            Signal::Terminate => proc_.exit = Some(TERMINATED),
            Signal::Kill => proc_.exit = Some(KILLED),
        }
        true
    }

    fn is_alive(&self, pid: u32) -> bool {
        lock(&self.state)
            .procs
            .get(&pid)
            .is_some_and(|p| p.exit.is_none())
    }
}

#[derive(Debug)]
pub struct FakeHandle {
    pid: u32,
    behavior: FakeBehavior,
    polls: u32,
    state: Arc<Mutex<FakeState>>,
}

impl FakeHandle {
    fn refuse(&self) -> io::Result<()> {
        if self.behavior == FakeBehavior::RefusesSignals {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ));
        }
        Ok(())
    }
}

impl ProcessHandle for FakeHandle {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        let mut state = lock(&self.state);
        let Some(proc_) = state.procs.get_mut(&self.pid) else {
            return Err(io::Error::other("unknown fake pid"));
        };
        if let Some(code) = proc_.exit {
            return Ok(Some(code));
        }
        if let FakeBehavior::ExitsAfter { polls, code } = self.behavior {
            if self.polls >= polls {
                proc_.exit = Some(code);
                return Ok(Some(code));
            }
            self.polls += 1;
        }
        Ok(None)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.refuse()?;
        let mut state = lock(&self.state);
        state.signals.push((self.pid, Signal::Terminate));
        if let Some(proc_) = state.procs.get_mut(&self.pid)
            && proc_.exit.is_none()
            && !proc_.stubborn
        {
            proc_.exit = Some(TERMINATED);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.refuse()?;
        let mut state = lock(&self.state);
        state.signals.push((self.pid, Signal::Kill));
        if let Some(proc_) = state.procs.get_mut(&self.pid)
            && proc_.exit.is_none()
        {
            proc_.exit = Some(KILLED);
        }
        Ok(())
    }
}
