use std::{
    fmt,
    time::{Duration, Instant},
};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::config::ProgramConfig;

/// Externally visible run state of a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Running,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Status::Running => "RUNNING",
            Status::Stopped => "STOPPED",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Stopping {
    deadline: Instant,
    killed: bool,
}

/// One configured program and its current run state.
///
/// `pid` is set exactly while the program is running. Only the supervision
/// loop mutates a `Program`; remote callers go through the task bridge.
///
/// A program asked to stop stays running (it still has a pid) until its exit
/// is reaped; meanwhile it carries the deadline after which it gets SIGKILL.
#[derive(Clone, Debug)]
pub struct Program {
    config: ProgramConfig,
    pid: Option<Pid>,
    exec_count: u32,
    started_at: Option<Instant>,
    stopping: Option<Stopping>,
}

impl Program {
    pub const fn new(config: ProgramConfig) -> Self {
        Self {
            config,
            pid: None,
            exec_count: 0,
            started_at: None,
            stopping: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub const fn config(&self) -> &ProgramConfig {
        &self.config
    }

    pub const fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    pub const fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Number of launches that produced a live child.
    pub const fn exec_count(&self) -> u32 {
        self.exec_count
    }

    /// When the most recent launch happened.
    pub const fn start_time(&self) -> Option<Instant> {
        self.started_at
    }

    pub const fn autorestart(&self) -> bool {
        self.config.autorestart
    }

    pub fn status(&self) -> Status {
        if self.is_running() {
            Status::Running
        } else {
            Status::Stopped
        }
    }

    /// Records a successful launch.
    pub fn started(&mut self, pid: Pid) {
        self.started_at(pid, Instant::now());
    }

    pub(crate) fn started_at(&mut self, pid: Pid, at: Instant) {
        self.pid = Some(pid);
        self.started_at = Some(at);
        self.stopping = None;
        self.exec_count += 1;
    }

    /// Records a confirmed exit.
    pub fn stopped(&mut self) {
        self.pid = None;
        self.stopping = None;
    }

    /// Records that SIGTERM was sent, with the time SIGKILL is due.
    pub fn stopping(&mut self, deadline: Instant) {
        if self.is_running() {
            self.stopping = Some(Stopping {
                deadline,
                killed: false,
            });
        }
    }

    /// Whether a stop was requested and the exit isn't reaped yet.
    pub const fn is_stopping(&self) -> bool {
        self.stopping.is_some()
    }

    /// When SIGKILL is due, unless it was already sent.
    pub fn kill_deadline(&self) -> Option<Instant> {
        self.stopping.filter(|s| !s.killed).map(|s| s.deadline)
    }

    /// Whether SIGKILL is due at `now` and hasn't been sent.
    pub fn kill_due(&self, now: Instant) -> bool {
        self.kill_deadline().map_or(false, |deadline| now >= deadline)
    }

    /// Records that SIGKILL was sent.
    pub fn killed(&mut self) {
        if let Some(stopping) = self.stopping.as_mut() {
            stopping.killed = true;
        }
    }

    /// Whether the last run ended before `min_runtime` had elapsed.
    pub fn too_short(&self, min_runtime: Duration) -> bool {
        self.too_short_at(Instant::now(), min_runtime)
    }

    fn too_short_at(&self, now: Instant, min_runtime: Duration) -> bool {
        self.started_at
            .map_or(false, |started| now.saturating_duration_since(started) < min_runtime)
    }
}
