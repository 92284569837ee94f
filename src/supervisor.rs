//! The supervision engine.
//!
//! All program state lives in [`State`], behind one mutex shared with the
//! remote-call threads. Only the loop thread mutates programs; remote callers
//! read status under the lock, and request changes by queueing tasks on the
//! bridge and waiting for the loop to apply them.
//!
//! Each loop iteration waits (bounded by the poll interval and the nearest
//! kill deadline, cut short by a queued task or a signal), then, holding the
//! lock for the whole step: drains queued tasks, reaps exited children,
//! escalates overdue stops, completes finished stops, and checks for a
//! termination request. Nothing in a step waits on a child.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use nix::{sys::signal::Signal, unistd::Pid};

use crate::{
    bridge::{Completion, Operation, Outcome, Task, TaskQueue},
    config::{Config, ProgramConfig, ALL},
    control,
    daemon,
    error::{Error, Result},
    pidfile::PidFile,
    process,
    program::Program,
    service::{Control, StatusEntry},
    signal::{self, SignalFlags, Wakeups},
};

/// Lifecycle of a supervisor. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Unstarted,
    CheckingSingleton,
    Detaching,
    ClaimingMarker,
    InstallingSignals,
    Running,
    Draining,
    Terminated,
}

#[derive(Clone, Copy, Debug)]
struct Policy {
    min_runtime: Duration,
    stop_grace: Duration,
}

/// A stop request whose targets haven't all been reaped yet.
#[derive(Debug)]
struct PendingStop {
    targets: Vec<usize>,
    completion: Completion,
}

/// Everything guarded by the shared lock.
#[derive(Debug)]
pub(crate) struct State {
    programs: Vec<Program>,
    pub(crate) tasks: TaskQueue,
    pending_stops: Vec<PendingStop>,
    policy: Policy,
}

impl State {
    fn new(programs: &[ProgramConfig], policy: Policy) -> Self {
        Self {
            programs: programs.iter().cloned().map(Program::new).collect(),
            tasks: TaskQueue::default(),
            pending_stops: Vec::new(),
            policy,
        }
    }

    pub(crate) fn programs(&self) -> &[Program] {
        &self.programs
    }

    #[cfg(test)]
    pub(crate) fn programs_mut(&mut self) -> &mut [Program] {
        &mut self.programs
    }

    /// Status entries for `name`, or for every program (in configuration
    /// order) when `name` is empty or `all`.
    pub(crate) fn status(&self, name: &str) -> Vec<StatusEntry> {
        let everything = name.is_empty() || name == ALL;
        self.programs
            .iter()
            .filter(|p| everything || p.name() == name)
            .map(|p| StatusEntry {
                name: p.name().to_string(),
                status: p.status(),
            })
            .collect()
    }

    /// Launches every program that isn't running.
    pub(crate) fn start_all(&mut self) {
        for program in &mut self.programs {
            if program.is_running() {
                info!("program {} is already running.", program.name());
            } else {
                launch(program);
            }
        }
    }

    fn start(&mut self, name: &str) {
        match self.programs.iter_mut().find(|p| p.name() == name) {
            None => warn!("Can't start unknown program {:?}", name),
            Some(program) if program.is_running() => {
                info!("program {} is already running.", program.name())
            }
            Some(program) => launch(program),
        }
    }

    /// Sends SIGTERM to the task's targets. The task completes once every
    /// target is reaped, which may be several steps later.
    fn begin_stop(&mut self, task: Task) {
        let everything = task.targets_all();
        if !everything && !self.programs.iter().any(|p| p.name() == task.target()) {
            warn!("Can't stop unknown program {:?}", task.target());
        }

        let deadline = Instant::now() + self.policy.stop_grace;
        let mut targets = Vec::new();
        for (index, program) in self.programs.iter_mut().enumerate() {
            if !everything && program.name() != task.target() {
                continue;
            }

            match program.pid() {
                None if everything => {}
                None => info!("program {} is not running.", program.name()),
                Some(_) if program.is_stopping() => targets.push(index),
                Some(pid) => {
                    match process::signal(pid, Signal::SIGTERM) {
                        Ok(()) => info!("Stopping program {} pid {}", program.name(), pid),
                        Err(err) => error!(
                            "Couldn't stop program {} pid {}: {}",
                            program.name(),
                            pid,
                            err
                        ),
                    }
                    program.stopping(deadline);
                    targets.push(index);
                }
            }
        }

        if targets.is_empty() {
            task.complete(Outcome::Applied);
        } else {
            self.pending_stops.push(PendingStop {
                targets,
                completion: task.into_completion(),
            });
        }
    }

    fn apply(&mut self, task: Task) {
        debug!("Applying {} {:?}", task.op(), task.target());
        match task.op() {
            Operation::Start => {
                if task.targets_all() {
                    self.start_all();
                } else {
                    self.start(task.target());
                }
                task.complete(Outcome::Applied);
            }
            Operation::Stop => self.begin_stop(task),
        }
    }

    /// Runs every queued task in submission order.
    pub(crate) fn drain_tasks(&mut self) -> usize {
        let mut pending = std::mem::take(&mut self.tasks);
        let ran = pending.drain(|task| self.apply(task));
        // push() only runs under the lock we hold, so nothing arrived meanwhile
        self.tasks = pending;
        ran
    }

    /// Collects every exited child and applies the restart policy to it.
    /// Children that were asked to stop are never restarted.
    pub(crate) fn reap(&mut self) {
        let min_runtime = self.policy.min_runtime;
        for program in &mut self.programs {
            let pid = match program.pid() {
                Some(pid) => pid,
                None => continue,
            };

            let reason = match process::try_reap(pid) {
                Ok(Some(reason)) => reason,
                Ok(None) => continue,
                Err(err) => {
                    error!("Couldn't reap pid {} of program {}: {}", pid, program.name(), err);
                    continue;
                }
            };

            let requested = program.is_stopping();
            program.stopped();
            if requested {
                info!("stopped program {} pid {} ({})", program.name(), pid, reason);
                continue;
            }

            info!("exited program {} pid {} ({})", program.name(), pid, reason);
            if !program.autorestart() {
                continue;
            }

            if program.too_short(min_runtime) {
                warn!(
                    "program {} exited too quickly (under {:?}), not restarting",
                    program.name(),
                    min_runtime
                );
            } else {
                launch(program);
            }
        }
    }

    /// Sends SIGKILL to every stopping child whose grace period has run out.
    fn escalate(&mut self, now: Instant) {
        let grace = self.policy.stop_grace;
        for program in &mut self.programs {
            if !program.kill_due(now) {
                continue;
            }
            if let Some(pid) = program.pid() {
                warn!(
                    "program {} pid {} still running {:?} after SIGTERM, sending SIGKILL",
                    program.name(),
                    pid,
                    grace
                );
                if let Err(err) = process::signal(pid, Signal::SIGKILL) {
                    error!("Couldn't kill pid {}: {}", pid, err);
                }
            }
            program.killed();
        }
    }

    /// Completes every stop whose targets are all reaped.
    fn settle_stops(&mut self) {
        let programs = &self.programs;
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_stops)
            .into_iter()
            .partition(|stop| stop.targets.iter().all(|&i| !programs[i].is_running()));
        self.pending_stops = waiting;

        for stop in done {
            stop.completion.complete(Outcome::Applied);
        }
    }

    /// The earliest pending SIGKILL, if any.
    fn next_kill(&self) -> Option<Instant> {
        self.programs.iter().filter_map(Program::kill_deadline).min()
    }

    /// Forcibly ends every running child, waiting for each.
    pub(crate) fn kill_all(&mut self) {
        for program in &mut self.programs {
            if let Some(pid) = program.pid() {
                info!("Kill child process pid: {}", pid);
                match process::kill_and_reap(pid) {
                    Ok(reason) => debug!("program {} ended with {}", program.name(), reason),
                    Err(err) => error!("Couldn't kill pid {}: {}", pid, err),
                }
                program.stopped();
            }
        }
        self.settle_stops();
    }
}

fn launch(program: &mut Program) {
    match process::spawn(program.config()) {
        Ok(pid) => {
            let kind = if program.exec_count() == 0 {
                "Start"
            } else {
                "Restart"
            };
            program.started(pid);
            info!("[{}] program {} pid: {}", kind, program.name(), pid);
        }
        Err(err) => error!("{}", err),
    }
}

/// State plus the condition variable the loop sleeps on.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn new(config: &Config) -> Self {
        let policy = Policy {
            min_runtime: config.min_runtime,
            stop_grace: config.stop_grace,
        };
        Self {
            state: Mutex::new(State::new(&config.programs, policy)),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes the loop if it is waiting.
    fn nudge(&self) {
        // Taken so the notification can't land between the loop's checks and its wait.
        let _state = self.lock();
        self.wake.notify_all();
    }

    /// Queues a task and blocks until the loop has run it or shut down.
    pub(crate) fn submit(&self, op: Operation, target: &str) -> Outcome {
        let waiter = {
            let mut state = self.lock();
            state.tasks.push(op, target)
        };

        match waiter {
            Some(waiter) => {
                self.wake.notify_one();
                waiter.wait()
            }
            None => Outcome::ShuttingDown,
        }
    }
}

/// Turns bytes from the signal handlers into condvar wakeups.
fn watch_signals(mut wakeups: Wakeups, shared: &Shared) {
    loop {
        if let Err(err) = wakeups.wait() {
            error!("Signal wake channel failed, falling back to polling: {}", err);
            return;
        }
        trace!("Woken by a signal");
        shared.nudge();
    }
}

pub struct Supervisor {
    config: Config,
    pidfile: PidFile,
    shared: Arc<Shared>,
    flags: &'static SignalFlags,
    install_handlers: bool,
    server: Option<control::Server>,
    phase: Phase,
}

impl Supervisor {
    /// A supervisor driven by real process signals.
    pub fn new(config: Config) -> Self {
        Self::build(config, &signal::FLAGS, true)
    }

    /// A supervisor driven by `flags` alone; no signal handlers are
    /// installed, so whoever holds `flags` stands in for them.
    pub fn with_flags(config: Config, flags: &'static SignalFlags) -> Self {
        Self::build(config, flags, false)
    }

    fn build(config: Config, flags: &'static SignalFlags, install_handlers: bool) -> Self {
        Self {
            pidfile: PidFile::new(&config.pidfile),
            shared: Arc::new(Shared::new(&config)),
            config,
            flags,
            install_handlers,
            server: None,
            phase: Phase::Unstarted,
        }
    }

    /// Handle for remote callers.
    pub fn control(&self) -> Control {
        Control::new(Arc::clone(&self.shared))
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Starts up, supervises until asked to terminate, then shuts down.
    pub fn run(mut self) -> Result<()> {
        self.startup()?;
        self.supervise();
        self.shutdown()
    }

    fn enter(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "{:?} -> {:?}", self.phase, next);
        debug!("Supervisor phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    /// Walks the startup phases up to [`Phase::Running`] and launches every
    /// program. Any error is fatal; the marker is released again if it had
    /// already been claimed.
    pub fn startup(&mut self) -> Result<()> {
        self.enter(Phase::CheckingSingleton);
        if self.pidfile.check()? {
            let pid = self.pidfile.read()?.map_or(0, Pid::as_raw);
            return Err(Error::AlreadyRunning(pid));
        }

        self.enter(Phase::Detaching);
        if self.config.daemonize {
            daemon::detach(&self.config.dir, &self.config.logfile)?;
        }

        self.enter(Phase::ClaimingMarker);
        self.pidfile.claim()?;

        if let Err(err) = self.install() {
            if let Err(rm) = self.pidfile.remove() {
                error!("Couldn't remove pid file {:?}: {}", self.pidfile.path(), rm);
            }
            return Err(err);
        }

        self.enter(Phase::Running);
        info!("Start pman");
        self.shared.lock().start_all();
        Ok(())
    }

    fn install(&mut self) -> Result<()> {
        self.enter(Phase::InstallingSignals);
        if self.install_handlers {
            let wakeups = signal::install()?;
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("pman-signal".into())
                .spawn(move || watch_signals(wakeups, &shared))?;
        }

        if let Some(path) = &self.config.socket {
            self.server = Some(control::Server::bind(path, self.control())?);
        }

        Ok(())
    }

    /// Whether the loop may sleep: nothing queued, no signal waiting.
    fn idle(&self, state: &State) -> bool {
        state.tasks.is_empty()
            && !self.flags.terminate_requested()
            && !self.flags.child_exit_pending()
    }

    /// Runs the loop until termination is requested.
    pub fn supervise(&self) {
        let poll = self.config.poll_interval;
        loop {
            let mut state = self.shared.lock();
            if self.idle(&state) {
                let timeout = state.next_kill().map_or(poll, |at| {
                    at.saturating_duration_since(Instant::now()).min(poll)
                });
                state = self
                    .shared
                    .wake
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }

            if !self.step(&mut state) {
                break;
            }
        }
    }

    /// One pass over tasks, exits and stops. Returns false once termination
    /// is requested.
    fn step(&self, state: &mut State) -> bool {
        let ran = state.drain_tasks();
        if ran > 0 {
            trace!("Ran {} task(s)", ran);
        }

        // Exits are reaped every step; the flag only cuts the wait short.
        if self.flags.take_child_exited() {
            trace!("Child exit reported");
        }
        state.reap();
        state.escalate(Instant::now());
        state.settle_stops();

        if self.flags.take_terminate() {
            info!("Termination requested");
            return false;
        }

        true
    }

    /// Releases queued tasks, kills every child (which completes any stop
    /// still waiting), and gives up the marker.
    pub fn shutdown(&mut self) -> Result<()> {
        self.enter(Phase::Draining);
        {
            let mut state = self.shared.lock();
            let released = state.tasks.close();
            if released > 0 {
                info!("Released {} pending task(s)", released);
            }
            state.kill_all();
        }

        if let Some(server) = self.server.take() {
            server.close();
        }

        let removed = self.pidfile.remove();
        self.enter(Phase::Terminated);
        info!("End pman");
        removed
    }
}
