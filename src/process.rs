use std::{
    fmt,
    fs::OpenOptions,
    process::{Command, Stdio},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

use crate::config::ProgramConfig;
use crate::error::{Error, Result};

/// How a child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Exited(i32),
    Signalled(Signal),
    /// Already reaped elsewhere; nothing is known about how it ended.
    Vanished,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exit code {}", code),
            ExitReason::Signalled(sig) => write!(f, "signal {}", sig),
            ExitReason::Vanished => f.write_str("unknown status"),
        }
    }
}

/// Launches the program's command as a new child process.
///
/// stdout and stderr are appended to the program's log file, stdin is
/// `/dev/null`. A missing executable or an unopenable log file is reported
/// as [`Error::Launch`].
pub fn spawn(config: &ProgramConfig) -> Result<Pid> {
    let launch_error = |err| Error::Launch {
        name: config.name.clone(),
        err,
    };

    let (program, args) = config
        .command
        .split_first()
        .ok_or_else(|| Error::Config(format!("command of program '{}' is empty", config.name)))?;

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.logfile)
        .map_err(launch_error)?;
    let err_log = log.try_clone().map_err(launch_error)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(err_log);

    debug!("Assembled command {:?}", command);

    let child = command.spawn().map_err(launch_error)?;

    // Dropping the handle neither waits nor kills; exits are reaped by pid.
    #[allow(clippy::cast_possible_wrap)]
    Ok(Pid::from_raw(child.id() as i32))
}

/// Collects the exit status of `pid` if it has terminated, without blocking.
pub fn try_reap(pid: Pid) -> Result<Option<ExitReason>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitReason::Exited(code))),
        Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(ExitReason::Signalled(sig))),
        Ok(_) => Ok(None),
        Err(Errno::ECHILD) => Ok(Some(ExitReason::Vanished)),
        Err(err) => Err(err.into()),
    }
}

/// Sends SIGKILL to `pid` and waits for it.
///
/// Blocks until the child is gone; only for shutdown, never the loop.
pub fn kill_and_reap(pid: Pid) -> Result<ExitReason> {
    signal(pid, Signal::SIGKILL)?;

    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitReason::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitReason::Signalled(sig)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(ExitReason::Vanished),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Sends `sig` to `pid` without waiting for any effect.
pub fn signal(pid: Pid, sig: Signal) -> Result<()> {
    debug!("Sending {} to pid {}", sig, pid);
    match kill(pid, sig) {
        // Already gone, but not reaped yet: the wait that follows collects it.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}
