//! Detaching from the controlling terminal.

#![allow(unsafe_code)]

use std::{
    fs::OpenOptions,
    os::unix::io::AsRawFd,
    path::Path,
    process,
};

use nix::{
    sys::stat::{umask, Mode},
    unistd::{chdir, dup2, fork, setsid, ForkResult},
};

use crate::error::Result;

/// Turns the calling process into a background daemon.
///
/// The invoking process exits with status 0 once the fork succeeds; only the
/// child returns from here. The child leaves the caller's session, moves to
/// `dir`, and sends its stdout and stderr to `logfile`.
///
/// Must run before any other thread is started.
pub fn detach(dir: &Path, logfile: &Path) -> Result<()> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            debug!("Detached as pid {}", child);
            process::exit(0);
        }
        ForkResult::Child => {}
    }

    umask(Mode::empty());
    chdir(dir)?;
    setsid()?;
    redirect(logfile)
}

/// Points stdin at `/dev/null` and stdout/stderr at `logfile`.
pub fn redirect(logfile: &Path) -> Result<()> {
    let null = OpenOptions::new().read(true).open("/dev/null")?;
    let log = OpenOptions::new().create(true).append(true).open(logfile)?;

    dup2(null.as_raw_fd(), 0)?;
    dup2(log.as_raw_fd(), 1)?;
    dup2(log.as_raw_fd(), 2)?;
    Ok(())
}
