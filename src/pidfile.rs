//! Single-instance guard backed by a pid file.
//!
//! The file holds one value: the decimal pid of the supervisor that owns the
//! host. A missing file, or one naming a process that no longer exists, means
//! nobody owns it.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use nix::{
    errno::Errno,
    sys::signal::kill,
    unistd::{getpid, Pid},
};

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether a live process already holds the marker.
    pub fn check(&self) -> Result<bool> {
        Ok(self.read()?.map_or(false, is_alive))
    }

    /// Reads the stored pid. Unparseable content counts as no pid.
    pub fn read(&self) -> Result<Option<Pid>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(parse(&contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists our own pid, replacing whatever is there.
    ///
    /// Only safe after [`check`](Self::check) returned false; prefer
    /// [`claim`](Self::claim), which doesn't leave a window between the two.
    pub fn write(&self) -> Result<()> {
        fs::write(&self.path, format!("{}\n", getpid()))?;
        Ok(())
    }

    /// Atomically takes ownership of the marker for this process.
    ///
    /// The pid is written to a scratch file first and then hard-linked into
    /// place, which fails if the marker exists. The marker is therefore never
    /// observed half-written, and of two processes racing here exactly one
    /// succeeds. A marker left behind by a dead process is removed and the
    /// claim retried.
    pub fn claim(&self) -> Result<()> {
        let scratch = self.scratch_path();
        fs::write(&scratch, format!("{}\n", getpid()))?;
        let claimed = self.link_from(&scratch);
        discard(&scratch);
        claimed
    }

    fn link_from(&self, scratch: &Path) -> Result<()> {
        loop {
            match fs::hard_link(scratch, &self.path) {
                Ok(()) => {
                    debug!("Claimed {:?}", self.path);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => match self.read()? {
                    Some(pid) if is_alive(pid) => return Err(Error::AlreadyRunning(pid.as_raw())),
                    stale => {
                        warn!("Removing stale pid file {:?} (pid: {:?})", self.path, stale);
                        self.remove()?;
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn scratch_path(&self) -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);

        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(
            ".{}.{}.tmp",
            getpid(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        self.path.with_file_name(name)
    }

    /// Erases the marker. A marker that is already gone is fine.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Removes a scratch file, logging rather than failing when it can't.
fn discard(scratch: &Path) -> bool {
    match fs::remove_file(scratch) {
        Ok(()) => true,
        Err(err) => {
            warn!("Couldn't remove scratch file {:?}: {}", scratch, err);
            false
        }
    }
}

fn parse(contents: &str) -> Option<Pid> {
    contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
}

/// Checks that a process exists without signalling it.
pub(crate) fn is_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
