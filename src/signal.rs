//! Signal-safe notification flags.
//!
//! Handlers registered here do two things: an atomic store into [`FLAGS`],
//! then a one-byte non-blocking write to the wake channel. They never
//! allocate, lock or log, and never touch program state, since they may
//! interrupt the supervision loop at any instruction. Everything else happens
//! on the loop thread, which reads and clears the flags with
//! [`SignalFlags::take_terminate`] and [`SignalFlags::take_child_exited`].
//!
//! The byte only exists to end the loop's wait early. [`Wakeups`] is the
//! reading end; whoever holds it turns bytes into condvar notifications.

#![allow(unsafe_code)]

use std::{
    io::{self, Read},
    os::unix::{
        io::{BorrowedFd, IntoRawFd, RawFd},
        net::UnixStream,
    },
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};

use nix::{
    errno::Errno,
    libc::c_int,
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd,
};

use crate::error::Result;

/// Flags raised from signal context and consumed by the loop thread.
///
/// Writers: signal handlers only (or tests standing in for them).
/// Readers: the supervision loop only.
#[derive(Debug, Default)]
pub struct SignalFlags {
    terminate: AtomicBool,
    child_exited: AtomicBool,
}

/// The process-wide flags the installed handlers write to.
pub static FLAGS: SignalFlags = SignalFlags::new();

/// Writing end of the wake channel, or -1 before [`install`].
///
/// Never closed once set: a handler may be mid-write on another thread.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

impl SignalFlags {
    pub const fn new() -> Self {
        Self {
            terminate: AtomicBool::new(false),
            child_exited: AtomicBool::new(false),
        }
    }

    pub fn raise_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn raise_child_exited(&self) {
        self.child_exited.store(true, Ordering::SeqCst);
    }

    /// Termination stays requested once seen; this does not clear it.
    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn take_terminate(&self) -> bool {
        self.terminate.swap(false, Ordering::SeqCst)
    }

    /// Whether an exit was reported and not yet taken. Does not clear.
    pub fn child_exit_pending(&self) -> bool {
        self.child_exited.load(Ordering::SeqCst)
    }

    /// Clears before returning, so an exit landing while the caller reaps
    /// raises the flag again rather than being lost.
    pub fn take_child_exited(&self) -> bool {
        self.child_exited.swap(false, Ordering::SeqCst)
    }
}

/// Reading end of the wake channel.
#[derive(Debug)]
pub struct Wakeups(UnixStream);

impl Wakeups {
    /// Blocks until at least one handler has run since the last call.
    pub fn wait(&mut self) -> io::Result<()> {
        let mut buf = [0_u8; 64];
        loop {
            match self.0.read(&mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Creates a wake channel: a non-blocking raw writer and its reader.
///
/// The writer is released from ownership; it lives as long as the process.
fn channel() -> io::Result<(RawFd, Wakeups)> {
    let (reader, writer) = UnixStream::pair()?;
    writer.set_nonblocking(true)?;
    Ok((writer.into_raw_fd(), Wakeups(reader)))
}

/// Async-signal-safe: one write(2), errno left as found.
fn nudge(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let saved = Errno::last_raw();
    // A full channel already guarantees a wakeup, so EAGAIN is fine.
    let _ = unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, &[1]);
    Errno::set_raw(saved);
}

extern "C" fn on_terminate(_: c_int) {
    FLAGS.raise_terminate();
    nudge(WAKE_FD.load(Ordering::SeqCst));
}

extern "C" fn on_child_exit(_: c_int) {
    FLAGS.raise_child_exited();
    nudge(WAKE_FD.load(Ordering::SeqCst));
}

/// Installs the handlers that feed [`FLAGS`] and returns the channel they
/// write to.
///
/// SIGINT, SIGTERM and SIGQUIT request termination. SIGCHLD reports child
/// exits; stops and continues of children are not reported.
pub fn install() -> Result<Wakeups> {
    let (writer, wakeups) = channel()?;
    WAKE_FD.store(writer, Ordering::SeqCst);

    let terminate = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in &[Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        unsafe { sigaction(*sig, &terminate) }?;
        debug!("Installed handler for {}", sig);
    }

    let child = SigAction::new(
        SigHandler::Handler(on_child_exit),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &child) }?;
    debug!("Installed handler for {}", Signal::SIGCHLD);

    Ok(wakeups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn take_clears() {
        let flags = SignalFlags::new();
        assert!(!flags.take_child_exited());

        flags.raise_child_exited();
        assert!(flags.child_exit_pending());
        assert!(flags.child_exit_pending());
        assert!(flags.take_child_exited());
        assert!(!flags.child_exit_pending());
        assert!(!flags.take_child_exited());

        flags.raise_terminate();
        assert!(flags.terminate_requested());
        assert!(flags.terminate_requested());
        assert!(flags.take_terminate());
        assert!(!flags.terminate_requested());
    }

    #[test]
    fn flags_are_independent() {
        let flags = SignalFlags::new();
        flags.raise_terminate();
        assert!(!flags.take_child_exited());
        assert!(flags.take_terminate());
    }

    #[test]
    fn nudge_wakes_the_reader() {
        let (writer, mut wakeups) = channel().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            wakeups.wait().unwrap();
            tx.send(()).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err(), "woke without a nudge");

        nudge(writer);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn nudge_never_blocks_on_a_full_channel() {
        let (writer, mut wakeups) = channel().unwrap();
        for _ in 0..100_000 {
            nudge(writer);
        }
        wakeups.wait().unwrap();
    }

    #[test]
    fn nudge_keeps_errno() {
        Errno::set_raw(Errno::EINTR as i32);
        nudge(-1);
        assert_eq!(Errno::last(), Errno::EINTR);

        let (writer, _wakeups) = channel().unwrap();
        Errno::set_raw(Errno::EINTR as i32);
        nudge(writer);
        assert_eq!(Errno::last(), Errno::EINTR);
    }
}
