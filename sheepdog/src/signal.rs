//! SIGINT handling.  The handler forwards the signal to the current child
//! (pid published through an atomic cell) and pokes a self-pipe so the
//! event loop wakes and can drain the child's pipes before exiting.
//!
//! Everything the handler touches is async-signal-safe: two atomic loads
//! and the raw `kill(2)` / `write(2)` calls.

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe2, Pid};
use snafu::ResultExt;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

// Current child pid, or 0 when no child is live.  Written by the event loop
// between reap points only.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

// Write end of the self-pipe; lives for the rest of the process.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

/// Install the SIGINT forwarder and hand back the read end of the wakeup
/// pipe for the reactor to watch.
pub(crate) fn install() -> Result<OwnedFd> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).context(error::PipeSnafu)?;
    NOTIFY_FD.store(tx, Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(forward),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }.context(error::InstallSnafu)?;

    Ok(unsafe { OwnedFd::from_raw_fd(rx) })
}

/// Publish the pid of a freshly spawned child so the handler can reach it.
pub(crate) fn publish_child(pid: Pid) {
    CHILD_PID.store(pid.as_raw(), Ordering::SeqCst);
}

/// Clear the published pid once the child has been reaped.
pub(crate) fn clear_child() {
    CHILD_PID.store(0, Ordering::SeqCst);
}

extern "C" fn forward(signo: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, signo);
        }
    }
    let fd = NOTIFY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to create signal wakeup pipe: {}", source))]
        Pipe { source: nix::Error },

        #[snafu(display("Failed to install SIGINT handler: {}", source))]
        Install { source: nix::Error },
    }
}
pub(crate) use error::Error;
type Result<T> = std::result::Result<T, error::Error>;
