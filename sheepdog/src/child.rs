//! The 'child' module owns one supervised attempt: the spawned process, the
//! read ends of its stdout/stderr pipes, and the reap that finishes the
//! attempt once both pipes have drained to EOF.

use crate::logfile::{LogSink, StreamLabel};
use crate::reactor::{Reactor, SourceKind};
use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{pipe2, read, Pid};
use snafu::{ensure, OptionExt, ResultExt};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

/// How much child output one read grabs; one log record is written per
/// chunk actually read.
const READ_CHUNK: usize = 2048;

/// Whether a pipe read end is still delivering data after a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeStatus {
    Open,
    Closed,
}

/// A spawned child process plus the pipe read ends the parent still holds.
/// The write ends are handed to the child at spawn and the parent's copies
/// are closed as part of the spawn itself.
#[derive(Debug)]
pub(crate) struct Child {
    pid: Pid,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

impl Child {
    /// Create the stdout/stderr pipes, spawn `argv` with the write ends as
    /// its fds 1 and 2, and register the (non-blocking) read ends with the
    /// reactor.
    pub(crate) fn spawn(
        argv: &[String],
        rss_limit_bytes: Option<u64>,
        reactor: &Reactor,
    ) -> Result<Self> {
        ensure!(!argv.is_empty(), error::EmptyCommandSnafu);

        let (stdout_rx, stdout_tx) = pipe_pair()?;
        let (stderr_rx, stderr_tx) = pipe_pair()?;
        set_nonblocking(&stdout_rx)?;
        set_nonblocking(&stderr_rx)?;

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        // Stdio takes over the write ends; the spawn machinery dup2s them
        // onto the child's fds 1 and 2 and closes the parent's copies.
        command.stdout(unsafe { Stdio::from_raw_fd(stdout_tx.into_raw_fd()) });
        command.stderr(unsafe { Stdio::from_raw_fd(stderr_tx.into_raw_fd()) });
        if let Some(bytes) = rss_limit_bytes {
            // Runs after fork, before exec, in the child.
            unsafe {
                command.pre_exec(move || apply_rss_limit(bytes));
            }
        }

        let spawned = command.spawn().context(error::SpawnSnafu {
            program: argv[0].clone(),
        })?;
        let pid_raw = i32::try_from(spawned.id()).ok().context(error::InvalidPidSnafu {
            given: spawned.id(),
        })?;
        let pid = Pid::from_raw(pid_raw);
        debug!("Spawned child with pid {}", pid);

        let child = Self {
            pid,
            stdout: Some(stdout_rx),
            stderr: Some(stderr_rx),
        };
        // If the read ends can't be watched the attempt can never complete;
        // stop the process we just started before reporting the failure.
        child.register_pipes(reactor).map_err(|e| {
            child.terminate();
            e
        })?;
        Ok(child)
    }

    fn register_pipes(&self, reactor: &Reactor) -> Result<()> {
        let stdout_fd = self.stdout.as_ref().expect("stdout read end").as_raw_fd();
        let stderr_fd = self.stderr.as_ref().expect("stderr read end").as_raw_fd();
        reactor
            .register_fd(stdout_fd, SourceKind::ChildStdout(stdout_fd))
            .context(error::WatchPipeSnafu)?;
        reactor
            .register_fd(stderr_fd, SourceKind::ChildStderr(stderr_fd))
            .context(error::WatchPipeSnafu)?;
        Ok(())
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    /// How many pipe read ends are still open.
    pub(crate) fn open_streams(&self) -> usize {
        self.stdout.is_some() as usize + self.stderr.is_some() as usize
    }

    /// Read the given pipe until it would block, writing one log record per
    /// chunk.  On EOF (or a hard read error, treated the same) the read end
    /// is deregistered and closed.
    pub(crate) fn drain_pipe(
        &mut self,
        fd: RawFd,
        label: StreamLabel,
        sink: &mut LogSink,
        reactor: &Reactor,
    ) -> PipeStatus {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = sink.record(label, &buf[..n]) {
                        warn!("Dropping captured chunk: {}", e);
                    }
                }
                Err(Errno::EAGAIN) => return PipeStatus::Open,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Error reading child pipe, treating as EOF: {}", e);
                    break;
                }
            }
        }

        if let Err(e) = reactor.deregister_fd(fd) {
            warn!("Failed to deregister drained pipe: {}", e);
        }
        self.release_stream(fd);
        PipeStatus::Closed
    }

    // Drop the read end matching `fd`, closing it.
    fn release_stream(&mut self, fd: RawFd) {
        if self.stdout.as_ref().map(|f| f.as_raw_fd()) == Some(fd) {
            self.stdout = None;
        } else if self.stderr.as_ref().map(|f| f.as_raw_fd()) == Some(fd) {
            self.stderr = None;
        }
    }

    /// Ask the child to exit.  Its pipes keep delivering whatever it writes
    /// on the way down; the normal EOF path finishes the attempt.
    pub(crate) fn terminate(&self) {
        match kill(self.pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to signal child {}: {}", self.pid, e),
        }
    }

    /// Wait for the child and return its status.  Callers only get here
    /// after both pipes reached EOF, so both ends of the attempt are done.
    pub(crate) fn reap(self) -> Result<WaitStatus> {
        debug_assert_eq!(self.open_streams(), 0);
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => return Ok(status),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context(error::ReapSnafu { pid: self.pid }),
            }
        }
    }
}

fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC).context(error::CreatePipeSnafu)?;
    Ok(unsafe { (OwnedFd::from_raw_fd(rx), OwnedFd::from_raw_fd(tx)) })
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .context(error::NonblockingSnafu)?;
    Ok(())
}

/// Cap the child's resident set where the kernel supports it.  The limit is
/// advisory on modern Linux; failures are ignored rather than failing the
/// spawn.
#[cfg(target_os = "linux")]
fn apply_rss_limit(bytes: u64) -> io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};
    let _ = setrlimit(Resource::RLIMIT_RSS, bytes, bytes);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_rss_limit(_bytes: u64) -> io::Result<()> {
    // No usable RLIMIT_RSS here.
    Ok(())
}

mod error {
    use nix::unistd::Pid;
    use snafu::Snafu;
    use std::io;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("No child command given"))]
        EmptyCommand,

        #[snafu(display("Unable to create pipe for child output: {}", source))]
        CreatePipe { source: nix::Error },

        #[snafu(display("Unable to make pipe read end non-blocking: {}", source))]
        Nonblocking { source: nix::Error },

        #[snafu(display("Failed to spawn '{}': {}", program, source))]
        Spawn { program: String, source: io::Error },

        #[snafu(display("Child had invalid PID '{}', should never happen", given))]
        InvalidPid { given: u32 },

        #[snafu(display("Failed to watch child pipe: {}", source))]
        WatchPipe { source: crate::reactor::Error },

        #[snafu(display("Failed to wait for child {}: {}", pid, source))]
        Reap { pid: Pid, source: nix::Error },
    }
}
pub(crate) use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

impl Error {
    /// Spawn failures consume an attempt; everything else in this module is
    /// a setup invariant and aborts the supervisor.
    pub(crate) fn is_spawn_failure(&self) -> bool {
        matches!(self, Error::Spawn { .. })
    }
}
