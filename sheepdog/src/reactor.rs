//! The 'reactor' module wraps the OS event-notification facility (epoll on
//! Linux, kqueue on the BSDs, via mio) behind the small surface the
//! supervisor loop needs: register readable sources tagged with a
//! [`SourceKind`], arm a single one-shot backoff timer, and block for one
//! event at a time.
//!
//! The kind tag is encoded into the mio token itself, so dispatch needs no
//! side table: decoding the token of a delivered event yields the kind
//! verbatim.

use log::warn;
use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use snafu::ResultExt;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

// Token layout: the low three bits carry the kind tag, the rest carry the
// file descriptor (where the kind has one).
const TAG_BITS: usize = 3;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;
const TAG_SERVER: usize = 0;
const TAG_CLIENT: usize = 1;
const TAG_STDOUT: usize = 2;
const TAG_STDERR: usize = 3;
const TAG_TIMER: usize = 4;
// Internal: readiness of the signal self-pipe.  Never surfaces as a kind;
// it is reported through `Error::Interrupted` instead.
const TAG_INTERRUPT: usize = 5;

/// Which logical source produced an event.  This is the sole dispatch
/// discriminator for the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKind {
    /// The listening control socket has a connection to accept.
    ServerAccept,
    /// An accepted control connection has data (or EOF).
    ClientData(RawFd),
    /// The child's stdout pipe is readable.
    ChildStdout(RawFd),
    /// The child's stderr pipe is readable.
    ChildStderr(RawFd),
    /// The one-shot backoff timer expired.
    BackoffTimer,
}

impl SourceKind {
    fn token(self) -> Token {
        match self {
            SourceKind::ServerAccept => Token(TAG_SERVER),
            SourceKind::ClientData(fd) => Token((fd as usize) << TAG_BITS | TAG_CLIENT),
            SourceKind::ChildStdout(fd) => Token((fd as usize) << TAG_BITS | TAG_STDOUT),
            SourceKind::ChildStderr(fd) => Token((fd as usize) << TAG_BITS | TAG_STDERR),
            SourceKind::BackoffTimer => Token(TAG_TIMER),
        }
    }

    fn from_token(token: Token) -> Self {
        let fd = (token.0 >> TAG_BITS) as RawFd;
        match token.0 & TAG_MASK {
            TAG_SERVER => SourceKind::ServerAccept,
            TAG_CLIENT => SourceKind::ClientData(fd),
            TAG_STDOUT => SourceKind::ChildStdout(fd),
            TAG_STDERR => SourceKind::ChildStderr(fd),
            _ => SourceKind::BackoffTimer,
        }
    }
}

/// Single-threaded event demultiplexer.  `wait_one` is the loop's only
/// suspension point; everything else returns immediately.
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    // Events already received from the kernel but not yet handed out.
    ready: VecDeque<SourceKind>,
    // One-shot backoff deadline; arming overwrites any previous deadline.
    deadline: Option<Instant>,
    // Read end of the SIGINT self-pipe, once attached.
    interrupt_rx: Option<OwnedFd>,
}

impl Reactor {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new().context(error::CreateSnafu)?,
            events: Events::with_capacity(32),
            ready: VecDeque::new(),
            deadline: None,
            interrupt_rx: None,
        })
    }

    /// Register a readable source under the given kind tag.
    pub(crate) fn register<S>(&self, source: &mut S, kind: SourceKind) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .register(source, kind.token(), Interest::READABLE)
            .context(error::RegisterSnafu { kind })
    }

    /// Register a bare descriptor (pipe read ends) under the given kind.
    pub(crate) fn register_fd(&self, fd: RawFd, kind: SourceKind) -> Result<()> {
        self.register(&mut SourceFd(&fd), kind)
    }

    pub(crate) fn deregister<S>(&self, source: &mut S) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .deregister(source)
            .context(error::DeregisterSnafu)
    }

    pub(crate) fn deregister_fd(&self, fd: RawFd) -> Result<()> {
        self.deregister(&mut SourceFd(&fd))
    }

    /// Attach the read end of the signal self-pipe.  A byte written there by
    /// the signal handler wakes `wait_one`, which then reports
    /// [`Error::Interrupted`].
    pub(crate) fn watch_interrupts(&mut self, rx: OwnedFd) -> Result<()> {
        self.poll
            .registry()
            .register(
                &mut SourceFd(&rx.as_raw_fd()),
                Token(TAG_INTERRUPT),
                Interest::READABLE,
            )
            .context(error::WatchInterruptsSnafu)?;
        self.interrupt_rx = Some(rx);
        Ok(())
    }

    /// Arm the one-shot backoff timer, cancelling any previous deadline.
    pub(crate) fn arm_timer(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    pub(crate) fn disarm_timer(&mut self) {
        self.deadline = None;
    }

    #[cfg(test)]
    pub(crate) fn timer_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Block until one event is available and return its kind.  Events that
    /// arrive together are queued and handed out one call at a time, so a
    /// reply written for one event always precedes the handling of the next.
    pub(crate) fn wait_one(&mut self) -> Result<SourceKind> {
        loop {
            if let Some(kind) = self.ready.pop_front() {
                return Ok(kind);
            }

            let timeout = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        self.deadline = None;
                        return Ok(SourceKind::BackoffTimer);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                // A signal landed mid-wait.  Report the interrupt before the
                // timer deadline gets a chance to launch anything new.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if self.take_interrupt() {
                        return error::InterruptedSnafu.fail();
                    }
                    continue;
                }
                Err(e) => return Err(e).context(error::WaitSnafu),
            }

            let mut interrupted = false;
            for event in self.events.iter() {
                if event.token() == Token(TAG_INTERRUPT) {
                    interrupted = true;
                } else {
                    self.ready.push_back(SourceKind::from_token(event.token()));
                }
            }
            if interrupted {
                self.take_interrupt();
                return error::InterruptedSnafu.fail();
            }
        }
    }

    // Consume queued wakeup bytes so the next signal produces a fresh edge;
    // reports whether any were pending.
    fn take_interrupt(&self) -> bool {
        let mut seen = false;
        if let Some(rx) = &self.interrupt_rx {
            let mut buf = [0u8; 16];
            loop {
                match nix::unistd::read(rx.as_raw_fd(), &mut buf) {
                    Ok(0) => break,
                    Ok(_) => seen = true,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(nix::errno::Errno::EAGAIN) => break,
                    Err(e) => {
                        warn!("Failed to drain signal pipe: {}", e);
                        break;
                    }
                }
            }
        }
        seen
    }
}

mod error {
    use super::SourceKind;
    use snafu::Snafu;
    use std::io;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to create event poller: {}", source))]
        Create { source: io::Error },

        #[snafu(display("Failed to register {:?} with the reactor: {}", kind, source))]
        Register {
            kind: SourceKind,
            source: io::Error,
        },

        #[snafu(display("Failed to deregister event source: {}", source))]
        Deregister { source: io::Error },

        #[snafu(display("Failed to watch the signal pipe: {}", source))]
        WatchInterrupts { source: io::Error },

        #[snafu(display("Failed to wait for events: {}", source))]
        Wait { source: io::Error },

        #[snafu(display("Interrupted by signal"))]
        Interrupted,
    }
}
pub(crate) use error::Error;
pub(crate) type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::os::fd::FromRawFd;

    #[test]
    fn token_encoding_round_trips() {
        let kinds = [
            SourceKind::ServerAccept,
            SourceKind::ClientData(7),
            SourceKind::ChildStdout(123),
            SourceKind::ChildStderr(4096),
            SourceKind::BackoffTimer,
        ];
        for kind in kinds {
            assert_eq!(SourceKind::from_token(kind.token()), kind);
        }
    }

    #[test]
    fn expired_timer_is_delivered_as_event() {
        let mut reactor = Reactor::new().unwrap();
        reactor.arm_timer(Duration::from_secs(0));
        assert_eq!(reactor.wait_one().unwrap(), SourceKind::BackoffTimer);
        assert!(!reactor.timer_armed());
    }

    #[test]
    fn rearming_replaces_previous_deadline() {
        let mut reactor = Reactor::new().unwrap();
        reactor.arm_timer(Duration::from_secs(3600));
        reactor.arm_timer(Duration::from_secs(0));
        assert_eq!(reactor.wait_one().unwrap(), SourceKind::BackoffTimer);
    }

    #[test]
    fn readable_pipe_reports_its_kind() {
        let mut reactor = Reactor::new().unwrap();
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(rx), OwnedFd::from_raw_fd(tx)) };
        let kind = SourceKind::ChildStdout(rx.as_raw_fd());
        reactor.register_fd(rx.as_raw_fd(), kind).unwrap();

        nix::unistd::write(tx.as_raw_fd(), b"x").unwrap();
        assert_eq!(reactor.wait_one().unwrap(), kind);
        reactor.deregister_fd(rx.as_raw_fd()).unwrap();
    }
}
