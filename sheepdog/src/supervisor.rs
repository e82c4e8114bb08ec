//! The 'supervisor' module is the top-level controller: one event loop that
//! multiplexes child-pipe readiness, control-socket traffic, and the backoff
//! timer, and the state machine that sequences launch attempts.
//!
//! Phases: `Waiting` covers both the backoff wait (timer armed) and the
//! operator-requested idle state (timer disarmed, `idle` set).  `Running`
//! holds the live child.  `Draining` holds a child that was signalled on
//! operator request; its pipes still deliver residual output, and the
//! recorded disposition decides what happens after the reap.  Success and
//! exhaustion are the loop's `Ok`/`Err` outcomes.

use crate::backoff;
use crate::child::{Child, PipeStatus};
use crate::control::{Incoming, Listener, Request, Sessions};
use crate::logfile::{LogSink, StreamLabel};
use crate::reactor::{self, Reactor, SourceKind};
use crate::signal;
use log::{debug, error, info, warn};
use nix::sys::wait::WaitStatus;
use snafu::ResultExt;
use std::mem;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a run needs to know, prechewed by the argument parser.
#[derive(Debug)]
pub(crate) struct Config {
    /// Child argument vector; element 0 is the program.
    pub(crate) command: Vec<String>,
    pub(crate) socket_path: PathBuf,
    pub(crate) log_file: PathBuf,
    pub(crate) max_attempts: u32,
    pub(crate) base_delay_ms: u64,
    /// Best-effort resident-set cap for the child.
    pub(crate) rss_limit_bytes: Option<u64>,
}

enum Phase {
    Waiting,
    Running(Child),
    Draining(Child, AfterDrain),
}

/// What to do once a deliberately terminated child has been reaped.  In
/// both cases the interrupted attempt is not counted against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterDrain {
    /// Operator STOP: go idle, keep the attempt index for RESUME.
    Stop,
    /// Operator RESTART: begin again from attempt zero.
    Restart,
}

/// Whether the event loop keeps going after an event.
enum Tick {
    Continue,
    Finished,
}

pub(crate) struct Supervisor {
    config: Config,
    reactor: Reactor,
    listener: Listener,
    sessions: Sessions,
    sink: LogSink,
    phase: Phase,
    /// Current retry index; also the backoff exponent.
    attempt: u32,
    /// Operator STOP in force: no timer, no new spawns.
    idle: bool,
    /// A SIGINT arrived; exit with failure once the child is reaped.
    interrupted: bool,
}

impl Supervisor {
    pub(crate) fn new(config: Config) -> Result<Self> {
        let mut reactor = Reactor::new().context(error::ReactorSnafu)?;
        let interrupt_rx = signal::install().context(error::SignalSnafu)?;
        reactor
            .watch_interrupts(interrupt_rx)
            .context(error::ReactorSnafu)?;

        let sink = LogSink::create(&config.log_file).context(error::LogSinkSnafu)?;
        let mut listener = Listener::bind(&config.socket_path).context(error::ControlSocketSnafu)?;
        listener.register(&reactor).context(error::ReactorSnafu)?;

        Ok(Self {
            config,
            reactor,
            listener,
            sessions: Sessions::new(),
            sink,
            phase: Phase::Waiting,
            attempt: 0,
            idle: false,
            interrupted: false,
        })
    }

    /// Drive the loop to a terminal outcome: `Ok(())` when an attempt
    /// succeeds, `Exhausted` when the budget runs out, `Interrupted` when
    /// the operator kills the supervisor itself.
    pub(crate) fn run(&mut self) -> Result<()> {
        info!(
            "Supervising {:?}, up to {} attempts",
            self.config.command, self.config.max_attempts
        );
        self.reactor.arm_timer(self.delay(0));

        loop {
            let kind = match self.reactor.wait_one() {
                Ok(kind) => kind,
                Err(reactor::Error::Interrupted) => {
                    self.on_interrupt()?;
                    continue;
                }
                Err(e) => return Err(e).context(error::ReactorSnafu),
            };

            let tick = match kind {
                SourceKind::ServerAccept => {
                    self.sessions.accept_all(&self.listener, &self.reactor);
                    Tick::Continue
                }
                SourceKind::ClientData(fd) => {
                    self.on_client_data(fd);
                    Tick::Continue
                }
                SourceKind::BackoffTimer => {
                    self.on_timer()?;
                    Tick::Continue
                }
                SourceKind::ChildStdout(fd) => self.on_child_pipe(fd, StreamLabel::Info)?,
                SourceKind::ChildStderr(fd) => self.on_child_pipe(fd, StreamLabel::Error)?,
            };

            if let Tick::Finished = tick {
                return Ok(());
            }
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        backoff::delay(self.config.base_delay_ms, attempt)
    }

    /// The backoff timer fired: launch the next attempt, unless the phase
    /// moved on while the event was in flight.
    fn on_timer(&mut self) -> Result<()> {
        if !matches!(self.phase, Phase::Waiting) || self.idle {
            debug!("Ignoring stale backoff timer");
            return Ok(());
        }
        info!(
            "Attempt {} of {} at running {}",
            self.attempt + 1,
            self.config.max_attempts,
            self.config.command[0]
        );
        match Child::spawn(
            &self.config.command,
            self.config.rss_limit_bytes,
            &self.reactor,
        ) {
            Ok(child) => {
                signal::publish_child(child.pid());
                self.phase = Phase::Running(child);
                Ok(())
            }
            Err(e) if e.is_spawn_failure() => {
                error!("{}", e);
                self.attempt_failed()
            }
            Err(e) => Err(e).context(error::ChildSetupSnafu),
        }
    }

    /// An attempt was consumed without success: move to the next backoff
    /// slot or give up.
    fn attempt_failed(&mut self) -> Result<()> {
        self.attempt += 1;
        if self.attempt >= self.config.max_attempts {
            self.flush_log();
            return error::ExhaustedSnafu {
                attempts: self.attempt,
            }
            .fail();
        }
        let delay = self.delay(self.attempt);
        debug!("Next attempt in {}s", delay.as_secs());
        self.phase = Phase::Waiting;
        self.reactor.arm_timer(delay);
        Ok(())
    }

    /// Readiness on one of the child's pipes: drain it, and when both ends
    /// have reached EOF, reap and dispatch on how the attempt ended.
    fn on_child_pipe(&mut self, fd: RawFd, label: StreamLabel) -> Result<Tick> {
        let open_streams = match &mut self.phase {
            Phase::Running(child) | Phase::Draining(child, _) => {
                if child.drain_pipe(fd, label, &mut self.sink, &self.reactor) == PipeStatus::Open {
                    return Ok(Tick::Continue);
                }
                child.open_streams()
            }
            Phase::Waiting => {
                // The pipe outlived its attempt; nothing to do.
                debug!("Ignoring event for already-closed child pipe");
                return Ok(Tick::Continue);
            }
        };
        if open_streams > 0 {
            return Ok(Tick::Continue);
        }

        // Both pipes are done; the child can be reaped now.
        let (child, disposition) = match mem::replace(&mut self.phase, Phase::Waiting) {
            Phase::Running(child) => (child, None),
            Phase::Draining(child, disposition) => (child, Some(disposition)),
            Phase::Waiting => unreachable!("child pipes drained without a child"),
        };
        signal::clear_child();
        let status = child.reap().context(error::ReapSnafu)?;

        if self.interrupted {
            info!("Exiting on interrupt; child status was {:?}", status);
            self.flush_log();
            return error::InterruptedSnafu.fail();
        }

        match disposition {
            None => {
                if matches!(status, WaitStatus::Exited(_, 0)) {
                    info!("Child exited successfully");
                    self.flush_log();
                    Ok(Tick::Finished)
                } else {
                    info!("Child failed: {:?}", status);
                    self.attempt_failed()?;
                    Ok(Tick::Continue)
                }
            }
            Some(AfterDrain::Restart) => {
                debug!("Child stopped for restart: {:?}", status);
                self.rearm_or_idle();
                Ok(Tick::Continue)
            }
            Some(AfterDrain::Stop) => {
                debug!("Child stopped on operator request: {:?}", status);
                self.rearm_or_idle();
                Ok(Tick::Continue)
            }
        }
    }

    // Post-drain landing spot: back to the wait phase, with the timer armed
    // unless the operator has us idled.
    fn rearm_or_idle(&mut self) {
        self.phase = Phase::Waiting;
        if self.idle {
            self.reactor.disarm_timer();
        } else {
            self.reactor.arm_timer(self.delay(self.attempt));
        }
    }

    fn on_client_data(&mut self, fd: RawFd) {
        for incoming in self.sessions.drain_client(fd, &self.reactor) {
            match incoming {
                Incoming::Command(request) => {
                    if let Some(payload) = self.apply(request) {
                        self.sessions.reply(fd, &payload, &self.reactor);
                    }
                }
                Incoming::Invalid => {
                    self.sessions.reply(fd, "INVALID COMMAND\n", &self.reactor);
                }
            }
        }
    }

    /// Apply one operator command, returning the reply payload if the
    /// command has one.
    fn apply(&mut self, request: Request) -> Option<String> {
        match request {
            Request::GetStatus => Some(match &self.phase {
                Phase::Running(child) | Phase::Draining(child, _) => {
                    format!("RUNNING | PID {}\n", child.pid())
                }
                Phase::Waiting => "IDLE\n".to_string(),
            }),
            Request::Restart => {
                info!("Operator requested restart");
                self.attempt = 0;
                self.idle = false;
                self.phase = match mem::replace(&mut self.phase, Phase::Waiting) {
                    Phase::Running(child) | Phase::Draining(child, _) => {
                        child.terminate();
                        Phase::Draining(child, AfterDrain::Restart)
                    }
                    Phase::Waiting => {
                        self.reactor.arm_timer(self.delay(0));
                        Phase::Waiting
                    }
                };
                None
            }
            Request::Stop => {
                info!("Operator requested stop");
                self.idle = true;
                // The attempt index is left alone, so RESUME retries the
                // interrupted attempt instead of skipping past it.
                self.phase = match mem::replace(&mut self.phase, Phase::Waiting) {
                    Phase::Running(child) | Phase::Draining(child, _) => {
                        child.terminate();
                        Phase::Draining(child, AfterDrain::Stop)
                    }
                    Phase::Waiting => {
                        self.reactor.disarm_timer();
                        Phase::Waiting
                    }
                };
                None
            }
            Request::Resume => {
                if self.idle {
                    info!("Operator requested resume");
                    self.idle = false;
                    if matches!(self.phase, Phase::Waiting) {
                        self.reactor.arm_timer(self.delay(self.attempt));
                    }
                } else {
                    debug!("RESUME while not idle; nothing to do");
                }
                None
            }
        }
    }

    /// A SIGINT arrived.  The handler already forwarded it to the child, so
    /// with a child live we keep looping to drain its pipes; otherwise the
    /// run ends here.
    fn on_interrupt(&mut self) -> Result<()> {
        self.interrupted = true;
        match self.phase {
            Phase::Running(_) | Phase::Draining(..) => {
                info!("Interrupt received; draining child before exit");
                Ok(())
            }
            Phase::Waiting => {
                self.flush_log();
                error::InterruptedSnafu.fail()
            }
        }
    }

    fn flush_log(&mut self) {
        if let Err(e) = self.sink.flush() {
            warn!("{}", e);
        }
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Reactor failure: {}", source))]
        Reactor { source: crate::reactor::Error },

        #[snafu(display("{}", source))]
        LogSink { source: crate::logfile::Error },

        #[snafu(display("{}", source))]
        ControlSocket { source: crate::control::Error },

        #[snafu(display("{}", source))]
        Signal { source: crate::signal::Error },

        #[snafu(display("Failed to set up child process: {}", source))]
        ChildSetup { source: crate::child::Error },

        #[snafu(display("{}", source))]
        Reap { source: crate::child::Error },

        #[snafu(display("Child failed {} times; giving up", attempts))]
        Exhausted { attempts: u32 },

        #[snafu(display("Interrupted by signal"))]
        Interrupted,
    }
}
pub(crate) use error::Error;
pub(crate) type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn test_supervisor(dir: &TempDir) -> Supervisor {
        let config = Config {
            command: vec!["/bin/true".to_string()],
            socket_path: dir.path().join("control.sock"),
            log_file: dir.path().join("log.txt"),
            max_attempts: 10,
            base_delay_ms: 1,
            rss_limit_bytes: None,
        };
        Supervisor::new(config).unwrap()
    }

    #[test]
    fn restart_resets_the_attempt_counter() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        supervisor.attempt = 5;
        supervisor.idle = true;

        assert_eq!(supervisor.apply(Request::Restart), None);
        assert_eq!(supervisor.attempt, 0);
        assert!(!supervisor.idle);
        assert!(supervisor.reactor.timer_armed());
    }

    #[test]
    fn stop_keeps_the_attempt_counter_and_disarms_the_timer() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        supervisor.attempt = 4;
        supervisor.reactor.arm_timer(Duration::from_secs(60));

        assert_eq!(supervisor.apply(Request::Stop), None);
        assert!(supervisor.idle);
        assert_eq!(supervisor.attempt, 4);
        assert!(!supervisor.reactor.timer_armed());
    }

    #[test]
    fn resume_rearms_with_the_preserved_attempt() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        supervisor.attempt = 4;
        supervisor.apply(Request::Stop);

        assert_eq!(supervisor.apply(Request::Resume), None);
        assert!(!supervisor.idle);
        assert_eq!(supervisor.attempt, 4);
        assert!(supervisor.reactor.timer_armed());
    }

    #[test]
    fn resume_without_stop_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        supervisor.reactor.disarm_timer();

        supervisor.apply(Request::Resume);
        assert!(!supervisor.idle);
        assert!(!supervisor.reactor.timer_armed());
    }

    #[test]
    fn status_without_a_child_reads_idle() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        assert_eq!(supervisor.apply(Request::GetStatus).as_deref(), Some("IDLE\n"));
    }

    #[test]
    fn stale_timer_in_idle_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = test_supervisor(&dir);
        supervisor.idle = true;
        supervisor.on_timer().unwrap();
        assert!(matches!(supervisor.phase, Phase::Waiting));
    }
}
