/*!
sheepdog launches a designated child program and herds it: the child's
stdout and stderr are captured into a timestamped, leveled log file, failed
runs are relaunched with base-3 exponential backoff, and a line-framed
control protocol on a local domain socket lets an operator query status and
steer the supervisor at runtime.

# Control protocol

Commands are exact, newline-terminated lines of at most 32 bytes on the
socket (default `/tmp/parent.socket`); replies are NUL-padded 100-byte
frames.

* `GET_STATUS` - replies `RUNNING | PID <pid>` while a child is live,
  `IDLE` otherwise.
* `RESTART` - terminate any live child and start over from attempt zero.
* `STOP` - terminate any live child and go idle; the interrupted attempt is
  not counted.
* `RESUME` - leave the idle state and retry the pending attempt.

Anything else is answered with `INVALID COMMAND`.

A `SIGINT` sent to the supervisor is forwarded to the child; once the
child's output has drained, the supervisor exits with a failure status.

# Running

With no positional arguments sheepdog runs the test child `./ChildProcess`
(its failing variant with `--fail`); otherwise the positional arguments
form the child command vector.  The process exits 0 when an attempt
succeeds and nonzero on exhaustion, setup failure, or interrupt.
*/

mod args;
mod backoff;
mod child;
mod control;
mod logfile;
mod reactor;
mod signal;
mod supervisor;
#[cfg(test)]
mod supervisor_test;

use crate::args::Arguments;
use crate::supervisor::Supervisor;
use simplelog::{Config as LogConfig, SimpleLogger};
use snafu::ResultExt;
use std::process;

fn run() -> Result<()> {
    let args: Arguments = argh::from_env();
    SimpleLogger::init(args.log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    let mut supervisor =
        Supervisor::new(args.into_config()).context(error::SuperviseSnafu)?;
    supervisor.run().context(error::SuperviseSnafu)
}

// Returning a Result from main makes it print a Debug representation of the
// error, but with Snafu we have nice Display representations, so we wrap
// "main" (run) and print any error.
fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        process::exit(1);
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(display("Failed to set up logger: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("{}", source))]
        Supervise { source: crate::supervisor::Error },
    }
}

type Result<T> = std::result::Result<T, error::Error>;
