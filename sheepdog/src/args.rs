//! Command line arguments for the sheepdog program.

use crate::supervisor::Config;
use argh::FromArgs;
use log::LevelFilter;
use std::path::PathBuf;

const DEFAULT_CHILD_PROGRAM: &str = "./ChildProcess";
const DEFAULT_SOCKET_PATH: &str = "/tmp/parent.socket";
const DEFAULT_LOG_FILE: &str = "./log.txt";
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_BASE_DELAY_MS: u64 = 1;
const DEFAULT_RSS_LIMIT_MB: u64 = 512;

fn default_log_level() -> LevelFilter {
    LevelFilter::Info
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_log_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_FILE)
}

/// Launch a child program, capture its output into a timestamped log, retry
/// failures with exponential backoff, and serve operator commands over a
/// local control socket.
#[derive(FromArgs, Debug, PartialEq)]
pub(crate) struct Arguments {
    /// logging verbosity [trace|debug|info|warn|error]
    #[argh(option, short = 'l', long = "log-level", default = "default_log_level()")]
    pub(crate) log_level: LevelFilter,

    /// path of the control socket [default: /tmp/parent.socket]
    #[argh(option, long = "socket-path", default = "default_socket_path()")]
    pub(crate) socket_path: PathBuf,

    /// file receiving the child's captured output [default: ./log.txt]
    #[argh(option, long = "log-file", default = "default_log_file()")]
    pub(crate) log_file: PathBuf,

    /// launch attempts before giving up [default: 10]
    #[argh(option, long = "max-attempts", default = "DEFAULT_MAX_ATTEMPTS")]
    pub(crate) max_attempts: u32,

    /// base backoff delay in milliseconds [default: 1]
    #[argh(option, long = "base-delay-ms", default = "DEFAULT_BASE_DELAY_MS")]
    pub(crate) base_delay_ms: u64,

    /// best-effort resident-set cap for the child in MiB, 0 to disable
    /// [default: 512]
    #[argh(option, long = "rss-limit-mb", default = "DEFAULT_RSS_LIMIT_MB")]
    pub(crate) rss_limit_mb: u64,

    /// run the failing variant of the default test child
    #[argh(switch)]
    pub(crate) fail: bool,

    /// child command and arguments [default: ./ChildProcess]
    #[argh(positional)]
    pub(crate) command: Vec<String>,
}

impl Arguments {
    pub(crate) fn into_config(self) -> Config {
        // With no command given, fall back to the test child; `--fail`
        // selects its failing variant.  An explicit command is taken as-is.
        let command = if self.command.is_empty() {
            let mut command = vec![DEFAULT_CHILD_PROGRAM.to_string()];
            if self.fail {
                command.push("1".to_string());
            }
            command
        } else {
            self.command
        };

        Config {
            command,
            socket_path: self.socket_path,
            log_file: self.log_file,
            // A budget of zero would exit before the first launch.
            max_attempts: self.max_attempts.max(1),
            base_delay_ms: self.base_delay_ms,
            rss_limit_bytes: match self.rss_limit_mb {
                0 => None,
                mb => Some(mb * 1024 * 1024),
            },
        }
    }
}
