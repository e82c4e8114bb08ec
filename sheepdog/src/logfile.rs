//! The 'logfile' module owns the append-only capture log.  Every chunk read
//! from the child's stdout or stderr becomes exactly one record, prefixed
//! with a local-time stamp and a stream label, with the payload bytes passed
//! through untranslated.

use chrono::Local;
use snafu::ResultExt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Stamp prefixed to every record, e.g. `***02-28-2026 13:45:07***`.
const TIMESTAMP_FORMAT: &str = "***%m-%d-%Y %H:%M:%S***";

/// Which child stream a captured chunk came from.  The rendered labels keep
/// their exact historical spacing; downstream tooling matches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamLabel {
    /// Child stdout.
    Info,
    /// Child stderr.
    Error,
}

impl StreamLabel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            StreamLabel::Info => " [INFO]   ",
            StreamLabel::Error => " [ERROR]  ",
        }
    }
}

/// Buffered writer for the capture log.  The file is truncated when the
/// sink is created and flushed explicitly on the success and exhaustion
/// exit paths.
#[derive(Debug)]
pub(crate) struct LogSink {
    out: BufWriter<File>,
}

impl LogSink {
    pub(crate) fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).context(error::CreateSnafu { path })?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Write one record for a captured chunk.  Embedded newlines in the
    /// payload are preserved; no escaping or translation happens here.
    pub(crate) fn record(&mut self, label: StreamLabel, chunk: &[u8]) -> Result<()> {
        let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        self.out
            .write_all(stamp.as_bytes())
            .context(error::WriteSnafu)?;
        self.out
            .write_all(label.as_str().as_bytes())
            .context(error::WriteSnafu)?;
        self.out.write_all(chunk).context(error::WriteSnafu)?;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.out.flush().context(error::WriteSnafu)
    }
}

mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to create log file '{}': {}", path.display(), source))]
        Create { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to write log record: {}", source))]
        Write { source: io::Error },
    }
}
pub(crate) use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDateTime;
    use std::fs;

    #[test]
    fn record_format_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let mut sink = LogSink::create(&path).unwrap();
        sink.record(StreamLabel::Info, b"hello\n").unwrap();
        sink.record(StreamLabel::Error, b"a\nb").unwrap();
        sink.flush().unwrap();

        let log = fs::read_to_string(&path).unwrap();
        let mut records = log.split("***").skip(1);

        // First record: timestamp, INFO label, payload.
        let stamp = records.next().unwrap();
        NaiveDateTime::parse_from_str(stamp, "%m-%d-%Y %H:%M:%S").unwrap();
        let rest = records.next().unwrap();
        assert!(rest.starts_with(" [INFO]   hello\n"), "got: {:?}", rest);

        // Second record keeps the embedded newline verbatim.
        assert!(log.ends_with(" [ERROR]  a\nb"), "got: {:?}", log);
    }

    #[test]
    fn create_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "stale contents").unwrap();
        let mut sink = LogSink::create(&path).unwrap();
        sink.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn labels_keep_exact_spacing() {
        assert_eq!(StreamLabel::Info.as_str(), " [INFO]   ");
        assert_eq!(StreamLabel::Error.as_str(), " [ERROR]  ");
    }
}
