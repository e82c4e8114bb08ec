//! The 'control' module owns the operator-facing side of the supervisor:
//! the listening domain socket, the accepted client sessions, and the
//! line-framed wire protocol.
//!
//! Commands are exact, case-sensitive, newline-terminated lines of at most
//! 32 bytes.  Replies are NUL-padded to a fixed 100-byte frame so clients
//! can read a constant amount.

use crate::reactor::{Reactor, SourceKind};
use log::{debug, info, warn};
use mio::net::{UnixListener, UnixStream};
use snafu::ResultExt;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Longest accepted command frame, newline included.
pub(crate) const MAX_COMMAND_LEN: usize = 32;

/// Fixed size of every reply frame; short payloads are NUL-padded.
pub(crate) const REPLY_LEN: usize = 100;

/// A recognized operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    GetStatus,
    Restart,
    Stop,
    Resume,
}

impl Request {
    /// Parse one command frame.  Anything that is not an exact match,
    /// trailing newline included, is rejected.
    pub(crate) fn parse(frame: &[u8]) -> Option<Self> {
        match frame {
            b"GET_STATUS\n" => Some(Request::GetStatus),
            b"RESTART\n" => Some(Request::Restart),
            b"STOP\n" => Some(Request::Stop),
            b"RESUME\n" => Some(Request::Resume),
            _ => None,
        }
    }
}

/// Something a client session delivered to the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Incoming {
    Command(Request),
    /// Unrecognized frame; the standard rejection reply is owed.
    Invalid,
}

/// Pad a reply payload to the fixed frame size.
pub(crate) fn reply_frame(payload: &str) -> [u8; REPLY_LEN] {
    debug_assert!(payload.len() <= REPLY_LEN);
    let mut frame = [0u8; REPLY_LEN];
    frame[..payload.len()].copy_from_slice(payload.as_bytes());
    frame
}

/// The listening control socket.  Binding removes any stale socket file a
/// crashed run left behind; dropping the listener reclaims the path.
#[derive(Debug)]
pub(crate) struct Listener {
    listener: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub(crate) fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale control socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(error::RemoveStaleSnafu { path });
            }
        }
        let listener = UnixListener::bind(&path).context(error::BindSnafu { path: path.clone() })?;
        Ok(Self { listener, path })
    }

    pub(crate) fn register(&mut self, reactor: &Reactor) -> crate::reactor::Result<()> {
        reactor.register(&mut self.listener, SourceKind::ServerAccept)
    }

    fn accept(&self) -> io::Result<(UnixStream, std::os::unix::net::SocketAddr)> {
        self.listener.accept()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove control socket {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Accepted control connections, keyed by descriptor.  Sessions are
/// stateless beyond the single command frame being served, so this is all
/// the bookkeeping they need.
#[derive(Debug, Default)]
pub(crate) struct Sessions {
    clients: HashMap<RawFd, UnixStream>,
}

impl Sessions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept every pending connection and register each as a client data
    /// source.  Accept errors are logged and ignored; the listener stays up.
    pub(crate) fn accept_all(&mut self, listener: &Listener, reactor: &Reactor) {
        loop {
            match listener.accept() {
                Ok((mut stream, _addr)) => {
                    let fd = stream.as_raw_fd();
                    info!("Control client connected");
                    if let Err(e) = reactor.register(&mut stream, SourceKind::ClientData(fd)) {
                        // Losing one session must not take the supervisor
                        // down with it.
                        warn!("Failed to watch control client: {}", e);
                        continue;
                    }
                    self.clients.insert(fd, stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Failed to accept control client: {}", e);
                    break;
                }
            }
        }
    }

    /// Read whatever the client has sent, one command frame per read.  A
    /// zero-byte read or a hard error retires the session.
    pub(crate) fn drain_client(&mut self, fd: RawFd, reactor: &Reactor) -> Vec<Incoming> {
        let mut incoming = Vec::new();
        let mut retire = false;
        {
            let stream = match self.clients.get_mut(&fd) {
                Some(stream) => stream,
                None => return incoming,
            };
            let mut buf = [0u8; MAX_COMMAND_LEN];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        retire = true;
                        break;
                    }
                    Ok(n) => match Request::parse(&buf[..n]) {
                        Some(request) => incoming.push(Incoming::Command(request)),
                        None => {
                            debug!("Rejecting unrecognized control command");
                            incoming.push(Incoming::Invalid);
                        }
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("Error reading control client: {}", e);
                        retire = true;
                        break;
                    }
                }
            }
        }
        if retire {
            self.retire(fd, reactor);
        }
        incoming
    }

    /// Best-effort reply: the payload is padded to the fixed frame and
    /// written; a failed write retires only this session.
    pub(crate) fn reply(&mut self, fd: RawFd, payload: &str, reactor: &Reactor) {
        let frame = reply_frame(payload);
        let failed = match self.clients.get_mut(&fd) {
            Some(stream) => stream.write_all(&frame).is_err(),
            None => false,
        };
        if failed {
            debug!("Failed to write reply to control client");
            self.retire(fd, reactor);
        }
    }

    fn retire(&mut self, fd: RawFd, reactor: &Reactor) {
        if let Some(mut stream) = self.clients.remove(&fd) {
            if let Err(e) = reactor.deregister(&mut stream) {
                debug!("Failed to deregister control client: {}", e);
            }
            info!("Control client disconnected");
        }
    }
}

mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to remove stale socket '{}': {}", path.display(), source))]
        RemoveStale { path: PathBuf, source: io::Error },

        #[snafu(display("Failed to bind control socket '{}': {}", path.display(), source))]
        Bind { path: PathBuf, source: io::Error },
    }
}
pub(crate) use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recognized_commands_parse_exactly() {
        assert_eq!(Request::parse(b"GET_STATUS\n"), Some(Request::GetStatus));
        assert_eq!(Request::parse(b"RESTART\n"), Some(Request::Restart));
        assert_eq!(Request::parse(b"STOP\n"), Some(Request::Stop));
        assert_eq!(Request::parse(b"RESUME\n"), Some(Request::Resume));
    }

    #[test]
    fn near_misses_are_rejected() {
        // Missing newline.
        assert_eq!(Request::parse(b"STOP"), None);
        // Prefixes must not match.
        assert_eq!(Request::parse(b"GET_ST\n"), None);
        // Case matters.
        assert_eq!(Request::parse(b"stop\n"), None);
        // Trailing garbage.
        assert_eq!(Request::parse(b"STOP\nRESUME\n"), None);
        assert_eq!(Request::parse(b""), None);
    }

    #[test]
    fn reply_frames_are_padded_to_fixed_size() {
        let frame = reply_frame("IDLE\n");
        assert_eq!(frame.len(), REPLY_LEN);
        assert_eq!(&frame[..5], b"IDLE\n");
        assert!(frame[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn binding_replaces_a_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        std::fs::write(&path, "stale").unwrap();
        let listener = Listener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        // The drop guard reclaims the path.
        assert!(!path.exists());
    }
}
