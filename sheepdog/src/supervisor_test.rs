//! End-to-end runs of the supervisor loop against real child processes and
//! a real control socket.

use crate::control::REPLY_LEN;
use crate::supervisor::{Config, Error, Supervisor};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir, script: &str, max_attempts: u32) -> Config {
    Config {
        command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        socket_path: dir.path().join("control.sock"),
        log_file: dir.path().join("log.txt"),
        max_attempts,
        base_delay_ms: 1,
        rss_limit_bytes: None,
    }
}

fn send(stream: &mut UnixStream, command: &str) {
    stream.write_all(command.as_bytes()).unwrap();
}

fn read_reply(stream: &mut UnixStream) -> String {
    let mut frame = [0u8; REPLY_LEN];
    stream.read_exact(&mut frame).unwrap();
    let end = frame.iter().position(|&b| b == 0).unwrap_or(REPLY_LEN);
    String::from_utf8_lossy(&frame[..end]).into_owned()
}

#[test]
fn successful_child_ends_the_run_with_one_info_record() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "echo hello", 10);
    let log_file = config.log_file.clone();
    let socket_path = config.socket_path.clone();

    let mut supervisor = Supervisor::new(config).unwrap();
    supervisor.run().unwrap();
    drop(supervisor);

    let log = fs::read_to_string(&log_file).unwrap();
    assert!(log.starts_with("***"), "log was: {:?}", log);
    assert!(log.contains(" [INFO]   hello\n"), "log was: {:?}", log);
    assert_eq!(log.matches("hello").count(), 1);
    // The socket path is reclaimed on the way out.
    assert!(!socket_path.exists());
}

#[test]
fn failing_child_exhausts_the_attempt_budget() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir, "echo boom >&2; exit 1", 3);
    let log_file = config.log_file.clone();

    let mut supervisor = Supervisor::new(config).unwrap();
    match supervisor.run() {
        Err(Error::Exhausted { attempts: 3 }) => {}
        other => panic!("expected exhaustion after 3 attempts, got {:?}", other),
    }
    drop(supervisor);

    let log = fs::read_to_string(&log_file).unwrap();
    assert_eq!(log.matches(" [ERROR]  boom\n").count(), 3, "log was: {:?}", log);
    assert_eq!(log.matches(" [INFO]   ").count(), 0);
}

#[test]
fn control_session_drives_status_stop_and_resume() {
    let dir = TempDir::new().unwrap();
    // Long enough that STOP lands while the child is still running, short
    // enough that the resumed attempt finishes the test.
    let config = test_config(&dir, "sleep 2", 10);
    let socket_path = config.socket_path.clone();

    // Binding happens in Supervisor::new, so the socket is connectable
    // before the loop starts; the backlog holds the connection until the
    // first accept.
    let supervisor = Supervisor::new(config).unwrap();
    let runner = thread::spawn(move || {
        let mut supervisor = supervisor;
        supervisor.run()
    });

    let mut stream = UnixStream::connect(&socket_path).unwrap();

    // Give the loop time to spawn the first attempt.
    thread::sleep(Duration::from_millis(500));
    send(&mut stream, "GET_STATUS\n");
    let status = read_reply(&mut stream);
    assert!(
        status.starts_with("RUNNING | PID "),
        "unexpected status: {:?}",
        status
    );
    let pid: i32 = status
        .trim_start_matches("RUNNING | PID ")
        .trim_end()
        .parse()
        .unwrap();
    assert!(pid > 0);

    // Garbage is answered without disturbing the session.
    send(&mut stream, "FOO\n");
    assert_eq!(read_reply(&mut stream), "INVALID COMMAND\n");

    // STOP kills the child and idles the supervisor.
    send(&mut stream, "STOP\n");
    thread::sleep(Duration::from_millis(500));
    send(&mut stream, "GET_STATUS\n");
    assert_eq!(read_reply(&mut stream), "IDLE\n");

    // RESUME relaunches; the fresh sleep exits cleanly and ends the run.
    send(&mut stream, "RESUME\n");
    thread::sleep(Duration::from_millis(500));
    send(&mut stream, "GET_STATUS\n");
    let status = read_reply(&mut stream);
    assert!(
        status.starts_with("RUNNING | PID "),
        "unexpected status: {:?}",
        status
    );

    runner.join().unwrap().unwrap();
    assert!(!socket_path.exists());
}

#[test]
fn restart_during_backoff_relaunches_immediately() {
    let dir = TempDir::new().unwrap();
    // Fail once to park the loop in a backoff wait, then restart out of it.
    let marker: PathBuf = dir.path().join("ran-once");
    let script = format!(
        "if [ -e {marker} ]; then exit 0; else touch {marker}; exit 1; fi",
        marker = marker.display()
    );
    let mut config = test_config(&dir, &script, 10);
    // With a 999ms base, attempt 0 launches immediately but attempt 1 waits
    // 2 whole seconds; a RESTART that properly rewinds to attempt 0 skips
    // that wait, and the relaunched child finds the marker and succeeds.
    config.base_delay_ms = 999;
    let socket_path = config.socket_path.clone();

    let supervisor = Supervisor::new(config).unwrap();
    let runner = thread::spawn(move || {
        let mut supervisor = supervisor;
        supervisor.run()
    });

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    // Let the first attempt fail and the backoff arm.
    thread::sleep(Duration::from_millis(500));
    assert!(marker.exists());
    assert!(!runner.is_finished());

    let restarted_at = std::time::Instant::now();
    send(&mut stream, "RESTART\n");
    runner.join().unwrap().unwrap();
    assert!(
        restarted_at.elapsed() < Duration::from_secs(1),
        "restart did not rewind the backoff schedule"
    );
}
