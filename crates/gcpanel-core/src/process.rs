//! External tool invocation with a deadline
//!
//! Dump and restore tools are run as child processes. Their stdin/stdout are
//! pumped on scoped helper threads so a chatty tool can never deadlock on a
//! full pipe, while the calling thread polls for exit against the deadline.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_STDERR_IN_MESSAGE: usize = 2000;

/// Why an external command did not succeed
#[derive(Error, Debug)]
pub(crate) enum CommandError {
    #[error("failed to start `{program}`: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("`{program}` exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("`{program}` timed out after {}s", .after.as_secs())]
    TimedOut { program: String, after: Duration },

    #[error("I/O error talking to `{program}`: {source}")]
    Io { program: String, source: io::Error },
}

impl CommandError {
    /// Convert into the crate error, keeping timeouts distinct from tool failures
    pub(crate) fn into_error(self, wrap: fn(String) -> Error) -> Error {
        match self {
            CommandError::TimedOut { program, after } => Error::Timeout {
                command: program,
                after,
            },
            other => wrap(other.to_string()),
        }
    }
}

/// Run `cmd` to completion within `timeout`
///
/// `input`, when given, is streamed to the child's stdin; `output`, when
/// given, receives the child's stdout. Stderr is always captured and
/// reported on a non-zero exit.
pub(crate) fn run_command(
    cmd: &mut Command,
    timeout: Duration,
    input: Option<&mut (dyn Read + Send)>,
    output: Option<&mut (dyn Write + Send)>,
) -> Result<(), CommandError> {
    let program = cmd.get_program().to_string_lossy().into_owned();

    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(if output.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stderr(Stdio::piped());

    debug!("Running {:?}", cmd);

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let (wait_result, feed_result, drain_result, stderr_text) = thread::scope(|scope| {
        let feeder = scope.spawn(move || -> io::Result<()> {
            if let (Some(reader), Some(pipe)) = (input, stdin.as_mut()) {
                match io::copy(reader, pipe) {
                    Ok(_) => {}
                    // The child may legitimately exit before reading everything;
                    // its exit status decides success.
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e),
                }
            }
            // Dropping the pipe closes the child's stdin.
            drop(stdin);
            Ok(())
        });

        let drainer = scope.spawn(move || -> io::Result<()> {
            if let (Some(pipe), Some(writer)) = (stdout.as_mut(), output) {
                io::copy(pipe, writer)?;
                writer.flush()?;
            }
            Ok(())
        });

        let collector = scope.spawn(move || {
            let mut text = String::new();
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_string(&mut text);
            }
            text
        });

        let wait_result = wait_with_deadline(&mut child, timeout);

        let feed_result = feeder
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin feeder panicked")));
        let drain_result = drainer
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdout drainer panicked")));
        let stderr_text = collector.join().unwrap_or_default();

        (wait_result, feed_result, drain_result, stderr_text)
    });

    let status = match wait_result {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!("{} exceeded {}s and was killed", program, timeout.as_secs());
            return Err(CommandError::TimedOut {
                program,
                after: timeout,
            });
        }
        Err(source) => return Err(CommandError::Io { program, source }),
    };

    if !status.success() {
        return Err(CommandError::Exit {
            program,
            status,
            stderr: truncate_stderr(&stderr_text),
        });
    }

    feed_result
        .and(drain_result)
        .map_err(|source| CommandError::Io { program, source })
}

/// Wait for exit; on deadline kill the child and return `Ok(None)`
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    // No deadline when the timeout is too large to represent.
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            // Kill can fail if the child exited between the two calls.
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn truncate_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= MAX_STDERR_IN_MESSAGE {
        return trimmed.to_string();
    }
    let mut end = MAX_STDERR_IN_MESSAGE;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_captures_stdout() {
        let mut out = Vec::new();
        run_command(
            &mut sh("echo hello"),
            Duration::from_secs(10),
            None,
            Some(&mut out),
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), "hello");
    }

    #[test]
    fn test_pipes_stdin_to_stdout() {
        let payload = "x".repeat(512 * 1024);
        let mut input = payload.as_bytes();
        let mut out = Vec::new();
        run_command(
            &mut sh("cat"),
            Duration::from_secs(10),
            Some(&mut input),
            Some(&mut out),
        )
        .unwrap();
        assert_eq!(out.len(), payload.len());
    }

    #[test]
    fn test_non_zero_exit_reports_stderr() {
        let err = run_command(
            &mut sh("echo boom >&2; exit 3"),
            Duration::from_secs(10),
            None,
            None,
        )
        .unwrap_err();
        match err {
            CommandError::Exit { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_timeout_kills_child() {
        let started = Instant::now();
        let err = run_command(
            &mut sh("sleep 30"),
            Duration::from_millis(200),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));

        let converted = err.into_error(Error::Backup);
        assert!(matches!(converted, Error::Timeout { .. }));
    }

    #[test]
    fn test_unrepresentable_timeout_waits_for_exit() {
        let mut out = Vec::new();
        run_command(&mut sh("echo done"), Duration::MAX, None, Some(&mut out)).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), "done");
    }

    #[test]
    fn test_missing_program() {
        let err = run_command(
            &mut Command::new("gcpanel-definitely-not-a-binary"),
            Duration::from_secs(5),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert!(matches!(err.into_error(Error::Restore), Error::Restore(_)));
    }
}
