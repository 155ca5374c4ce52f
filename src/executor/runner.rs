use super::{truncate_detail, ExecutorError};
use crate::executor::output_parse::is_stale_session_failure;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cooperative cancellation shared between the caller-facing stop API
/// and the thread waiting on the subprocess.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Spawns the prepared command and waits for it, honoring the wall-clock
/// timeout (zero disables it) and the cancellation handle. Cancellation
/// first sends a graceful termination signal, then escalates to a kill
/// after the grace period. The child runs in its own process group so
/// signals reach grandchildren too; a surviving grandchild would keep
/// the output pipes open and stall the readers.
pub fn run_command(
    mut command: Command,
    timeout: Duration,
    cancel: &CancelHandle,
) -> Result<RunOutput, ExecutorError> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let binary = command.get_program().to_string_lossy().to_string();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ExecutorError::MissingBinary { binary });
        }
        Err(source) => return Err(ExecutorError::Io { source }),
    };

    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| ExecutorError::Io {
            source: std::io::Error::other("missing stdout pipe"),
        })?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| ExecutorError::Io {
            source: std::io::Error::other("missing stderr pipe"),
        })?;

    let stdout_reader = thread::spawn(move || {
        let mut buf = String::new();
        let mut pipe = stdout_pipe;
        let _ = pipe.read_to_string(&mut buf);
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = String::new();
        let mut pipe = stderr_pipe;
        let _ = pipe.read_to_string(&mut buf);
        buf
    });

    let started = Instant::now();
    let mut term_sent_at: Option<Instant> = None;
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => return Err(ExecutorError::Io { source }),
        }

        if cancel.is_requested() {
            match term_sent_at {
                None => {
                    send_term(&child);
                    term_sent_at = Some(Instant::now());
                }
                Some(at) if at.elapsed() > STOP_GRACE_PERIOD => {
                    send_kill(&mut child);
                    let _ = child.wait();
                    drain(stdout_reader, stderr_reader);
                    return Err(ExecutorError::Stopped);
                }
                Some(_) => {}
            }
        } else if !timeout.is_zero() && started.elapsed() > timeout {
            send_kill(&mut child);
            let _ = child.wait();
            drain(stdout_reader, stderr_reader);
            return Err(ExecutorError::Timeout {
                timeout_secs: timeout.as_secs(),
            });
        }

        thread::sleep(WAIT_POLL_INTERVAL);
    };

    let (stdout, stderr) = drain(stdout_reader, stderr_reader);

    if cancel.is_requested() {
        return Err(ExecutorError::Stopped);
    }

    if !exit_status.success() {
        let detail = if stderr.trim().is_empty() {
            stdout.clone()
        } else {
            stderr.clone()
        };
        return Err(ExecutorError::NonZeroExit {
            exit_code: exit_status.code().unwrap_or(-1),
            detail: truncate_detail(&detail),
            stale_session: is_stale_session_failure(&stdout, &stderr),
        });
    }

    Ok(RunOutput { stdout, stderr })
}

fn drain(
    stdout_reader: thread::JoinHandle<String>,
    stderr_reader: thread::JoinHandle<String>,
) -> (String, String) {
    (
        stdout_reader.join().unwrap_or_default(),
        stderr_reader.join().unwrap_or_default(),
    )
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: &str) {
    // Negative pid targets the whole process group.
    let _ = Command::new("kill")
        .arg(signal)
        .arg("--")
        .arg(format!("-{}", child.id()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(unix)]
fn send_term(child: &Child) {
    signal_group(child, "-TERM");
}

#[cfg(not(unix))]
fn send_term(_child: &Child) {}

#[cfg(unix)]
fn send_kill(child: &mut Child) {
    signal_group(child, "-KILL");
    let _ = child.kill();
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn successful_run_captures_both_streams() {
        let output = run_command(
            sh("echo out; echo err >&2"),
            Duration::ZERO,
            &CancelHandle::default(),
        )
        .expect("run");
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn missing_binary_is_its_own_error() {
        let err = run_command(
            Command::new("/nonexistent/corral-executor"),
            Duration::ZERO,
            &CancelHandle::default(),
        )
        .expect_err("must fail");
        assert!(matches!(err, ExecutorError::MissingBinary { .. }));
    }

    #[test]
    fn nonzero_exit_carries_stderr_detail_and_stale_flag() {
        let err = run_command(
            sh("echo 'No conversation found with session ID sess-1' >&2; exit 1"),
            Duration::ZERO,
            &CancelHandle::default(),
        )
        .expect_err("must fail");
        match err {
            ExecutorError::NonZeroExit {
                exit_code,
                detail,
                stale_session,
            } => {
                assert_eq!(exit_code, 1);
                assert!(detail.contains("No conversation found"));
                assert!(stale_session);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn timeout_kills_the_process() {
        let started = Instant::now();
        let err = run_command(
            sh("sleep 30"),
            Duration::from_millis(200),
            &CancelHandle::default(),
        )
        .expect_err("must time out");
        assert!(matches!(err, ExecutorError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_means_disabled() {
        let output = run_command(
            sh("sleep 0.2; echo finished"),
            Duration::ZERO,
            &CancelHandle::default(),
        )
        .expect("run");
        assert_eq!(output.stdout.trim(), "finished");
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_terminates_gracefully_and_reports_stopped() {
        let cancel = CancelHandle::default();
        let stopper = thread::spawn({
            let cancel = cancel.clone();
            move || {
                thread::sleep(Duration::from_millis(100));
                cancel.request_stop();
            }
        });

        let started = Instant::now();
        let err = run_command(sh("sleep 30"), Duration::ZERO, &cancel).expect_err("must stop");
        assert!(matches!(err, ExecutorError::Stopped));
        assert!(started.elapsed() < Duration::from_secs(5));
        stopper.join().expect("join");
    }
}
