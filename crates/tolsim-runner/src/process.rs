//! Child process execution with a deadline and cooperative cancellation.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelFlag;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn status_label(&self) -> String {
        exit_label(&self.status)
    }

    pub fn stderr_tail(&self) -> String {
        tail_lines(&self.stderr, STDERR_TAIL_LINES)
    }
}

#[derive(Debug)]
pub enum WaitError {
    Spawn(io::Error),
    Wait(io::Error),
    Timeout,
    Cancelled,
}

/// Run `cmd` to completion, killing it if `timeout` passes or `cancel` is set.
/// Stdout and stderr are drained on helper threads so a verbose child never
/// blocks on a full pipe. The deadline also covers those drains: a child that
/// exits while a background process it spawned still holds the pipes open
/// counts as timed out.
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancelFlag,
) -> Result<ProcessOutput, WaitError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(WaitError::Spawn)?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let start = Instant::now();
    let deadline = start + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if cancel.is_cancelled() {
                    kill_and_reap(&mut child);
                    return Err(WaitError::Cancelled);
                }
                if Instant::now() >= deadline {
                    kill_and_reap(&mut child);
                    return Err(WaitError::Timeout);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(WaitError::Wait(e));
            }
        }
    };

    Ok(ProcessOutput {
        status,
        stdout: collect(stdout, deadline, cancel)?,
        stderr: collect(stderr, deadline, cancel)?,
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Wait for a drain thread to reach EOF, but no later than `deadline`.
/// A drain still blocked past that point is left to finish on its own.
fn collect(
    rx: Option<Receiver<Vec<u8>>>,
    deadline: Instant,
    cancel: &CancelFlag,
) -> Result<Vec<u8>, WaitError> {
    let Some(rx) = rx else {
        return Ok(Vec::new());
    };
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(buf) => return Ok(buf),
            Err(RecvTimeoutError::Disconnected) => return Ok(Vec::new()),
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    return Err(WaitError::Cancelled);
                }
                if Instant::now() >= deadline {
                    tracing::warn!("child exited but its output pipes are still open");
                    return Err(WaitError::Timeout);
                }
            }
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

pub fn exit_label(status: &ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

pub fn tail_lines(bytes: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
