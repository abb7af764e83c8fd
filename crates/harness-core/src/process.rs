use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often the waiter checks the deadline and the cancellation token.
const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Grace period for reaping a child after its group was killed, and for the
/// readers to reach EOF once the child is gone.
const REAP_GRACE: Duration = Duration::from_secs(2);
/// Bytes kept per stream, and for the combined output. Older bytes are dropped.
const MAX_CAPTURE: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;

type Capture = Arc<Mutex<VecDeque<u8>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, trimmed and capped.
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// Run `cmd` to completion, bounded by `timeout` and `cancel`.
///
/// The child runs in its own process group. On timeout or cancellation the
/// whole group is killed, so grandchildren spawned by `sh -c` die with it; on
/// unix the group is also killed once the child exits, so background jobs
/// holding the pipes cannot keep the call alive. A cancellation seen at any
/// point before returning marks the run as cancelled.
/// Returns `Err` only when the process could not be spawned or waited on.
pub fn run(
    mut cmd: Command,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> std::io::Result<ProcessOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let child_pid = child.id();

    // Read stdout/stderr in dedicated threads to avoid pipe-buffer deadlocks.
    // The channel disconnects once every reader has hit EOF.
    let stdout_buf: Capture = Arc::default();
    let stderr_buf: Capture = Arc::default();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    if let Some(handle) = child.stdout.take() {
        spawn_reader(handle, Arc::clone(&stdout_buf), done_tx.clone());
    }
    if let Some(handle) = child.stderr.take() {
        spawn_reader(handle, Arc::clone(&stderr_buf), done_tx.clone());
    }
    drop(done_tx);

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait());
    });

    let deadline = timeout.map(|t| start + t);
    let mut timed_out = false;
    let mut cancelled = false;

    let wait_result: Option<std::io::Result<ExitStatus>> = loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(result) => break Some(result),
            Err(RecvTimeoutError::Disconnected) => {
                break Some(Err(std::io::Error::other("waiter thread exited")))
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    cancelled = true;
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    timed_out = true;
                } else {
                    continue;
                }
                kill_group(child_pid);
                // Reap so the pipes close and the readers can finish. If the
                // child refuses to die the readers are left detached.
                break rx.recv_timeout(REAP_GRACE).ok();
            }
        }
    };

    // Whatever the shell left running in its group is orphaned now.
    #[cfg(unix)]
    {
        if !timed_out && !cancelled {
            kill_group(child_pid);
        }
    }

    let status = match wait_result {
        Some(Ok(status)) => Some(status),
        Some(Err(e)) if !timed_out && !cancelled => return Err(e),
        Some(Err(_)) | None => None,
    };

    let drain_deadline = Instant::now() + REAP_GRACE;
    loop {
        match done_rx.recv_timeout(POLL_INTERVAL) {
            Err(RecvTimeoutError::Disconnected) => break,
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        if Instant::now() >= drain_deadline {
            tracing::warn!(pid = child_pid, "output pipes still open after exit, keeping partial output");
            break;
        }
    }
    if !timed_out && cancel.is_cancelled() {
        cancelled = true;
    }

    let exit_code = if timed_out || cancelled {
        None
    } else {
        status.and_then(|s| s.code())
    };

    Ok(ProcessOutput {
        exit_code,
        output: combine_output(&snapshot(&stdout_buf), &snapshot(&stderr_buf)),
        timed_out,
        cancelled,
        duration: start.elapsed(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(handle: R, sink: Capture, done: Sender<()>) {
    std::thread::spawn(move || {
        pump(handle, &sink);
        drop(done);
    });
}

/// Copy `reader` into `sink` in chunks, keeping only the last `MAX_CAPTURE` bytes.
fn pump<R: Read>(mut reader: R, sink: &Mutex<VecDeque<u8>>) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let mut buf = sink.lock().unwrap_or_else(|e| e.into_inner());
                push_tail(&mut buf, &chunk[..n], MAX_CAPTURE);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn push_tail(buf: &mut VecDeque<u8>, chunk: &[u8], limit: usize) {
    let chunk = &chunk[chunk.len().saturating_sub(limit)..];
    let overflow = (buf.len() + chunk.len()).saturating_sub(limit);
    buf.drain(..overflow);
    buf.extend(chunk);
}

fn snapshot(sink: &Mutex<VecDeque<u8>>) -> String {
    let buf = sink.lock().unwrap_or_else(|e| e.into_inner());
    let bytes: Vec<u8> = buf.iter().copied().collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Combine stdout/stderr and cap the result, keeping the tail.
fn combine_output(stdout: &str, stderr: &str) -> String {
    let output = if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    };
    crate::io::tail(output.trim(), MAX_CAPTURE).to_string()
}

/// Kill the process group led by `pid`. Best-effort.
#[cfg(unix)]
fn kill_group(pid: u32) {
    // SAFETY: killpg only sends a signal; a stale pgid yields ESRCH, which is ignored.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
