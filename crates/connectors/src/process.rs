//! Supervised external process
//!
//! Spawns the external tool with piped stdio and translates its life into a
//! single ordered stream of `ProcessEvent`s: every stdout/stderr line as it
//! arrives, then exactly one `Exited`. Input goes through a dedicated stdin
//! writer task. Termination escalates from an interrupt sent to the process
//! group to a forced kill.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commands::CommandSpec;
use crate::{ConnectorError, OutputStream, ProcessEvent};

/// How long the exit watcher waits for the output readers to drain after the
/// process has exited. Grandchildren can keep the pipes open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ProcessConnector {
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    force_kill: Arc<Notify>,
    exit_rx: watch::Receiver<Option<i32>>,
    event_rx: Option<mpsc::Receiver<ProcessEvent>>,
}

impl ProcessConnector {
    /// Spawn the command described by `spec`.
    pub fn spawn(spec: &CommandSpec) -> Result<Self, ConnectorError> {
        info!(
            component = "process",
            event = "process.spawn",
            program = %spec.program,
            command = %spec.display(),
            "Spawning external process"
        );

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        // Own process group so an interrupt reaches interpreter children too.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| ConnectorError::Spawn(format!("{}: {}", spec.program, e)))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::Spawn("No stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::Spawn("No stdout on child".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ConnectorError::Spawn("No stderr on child".into()))?;

        let (event_tx, event_rx) = mpsc::channel::<ProcessEvent>(512);
        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(32);
        let (exit_tx, exit_rx) = watch::channel(None);
        let force_kill = Arc::new(Notify::new());

        tokio::spawn(stdin_writer(stdin, stdin_rx));

        let stdout_task = tokio::spawn(read_lines(stdout, OutputStream::Stdout, event_tx.clone()));
        let stderr_task = tokio::spawn(read_lines(stderr, OutputStream::Stderr, event_tx.clone()));

        let kill_signal = force_kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    // The leader alone would leave interpreter children running.
                    signal_group(pid, KILL_SIGNAL);
                    if let Err(e) = child.start_kill() {
                        warn!(
                            component = "process",
                            event = "process.kill_failed",
                            pid = ?pid,
                            error = %e,
                            "Forced kill failed"
                        );
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    error!(
                        component = "process",
                        event = "process.wait_failed",
                        pid = ?pid,
                        error = %e,
                        "Failed to wait for process"
                    );
                    -1
                }
            };

            drain_readers(stdout_task, stderr_task).await;

            info!(
                component = "process",
                event = "process.exited",
                pid = ?pid,
                code,
                "External process exited"
            );
            let _ = exit_tx.send(Some(code));
            let _ = event_tx.send(ProcessEvent::Exited { code }).await;
        });

        Ok(Self {
            pid,
            stdin_tx,
            force_kill,
            exit_rx,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ProcessEvent>> {
        self.event_rx.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Write raw bytes to the process's stdin.
    pub async fn write_input(&self, bytes: &[u8]) -> Result<(), ConnectorError> {
        if self.has_exited() {
            return Err(ConnectorError::NotRunning);
        }
        debug!(
            component = "process",
            event = "process.stdin.write",
            pid = ?self.pid,
            payload_len = bytes.len(),
            "Queueing stdin write"
        );
        self.stdin_tx
            .send(bytes.to_vec())
            .await
            .map_err(|_| ConnectorError::NotRunning)
    }

    /// Interrupt the process group, then force-kill if it is still alive
    /// after `grace`. Returns once the process has been reaped (or the second
    /// grace window elapsed). Calling this on an exited process is a no-op.
    pub async fn terminate(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }

        if self.interrupt() && self.wait_for_exit(grace).await {
            return;
        }

        warn!(
            component = "process",
            event = "process.force_kill",
            pid = ?self.pid,
            grace_ms = grace.as_millis() as u64,
            "Process still alive after grace window, killing"
        );
        self.force_kill.notify_one();
        if !self.wait_for_exit(grace).await {
            error!(
                component = "process",
                event = "process.kill_timeout",
                pid = ?self.pid,
                "Process did not exit after forced kill"
            );
        }
    }

    /// Wait until the exit watcher reports an exit code.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        let exited = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|code| code.is_some())).await,
            Ok(Ok(_))
        );
        exited
    }

    #[cfg(unix)]
    fn interrupt(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        if !signal_group(Some(pid), libc::SIGINT) {
            let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            return result == 0;
        }
        debug!(
            component = "process",
            event = "process.interrupt",
            pid,
            "Sent SIGINT to process group"
        );
        true
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> bool {
        false
    }
}

#[cfg(unix)]
const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;

/// Signal the whole process group led by `pid`. The child leads its own
/// group (see `spawn`).
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: i32) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: i32) -> bool {
    false
}

impl Drop for ProcessConnector {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.force_kill.notify_one();
        }
    }
}

/// Dedicated stdin writer task: drains the channel into the child's stdin.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = stdin.write_all(&bytes).await {
            error!(
                component = "process",
                event = "process.stdin.write_error",
                error = %e,
                "Failed to write to process stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "process",
                event = "process.stdin.flush_error",
                error = %e,
                "Failed to flush process stdin"
            );
            break;
        }
    }
    debug!(
        component = "process",
        event = "process.stdin.closed",
        "Stdin writer task ended"
    );
}

/// Forward every non-empty line of `reader` as a `ProcessEvent::Output`.
async fn read_lines<R>(reader: R, stream: OutputStream, event_tx: mpsc::Sender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let line = clean_line(&raw);
                if line.is_empty() {
                    continue;
                }
                if event_tx
                    .send(ProcessEvent::Output { stream, line })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    component = "process",
                    event = "process.output.read_error",
                    stream = ?stream,
                    error = %e,
                    "Error reading process output"
                );
                break;
            }
        }
    }
}

async fn drain_readers(mut stdout_task: JoinHandle<()>, mut stderr_task: JoinHandle<()>) {
    let drained = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
    })
    .await;
    if drained.is_err() {
        debug!(
            component = "process",
            event = "process.output.drain_timeout",
            "Output pipes still open after exit, abandoning readers"
        );
        stdout_task.abort();
        stderr_task.abort();
    }
}

/// Strip ANSI escape sequences and carriage-return redraws from a raw line.
///
/// Tools that redraw a table in place emit `ESC[nA` cursor moves and `\r`;
/// only the final visible text of the line is kept.
pub fn clean_line(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\u{1b}' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    // CSI: parameters until a final byte in '@'..='~'
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                } else {
                    chars.next();
                }
            }
            '\r' => {
                if chars.peek().is_some_and(|c| *c != '\n') {
                    out.clear();
                }
            }
            '\n' => {}
            _ => out.push(ch),
        }
    }
    out.trim_end().to_string()
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
