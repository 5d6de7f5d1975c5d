//! Child-process management for the external scanner.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, ScanError};
use crate::types::ScanRequest;

const INSTALL_HINT: &str =
    "Install nmap (e.g. `apt install nmap` or `brew install nmap`) or point NETSCAN_SCANNER at it.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of scanner output, in arrival order across both streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// How the child process ended. Reported exactly once per handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exited on its own; `code` is `None` when a signal we did not send killed it.
    Exited { code: Option<i32> },
    /// Stopped by our termination request within the grace period.
    Terminated,
    /// Forcibly killed after ignoring the termination request.
    Killed,
}

impl ProcessOutcome {
    pub fn success(self) -> bool {
        matches!(self, Self::Exited { code: Some(0) })
    }
}

/// Spawns the scanner for validated requests.
#[derive(Debug, Clone)]
pub struct ScanProcessManager {
    binary: PathBuf,
    grace_period: Duration,
    line_buffer: usize,
}

impl ScanProcessManager {
    pub fn new(binary: impl Into<PathBuf>, grace_period: Duration, line_buffer: usize) -> Self {
        Self {
            binary: binary.into(),
            grace_period,
            line_buffer: line_buffer.max(1),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Resolve the scanner binary or fail with `ToolNotFound`.
    pub fn resolve(&self) -> Result<PathBuf> {
        resolve_binary(&self.binary).ok_or_else(|| ScanError::ToolNotFound {
            binary: self.binary.display().to_string(),
            hint: INSTALL_HINT.to_string(),
        })
    }

    /// Resolve the scanner, then [`spawn`](Self::spawn) it.
    pub fn start(&self, request: &ScanRequest) -> Result<ScanHandle> {
        let program = self.resolve()?;
        self.spawn(&program, request)
    }

    /// Spawn an already resolved scanner with an explicit argument vector and start
    /// streaming its output.
    pub fn spawn(&self, program: &Path, request: &ScanRequest) -> Result<ScanHandle> {
        let args = request.args();

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %program.display(), ?args, "spawning scanner");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScanError::ToolNotFound {
                    binary: program.display().to_string(),
                    hint: INSTALL_HINT.to_string(),
                }
            } else {
                ScanError::Spawn(e)
            }
        })?;
        let pid = child.id();
        info!(pid, target = %request.target_expression(), "scanner started");

        let (line_tx, line_rx) = mpsc::channel(self.line_buffer);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Stream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Stream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        tokio::spawn(supervise(child, cancel.clone(), self.grace_period, outcome_tx));

        let mut command = vec![program.display().to_string()];
        command.extend(args);
        Ok(ScanHandle {
            pid,
            command,
            lines: line_rx,
            cancel,
            outcome: outcome_rx,
        })
    }
}

/// A running (or finished) scanner process.
#[derive(Debug)]
pub struct ScanHandle {
    pid: Option<u32>,
    command: Vec<String>,
    lines: mpsc::Receiver<OutputLine>,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<ProcessOutcome>>,
}

impl ScanHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Full argv, program first.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Next output line, or `None` once both output streams are closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Ask the process to stop without waiting for it.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Terminate the process (forcibly after the grace period) and return its outcome.
    pub async fn cancel(&mut self) -> ProcessOutcome {
        self.request_cancel();
        self.wait().await
    }

    /// Wait for the process to reach its terminal outcome.
    pub async fn wait(&mut self) -> ProcessOutcome {
        settled(&mut self.outcome).await
    }

    /// Resolves when the process itself has exited, even if a descendant still holds its
    /// output pipes open. Does not borrow the handle, so lines can be read meanwhile.
    pub fn exited(&self) -> impl Future<Output = ProcessOutcome> + Send + 'static {
        let mut outcome = self.outcome.clone();
        async move { settled(&mut outcome).await }
    }

    pub fn outcome(&self) -> Option<ProcessOutcome> {
        *self.outcome.borrow()
    }
}

async fn settled(outcome: &mut watch::Receiver<Option<ProcessOutcome>>) -> ProcessOutcome {
    if let Ok(published) = outcome.wait_for(Option::is_some).await {
        if let Some(done) = *published {
            return done;
        }
    }
    // Sender dropped without publishing: the supervisor task is gone, and with it the child.
    let current = *outcome.borrow();
    current.unwrap_or(ProcessOutcome::Killed)
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(?stream, "reading scanner output failed: {e}");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    grace: Duration,
    outcome_tx: watch::Sender<Option<ProcessOutcome>>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ProcessOutcome::Exited { code: status.code() },
            Err(e) => {
                warn!("waiting on scanner failed: {e}");
                ProcessOutcome::Exited { code: None }
            }
        },
        _ = cancel.cancelled() => terminate(&mut child, grace).await,
    };
    debug!(?outcome, "scanner finished");
    outcome_tx.send_replace(Some(outcome));
}

async fn terminate(child: &mut Child, grace: Duration) -> ProcessOutcome {
    request_termination(child);
    match time::timeout(grace, child.wait()).await {
        Ok(_) => ProcessOutcome::Terminated,
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "scanner ignored termination; killing");
            if let Err(e) = child.kill().await {
                warn!("kill failed: {e}");
            }
            ProcessOutcome::Killed
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, "SIGTERM failed: {e}");
            }
        }
        None => debug!("scanner already reaped"),
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

/// Locate an executable: paths with a separator are checked directly, bare names are
/// searched on `PATH`.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return is_executable(binary).then(|| binary.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

/// Check that the scanner exists and runs, returning the first line of `--version` output.
pub async fn check_tool(binary: &Path) -> Result<String> {
    let not_found = |hint: String| ScanError::ToolNotFound {
        binary: binary.display().to_string(),
        hint,
    };
    let program = resolve_binary(binary).ok_or_else(|| not_found(INSTALL_HINT.to_string()))?;
    let output = time::timeout(
        Duration::from_secs(8),
        Command::new(&program)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| not_found("`--version` timed out".to_string()))?
    .map_err(ScanError::Spawn)?;

    if !output.status.success() {
        return Err(not_found(format!(
            "exists but is not runnable (exit {:?})",
            output.status.code()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} detected", binary.display())))
}
