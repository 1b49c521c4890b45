//! Bounded, cancellable execution of short-lived external commands.
//!
//! `adb` can hang indefinitely when a device drops off the bus, and its output
//! is unbounded in principle. Commands run here always have a wall-clock
//! budget, a per-stream output cap, and observe a cancellation token. On Unix
//! the child gets its own process group so the whole tree is killed.

use std::{
    fmt, io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when either stream had more bytes than were kept.
    pub truncated: bool,
}

impl BoundedOutput {
    /// stdout followed by stderr, separated by a newline when both are present.
    pub fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// Maximum bytes kept per stream.
    pub max_bytes: usize,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_bytes: 64 * 1024,
            kill_grace: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: Option<ExitStatus>,
    pub output: BoundedOutput,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.is_some_and(|s| s.success())
    }
}

#[derive(Debug)]
pub enum RunCommandError {
    Io {
        command: CommandSpec,
        source: io::Error,
    },
    TimedOut {
        command: CommandSpec,
        after: Duration,
    },
    Cancelled {
        command: CommandSpec,
    },
    Failed {
        command: CommandSpec,
        status: Option<ExitStatus>,
        output: BoundedOutput,
    },
}

impl RunCommandError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunCommandError::Cancelled { .. })
    }

    /// Captured output of a command that ran to a failing exit.
    pub fn output(&self) -> Option<&BoundedOutput> {
        match self {
            RunCommandError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl fmt::Display for RunCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { command, source } => write!(f, "failed to run `{command}`: {source}"),
            Self::TimedOut { command, after } => {
                write!(f, "`{command}` did not finish within {after:?}")
            }
            Self::Cancelled { command } => write!(f, "`{command}` was cancelled"),
            Self::Failed {
                command,
                status,
                output,
            } => {
                match status {
                    Some(status) => write!(f, "`{command}` exited with {status}")?,
                    None => write!(f, "`{command}` exited abnormally")?,
                }
                let combined = output.combined();
                let combined = combined.trim();
                if !combined.is_empty() {
                    write!(f, ": {combined}")?;
                }
                if output.truncated {
                    write!(f, " (output truncated)")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RunCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Runs `command`, killing it on timeout or cancellation.
///
/// Always returns the captured output; `timed_out`/`cancelled` tell how the
/// run ended.
pub async fn run_command(
    command: &CommandSpec,
    opts: &RunOptions,
    cancel: &CancellationToken,
) -> io::Result<CommandResult> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

    let max_bytes = opts.max_bytes;
    let stdout_task = tokio::spawn(read_bounded(stdout, max_bytes));
    let stderr_task = tokio::spawn(read_bounded(stderr, max_bytes));

    let mut timed_out = false;
    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = tokio::time::sleep(opts.timeout) => {
            timed_out = true;
            terminate_process_tree(&mut child, opts.kill_grace).await
        }
        _ = cancel.cancelled() => {
            cancelled = true;
            terminate_process_tree(&mut child, opts.kill_grace).await
        }
    };

    let (stdout_bytes, stdout_truncated) = join_reader(stdout_task).await?;
    let (stderr_bytes, stderr_truncated) = join_reader(stderr_task).await?;

    tracing::trace!(
        target: "jinject.adb",
        command = %command,
        ?status,
        timed_out,
        cancelled,
        "command finished"
    );

    Ok(CommandResult {
        status,
        output: BoundedOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            truncated: stdout_truncated || stderr_truncated,
        },
        timed_out,
        cancelled,
    })
}

/// Like [`run_command`], but a non-zero exit, timeout, or cancellation is an
/// error.
pub async fn run_command_checked(
    command: &CommandSpec,
    opts: &RunOptions,
    cancel: &CancellationToken,
) -> Result<CommandResult, RunCommandError> {
    let result = run_command(command, opts, cancel)
        .await
        .map_err(|source| RunCommandError::Io {
            command: command.clone(),
            source,
        })?;

    if result.cancelled {
        return Err(RunCommandError::Cancelled {
            command: command.clone(),
        });
    }
    if result.timed_out {
        return Err(RunCommandError::TimedOut {
            command: command.clone(),
            after: opts.timeout,
        });
    }
    if !result.success() {
        return Err(RunCommandError::Failed {
            command: command.clone(),
            status: result.status,
            output: result.output,
        });
    }
    Ok(result)
}

async fn terminate_process_tree(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let pgid = pid as libc::pid_t;
        // SAFETY: `kill` has no memory-safety preconditions. The negative pid
        // targets the group created by `process_group(0)`.
        unsafe {
            libc::kill(-pgid, libc::SIGTERM);
        }
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            return Some(status);
        }
        // SAFETY: as above.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.start_kill();
    child.wait().await.ok()
}

async fn join_reader(
    handle: tokio::task::JoinHandle<io::Result<(Vec<u8>, bool)>>,
) -> io::Result<(Vec<u8>, bool)> {
    handle
        .await
        .map_err(|err| io::Error::other(format!("output reader failed: {err}")))?
}

async fn read_bounded(
    mut reader: impl AsyncRead + Unpin,
    max_bytes: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8 * 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        // Keep draining past the cap so the child never blocks on a full pipe.
        let keep = max_bytes.saturating_sub(out.len()).min(n);
        out.extend_from_slice(&buf[..keep]);
        truncated |= keep < n;
    }

    Ok((out, truncated))
}
