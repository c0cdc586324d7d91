use super::Result;
use crate::environment::Environment;
use async_trait::async_trait;
use eyre::WrapErr;
use nix::errno::Errno;
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DAEMON_ERROR_MARKER: &str = "Error response from daemon:";

static LOGGER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s]+\[[0-9]+\]").expect("logger prefix pattern is valid"));

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("ansi pattern is valid")
});

/// A single external command to execute.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Program to execute, resolved through `PATH`
    pub program: String,
    /// Arguments for the program
    pub args: Vec<String>,
    /// Variables layered on top of the inherited environment
    pub env: Environment,
    /// Payload written to the child's stdin, if any
    pub stdin: Option<Vec<u8>>,
    /// Whether stdout is returned to the caller
    pub capture_stdout: bool,
    /// Whether stderr is attached to a pseudo terminal
    pub pty: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    pub fn env(mut self, env: Environment) -> Self {
        self.env.extend(env);
        self
    }

    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    pub fn pty(mut self, enabled: bool) -> Self {
        self.pty = enabled;
        self
    }

    /// Renders the invocation as a single command line for logs and errors.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct Output {
    /// Captured stdout; empty unless the invocation asked for it
    pub stdout: Vec<u8>,
    /// Raw stderr as produced by the tool
    pub stderr: Vec<u8>,
}

impl Output {
    /// Stdout decoded as UTF-8, replacing invalid sequences.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Failure modes of an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{command}` {}{}", describe_exit(.code), describe_stderr(.stderr))]
    Failed {
        command: String,
        code: Option<i32>,
        /// Stderr with tool noise removed
        stderr: String,
    },
    #[error("`{command}` was interrupted")]
    Cancelled { command: String },
    #[error("failed to start `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl CommandError {
    /// Cleaned stderr of a failed command, empty for other variants.
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Executes external command-line tools.
///
/// Implementations must observe `cancel`: once it fires, the running process
/// is interrupted and the call returns [`CommandError::Cancelled`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: Invocation, cancel: &CancellationToken) -> Result<Output>;
}

pub type DynCommandRunner = Arc<dyn CommandRunner>;

/// Configuration for [`ProcessRunner`]
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Mirror stdout/stderr of every command to the terminal
    pub debug: bool,
    /// Time a process gets to exit after SIGINT before it is killed
    pub interrupt_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            interrupt_grace: Duration::from_secs(10),
        }
    }
}

/// Runs commands as real child processes.
///
/// Each child is placed in its own process group so interrupts reach the
/// whole tree the tool may spawn, and is killed if the runner future is
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

#[derive(Debug, Clone, Copy)]
enum Mirror {
    Stdout,
    Stderr,
}

impl ProcessRunner {
    /// Creates a new runner with the given configuration
    ///
    /// # Arguments
    /// * `config` - Runner configuration
    ///
    /// # Returns
    /// * `Self` - The runner instance
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn mirror(&self, target: Mirror) -> Option<Mirror> {
        self.config.debug.then_some(target)
    }

    /// Interrupts a child and its process group, escalating to SIGKILL when
    /// it does not exit within the grace period.
    ///
    /// # Arguments
    /// * `child` - The running child
    /// * `command_line` - Rendered command for logging
    async fn interrupt(&self, child: &mut Child, command_line: &str) {
        let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };

        debug!("Interrupting process group {} ({})", pid, command_line);
        if let Err(e) = kill(Pid::from_raw(-pid), Signal::SIGINT) {
            warn!("Failed to send SIGINT to {}: {}", command_line, e);
        }

        match timeout(self.config.interrupt_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("{} ignored SIGINT, forcing kill", command_line);
                if let Err(e) = kill(Pid::from_raw(-pid), Signal::SIGKILL) {
                    debug!("Failed to send SIGKILL to process group {}: {}", pid, e);
                }
                let _ = child.wait().await;
            }
        }
    }

    /// Waits for an output reader, giving up after the grace period so that
    /// descendants holding the pipe open cannot block the caller.
    async fn collect(&self, task: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Vec<u8> {
        let Some(task) = task else {
            return Vec::new();
        };
        match timeout(self.config.interrupt_grace, task).await {
            Ok(Ok(Ok(bytes))) => bytes,
            Ok(Ok(Err(e))) => {
                debug!("Reading process output failed: {}", e);
                Vec::new()
            }
            Ok(Err(e)) => {
                warn!("Output reader task failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!("Timed out collecting process output");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, mut invocation: Invocation, cancel: &CancellationToken) -> Result<Output> {
        let command_line = invocation.command_line();
        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled {
                command: command_line,
            }
            .into());
        }
        debug!("Running: {}", command_line);

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        command.envs(invocation.env.iter());
        // Own process group so SIGINT on cancellation reaches tool subprocesses
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());

        let mut pty_master: Option<OwnedFd> = None;
        if invocation.pty {
            let pty = openpty(None, None).wrap_err("failed to allocate a pseudo terminal")?;
            command.stderr(Stdio::from(pty.slave));
            pty_master = Some(pty.master);
        } else {
            command.stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        // Closes the parent's copy of the pty slave so reads end with the child
        drop(command);

        let stdin_task = match (child.stdin.take(), invocation.stdin.take()) {
            (Some(mut pipe), Some(payload)) => Some(tokio::spawn(async move {
                pipe.write_all(&payload).await?;
                pipe.shutdown().await
            })),
            _ => None,
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain(out, self.mirror(Mirror::Stdout))));
        let stderr_task = match pty_master {
            Some(master) => {
                let mirror = self.config.debug;
                Some(tokio::task::spawn_blocking(move || read_pty(master, mirror)))
            }
            None => child
                .stderr
                .take()
                .map(|err| tokio::spawn(drain(err, self.mirror(Mirror::Stderr)))),
        };

        let status = tokio::select! {
            status = child.wait() => status.wrap_err_with(|| format!("failed to wait for `{command_line}`"))?,
            _ = cancel.cancelled() => {
                self.interrupt(&mut child, &command_line).await;
                return Err(CommandError::Cancelled { command: command_line }.into());
            }
        };

        if let Some(task) = stdin_task {
            if let Ok(Err(e)) = task.await {
                debug!("Writing stdin of {} failed: {}", command_line, e);
            }
        }
        let stdout = self.collect(stdout_task).await;
        let stderr = self.collect(stderr_task).await;

        if !status.success() {
            return Err(CommandError::Failed {
                command: command_line,
                code: status.code(),
                stderr: clean_error_output(&String::from_utf8_lossy(&stderr)),
            }
            .into());
        }

        Ok(Output {
            stdout: if invocation.capture_stdout {
                stdout
            } else {
                Vec::new()
            },
            stderr,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, mirror: Option<Mirror>) -> std::io::Result<Vec<u8>> {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let bytes = &chunk[..n];
        match mirror {
            Some(Mirror::Stdout) => {
                let _ = tokio::io::stdout().write_all(bytes).await;
            }
            Some(Mirror::Stderr) => {
                let _ = tokio::io::stderr().write_all(bytes).await;
            }
            None => {}
        }
        captured.extend_from_slice(bytes);
    }
    Ok(captured)
}

fn read_pty(master: OwnedFd, mirror: bool) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::from(master);
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if mirror {
                    let _ = std::io::stderr().write_all(&chunk[..n]);
                }
                captured.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once every slave fd is closed
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(captured)
}

/// Extracts the actionable part of a tool's stderr.
///
/// Daemon errors are reduced to the message after `Error response from
/// daemon:`. Otherwise lines carrying a tool logger prefix such as
/// `time="..." level=warning` or `service[123]` are dropped. Terminal escape
/// sequences and carriage returns are always removed.
///
/// # Arguments
/// * `raw` - Stderr as produced by the tool
///
/// # Returns
/// * `String` - The cleaned, trimmed message
pub fn clean_error_output(raw: &str) -> String {
    let text = ANSI_ESCAPE.replace_all(raw, "").replace('\r', "");
    if let Some((_, message)) = text.split_once(DAEMON_ERROR_MARKER) {
        return message.trim().to_string();
    }
    text.lines()
        .filter(|line| !LOGGER_PREFIX.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
