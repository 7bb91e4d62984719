//! Running job commands.
//!
//! The queue treats command execution as an opaque collaborator: anything
//! implementing [`CommandRunner`] can be plugged into the [`crate::Runner`].
//! [`ShellRunner`] is the default and runs commands through `bash -c`.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default cap on the captured output of one attempt (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long to keep reading output after the command exited. Background
/// processes it left behind may hold the pipes open forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit code recorded when the process has none (killed, never spawned).
pub const NO_EXIT_CODE: i32 = -1;

/// What a finished command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined stdout and stderr, possibly truncated
    pub output: String,
    /// The exit code, [`NO_EXIT_CODE`] if there is none
    pub exit_code: i32,
    /// Set when the command could not run to completion on its own
    pub error: Option<String>,
}

impl CommandOutput {
    /// Whether the command ran and exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    /// An output for a command that never produced an exit code.
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            output: error.clone(),
            exit_code: NO_EXIT_CODE,
            error: Some(error),
        }
    }

    /// A one line description of why the attempt failed.
    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(error) => error.clone(),
            None => format!("command exited with code {}", self.exit_code),
        }
    }
}

/// Runs the command of a job.
///
/// Implementations must stop the command soon after `cancel` fires and still
/// return whatever output was produced.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `command` to completion or until `cancel` fires.
    fn run(
        &self,
        command: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = CommandOutput> + Send;
}

/// Runs commands with `bash -c`, capturing stdout and stderr together.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    max_output_bytes: usize,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ShellRunner {
    /// Use another shell. It is invoked as `<shell> -c <command>`.
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set how much output is kept per attempt.
    ///
    /// When a command prints more, only the last `max_output_bytes` are kept,
    /// behind a `[output truncated: N bytes omitted]` line.
    pub fn max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, cancel: CancellationToken) -> CommandOutput {
        let spawned = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(error) => {
                warn!(%error, shell = %self.shell, "Failed to spawn command");
                return CommandOutput::failure(format!("failed to spawn {}: {error}", self.shell));
            }
        };

        let mut capture = Capture {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            buffer: OutputBuffer::new(self.max_output_bytes),
        };

        let mut cancelled = false;
        let status = loop {
            tokio::select! {
                _ = capture.next_chunk(), if capture.is_open() => {}
                status = child.wait() => break status,
                () = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    debug!("Killing cancelled command");
                    if let Err(error) = child.start_kill() {
                        warn!(%error, "Failed to kill command");
                    }
                }
            }
        };

        let drain = async { while capture.next_chunk().await {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("Output pipes still open after exit, stopped reading");
        }
        let output = capture.buffer.into_string();

        match status {
            Ok(status) => CommandOutput {
                output,
                exit_code: status.code().unwrap_or(NO_EXIT_CODE),
                error: cancelled.then(|| "command was cancelled".to_string()),
            },
            Err(error) => CommandOutput {
                output,
                exit_code: NO_EXIT_CODE,
                error: Some(format!("failed to wait for command: {error}")),
            },
        }
    }
}

/// Reads stdout and stderr as they arrive into one buffer.
struct Capture<O, E> {
    stdout: Option<O>,
    stderr: Option<E>,
    buffer: OutputBuffer,
}

impl<O: AsyncRead + Unpin, E: AsyncRead + Unpin> Capture<O, E> {
    fn is_open(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }

    /// Reads one chunk from whichever pipe is ready. Returns `false` once both
    /// are closed.
    async fn next_chunk(&mut self) -> bool {
        if !self.is_open() {
            return false;
        }

        let mut out = [0u8; 8192];
        let mut err = [0u8; 8192];
        tokio::select! {
            read = read_chunk(&mut self.stdout, &mut out) => {
                consume(read, &out, &mut self.buffer, &mut self.stdout);
            }
            read = read_chunk(&mut self.stderr, &mut err) => {
                consume(read, &err, &mut self.buffer, &mut self.stderr);
            }
        }
        true
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

fn consume<R>(
    read: std::io::Result<usize>,
    chunk: &[u8],
    buffer: &mut OutputBuffer,
    reader: &mut Option<R>,
) {
    match read {
        Ok(0) => *reader = None,
        Ok(n) => buffer.push(&chunk[..n]),
        Err(error) => {
            warn!(%error, "Failed to read command output");
            *reader = None;
        }
    }
}

/// Keeps the last `max` bytes written to it.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    max: usize,
    bytes: Vec<u8>,
    omitted: usize,
}

impl OutputBuffer {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            bytes: Vec::new(),
            omitted: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        // Trim in batches, not on every chunk.
        if self.bytes.len() > self.max.saturating_mul(2).max(8192) {
            self.trim();
        }
    }

    fn trim(&mut self) {
        let excess = self.bytes.len().saturating_sub(self.max);
        if excess > 0 {
            self.bytes.drain(..excess);
            self.omitted += excess;
        }
    }

    /// Decodes the kept bytes, replacing invalid UTF-8 and NUL bytes (which
    /// PostgreSQL `TEXT` can't store) with U+FFFD.
    pub(crate) fn into_string(mut self) -> String {
        self.trim();
        let text = String::from_utf8_lossy(&self.bytes).replace('\0', "\u{FFFD}");
        if self.omitted == 0 {
            text
        } else {
            format!("[output truncated: {} bytes omitted]\n{text}", self.omitted)
        }
    }
}
