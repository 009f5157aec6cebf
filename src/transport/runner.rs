//! Command runner abstraction for the local helper processes.
//!
//! The tunnel transport never spawns processes itself; it hands a
//! [`CommandInvocation`] to a [`CommandRunner`] so tests can script outcomes
//! without a network.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::warn;

use super::error::TransportError;

const READ_CHUNK: usize = 8 * 1024;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// A single helper-process execution request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes piped to standard input, if any.
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock bound after which the process is killed.
    pub timeout: Duration,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions and logs.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the final argument, which carries the remote command for SSH.
    #[must_use]
    pub fn last_arg(&self) -> Option<String> {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
    }
}

/// Future returned by command runners.
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, TransportError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the invocation to completion or until its timeout.
    ///
    /// Implementations return [`TransportError::Timeout`] with any output
    /// captured so far once the bound elapses, after terminating the process.
    fn run<'a>(&'a self, invocation: &'a CommandInvocation) -> RunnerFuture<'a>;
}

/// Real command runner that spawns host processes and pipes their output.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, invocation: &'a CommandInvocation) -> RunnerFuture<'a> {
        Box::pin(run_process(invocation))
    }
}

async fn run_process(invocation: &CommandInvocation) -> Result<CommandOutput, TransportError> {
    let program = invocation.program.as_str();
    let mut child = Command::new(program)
        .args(&invocation.args)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| TransportError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut out = Vec::new();
    let mut err = Vec::new();

    let completed = tokio::time::timeout(invocation.timeout, async {
        let (fed, drained_out, drained_err) = tokio::join!(
            feed_stdin(stdin, invocation.stdin.as_deref()),
            drain(stdout, &mut out),
            drain(stderr, &mut err),
        );
        fed.and(drained_out).and(drained_err)?;
        child.wait().await
    })
    .await;

    match completed {
        Ok(Ok(status)) => Ok(CommandOutput {
            code: status.code(),
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        }),
        Ok(Err(io_err)) => Err(TransportError::Io {
            program: program.to_owned(),
            message: io_err.to_string(),
        }),
        Err(_elapsed) => {
            if let Err(kill_err) = child.start_kill() {
                warn!(program, error = %kill_err, "failed to kill timed out process");
            }
            if let Err(wait_err) = child.wait().await {
                warn!(program, error = %wait_err, "failed to reap timed out process");
            }
            Err(TransportError::Timeout {
                after: invocation.timeout,
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            })
        }
    }
}

async fn feed_stdin(stdin: Option<ChildStdin>, payload: Option<&[u8]>) -> io::Result<()> {
    let (Some(mut pipe), Some(bytes)) = (stdin, payload) else {
        return Ok(());
    };
    match pipe.write_all(bytes).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err),
    }
    match pipe.shutdown().await {
        Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
        _ => Ok(()),
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, buffer: &mut Vec<u8>) -> io::Result<()> {
    let Some(mut stream) = reader else {
        return Ok(());
    };
    let mut chunk = vec![0_u8; READ_CHUNK];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend(chunk.iter().take(read));
    }
}
