//! SSH over a TLS tunnel, driven through a [`CommandRunner`].
//!
//! VMs only accept connections through TLS on a fixed port, so every SSH
//! invocation carries an `openssl s_client` proxy command. File content is
//! base64 encoded and piped through standard input, which keeps arbitrary
//! bytes intact and avoids argument length limits.

use std::ffi::OsString;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use shell_escape::unix::escape;
use tokio::time::{Instant, sleep};
use tracing::debug;

use super::config::TransportConfig;
use super::credential::CredentialFile;
use super::error::{TransportError, WriteStep};
use super::runner::{CommandInvocation, CommandOutput, CommandRunner, ProcessCommandRunner};
use super::session::Session;
use super::{Transport, TransportFuture};
use crate::api::{Credentials, VmId};
use crate::config::ConfigError;

const READY_TOKEN: &str = "ready";
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Transport that shells out to `ssh` with an `openssl` proxy command.
#[derive(Clone, Debug)]
pub struct TunnelTransport<R: CommandRunner> {
    config: TransportConfig,
    runner: R,
}

impl TunnelTransport<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn with_process_runner(config: TransportConfig) -> Result<Self, ConfigError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> TunnelTransport<R> {
    /// Creates a transport using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration validation fails.
    pub fn new(config: TransportConfig, runner: R) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns the command runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Derives the network host for a VM.
    #[must_use]
    pub fn host_for(&self, vm_id: &VmId) -> String {
        format!("{vm_id}.{}", self.config.host_suffix)
    }

    fn proxy_command(&self, host: &str) -> String {
        let escaped_host = escape(host.into());
        format!(
            "ProxyCommand={} s_client -connect {escaped_host}:{} -servername {escaped_host} -quiet 2>/dev/null",
            escape(self.config.openssl_bin.as_str().into()),
            self.config.tunnel_port,
        )
    }

    /// Builds the full `ssh` argument vector for `remote_command`.
    #[must_use]
    pub fn build_ssh_args(&self, session: &Session, remote_command: &str) -> Vec<OsString> {
        let options = [
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("LogLevel=ERROR"),
            String::from("BatchMode=yes"),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            format!(
                "ServerAliveInterval={}",
                self.config.server_alive_interval_secs
            ),
            format!("ServerAliveCountMax={}", self.config.server_alive_count_max),
            self.proxy_command(session.host()),
        ];

        let mut args = vec![OsString::from("-i"), session.key_path().as_os_str().to_owned()];
        for option in options {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from(format!(
            "{}@{}",
            self.config.ssh_user,
            session.host()
        )));
        args.push(OsString::from(remote_command));
        args
    }

    async fn exec(
        &self,
        session: &Session,
        remote_command: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let invocation = CommandInvocation {
            program: self.config.ssh_bin.clone(),
            args: self.build_ssh_args(session, remote_command),
            stdin,
            timeout,
        };
        debug!(vm_id = %session.vm_id(), command = remote_command, "remote exec");
        self.runner.run(&invocation).await
    }

    async fn run_checked(
        &self,
        session: &Session,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let output = self.exec(session, command, None, timeout).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(TransportError::CommandFailed {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn write(
        &self,
        session: &Session,
        destination: &str,
        content: &[u8],
    ) -> Result<(), TransportError> {
        let timeout = self.config.transfer_timeout();
        if let Some(parent) = Utf8Path::new(destination)
            .parent()
            .filter(|dir| !dir.as_str().is_empty() && dir.as_str() != "/")
        {
            let mkdir = format!("mkdir -p {}", escape(parent.as_str().into()));
            let output = self.exec(session, &mkdir, None, timeout).await?;
            if !output.is_success() {
                return Err(TransportError::WriteFailed {
                    path: destination.to_owned(),
                    step: WriteStep::CreateParent,
                    exit_code: output.code,
                    stderr: output.stderr,
                });
            }
        }

        let mut payload = STANDARD.encode(content).into_bytes();
        payload.push(b'\n');
        let transfer = format!("base64 -d > {}", escape(destination.into()));
        let output = self.exec(session, &transfer, Some(payload), timeout).await?;
        if output.is_success() {
            return Ok(());
        }
        Err(TransportError::WriteFailed {
            path: destination.to_owned(),
            step: WriteStep::Transfer,
            exit_code: output.code,
            stderr: output.stderr,
        })
    }

    async fn read(&self, session: &Session, path: &str) -> Result<Vec<u8>, TransportError> {
        let command = format!("base64 < {}", escape(path.into()));
        let output = self
            .run_checked(session, &command, self.config.transfer_timeout())
            .await?;
        let compact: String = output
            .stdout
            .chars()
            .filter(|ch| !ch.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(compact)
            .map_err(|err| TransportError::Decode {
                path: path.to_owned(),
                message: err.to_string(),
            })
    }

    async fn reachable(&self, session: &Session, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let pause = self.config.reachable_interval().max(MIN_PROBE_INTERVAL);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt_timeout = self.config.probe_timeout().min(remaining);
            let last_error = match self
                .exec(session, "echo ready", None, attempt_timeout)
                .await
            {
                Ok(output) if output.is_success() && output.stdout.contains(READY_TOKEN) => {
                    return Ok(());
                }
                Ok(output) => TransportError::CommandFailed {
                    exit_code: output.code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                },
                Err(err) => err,
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Unreachable {
                    vm_id: session.vm_id().clone(),
                    after: timeout,
                    last_error: Some(Box::new(last_error)),
                });
            }
            debug!(vm_id = %session.vm_id(), "vm not reachable yet");
            sleep(pause.min(deadline - now)).await;
        }
    }
}

impl<R: CommandRunner> Transport for TunnelTransport<R> {
    fn open(&self, vm_id: &VmId, credentials: &Credentials) -> Result<Session, TransportError> {
        let root = self.config.key_dir.as_deref().map(Utf8Path::new);
        let credential = CredentialFile::create(vm_id, &credentials.private_key, root)?;
        Ok(Session::new(vm_id.clone(), self.host_for(vm_id), credential))
    }

    fn run<'a>(
        &'a self,
        session: &'a Session,
        command: &'a str,
        timeout: Duration,
    ) -> TransportFuture<'a, CommandOutput> {
        Box::pin(self.run_checked(session, command, timeout))
    }

    fn write_file<'a>(
        &'a self,
        session: &'a Session,
        destination: &'a str,
        content: &'a [u8],
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.write(session, destination, content))
    }

    fn read_file<'a>(&'a self, session: &'a Session, path: &'a str) -> TransportFuture<'a, Vec<u8>> {
        Box::pin(self.read(session, path))
    }

    fn wait_reachable<'a>(
        &'a self,
        session: &'a Session,
        timeout: Duration,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.reachable(session, timeout))
    }
}
