//! Applies provisioning units to a VM.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::error::ProvisionError;
use super::fingerprint::Fingerprint;
use super::spec::{FileSource, ProvisionSpec};
use crate::api::{LifecycleApi, VmId};
use crate::config::EngineConfig;
use crate::transport::{Session, Transport, TransportError};

const COMMAND_LABEL_LIMIT: usize = 100;

/// Timeouts and diagnostic limits for provisioning.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProvisionSettings {
    /// Bound on the reachability wait.
    pub reachable_timeout: Duration,
    /// Bound on each command.
    pub command_timeout: Duration,
    /// Characters of captured output kept in error messages.
    pub output_limit: usize,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            reachable_timeout: Duration::from_secs(180),
            command_timeout: Duration::from_secs(600),
            output_limit: 2000,
        }
    }
}

impl ProvisionSettings {
    /// Derives settings from engine configuration.
    #[must_use]
    pub const fn from_config(config: &EngineConfig) -> Self {
        Self {
            reachable_timeout: config.reachable_timeout(),
            command_timeout: config.command_timeout(),
            output_limit: config.output_limit,
        }
    }
}

/// Output of one successful command.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CommandReport {
    /// One-based position in the unit.
    pub position: usize,
    /// Command text.
    pub command: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Result of a full provisioning run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProvisionReport {
    /// Target VM.
    pub vm_id: VmId,
    /// Fingerprint of the applied inputs.
    pub fingerprint: Fingerprint,
    /// Number of files written.
    pub files_written: usize,
    /// Per-command output, in order.
    pub commands: Vec<CommandReport>,
}

/// Result of comparing a unit against its recorded fingerprint.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Convergence {
    /// Fingerprints matched; nothing remote was touched.
    Unchanged {
        /// Recorded fingerprint.
        fingerprint: Fingerprint,
    },
    /// The unit was applied from the top.
    Applied(ProvisionReport),
}

impl Convergence {
    /// Fingerprint to record after this outcome.
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        match self {
            Self::Unchanged { fingerprint } => fingerprint,
            Self::Applied(report) => &report.fingerprint,
        }
    }
}

/// Uploads files and runs commands against one VM.
#[derive(Debug)]
pub struct ProvisionOrchestrator<'a, A, T> {
    api: &'a A,
    transport: &'a T,
    settings: ProvisionSettings,
}

impl<'a, A, T> ProvisionOrchestrator<'a, A, T>
where
    A: LifecycleApi,
    T: Transport,
{
    /// Creates an orchestrator over the given collaborators.
    #[must_use]
    pub const fn new(api: &'a A, transport: &'a T, settings: ProvisionSettings) -> Self {
        Self {
            api,
            transport,
            settings,
        }
    }

    /// Applies the unit only when its fingerprint differs from `previous`.
    ///
    /// Any difference re-runs every file and command from the top.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when a re-run is needed and fails.
    pub async fn converge(
        &self,
        spec: &ProvisionSpec,
        previous: Option<&Fingerprint>,
    ) -> Result<Convergence, ProvisionError<A::Error>> {
        let fingerprint = Fingerprint::of_provision(spec);
        if previous == Some(&fingerprint) {
            info!(vm_id = %spec.vm_id, %fingerprint, "provisioning unchanged; skipping");
            return Ok(Convergence::Unchanged { fingerprint });
        }
        self.apply(spec).await.map(Convergence::Applied)
    }

    /// Uploads every file then runs every command, stopping at the first
    /// failure.
    ///
    /// The session is closed on every path. Completed steps are not rolled
    /// back when a later step fails.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] identifying the failed step.
    pub async fn apply(
        &self,
        spec: &ProvisionSpec,
    ) -> Result<ProvisionReport, ProvisionError<A::Error>> {
        let vm_id = &spec.vm_id;
        let credentials = match self.api.fetch_credentials(vm_id).await {
            Ok(credentials) => credentials,
            Err(source) => return Err(self.classify_credential_failure(vm_id, source).await),
        };
        let session =
            self.transport
                .open(vm_id, &credentials)
                .map_err(|source| ProvisionError::Session {
                    vm_id: vm_id.clone(),
                    source,
                })?;

        let result = self.run_steps(&session, spec).await;
        let closed = self.transport.close(session);

        match (result, closed) {
            (Ok(report), Ok(())) => {
                info!(vm_id = %vm_id, fingerprint = %report.fingerprint, "provisioning complete");
                Ok(report)
            }
            (Ok(_), Err(source)) => Err(ProvisionError::Cleanup {
                vm_id: vm_id.clone(),
                source,
            }),
            (Err(err), closed) => {
                if let Err(close_err) = closed {
                    warn!(vm_id = %vm_id, error = %close_err, "failed to close session after error");
                }
                Err(err)
            }
        }
    }

    async fn classify_credential_failure(
        &self,
        vm_id: &VmId,
        source: A::Error,
    ) -> ProvisionError<A::Error> {
        match self.api.get_vm(vm_id).await {
            Ok(None) => ProvisionError::Gone {
                vm_id: vm_id.clone(),
            },
            _ => ProvisionError::Credentials {
                vm_id: vm_id.clone(),
                source,
            },
        }
    }

    async fn run_steps(
        &self,
        session: &Session,
        spec: &ProvisionSpec,
    ) -> Result<ProvisionReport, ProvisionError<A::Error>> {
        let vm_id = &spec.vm_id;
        self.transport
            .wait_reachable(session, self.settings.reachable_timeout)
            .await
            .map_err(|source| ProvisionError::Unreachable {
                vm_id: vm_id.clone(),
                source,
            })?;

        for (index, file) in spec.files.iter().enumerate() {
            let uploaded = match &file.source {
                FileSource::LocalFile(path) => {
                    self.transport
                        .upload_file(session, path, &file.destination)
                        .await
                }
                FileSource::Inline(bytes) => {
                    self.transport
                        .write_file(session, &file.destination, bytes)
                        .await
                }
            };
            uploaded.map_err(|source| ProvisionError::Upload {
                vm_id: vm_id.clone(),
                position: index + 1,
                destination: file.destination.clone(),
                source,
            })?;
        }

        let total = spec.commands.len();
        let mut commands = Vec::with_capacity(total);
        for (index, command) in spec.commands.iter().enumerate() {
            let position = index + 1;
            info!(vm_id = %vm_id, position, total, "running provisioning command");
            let output = self
                .transport
                .run(session, command, self.settings.command_timeout)
                .await
                .map_err(|source| ProvisionError::Command {
                    vm_id: vm_id.clone(),
                    position,
                    total,
                    command: truncate(command, COMMAND_LABEL_LIMIT),
                    output: self.diagnostic_output(&source),
                    source,
                })?;
            commands.push(CommandReport {
                position,
                command: command.clone(),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(ProvisionReport {
            vm_id: vm_id.clone(),
            fingerprint: Fingerprint::of_provision(spec),
            files_written: spec.files.len(),
            commands,
        })
    }

    fn diagnostic_output(&self, error: &TransportError) -> String {
        let Some((stdout, stderr)) = error.captured_output() else {
            return String::new();
        };
        let mut rendered = String::new();
        if !stdout.trim().is_empty() {
            rendered.push_str("\nstdout: ");
            rendered.push_str(&truncate(stdout.trim_end(), self.settings.output_limit));
        }
        if !stderr.trim().is_empty() {
            rendered.push_str("\nstderr: ");
            rendered.push_str(&truncate(stderr.trim_end(), self.settings.output_limit));
        }
        rendered
    }
}

/// Shortens `text` to at most `limit` characters, marking the cut.
fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let mut shortened: String = text.chars().take(limit).collect();
    shortened.push_str("...");
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("short", 10, "short")]
    #[case("abcdef", 3, "abc...")]
    #[case("héllo wörld", 5, "héllo...")]
    fn truncate_respects_character_boundaries(
        #[case] text: &str,
        #[case] limit: usize,
        #[case] expected: &str,
    ) {
        assert_eq!(truncate(text, limit), expected);
    }
}
