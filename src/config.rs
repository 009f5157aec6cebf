//! Configuration loading via `ortho-config`.
//!
//! Values merge built-in defaults, a discovered `verge.toml`, and environment
//! variables. Validation is explicit so callers decide when a missing value
//! becomes fatal.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::api::DEFAULT_BASE_URL;

/// Application name used for configuration discovery.
pub const APP_NAME: &str = "verge";

/// Remote lifecycle API settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VERS",
    discovery(
        app_name = "verge",
        env_var = "VERGE_CONFIG_PATH",
        config_file_name = "verge.toml",
        dotfile_name = ".verge.toml",
        project_file_name = "verge.toml"
    )
)]
pub struct ApiConfig {
    /// Bearer credential for the lifecycle API. This value is required.
    pub api_key: String,
    /// Base URL of the lifecycle API.
    #[ortho_config(default = DEFAULT_BASE_URL.to_owned())]
    pub base_url: String,
    /// Per-request timeout in seconds. Create and commit calls can take
    /// minutes, so the default is generous.
    #[ortho_config(default = 300)]
    pub request_timeout_secs: u64,
}

/// Engine timeouts and local state location.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VERGE",
    discovery(
        app_name = "verge",
        env_var = "VERGE_CONFIG_PATH",
        config_file_name = "verge.toml",
        dotfile_name = ".verge.toml",
        project_file_name = "verge.toml"
    )
)]
pub struct EngineConfig {
    /// Upper bound for a VM to answer a round-trip before provisioning.
    #[ortho_config(default = 180)]
    pub reachable_timeout_secs: u64,
    /// Upper bound for a single provisioning command.
    #[ortho_config(default = 600)]
    pub command_timeout_secs: u64,
    /// Upper bound for the filesystem flush that precedes a commit.
    #[ortho_config(default = 120)]
    pub flush_timeout_secs: u64,
    /// Upper bound for a created or restored VM to report `running`.
    #[ortho_config(default = 180)]
    pub boot_timeout_secs: u64,
    /// Interval between VM state polls.
    #[ortho_config(default = 2)]
    pub boot_poll_interval_secs: u64,
    /// Number of characters of captured output kept in diagnostics.
    #[ortho_config(default = 2000)]
    pub output_limit: usize,
    /// Location of the local record ledger.
    #[ortho_config(default = ".verge/state.json".to_owned())]
    pub state_path: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
pub(crate) struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    pub(crate) const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    pub(crate) fn require_text(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [{}] in verge.toml",
                self.description, self.env_var, self.toml_key, self.section
            )));
        }
        Ok(())
    }

    pub(crate) fn require_positive(&self, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: set {} or {} in [{}] of verge.toml",
                self.description, self.env_var, self.toml_key, self.section
            )));
        }
        Ok(())
    }
}

impl ApiConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the API key or base URL is
    /// blank, or [`ConfigError::Invalid`] for a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new("lifecycle API key", "VERS_API_KEY", "api_key", "api")
            .require_text(&self.api_key)?;
        FieldMetadata::new("lifecycle API base URL", "VERS_BASE_URL", "base_url", "api")
            .require_text(&self.base_url)?;
        FieldMetadata::new(
            "API request timeout",
            "VERS_REQUEST_TIMEOUT_SECS",
            "request_timeout_secs",
            "api",
        )
        .require_positive(self.request_timeout_secs)?;
        Ok(())
    }
}

impl EngineConfig {
    /// Returns the built-in defaults without consulting any source.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            reachable_timeout_secs: 180,
            command_timeout_secs: 600,
            flush_timeout_secs: 120,
            boot_timeout_secs: 180,
            boot_poll_interval_secs: 2,
            output_limit: 2000,
            state_path: String::from(".verge/state.json"),
        }
    }
}

impl EngineConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Bound on the reachability wait before provisioning.
    #[must_use]
    pub const fn reachable_timeout(&self) -> Duration {
        Duration::from_secs(self.reachable_timeout_secs)
    }

    /// Bound on a single provisioning command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Bound on the pre-commit flush.
    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    /// Bound on boot readiness polling.
    #[must_use]
    pub const fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Interval between state polls.
    #[must_use]
    pub const fn boot_poll_interval(&self) -> Duration {
        Duration::from_secs(self.boot_poll_interval_secs)
    }

    /// Location of the ledger file.
    #[must_use]
    pub fn state_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.state_path)
    }

    /// Validates timeouts and the state path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            (
                self.reachable_timeout_secs,
                FieldMetadata::new(
                    "reachability timeout",
                    "VERGE_REACHABLE_TIMEOUT_SECS",
                    "reachable_timeout_secs",
                    "engine",
                ),
            ),
            (
                self.command_timeout_secs,
                FieldMetadata::new(
                    "command timeout",
                    "VERGE_COMMAND_TIMEOUT_SECS",
                    "command_timeout_secs",
                    "engine",
                ),
            ),
            (
                self.flush_timeout_secs,
                FieldMetadata::new(
                    "flush timeout",
                    "VERGE_FLUSH_TIMEOUT_SECS",
                    "flush_timeout_secs",
                    "engine",
                ),
            ),
            (
                self.boot_timeout_secs,
                FieldMetadata::new(
                    "boot timeout",
                    "VERGE_BOOT_TIMEOUT_SECS",
                    "boot_timeout_secs",
                    "engine",
                ),
            ),
            (
                self.boot_poll_interval_secs,
                FieldMetadata::new(
                    "boot poll interval",
                    "VERGE_BOOT_POLL_INTERVAL_SECS",
                    "boot_poll_interval_secs",
                    "engine",
                ),
            ),
        ];
        for (value, metadata) in &durations {
            metadata.require_positive(*value)?;
        }
        FieldMetadata::new("state path", "VERGE_STATE_PATH", "state_path", "engine")
            .require_text(&self.state_path)?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
