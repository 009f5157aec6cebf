//! Tunnel transport settings loaded via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{APP_NAME, ConfigError, FieldMetadata};

/// SSH and TLS tunnel settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VERS_TRANSPORT",
    discovery(
        app_name = "verge",
        env_var = "VERGE_CONFIG_PATH",
        config_file_name = "verge.toml",
        dotfile_name = ".verge.toml",
        project_file_name = "verge.toml"
    )
)]
pub struct TransportConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `openssl` executable used as the proxy command.
    #[ortho_config(default = "openssl".to_owned())]
    pub openssl_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Domain appended to the VM identifier to form its host name.
    #[ortho_config(default = "vm.vers.sh".to_owned())]
    pub host_suffix: String,
    /// TLS port the tunnel connects to.
    #[ortho_config(default = 443)]
    pub tunnel_port: u16,
    /// SSH connection timeout in seconds.
    #[ortho_config(default = 30)]
    pub connect_timeout_secs: u64,
    /// SSH keep-alive interval in seconds.
    #[ortho_config(default = 15)]
    pub server_alive_interval_secs: u64,
    /// Missed keep-alives tolerated before SSH disconnects.
    #[ortho_config(default = 4)]
    pub server_alive_count_max: u32,
    /// Bound on a single reachability round-trip, in seconds.
    #[ortho_config(default = 15)]
    pub probe_timeout_secs: u64,
    /// Pause between reachability attempts, in seconds.
    #[ortho_config(default = 3)]
    pub reachable_interval_secs: u64,
    /// Bound on each file transfer step, in seconds.
    #[ortho_config(default = 600)]
    pub transfer_timeout_secs: u64,
    /// Directory under which per-session credential directories are made.
    /// Defaults to the system temporary directory.
    pub key_dir: Option<String>,
}

impl TransportConfig {
    /// Returns the built-in defaults without consulting any source.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            openssl_bin: String::from("openssl"),
            ssh_user: String::from("root"),
            host_suffix: String::from("vm.vers.sh"),
            tunnel_port: 443,
            connect_timeout_secs: 30,
            server_alive_interval_secs: 15,
            server_alive_count_max: 4,
            probe_timeout_secs: 15,
            reachable_interval_secs: 3,
            transfer_timeout_secs: 600,
            key_dir: None,
        }
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Bound on one reachability round-trip.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Pause between reachability attempts.
    #[must_use]
    pub const fn reachable_interval(&self) -> Duration {
        Duration::from_secs(self.reachable_interval_secs)
    }

    /// Bound on each file transfer step.
    #[must_use]
    pub const fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    /// Ensures required values are present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first unusable setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new("ssh executable", "VERS_TRANSPORT_SSH_BIN", "ssh_bin", "transport")
            .require_text(&self.ssh_bin)?;
        FieldMetadata::new(
            "openssl executable",
            "VERS_TRANSPORT_OPENSSL_BIN",
            "openssl_bin",
            "transport",
        )
        .require_text(&self.openssl_bin)?;
        FieldMetadata::new("ssh user", "VERS_TRANSPORT_SSH_USER", "ssh_user", "transport")
            .require_text(&self.ssh_user)?;
        FieldMetadata::new(
            "VM host suffix",
            "VERS_TRANSPORT_HOST_SUFFIX",
            "host_suffix",
            "transport",
        )
        .require_text(&self.host_suffix)?;
        if let Some(dir) = self.key_dir.as_deref() {
            FieldMetadata::new(
                "credential directory",
                "VERS_TRANSPORT_KEY_DIR",
                "key_dir",
                "transport",
            )
            .require_text(dir)?;
        }
        FieldMetadata::new(
            "reachability probe timeout",
            "VERS_TRANSPORT_PROBE_TIMEOUT_SECS",
            "probe_timeout_secs",
            "transport",
        )
        .require_positive(self.probe_timeout_secs)?;
        FieldMetadata::new(
            "transfer timeout",
            "VERS_TRANSPORT_TRANSFER_TIMEOUT_SECS",
            "transfer_timeout_secs",
            "transport",
        )
        .require_positive(self.transfer_timeout_secs)?;
        Ok(())
    }
}
