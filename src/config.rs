//! Application configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named WireGuard peer granted access to the server, with a fixed route.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct WireguardPeer {
    /// Human-readable label for the peer.
    pub name: String,
    /// Peer public key installed on the server at boot.
    pub public_key: String,
    /// Route assigned to the peer inside the tunnel network.
    pub allowed_ip: String,
}

/// Application settings merged from defaults, configuration files, and
/// `STRATUS_`-prefixed environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "STRATUS")]
pub struct AppConfig {
    /// Google Cloud project that owns the VPN instance.
    #[ortho_config(default = "my-vpn-project".to_owned())]
    pub project_id: String,
    /// Machine type for new instances. A small shape is plenty for one peer.
    #[ortho_config(default = "e2-micro".to_owned())]
    pub machine_type: String,
    /// Network tier applied to the instance's external address.
    #[ortho_config(default = "PREMIUM".to_owned())]
    pub network_tier: String,
    /// Firewall tags attached to the instance. Defaults to `["wireguard"]`.
    pub firewall_tags: Option<Vec<String>>,
    /// Prefix used when naming instances.
    #[ortho_config(default = "vpn-server".to_owned())]
    pub instance_prefix: String,
    /// UDP port the WireGuard server listens on.
    #[ortho_config(default = 51820)]
    pub listen_port: u16,
    /// Static peers injected into the server's boot configuration.
    #[ortho_config(skip_cli)]
    pub peers: Option<Vec<WireguardPeer>>,
    /// Path to the local WireGuard client configuration file.
    #[ortho_config(default = "/etc/wireguard/wg0.conf".to_owned())]
    pub tunnel_config_file: String,
    /// Path to the persisted deployment state file.
    #[ortho_config(default = "~/.config/stratus/state.json".to_owned())]
    pub state_file: String,
    /// HTTP endpoint returning the caller's public IP and country as JSON.
    #[ortho_config(default = "https://ipinfo.io/json".to_owned())]
    pub ip_info_service: String,
    /// Address pinged by the connectivity probe.
    #[ortho_config(default = "8.8.8.8".to_owned())]
    pub connectivity_check_ip: String,
    /// Path to the `gcloud` binary used for token acquisition.
    #[ortho_config(default = "gcloud".to_owned())]
    pub gcloud_bin: String,
    /// Path to the `wg` binary.
    #[ortho_config(default = "wg".to_owned())]
    pub wg_bin: String,
    /// Path to the `wg-quick` binary.
    #[ortho_config(default = "wg-quick".to_owned())]
    pub wg_quick_bin: String,
    /// Whether tunnel commands are run through `sudo`.
    #[ortho_config(default = true)]
    pub use_sudo: bool,
    /// Default authentication method (`adc`, `sa_key`, or `impersonation`).
    pub auth_method: Option<String>,
    /// Service account email used when impersonating.
    pub service_account_email: Option<String>,
    /// Service account key file used when `auth_method` is `sa_key`.
    pub service_account_key_path: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl AppConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("stratus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Firewall tags with the documented default applied.
    #[must_use]
    pub fn firewall_tags(&self) -> Vec<String> {
        self.firewall_tags
            .clone()
            .unwrap_or_else(|| vec![String::from("wireguard")])
    }

    /// Static peers with the documented default (none) applied.
    #[must_use]
    pub fn peers(&self) -> &[WireguardPeer] {
        self.peers.as_deref().unwrap_or_default()
    }

    /// Performs semantic validation on required fields. Error messages
    /// include guidance on how to provide missing values via environment
    /// variables or configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.project_id,
            &FieldMetadata::new("GCP project ID", "STRATUS_PROJECT_ID", "project_id"),
        )?;
        Self::require_field(
            &self.machine_type,
            &FieldMetadata::new("machine type", "STRATUS_MACHINE_TYPE", "machine_type"),
        )?;
        Self::require_field(
            &self.network_tier,
            &FieldMetadata::new("network tier", "STRATUS_NETWORK_TIER", "network_tier"),
        )?;
        Self::require_field(
            &self.instance_prefix,
            &FieldMetadata::new(
                "instance name prefix",
                "STRATUS_INSTANCE_PREFIX",
                "instance_prefix",
            ),
        )?;
        Self::require_field(
            &self.tunnel_config_file,
            &FieldMetadata::new(
                "WireGuard config path",
                "STRATUS_TUNNEL_CONFIG_FILE",
                "tunnel_config_file",
            ),
        )?;
        Self::require_field(
            &self.state_file,
            &FieldMetadata::new("state file path", "STRATUS_STATE_FILE", "state_file"),
        )?;
        if self.listen_port == 0 {
            return Err(ConfigError::MissingField(String::from(
                "listen_port must be non-zero",
            )));
        }
        Ok(())
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to stratus.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Expands a leading `~/` to the caller's home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
