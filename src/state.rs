//! Persisted deployment state for the VPN server.
//!
//! The state file is a cache of the last known answers from the cloud and
//! must never be trusted as ground truth: every operation re-reads it before
//! acting and reconciles against a live status query before anything with
//! external consequences.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tunnel::TunnelMode;

/// Raw provider status for a running instance.
pub const STATUS_RUNNING: &str = "RUNNING";
/// Raw provider status for a stopped instance. Compute Engine reports
/// stopped instances as `TERMINATED`.
pub const STATUS_TERMINATED: &str = "TERMINATED";

/// Maps a raw provider status to the label shown to users.
#[must_use]
pub fn display_status(raw: &str) -> &str {
    if raw == STATUS_TERMINATED { "STOPPED" } else { raw }
}

/// Durable record of the deployed VPN server, one instance at most.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeploymentState {
    /// Cloud instance name; `None` means no server is deployed.
    pub instance_name: Option<String>,
    /// Region the instance lives in. Set and cleared together with
    /// `instance_name` and `zone`.
    pub region: Option<String>,
    /// Zone the instance lives in.
    pub zone: Option<String>,
    /// Last known provider status. A cache, not ground truth.
    pub status: Option<String>,
    /// WireGuard public key published by the server at boot.
    pub server_public_key: Option<String>,
    /// Routing scope applied to the local tunnel.
    pub tunnel_mode: Option<TunnelMode>,
}

impl DeploymentState {
    /// Returns `true` when an instance identity is recorded.
    #[must_use]
    pub const fn is_deployed(&self) -> bool {
        self.instance_name.is_some() && self.zone.is_some()
    }

    /// Records a freshly deployed (or started) instance identity. The
    /// name/region/zone triple always moves together.
    pub fn record_deployment(
        &mut self,
        instance_name: impl Into<String>,
        region: impl Into<String>,
        zone: impl Into<String>,
    ) {
        self.instance_name = Some(instance_name.into());
        self.region = Some(region.into());
        self.zone = Some(zone.into());
        self.status = Some(STATUS_RUNNING.to_owned());
    }

    /// Clears the full instance identity quadruple and the server key, used
    /// by delete and by drift repair when the instance is confirmed gone.
    pub fn clear_deployment(&mut self) {
        self.instance_name = None;
        self.region = None;
        self.zone = None;
        self.status = None;
        self.server_public_key = None;
    }

    /// Tunnel mode with the documented default applied.
    #[must_use]
    pub fn effective_tunnel_mode(&self) -> TunnelMode {
        self.tunnel_mode.unwrap_or_default()
    }
}

/// Errors raised while persisting deployment state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when state cannot be serialised.
    #[error("failed to serialise state: {0}")]
    Serialize(String),
}

/// Abstraction over state persistence for dependency injection.
pub trait StateStore {
    /// Loads the persisted state, falling back to the default when the file
    /// is missing or unreadable.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::Io`] only for filesystem failures other
    /// than a missing file; corrupt content degrades to the default state
    /// with a logged warning.
    fn load(&self) -> Result<DeploymentState, StateStoreError>;

    /// Persists the full state record, creating parent directories as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the file cannot be written.
    fn save(&self, state: &DeploymentState) -> Result<(), StateStoreError>;
}

/// JSON-on-disk state store.
#[derive(Clone, Debug)]
pub struct JsonStateStore {
    path: Utf8PathBuf,
}

impl JsonStateStore {
    /// Creates a store backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn split_path(&self) -> Result<(&Utf8Path, &str), StateStoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| StateStoreError::Io {
                path: self.path.clone(),
                message: String::from("state file path is missing a filename"),
            })?;
        Ok((parent, file_name))
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<DeploymentState, StateStoreError> {
        let (parent, file_name) = self.split_path()?;

        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DeploymentState::default());
            }
            Err(err) => {
                return Err(StateStoreError::Io {
                    path: parent.to_path_buf(),
                    message: err.to_string(),
                });
            }
        };

        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DeploymentState::default());
            }
            Err(err) => {
                return Err(StateStoreError::Io {
                    path: self.path.clone(),
                    message: err.to_string(),
                });
            }
        };

        match serde_json::from_str(&contents) {
            Ok(state) => Ok(state),
            Err(err) => {
                tracing::warn!(
                    path = %self.path,
                    error = %err,
                    "state file is corrupt, falling back to empty state"
                );
                Ok(DeploymentState::default())
            }
        }
    }

    fn save(&self, state: &DeploymentState) -> Result<(), StateStoreError> {
        let (parent, file_name) = self.split_path()?;

        Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
            StateStoreError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            StateStoreError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;

        let rendered = serde_json::to_string_pretty(state)
            .map_err(|err| StateStoreError::Serialize(err.to_string()))?;

        dir.write(file_name, rendered)
            .map_err(|err| StateStoreError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> JsonStateStore {
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("state.json"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
        JsonStateStore::new(path)
    }

    #[test]
    fn load_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let state = store_in(&tmp).load().expect("load should succeed");
        assert_eq!(state, DeploymentState::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);

        let mut state = DeploymentState::default();
        state.record_deployment("vpn-server-us-central1-a", "us-central1", "us-central1-a");
        state.server_public_key = Some(format!("{}=", "A".repeat(43)));
        state.tunnel_mode = Some(TunnelMode::Socks5);
        store.save(&state).expect("save should succeed");

        let loaded = store.load().expect("load should succeed");
        assert_eq!(loaded, state);
    }

    #[test]
    fn corrupt_file_degrades_to_default() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);
        std::fs::write(tmp.path().join("state.json"), "{ not json")
            .expect("seed file should write");

        let state = store.load().expect("load should tolerate corruption");
        assert_eq!(state, DeploymentState::default());
    }

    #[test]
    fn clear_deployment_resets_identity_and_key() {
        let mut state = DeploymentState::default();
        state.record_deployment("name", "region", "zone");
        state.server_public_key = Some(String::from("key"));
        state.tunnel_mode = Some(TunnelMode::Socks5);

        state.clear_deployment();

        assert!(!state.is_deployed());
        assert_eq!(state.status, None);
        assert_eq!(state.server_public_key, None);
        // Tunnel mode is a local preference, not instance identity.
        assert_eq!(state.tunnel_mode, Some(TunnelMode::Socks5));
    }

    #[test]
    fn display_status_translates_terminated() {
        assert_eq!(display_status(STATUS_TERMINATED), "STOPPED");
        assert_eq!(display_status(STATUS_RUNNING), "RUNNING");
        assert_eq!(display_status("STAGING"), "STAGING");
    }
}
