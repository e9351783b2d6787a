//! Backend abstraction for the cloud instance hosting the VPN server.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Parameters required to create a new VPN server instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeployRequest {
    /// Instance name to create.
    pub name: String,
    /// Region derived from the zone.
    pub region: String,
    /// Target availability zone (for example `us-central1-a`).
    pub zone: String,
    /// Boot payload executed on first start (startup script).
    pub boot_payload: String,
}

impl DeployRequest {
    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any string field is empty.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.name.is_empty() {
            return Err(BackendError::Validation("name".to_owned()));
        }
        if self.region.is_empty() {
            return Err(BackendError::Validation("region".to_owned()));
        }
        if self.zone.is_empty() {
            return Err(BackendError::Validation("zone".to_owned()));
        }
        if self.boot_payload.is_empty() {
            return Err(BackendError::Validation("boot_payload".to_owned()));
        }
        Ok(())
    }
}

/// Details of a freshly created instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedServer {
    /// Provider instance name.
    pub name: String,
    /// External IPv4 address, when the provider has assigned one.
    pub public_ip: Option<String>,
}

/// Live status of an instance as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerStatus {
    /// Status retrieved successfully, in the provider's own vocabulary.
    Known {
        /// Raw provider status, for example `RUNNING` or `TERMINATED`.
        raw: String,
    },
    /// The instance does not exist.
    NotFound,
    /// The caller is not permitted to inspect the instance.
    Forbidden,
    /// The query failed for a transient or unclassified reason.
    Unavailable {
        /// Description of the failure.
        message: String,
    },
}

impl ServerStatus {
    /// Returns the raw provider status when known.
    #[must_use]
    pub fn raw(&self) -> Option<&str> {
        match self {
            Self::Known { raw } => Some(raw),
            _ => None,
        }
    }

    /// Returns the label shown to users, translating the provider's
    /// stopped-state vocabulary.
    #[must_use]
    pub fn display(&self) -> String {
        match self {
            Self::Known { raw } => crate::state::display_status(raw).to_owned(),
            Self::NotFound => String::from("Not found"),
            Self::Forbidden => String::from("Permission denied"),
            Self::Unavailable { .. } => String::from("Error"),
        }
    }

    /// Returns `true` when the instance is gone or inaccessible, the signal
    /// that persisted identity should be cleared.
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound | Self::Forbidden)
    }
}

/// Errors raised by backend request validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Cloud lifecycle operations required by the reconciliation engine.
pub trait CloudBackend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a new instance and blocks until the create operation reaches
    /// a terminal state.
    fn create_server<'a>(
        &'a self,
        request: &'a DeployRequest,
    ) -> BackendFuture<'a, CreatedServer, Self::Error>;

    /// Starts a stopped instance and returns its public IP once assigned.
    fn start_server<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error>;

    /// Stops a running instance.
    fn stop_server<'a>(&'a self, name: &'a str, zone: &'a str)
    -> BackendFuture<'a, (), Self::Error>;

    /// Deletes an instance. A missing instance counts as success.
    fn delete_server<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Queries the live status of an instance. Failures are folded into
    /// [`ServerStatus`] rather than surfaced as errors so callers can react
    /// to not-found and transient failures differently.
    fn server_status<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, ServerStatus, Self::Error>;

    /// Returns the instance's external IPv4 address, if assigned.
    fn public_ip<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error>;

    /// Reads the instance's serial console output.
    fn read_serial_console<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, String, Self::Error>;

    /// Lists instance names in a zone, used for rotation numbering.
    fn list_server_names<'a>(&'a self, zone: &'a str)
    -> BackendFuture<'a, Vec<String>, Self::Error>;
}
