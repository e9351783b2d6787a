//! Error taxonomy for reconciliation operations.

use thiserror::Error;

use crate::state::StateStoreError;
use crate::tunnel::TunnelError;
use crate::ui::UiError;

/// Errors surfaced by the reconciliation engine, generic over the backend's
/// own error type.
#[derive(Debug, Error)]
pub enum EngineError<BackendError>
where
    BackendError: std::error::Error + 'static,
{
    /// Raised when a zone string has no recognisable region prefix.
    #[error("could not determine region from zone '{zone}'")]
    InvalidZone {
        /// Zone string supplied by the caller.
        zone: String,
    },
    /// Raised when a deploy is attempted while an instance is recorded and
    /// no human is present to approve its deletion.
    #[error("instance '{name}' already exists in state; delete it before deploying")]
    AlreadyDeployed {
        /// Name of the recorded instance.
        name: String,
    },
    /// Raised when a created instance comes back without a name or address.
    #[error("deployment unsuccessful: {reason}")]
    DeploymentFailed {
        /// What was missing from the provider's answer.
        reason: String,
    },
    /// Raised when an operation needs an instance but none is recorded.
    #[error("no instance found in state; deploy first")]
    NoInstance,
    /// Raised when the live status query does not yield a usable answer.
    #[error("could not confirm instance status (status: {display})")]
    StatusCheckFailed {
        /// Display form of the provider's answer.
        display: String,
    },
    /// Raised when the instance is mid-transition and cannot be acted on.
    #[error("instance is in state '{display}' and cannot be started now")]
    Busy {
        /// Display form of the provider's answer.
        display: String,
    },
    /// Raised when a connection is requested but the server is not running.
    #[error("instance is not running (status: {display})")]
    NotRunning {
        /// Display form of the provider's answer.
        display: String,
    },
    /// Raised when a running instance never exposes a public address.
    #[error("no public IP available for instance {name}")]
    MissingPublicIp {
        /// Instance whose address could not be read.
        name: String,
    },
    /// Raised when the server key cannot be obtained before connecting.
    #[error("server public key is unavailable; cannot establish the tunnel")]
    MissingServerKey,
    /// Raised when a destructive action runs unattended without `--force`.
    #[error("deletion requires confirmation; use --force when running non-interactively")]
    ConfirmationRequired,
    /// Raised when the user declines a confirmation.
    #[error("operation cancelled")]
    Cancelled,
    /// Raised when the local WireGuard configuration cannot be rewritten.
    #[error("failed to update the WireGuard configuration: {0}")]
    ConfigUpdate(#[source] TunnelError),
    /// Raised when bringing the tunnel up or down fails.
    #[error("tunnel control failed: {0}")]
    Tunnel(#[source] TunnelError),
    /// Raised when the state file cannot be read or written.
    #[error(transparent)]
    State(#[from] StateStoreError),
    /// Raised when a prompt cannot be rendered.
    #[error(transparent)]
    Ui(#[from] UiError),
    /// Provider failure, including operation timeouts and remote errors.
    #[error(transparent)]
    Backend(BackendError),
}
