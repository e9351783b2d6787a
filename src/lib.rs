//! Core library for the stratus VPN manager.
//!
//! The crate deploys, connects to, and tears down a personal WireGuard VPN
//! running on a single Compute Engine instance. Its heart is the
//! [`engine::Reconciler`], which keeps three independent sources of truth —
//! live cloud status, local tunnel state, and the local WireGuard
//! configuration file — consistent with the persisted deployment record.

pub mod auth;
pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod gcp;
pub mod netcheck;
pub mod process;
pub mod state;
pub mod test_support;
pub mod tunnel;
pub mod ui;

pub use auth::{AuthConfig, AuthError, GcloudTokenSource, TokenSource, is_credential_error};
pub use backend::{
    BackendFuture, CloudBackend, CreatedServer, DeployRequest, ServerStatus,
};
pub use config::{AppConfig, ConfigError, WireguardPeer, expand_tilde};
pub use engine::{EngineError, Reconciler, StatusReport};
pub use gcp::{GceBackend, GceError};
pub use netcheck::{NetProbe, PublicIpInfo, SystemNetProbe, country_code_to_flag};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner, ProcessError};
pub use state::{DeploymentState, JsonStateStore, StateStore, StateStoreError};
pub use tunnel::{TunnelClient, TunnelError, TunnelMode, WgQuickTunnel};
pub use ui::{Console, MenuAction, TerminalConsole, UiError};
