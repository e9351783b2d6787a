//! Command-line interface definitions for the `stratus` binary.
//!
//! This module is kept free of crate-internal types so the build script can
//! include it by path when generating the manual page.

use clap::{ArgGroup, Parser, ValueEnum};

/// Top-level CLI for the `stratus` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stratus",
    about = "Manage a personal WireGuard VPN on Google Compute Engine",
    group(ArgGroup::new("action").multiple(false)),
    group(ArgGroup::new("auth").multiple(false))
)]
pub(crate) struct Cli {
    /// Deploy a new VPN server (requires --zone).
    #[arg(long, group = "action", requires = "zone")]
    pub(crate) deploy: bool,
    /// Start the existing VPN server.
    #[arg(long, group = "action")]
    pub(crate) start: bool,
    /// Stop the existing VPN server.
    #[arg(long, group = "action")]
    pub(crate) stop: bool,
    /// Delete the VPN server.
    #[arg(long, group = "action")]
    pub(crate) delete: bool,
    /// Connect local WireGuard (optional mode: vpn or socks5).
    #[arg(
        long,
        group = "action",
        value_name = "MODE",
        num_args = 0..=1,
        default_missing_value = "vpn"
    )]
    pub(crate) connect: Option<ModeArg>,
    /// Disconnect local WireGuard.
    #[arg(long, group = "action")]
    pub(crate) disconnect: bool,
    /// Rotate the VPN server's public IP by replacing the instance.
    #[arg(long = "rotate-ip", group = "action")]
    pub(crate) rotate_ip: bool,
    /// Show VPN and connection status, repairing drift where possible.
    #[arg(long, group = "action")]
    pub(crate) status: bool,
    /// Show the local WireGuard configuration.
    #[arg(long = "show-config", group = "action")]
    pub(crate) show_config: bool,

    /// GCP zone (e.g. europe-west1-b).
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Skip confirmation prompts.
    #[arg(long)]
    pub(crate) force: bool,

    /// Use Application Default Credentials.
    #[arg(long, group = "auth")]
    pub(crate) adc: bool,
    /// Use ADC with service account impersonation (optionally provide the
    /// service account email).
    #[arg(long, group = "auth", value_name = "SA_EMAIL", num_args = 0..=1)]
    pub(crate) impersonate: Option<Option<String>>,
    /// Use a service account key file.
    #[arg(long = "sa-key", group = "auth", value_name = "KEY_FILE_PATH")]
    pub(crate) sa_key: Option<String>,

    /// Enable verbose output.
    #[arg(short, long)]
    pub(crate) verbose: bool,
}

/// Tunnel mode accepted by `--connect`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum ModeArg {
    /// Route all traffic through the tunnel.
    Vpn,
    /// Route only SOCKS5 proxy traffic through the tunnel.
    Socks5,
}

/// A single action selected on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CliAction {
    /// Deploy a new server.
    Deploy,
    /// Start the recorded server.
    Start,
    /// Stop the recorded server.
    Stop,
    /// Delete the recorded server.
    Delete,
    /// Connect the local tunnel with the given mode.
    Connect(ModeArg),
    /// Disconnect the local tunnel.
    Disconnect,
    /// Rotate the server's public IP.
    RotateIp,
    /// Run the status checks.
    Status,
    /// Print the local WireGuard configuration.
    ShowConfig,
}

impl Cli {
    /// Returns the selected action, or `None` for the interactive menu.
    pub(crate) fn action(&self) -> Option<CliAction> {
        if self.deploy {
            Some(CliAction::Deploy)
        } else if self.start {
            Some(CliAction::Start)
        } else if self.stop {
            Some(CliAction::Stop)
        } else if self.delete {
            Some(CliAction::Delete)
        } else if let Some(mode) = self.connect {
            Some(CliAction::Connect(mode))
        } else if self.disconnect {
            Some(CliAction::Disconnect)
        } else if self.rotate_ip {
            Some(CliAction::RotateIp)
        } else if self.status {
            Some(CliAction::Status)
        } else if self.show_config {
            Some(CliAction::ShowConfig)
        } else {
            None
        }
    }
}
