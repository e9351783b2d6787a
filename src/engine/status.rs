//! Drift detection and repair across the three sources of truth.
//!
//! Five checks run in a fixed order; each is independent and non-aborting,
//! prints its own status line, and accumulates mutations that are persisted
//! in a single write at the end.

use crate::backend::{CloudBackend, ServerStatus};
use crate::netcheck::{NetProbe, PublicIpInfo};
use crate::state::{STATUS_RUNNING, StateStore, display_status};
use crate::tunnel::TunnelClient;
use crate::ui::Console;

use super::{EngineError, Reconciler};

/// Findings of a status-sync run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StatusReport {
    /// Whether the connectivity probe succeeded.
    pub internet_connected: bool,
    /// Whether the local tunnel interface is up.
    pub tunnel_connected: bool,
    /// Public IP and country, when the lookup succeeded.
    pub public_ip: Option<PublicIpInfo>,
    /// Whether the persisted state was changed and re-written.
    pub state_updated: bool,
    /// Whether any check failed in a way that leaves drift unresolved.
    pub sync_incomplete: bool,
}

impl<B, T, S, C, N> Reconciler<B, T, S, C, N>
where
    B: CloudBackend,
    T: TunnelClient,
    S: StateStore,
    C: Console,
    N: NetProbe,
{
    /// Runs the five drift checks and repairs what can be repaired.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] when the store cannot be read or the
    /// accumulated repairs cannot be written back; individual check failures
    /// degrade to warnings instead of aborting the run.
    pub async fn sync_status(&self) -> Result<StatusReport, EngineError<B::Error>> {
        let mut state = self.store.load()?;
        let mut report = StatusReport::default();
        let mut dirty = false;

        // Check 1: connectivity probe, informational only.
        self.console.info("Checking internet connectivity...");
        report.internet_connected = self.probe.ping(&self.config.connectivity_check_ip);
        if report.internet_connected {
            self.console.success("Internet: Connected");
        } else {
            self.console.error("Internet: Disconnected");
        }

        // Check 2: live cloud status against the cached one.
        self.console.info("Checking cloud instance status...");
        let mut live_raw_status: Option<String> = None;
        if let (Some(name), Some(zone)) = (state.instance_name.clone(), state.zone.clone()) {
            let status = self
                .backend
                .server_status(&name, &zone)
                .await
                .map_err(EngineError::Backend)?;
            match status {
                ServerStatus::Known { raw } => {
                    self.console.success(&format!(
                        "Cloud instance: {name} (Status: {}, Zone: {zone})",
                        display_status(&raw)
                    ));
                    self.console.info("Checking local state consistency...");
                    if state.status.as_deref() == Some(raw.as_str()) {
                        self.console.success("Local state status matches the cloud.");
                    } else {
                        self.console.warning(&format!(
                            "Local state status mismatch detected (was '{}', now '{raw}'). Updated.",
                            state.status.as_deref().unwrap_or("N/A")
                        ));
                        state.status = Some(raw.clone());
                        dirty = true;
                    }
                    live_raw_status = Some(raw);
                }
                gone if gone.is_gone() => {
                    self.console.warning(&format!(
                        "Could not retrieve status for instance '{name}'. API returned: {}.",
                        gone.display()
                    ));
                    state.clear_deployment();
                    dirty = true;
                    self.console.warning(
                        "Cleared stale instance details from local state.",
                    );
                }
                unavailable => {
                    self.console.warning(&format!(
                        "Could not retrieve status for instance '{name}'. API returned: {}.",
                        unavailable.display()
                    ));
                    self.console.error(
                        "Failed to confirm instance status due to an API error. \
                         Local state remains unchanged.",
                    );
                    report.sync_incomplete = true;
                }
            }
        } else {
            self.console
                .info("No instance details found in local state to check.");
        }

        // Check 3: local tunnel connection, informational only.
        self.console.info("Checking WireGuard connection...");
        report.tunnel_connected = self.tunnel.is_connected();
        if report.tunnel_connected {
            self.console.success("WireGuard: Connected");
        } else {
            self.console.warning("WireGuard: Not connected");
        }

        // Check 4: public IP and geolocation, best-effort.
        self.console.info("Checking public IP...");
        report.public_ip = self
            .probe
            .public_ip_info(&self.config.ip_info_service)
            .await;
        match &report.public_ip {
            Some(info) => self
                .console
                .success(&format!("Public IP: {}", info.display())),
            None => self.console.error("Could not determine public IP"),
        }

        // Check 5: config endpoint against the live cloud address.
        self.console.info("Checking WireGuard config endpoint...");
        let config_ip = self.tunnel.endpoint_host();
        let cloud_ip = if live_raw_status.as_deref() == Some(STATUS_RUNNING) {
            match (state.instance_name.clone(), state.zone.clone()) {
                (Some(name), Some(zone)) => self
                    .backend
                    .public_ip(&name, &zone)
                    .await
                    .map_err(EngineError::Backend)?,
                _ => None,
            }
        } else {
            None
        };

        match (config_ip, cloud_ip) {
            (Some(config_ip), Some(cloud_ip)) if config_ip == cloud_ip => {
                self.console.success(&format!(
                    "WireGuard config IP matches the cloud IP: {config_ip}"
                ));
            }
            (Some(config_ip), Some(cloud_ip)) => {
                self.console.warning(&format!(
                    "WireGuard config IP ({config_ip}) does not match the instance IP ({cloud_ip})."
                ));
                self.repair_endpoint(&cloud_ip, &mut report);
            }
            (Some(config_ip), None) => {
                self.console
                    .success(&format!("WireGuard config IP: {config_ip}"));
                if live_raw_status.as_deref() == Some(STATUS_RUNNING) {
                    self.console.warning(
                        "Could not verify the config IP against the instance IP.",
                    );
                }
            }
            (None, Some(cloud_ip)) => {
                self.console.warning(
                    "Could not read an Endpoint IP from the WireGuard config.",
                );
                self.console
                    .info("Instance is running but the config IP is missing. Updating...");
                self.repair_endpoint(&cloud_ip, &mut report);
            }
            (None, None) => {
                self.console.warning(
                    "Could not read an Endpoint IP from the WireGuard config.",
                );
            }
        }

        if dirty {
            self.store.save(&state)?;
            report.state_updated = true;
            self.console
                .warning("Local state file was updated based on these checks.");
        }
        Ok(report)
    }

    fn repair_endpoint(&self, cloud_ip: &str, report: &mut StatusReport) {
        match self.tunnel.set_endpoint(cloud_ip, self.config.listen_port) {
            Ok(()) => self
                .console
                .success("Local WireGuard configuration updated successfully."),
            Err(err) => {
                tracing::warn!(error = %err, "endpoint repair failed");
                self.console
                    .error("Failed to update the local WireGuard configuration.");
                report.sync_incomplete = true;
            }
        }
    }

    /// Builds the banner shown at the top of each interactive loop pass:
    /// a connection-state header and a one-line summary of public IP,
    /// tunnel mode, and instance identity.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] when the store cannot be read.
    pub async fn state_summary(&self) -> Result<(String, String), EngineError<B::Error>> {
        let state = self.store.load()?;
        let connected = self.tunnel.is_connected();

        let mut status_display = String::from("N/A");
        if let (Some(name), Some(zone)) = (state.instance_name.clone(), state.zone.clone()) {
            status_display = match &state.status {
                Some(raw) => display_status(raw).to_owned(),
                None => self
                    .backend
                    .server_status(&name, &zone)
                    .await
                    .map_err(EngineError::Backend)?
                    .display(),
            };
        }

        let header = if connected {
            "[ Stratus - Connected ]"
        } else if status_display == "RUNNING" {
            "[ Stratus - Ready ]"
        } else if status_display == "STOPPED" {
            "[ Stratus - Stopped ]"
        } else {
            "[ Stratus - Disconnected ]"
        };

        let ip_display = self
            .probe
            .public_ip_info(&self.config.ip_info_service)
            .await
            .map_or_else(|| String::from("Unknown"), |info| info.display());

        let instance_info = match (&state.instance_name, &state.zone) {
            (Some(name), Some(zone)) => format!("Instance: {name} ({zone})"),
            _ if status_display == "N/A" => String::from("No VPN instance deployed"),
            _ => String::from("Instance: N/A"),
        };

        let info_line = format!(
            "Public IP: {ip_display}  •  Tunnel: {}  •  {instance_info}",
            state.effective_tunnel_mode().label()
        );

        Ok((header.to_owned(), info_line))
    }
}
