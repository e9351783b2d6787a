//! State reconciliation and lifecycle orchestration.
//!
//! The [`Reconciler`] decides, given the persisted deployment state and live
//! cloud/tunnel queries, what action is safe to take next, drives the
//! collaborators to execute it, and updates persisted state to reflect the
//! outcome. Cached state is never trusted for decisions with external
//! consequences: every operation re-reads the store and re-queries the cloud
//! first.

mod error;
pub mod naming;
mod status;

use std::time::Duration;

use tokio::time::sleep;

use crate::backend::{CloudBackend, DeployRequest, ServerStatus};
use crate::bootstrap::render_startup_script;
use crate::config::AppConfig;
use crate::netcheck::NetProbe;
use crate::state::{DeploymentState, STATUS_RUNNING, STATUS_TERMINATED, StateStore};
use crate::tunnel::{TunnelClient, TunnelMode};
use crate::ui::Console;

pub use error::EngineError;
pub use status::StatusReport;

const KEY_POLL_ATTEMPTS: u32 = 30;
const KEY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Orchestrates the VPN lifecycle across the cloud backend, the local
/// tunnel, and the persisted state store.
#[derive(Debug)]
pub struct Reconciler<B, T, S, C, N> {
    backend: B,
    tunnel: T,
    store: S,
    console: C,
    probe: N,
    config: AppConfig,
    key_poll_attempts: u32,
    key_poll_interval: Duration,
}

impl<B, T, S, C, N> Reconciler<B, T, S, C, N>
where
    B: CloudBackend,
    T: TunnelClient,
    S: StateStore,
    C: Console,
    N: NetProbe,
{
    /// Creates a new reconciler over the given collaborators.
    #[must_use]
    pub const fn new(
        config: AppConfig,
        backend: B,
        tunnel: T,
        store: S,
        console: C,
        probe: N,
    ) -> Self {
        Self {
            backend,
            tunnel,
            store,
            console,
            probe,
            config,
            key_poll_attempts: KEY_POLL_ATTEMPTS,
            key_poll_interval: KEY_POLL_INTERVAL,
        }
    }

    /// Overrides the serial-console key polling schedule.
    ///
    /// This is primarily used by tests to keep retry scenarios fast.
    #[must_use]
    pub const fn with_key_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.key_poll_attempts = attempts;
        self.key_poll_interval = interval;
        self
    }

    /// Returns the current persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] when the store cannot be read.
    pub fn state_snapshot(&self) -> Result<DeploymentState, EngineError<B::Error>> {
        Ok(self.store.load()?)
    }

    /// Returns `true` when the local tunnel interface is up.
    pub fn tunnel_connected(&self) -> bool {
        self.tunnel.is_connected()
    }

    /// Returns the raw local WireGuard configuration for display.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Tunnel`] when the file cannot be read.
    pub fn tunnel_config(&self) -> Result<String, EngineError<B::Error>> {
        self.tunnel.raw_config().map_err(EngineError::Tunnel)
    }

    /// Deploys a new VPN server in `zone`.
    ///
    /// An existing deployment is never overwritten implicitly: interactively
    /// the user may approve a delete-then-deploy, while unattended callers
    /// get a hard failure.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidZone`] before any cloud call,
    /// [`EngineError::AlreadyDeployed`] or [`EngineError::Cancelled`] for
    /// the occupied-state branch, [`EngineError::DeploymentFailed`] when the
    /// provider returns no address, and [`EngineError::ConfigUpdate`] when
    /// the local config rewrite fails after the state was already persisted.
    pub async fn deploy(&self, zone: &str) -> Result<(), EngineError<B::Error>> {
        let region = naming::region_for_zone(zone).ok_or_else(|| EngineError::InvalidZone {
            zone: zone.to_owned(),
        })?;

        let mut state = self.store.load()?;
        if state.is_deployed() {
            let name = state.instance_name.clone().unwrap_or_default();
            if !self.console.is_interactive() {
                return Err(EngineError::AlreadyDeployed { name });
            }
            let replace = self.console.confirm(&format!(
                "An instance '{name}' already exists. Delete it before deploying a new one?"
            ))?;
            if !replace {
                self.console.warning("Deployment cancelled.");
                return Err(EngineError::Cancelled);
            }
            self.delete(true).await?;
            state = self.store.load()?;
        }

        let name = naming::base_instance_name(&self.config.instance_prefix, &region, zone);
        let (created_name, public_ip) = self.deploy_instance(name, &region, zone).await?;

        let server_key = self.fetch_server_key(&created_name, zone).await;

        state.record_deployment(created_name, region, zone);
        state.server_public_key = server_key.clone();
        self.store.save(&state)?;

        self.apply_server_config(&public_ip, server_key.as_deref())?;
        Ok(())
    }

    /// Starts the recorded VPN server, reconciling against live status
    /// first. Already-running servers take the idempotent refresh path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoInstance`] without a recorded instance,
    /// [`EngineError::StatusCheckFailed`] when the live query yields no
    /// usable answer, [`EngineError::Busy`] for transitional states, and
    /// backend/config errors from the start path itself.
    pub async fn start(&self) -> Result<(), EngineError<B::Error>> {
        let mut state = self.store.load()?;
        let (name, zone) = require_instance(&state)?;

        let status = self
            .backend
            .server_status(&name, &zone)
            .await
            .map_err(EngineError::Backend)?;

        match status {
            ServerStatus::Known { ref raw } if raw == STATUS_RUNNING => {
                self.console
                    .warning(&format!("Instance '{name}' is already running."));
                let public_ip = self
                    .backend
                    .public_ip(&name, &zone)
                    .await
                    .map_err(EngineError::Backend)?
                    .ok_or_else(|| EngineError::MissingPublicIp { name: name.clone() })?;
                self.apply_server_config(&public_ip, None)?;

                if let Some(cached) = state.server_public_key.clone() {
                    // Defends against manual edits to the config file.
                    self.tunnel
                        .set_peer_key(&cached)
                        .map_err(EngineError::ConfigUpdate)?;
                } else if let Some(key) = self.fetch_server_key(&name, &zone).await {
                    self.tunnel
                        .set_peer_key(&key)
                        .map_err(EngineError::ConfigUpdate)?;
                    state.server_public_key = Some(key);
                    self.store.save(&state)?;
                }
                Ok(())
            }
            ServerStatus::Known { ref raw } if raw == STATUS_TERMINATED => {
                let public_ip = self
                    .backend
                    .start_server(&name, &zone)
                    .await
                    .map_err(EngineError::Backend)?
                    .ok_or_else(|| EngineError::MissingPublicIp { name: name.clone() })?;

                state.status = Some(STATUS_RUNNING.to_owned());
                self.apply_server_config(&public_ip, None)?;

                if let Some(cached) = state.server_public_key.clone() {
                    if self.tunnel.set_peer_key(&cached).is_err() {
                        self.console
                            .warning("Could not re-assert the server key in the config.");
                    }
                } else if let Some(key) = self.fetch_server_key(&name, &zone).await {
                    if self.tunnel.set_peer_key(&key).is_ok() {
                        state.server_public_key = Some(key);
                    }
                }

                self.store.save(&state)?;
                Ok(())
            }
            ServerStatus::Known { raw } => Err(EngineError::Busy {
                display: crate::state::display_status(&raw).to_owned(),
            }),
            other => Err(EngineError::StatusCheckFailed {
                display: other.display(),
            }),
        }
    }

    /// Stops the recorded VPN server, disconnecting the tunnel first. A
    /// missing instance is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Tunnel`] when a live tunnel cannot be brought
    /// down (the stop is aborted), or a backend error from the stop call.
    pub async fn stop(&self) -> Result<(), EngineError<B::Error>> {
        let mut state = self.store.load()?;
        if !state.is_deployed() {
            self.console.warning("No instance found in state to stop.");
            return Ok(());
        }
        if state.status.as_deref() == Some(STATUS_TERMINATED) {
            self.console.warning("Instance is already stopped.");
            return Ok(());
        }
        let (name, zone) = require_instance(&state)?;

        if self.tunnel.is_connected() {
            if let Err(err) = self.tunnel.disconnect() {
                self.console
                    .warning("Could not disconnect the tunnel. Aborting instance stop.");
                return Err(EngineError::Tunnel(err));
            }
        }

        self.backend
            .stop_server(&name, &zone)
            .await
            .map_err(EngineError::Backend)?;

        state.status = Some(STATUS_TERMINATED.to_owned());
        self.store.save(&state)?;
        Ok(())
    }

    /// Permanently deletes the recorded VPN server. A missing instance is a
    /// no-op success; deletion of a live tunnel's server disconnects first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConfirmationRequired`] unattended without
    /// `force`, [`EngineError::Cancelled`] when the user declines, and
    /// tunnel/backend errors from the teardown steps.
    pub async fn delete(&self, force: bool) -> Result<(), EngineError<B::Error>> {
        let mut state = self.store.load()?;
        if !state.is_deployed() {
            self.console.warning("No instance found in state to delete.");
            return Ok(());
        }
        let (name, zone) = require_instance(&state)?;

        if !force {
            if !self.console.is_interactive() {
                return Err(EngineError::ConfirmationRequired);
            }
            let confirmed = self.console.confirm(&format!(
                "Permanently delete instance '{name}'? This cannot be undone."
            ))?;
            if !confirmed {
                self.console.info("Deletion cancelled.");
                return Err(EngineError::Cancelled);
            }
        }

        if self.tunnel.is_connected() {
            if let Err(err) = self.tunnel.disconnect() {
                self.console
                    .warning("Could not disconnect the tunnel. Aborting instance deletion.");
                return Err(EngineError::Tunnel(err));
            }
        }

        self.backend
            .delete_server(&name, &zone)
            .await
            .map_err(EngineError::Backend)?;

        state.clear_deployment();
        self.store.save(&state)?;
        Ok(())
    }

    /// Connects the local tunnel, applying the requested (or prompted, or
    /// default) mode first. Connecting while connected is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] when the live status is anything
    /// but running, [`EngineError::MissingServerKey`] when no key can be
    /// obtained, and config/tunnel errors from the connection steps.
    pub async fn connect(&self, mode: Option<TunnelMode>) -> Result<(), EngineError<B::Error>> {
        if self.tunnel.is_connected() {
            self.console.warning("WireGuard is already connected.");
            return Ok(());
        }

        let mut state = self.store.load()?;
        let mode = match mode {
            Some(mode) => mode,
            None if self.console.is_interactive() => self.console.choose_mode()?,
            None => TunnelMode::default(),
        };

        self.tunnel
            .set_route_scope(mode)
            .map_err(EngineError::ConfigUpdate)?;
        state.tunnel_mode = Some(mode);
        self.store.save(&state)?;

        let (name, zone) = require_instance(&state)?;
        let status = self
            .backend
            .server_status(&name, &zone)
            .await
            .map_err(EngineError::Backend)?;
        if status.raw() != Some(STATUS_RUNNING) {
            return Err(EngineError::NotRunning {
                display: status.display(),
            });
        }

        if let Some(cached) = state.server_public_key.clone() {
            self.tunnel
                .set_peer_key(&cached)
                .map_err(EngineError::ConfigUpdate)?;
        } else {
            let Some(key) = self.fetch_server_key(&name, &zone).await else {
                self.console
                    .warning("Cannot connect without the server public key.");
                return Err(EngineError::MissingServerKey);
            };
            self.tunnel
                .set_peer_key(&key)
                .map_err(EngineError::ConfigUpdate)?;
            state.server_public_key = Some(key);
            self.store.save(&state)?;
        }

        self.tunnel.connect().map_err(|err| {
            self.console
                .warning("Check 'wg-quick' logs or permissions.");
            EngineError::Tunnel(err)
        })?;
        Ok(())
    }

    /// Disconnects the local tunnel. Disconnecting while down is a no-op
    /// success.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Tunnel`] when the interface cannot be
    /// confirmed down afterwards.
    pub fn disconnect(&self) -> Result<(), EngineError<B::Error>> {
        if !self.tunnel.is_connected() {
            self.console.warning("WireGuard is already disconnected.");
            return Ok(());
        }
        self.tunnel.disconnect().map_err(|err| {
            self.console
                .warning("Interface may be stuck. Try again or check permissions.");
            EngineError::Tunnel(err)
        })
    }

    /// Switches the tunnel mode, rewriting the route scope and persisting
    /// the choice. Interactively the user may opt into an immediate
    /// disconnect/reconnect cycle; unattended callers get a warning instead
    /// because cycling a live tunnel without a human present is not assumed
    /// safe.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConfigUpdate`] when the route scope cannot be
    /// rewritten, plus any error from an approved reconnect cycle.
    pub async fn switch_mode(
        &self,
        mode: Option<TunnelMode>,
    ) -> Result<(), EngineError<B::Error>> {
        let mut state = self.store.load()?;
        let current = state.effective_tunnel_mode();
        self.console
            .info(&format!("Current tunnel mode: {}", current.label()));

        let new_mode = match mode {
            Some(mode) => mode,
            None if self.console.is_interactive() => self.console.choose_mode()?,
            None => current.toggled(),
        };

        if new_mode == current {
            self.console
                .info(&format!("Tunnel mode unchanged ({}).", current.label()));
            return Ok(());
        }

        self.tunnel
            .set_route_scope(new_mode)
            .map_err(EngineError::ConfigUpdate)?;
        state.tunnel_mode = Some(new_mode);
        self.store.save(&state)?;

        if self.tunnel.is_connected() {
            if self.console.is_interactive()
                && self
                    .console
                    .confirm("Disconnect and reconnect now to apply the new route scope?")?
            {
                self.disconnect()?;
                self.connect(Some(new_mode)).await?;
            } else {
                self.console.warning(
                    "Tunnel is still connected; the new route scope applies after a reconnect.",
                );
            }
        }
        Ok(())
    }

    /// Replaces the running server with a freshly deployed one to obtain a
    /// new public address, preserving continuity: the old instance is only
    /// deleted after the switch succeeds, and a failure to delete it is a
    /// warning rather than a rollback.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoInstance`] without a recorded instance,
    /// [`EngineError::Cancelled`] when the user declines the switch, and
    /// deploy/config/tunnel errors from the switch steps.
    pub async fn rotate_ip(
        &self,
        target_zone: Option<&str>,
    ) -> Result<(), EngineError<B::Error>> {
        let mut state = self.store.load()?;
        let (old_name, old_zone) = require_instance(&state)?;
        let old_region = match state.region.clone() {
            Some(region) => region,
            None => naming::region_for_zone(&old_zone).ok_or_else(|| EngineError::InvalidZone {
                zone: old_zone.clone(),
            })?,
        };

        let (deploy_region, deploy_zone) =
            self.rotation_target(&old_region, &old_zone, target_zone)?;

        let base =
            naming::base_instance_name(&self.config.instance_prefix, &deploy_region, &deploy_zone);
        let existing = match self.backend.list_server_names(&deploy_zone).await {
            Ok(names) => names,
            Err(err) => {
                tracing::warn!(error = %err, "instance listing failed, assuming first rotation");
                Vec::new()
            }
        };
        let name = format!(
            "{base}-rotate{}",
            naming::next_rotation_number(&base, &existing)
        );

        let (new_name, new_ip) = self
            .deploy_instance(name, &deploy_region, &deploy_zone)
            .await?;
        let new_key = self.fetch_server_key(&new_name, &deploy_zone).await;
        if new_key.is_none() {
            self.console
                .warning("Could not retrieve the public key from the new instance.");
        }

        self.console
            .success(&format!("Deployment successful: {new_ip}"));

        if self.console.is_interactive() {
            let switch = self.console.confirm(
                "Switch to the new IP now? (This will disconnect and reconnect your VPN)",
            )?;
            if !switch {
                self.console.info("IP rotation cancelled.");
                let keep = self.console.confirm(&format!(
                    "Keep the new server instance '{new_name}' running? (No will delete it)"
                ))?;
                if !keep {
                    self.console
                        .info(&format!("Deleting new instance '{new_name}'..."));
                    if self.backend.delete_server(&new_name, &deploy_zone).await.is_err() {
                        self.console
                            .warning(&format!("Failed to delete new instance '{new_name}'."));
                    }
                }
                return Err(EngineError::Cancelled);
            }
        }

        if self.tunnel.is_connected() {
            self.tunnel.disconnect().map_err(|err| {
                self.console
                    .error("Failed to disconnect from the current server. Aborting switch.");
                EngineError::Tunnel(err)
            })?;
        }

        self.apply_server_config(&new_ip, new_key.as_deref())?;

        state.record_deployment(new_name, deploy_region, deploy_zone.clone());
        state.server_public_key = new_key;
        self.store.save(&state)?;

        let mode = state.effective_tunnel_mode();
        self.connect(Some(mode)).await?;

        if self.backend.delete_server(&old_name, &old_zone).await.is_err() {
            self.console.warning(&format!(
                "Failed to delete old instance '{old_name}'. You may want to clean it up manually."
            ));
        }

        self.console.success(&format!("Rotated to new IP {new_ip}"));
        Ok(())
    }

    fn rotation_target(
        &self,
        old_region: &str,
        old_zone: &str,
        target_zone: Option<&str>,
    ) -> Result<(String, String), EngineError<B::Error>> {
        if !self.console.is_interactive() {
            return match target_zone {
                Some(zone) => {
                    let region =
                        naming::region_for_zone(zone).ok_or_else(|| EngineError::InvalidZone {
                            zone: zone.to_owned(),
                        })?;
                    Ok((region, zone.to_owned()))
                }
                None => Ok((old_region.to_owned(), old_zone.to_owned())),
            };
        }

        let same_location = self.console.confirm(&format!(
            "Use the same region ({old_region}) and zone ({old_zone}) for the new server?"
        ))?;
        if same_location {
            return Ok((old_region.to_owned(), old_zone.to_owned()));
        }

        match self.console.prompt_zone()? {
            Some(zone) => {
                let region =
                    naming::region_for_zone(&zone).ok_or_else(|| EngineError::InvalidZone {
                        zone: zone.clone(),
                    })?;
                Ok((region, zone))
            }
            None => {
                self.console
                    .warning("Zone selection cancelled. Using the current location.");
                Ok((old_region.to_owned(), old_zone.to_owned()))
            }
        }
    }

    async fn deploy_instance(
        &self,
        name: String,
        region: &str,
        zone: &str,
    ) -> Result<(String, String), EngineError<B::Error>> {
        let request = DeployRequest {
            name,
            region: region.to_owned(),
            zone: zone.to_owned(),
            boot_payload: render_startup_script(&self.config),
        };
        let created = self
            .backend
            .create_server(&request)
            .await
            .map_err(EngineError::Backend)?;

        let Some(public_ip) = created.public_ip else {
            return Err(EngineError::DeploymentFailed {
                reason: String::from("instance name or public IP not returned"),
            });
        };
        if created.name.is_empty() {
            return Err(EngineError::DeploymentFailed {
                reason: String::from("instance name or public IP not returned"),
            });
        }
        Ok((created.name, public_ip))
    }

    /// Best-effort retrieval of the server's published key by polling the
    /// serial console. Returns `None` after the attempts are exhausted.
    async fn fetch_server_key(&self, name: &str, zone: &str) -> Option<String> {
        for attempt in 1..=self.key_poll_attempts {
            match self.backend.read_serial_console(name, zone).await {
                Ok(console_output) => {
                    if let Some(key) = naming::extract_public_key(&console_output) {
                        return Some(key);
                    }
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "serial console read failed");
                }
            }
            if attempt < self.key_poll_attempts {
                sleep(self.key_poll_interval).await;
            }
        }
        self.console
            .warning("Public key not found in the serial console output.");
        None
    }

    /// Writes the server address (and key, when present) into the local
    /// tunnel configuration.
    fn apply_server_config(
        &self,
        public_ip: &str,
        server_key: Option<&str>,
    ) -> Result<(), EngineError<B::Error>> {
        self.tunnel
            .set_endpoint(public_ip, self.config.listen_port)
            .map_err(EngineError::ConfigUpdate)?;
        if let Some(key) = server_key {
            self.tunnel
                .set_peer_key(key)
                .map_err(EngineError::ConfigUpdate)?;
        }
        Ok(())
    }
}

fn require_instance<BE>(state: &DeploymentState) -> Result<(String, String), EngineError<BE>>
where
    BE: std::error::Error + 'static,
{
    match (&state.instance_name, &state.zone) {
        (Some(name), Some(zone)) => Ok((name.clone(), zone.clone())),
        _ => Err(EngineError::NoInstance),
    }
}

#[cfg(test)]
mod tests;
