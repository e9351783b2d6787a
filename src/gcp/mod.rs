//! Compute Engine backend implementation of the instance lifecycle.
//!
//! Every mutating call blocks on bounded zonal-operation polling so callers
//! observe a terminal outcome or a timeout, never an in-flight operation.

mod api;
mod error;

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::auth::TokenSource;
use crate::backend::{BackendFuture, CloudBackend, CreatedServer, DeployRequest, ServerStatus};
use crate::config::AppConfig;
use api::{
    InstanceListResponse, InstanceResource, OperationResource, SerialPortOutputResource,
};

pub use error::GceError;

const API_BASE: &str = "https://compute.googleapis.com/compute/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(3);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Boot image pinned for reproducible server builds.
pub(crate) const SOURCE_IMAGE: &str =
    "projects/debian-cloud/global/images/debian-12-bookworm-v20240415";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Backend that manages the VPN instance through the Compute Engine v1 API.
#[derive(Clone)]
pub struct GceBackend {
    pub(crate) http: reqwest::Client,
    pub(crate) token_source: Arc<dyn TokenSource>,
    pub(crate) project_id: String,
    pub(crate) machine_type: String,
    pub(crate) network_tier: String,
    pub(crate) firewall_tags: Vec<String>,
    pub(crate) api_base: String,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl GceBackend {
    /// Constructs a backend and verifies the token source can produce a
    /// credential. Construction either succeeds or fails with an
    /// authentication error; recovery policy is the caller's concern.
    ///
    /// # Errors
    ///
    /// Returns [`GceError::Auth`] when no access token can be obtained.
    pub fn connect(
        config: &AppConfig,
        token_source: Arc<dyn TokenSource>,
    ) -> Result<Self, GceError> {
        token_source.token()?;
        Ok(Self {
            http: HTTP_CLIENT.clone(),
            token_source,
            project_id: config.project_id.clone(),
            machine_type: config.machine_type.clone(),
            network_tier: config.network_tier.to_ascii_uppercase(),
            firewall_tags: config.firewall_tags(),
            api_base: API_BASE.to_owned(),
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        })
    }

    /// Overrides the API base URL. Used by tests to point at a local mock.
    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Overrides the operation polling interval, primarily for tests.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the operation wait timeout, primarily for tests.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    async fn fetch_instance(
        &self,
        name: &str,
        zone: &str,
    ) -> Result<InstanceResource, GceError> {
        let url = self.zone_url(zone, &format!("/instances/{name}"));
        let response = self.api_get(&url, "instance get").await?;
        Self::decode(response, "instance get").await
    }

    async fn fetch_public_ip(&self, name: &str, zone: &str) -> Option<String> {
        match self.fetch_instance(name, zone).await {
            Ok(instance) => instance.public_ip(),
            Err(err) => {
                tracing::warn!(instance = name, error = %err, "public IP lookup failed");
                None
            }
        }
    }

    /// Polls the zonal operation until it reports `DONE` or the deadline
    /// passes. A timeout is a distinct failure from a reported remote error.
    async fn wait_for_operation(
        &self,
        zone: &str,
        operation: &OperationResource,
        action: &'static str,
        name: &str,
    ) -> Result<(), GceError> {
        if operation.is_done() {
            return Self::completed(operation, action, name);
        }

        let url = self.zone_url(zone, &format!("/operations/{}/wait", operation.name));
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            match self.api_post(&url, None, "operation wait").await {
                Ok(response) => {
                    let latest: OperationResource =
                        Self::decode(response, "operation wait").await?;
                    if latest.is_done() {
                        return Self::completed(&latest, action, name);
                    }
                }
                // The operation may not be visible immediately after the
                // mutating call returns.
                Err(err) if err.api_status() == Some(404) => {}
                Err(err) => return Err(err),
            }
            sleep(self.poll_interval).await;
        }

        Err(GceError::OperationTimeout {
            action,
            name: name.to_owned(),
        })
    }

    fn completed(
        operation: &OperationResource,
        action: &'static str,
        name: &str,
    ) -> Result<(), GceError> {
        operation.error_summary().map_or(Ok(()), |summary| {
            Err(GceError::OperationFailed {
                action,
                name: name.to_owned(),
                message: summary,
            })
        })
    }

    async fn mutate_instance(
        &self,
        name: &str,
        zone: &str,
        verb: Option<&'static str>,
        action: &'static str,
        endpoint: &'static str,
    ) -> Result<(), GceError> {
        let suffix = verb.map_or_else(
            || format!("/instances/{name}"),
            |verb| format!("/instances/{name}/{verb}"),
        );
        let url = self.zone_url(zone, &suffix);
        let result = if verb.is_some() {
            self.api_post(&url, None, endpoint).await
        } else {
            self.api_delete(&url, endpoint).await
        };

        let response = match result {
            Ok(response) => response,
            // Already gone counts as done for stop and delete.
            Err(err) if err.api_status() == Some(404) => return Ok(()),
            Err(err) => return Err(err),
        };

        let operation: OperationResource = Self::decode(response, endpoint).await?;
        self.wait_for_operation(zone, &operation, action, name).await
    }
}

impl CloudBackend for GceBackend {
    type Error = GceError;

    fn create_server<'a>(
        &'a self,
        request: &'a DeployRequest,
    ) -> BackendFuture<'a, CreatedServer, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let url = self.zone_url(&request.zone, "/instances");
            let body = self.insert_body(request);
            let response = self.api_post(&url, Some(&body), "instance insert").await?;
            let operation: OperationResource =
                Self::decode(response, "instance insert").await?;
            self.wait_for_operation(&request.zone, &operation, "create", &request.name)
                .await?;

            let public_ip = self.fetch_public_ip(&request.name, &request.zone).await;
            Ok(CreatedServer {
                name: request.name.clone(),
                public_ip,
            })
        })
    }

    fn start_server<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error> {
        Box::pin(async move {
            let url = self.zone_url(zone, &format!("/instances/{name}/start"));
            let response = self.api_post(&url, None, "instance start").await?;
            let operation: OperationResource =
                Self::decode(response, "instance start").await?;
            self.wait_for_operation(zone, &operation, "start", name).await?;
            Ok(self.fetch_public_ip(name, zone).await)
        })
    }

    fn stop_server<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.mutate_instance(name, zone, Some("stop"), "stop", "instance stop")
                .await
        })
    }

    fn delete_server<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.mutate_instance(name, zone, None, "delete", "instance delete")
                .await
        })
    }

    fn server_status<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, ServerStatus, Self::Error> {
        Box::pin(async move {
            let status = match self.fetch_instance(name, zone).await {
                Ok(instance) => ServerStatus::Known {
                    raw: instance.status.unwrap_or_else(|| String::from("UNKNOWN")),
                },
                Err(err) if err.api_status() == Some(404) => ServerStatus::NotFound,
                Err(err) if err.api_status() == Some(403) => ServerStatus::Forbidden,
                Err(err) => ServerStatus::Unavailable {
                    message: err.to_string(),
                },
            };
            Ok(status)
        })
    }

    fn public_ip<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error> {
        Box::pin(async move { Ok(self.fetch_public_ip(name, zone).await) })
    }

    fn read_serial_console<'a>(
        &'a self,
        name: &'a str,
        zone: &'a str,
    ) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let url = self.zone_url(zone, &format!("/instances/{name}/serialPort?port=1"));
            let response = self.api_get(&url, "serial console").await?;
            let output: SerialPortOutputResource =
                Self::decode(response, "serial console").await?;
            Ok(output.contents.unwrap_or_default())
        })
    }

    fn list_server_names<'a>(
        &'a self,
        zone: &'a str,
    ) -> BackendFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move {
            let url = self.zone_url(zone, "/instances");
            let response = self.api_get(&url, "instance list").await?;
            let list: InstanceListResponse = Self::decode(response, "instance list").await?;
            Ok(list.items.into_iter().map(|entry| entry.name).collect())
        })
    }
}

#[cfg(test)]
mod tests;
