//! Typed payloads and low-level HTTP plumbing for the Compute Engine v1 API.

use serde::Deserialize;
use serde_json::{Value, json};

use super::{GceBackend, GceError};
use crate::backend::DeployRequest;

/// Subset of the instance resource the manager reads.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InstanceResource {
    pub(crate) status: Option<String>,
    #[serde(default)]
    pub(crate) network_interfaces: Vec<NetworkInterfaceResource>,
}

impl InstanceResource {
    /// External NAT address from the first access config, when assigned.
    pub(crate) fn public_ip(&self) -> Option<String> {
        self.network_interfaces
            .first()
            .and_then(|nic| nic.access_configs.first())
            .and_then(|access| access.nat_ip.clone())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetworkInterfaceResource {
    #[serde(default)]
    pub(crate) access_configs: Vec<AccessConfigResource>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct AccessConfigResource {
    #[serde(rename = "natIP")]
    pub(crate) nat_ip: Option<String>,
}

/// Zonal operation resource returned by mutating calls.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct OperationResource {
    pub(crate) name: String,
    pub(crate) status: Option<String>,
    pub(crate) error: Option<OperationErrors>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct OperationErrors {
    #[serde(default)]
    pub(crate) errors: Vec<OperationErrorDetail>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct OperationErrorDetail {
    #[serde(default)]
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) message: String,
}

impl OperationResource {
    pub(crate) fn is_done(&self) -> bool {
        self.status.as_deref() == Some("DONE")
    }

    /// Joined `code: message` pairs when the operation carries errors.
    pub(crate) fn error_summary(&self) -> Option<String> {
        let errors = &self.error.as_ref()?.errors;
        if errors.is_empty() {
            return None;
        }
        Some(
            errors
                .iter()
                .map(|detail| format!("{}: {}", detail.code, detail.message))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct SerialPortOutputResource {
    pub(crate) contents: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct InstanceListResponse {
    #[serde(default)]
    pub(crate) items: Vec<InstanceListEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct InstanceListEntry {
    pub(crate) name: String,
}

impl GceBackend {
    pub(crate) fn zone_url(&self, zone: &str, suffix: &str) -> String {
        format!(
            "{}/projects/{}/zones/{zone}{suffix}",
            self.api_base, self.project_id
        )
    }

    /// Instance resource body for the insert call. Mirrors what the manager
    /// has always created: one auto-deleting boot disk from the pinned
    /// Debian image, one NIC on the default network with an ephemeral
    /// external address, and the startup script in metadata.
    pub(crate) fn insert_body(&self, request: &DeployRequest) -> Value {
        json!({
            "name": request.name,
            "machineType": format!(
                "projects/{}/zones/{}/machineTypes/{}",
                self.project_id, request.zone, self.machine_type
            ),
            "canIpForward": true,
            "tags": { "items": self.firewall_tags },
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "type": "PERSISTENT",
                "initializeParams": {
                    "sourceImage": super::SOURCE_IMAGE,
                    "diskSizeGb": "10",
                    "diskType": format!(
                        "projects/{}/zones/{}/diskTypes/pd-balanced",
                        self.project_id, request.zone
                    ),
                },
            }],
            "networkInterfaces": [{
                "network": format!("projects/{}/global/networks/default", self.project_id),
                "accessConfigs": [{
                    "name": "External NAT",
                    "type": "ONE_TO_ONE_NAT",
                    "networkTier": self.network_tier,
                }],
            }],
            "metadata": {
                "items": [{ "key": "startup-script", "value": request.boot_payload }],
            },
        })
    }

    pub(crate) async fn api_get(
        &self,
        url: &str,
        endpoint: &'static str,
    ) -> Result<reqwest::Response, GceError> {
        let token = self.token_source.token()?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| GceError::Http {
                endpoint,
                message: err.to_string(),
            })?;
        Self::check(response, endpoint).await
    }

    pub(crate) async fn api_post(
        &self,
        url: &str,
        body: Option<&Value>,
        endpoint: &'static str,
    ) -> Result<reqwest::Response, GceError> {
        let token = self.token_source.token()?;
        let mut builder = self.http.post(url).bearer_auth(token);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|err| GceError::Http {
            endpoint,
            message: err.to_string(),
        })?;
        Self::check(response, endpoint).await
    }

    pub(crate) async fn api_delete(
        &self,
        url: &str,
        endpoint: &'static str,
    ) -> Result<reqwest::Response, GceError> {
        let token = self.token_source.token()?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| GceError::Http {
                endpoint,
                message: err.to_string(),
            })?;
        Self::check(response, endpoint).await
    }

    pub(crate) async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<T, GceError> {
        response.json().await.map_err(|err| GceError::Http {
            endpoint,
            message: err.to_string(),
        })
    }

    async fn check(
        response: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<reqwest::Response, GceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GceError::Api {
            endpoint,
            status: status.as_u16(),
            message: summarise_body(&body),
        })
    }
}

/// Keeps API error bodies readable in terminal output.
fn summarise_body(body: &str) -> String {
    const LIMIT: usize = 400;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::from("(empty response body)");
    }
    let mut summary: String = trimmed.chars().take(LIMIT).collect();
    if trimmed.chars().count() > LIMIT {
        summary.push('…');
    }
    summary
}
