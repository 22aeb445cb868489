//! Redfish protocol client: capability probe, health check, SimpleUpdate
//! submission, software inventory collection, and the endpoint seam the
//! task poller drives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::cfg::HttpConfig;
use crate::errors::{AnvilError, AnvilResult};
use crate::model::{
    ControllerGeneration, Credentials, FirmwareUpdateRequest, FirmwareUpdateResult, HealthStatus,
    InventoryComponent, InventorySnapshot, Protocol, ProtocolCapability, ProtocolHealth,
    ServerIdentity, UpdateMode, UpdateStatus,
};
use crate::poller::TaskRecord;
use crate::protocol::ProtocolClient;

const SERVICE_ROOT: &str = "/redfish/v1/";
const SIMPLE_UPDATE: &str = "/redfish/v1/UpdateService/Actions/UpdateService.SimpleUpdate";
const SOFTWARE_INVENTORY: &str = "/redfish/v1/UpdateService/SoftwareInventory";

/// A Redfish client over an explicitly constructed HTTP client. TLS trust
/// policy comes from configuration; there is no ambient global state.
#[derive(Clone)]
pub struct RedfishClient {
    http: reqwest::Client,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl RedfishClient {
    pub fn new(config: &HttpConfig) -> AnvilResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .use_rustls_tls()
            .build()
            .map_err(|e| AnvilError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            probe_timeout: config.probe_timeout(),
            request_timeout: config.request_timeout(),
        })
    }

    fn base_url(identity: &ServerIdentity, credentials: &Credentials) -> String {
        match credentials.port {
            Some(port) => format!("https://{}:{}", identity.host, port),
            None => format!("https://{}", identity.host),
        }
    }

    /// Resolve a task location against the base URL when the controller
    /// returns a relative path.
    pub fn resolve_location(base: &str, location: &str) -> AnvilResult<String> {
        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(location.to_string());
        }
        let base_url = url::Url::parse(base).map_err(|e| AnvilError::MalformedResponse {
            url: base.to_string(),
            details: e.to_string(),
        })?;
        let joined = base_url
            .join(location)
            .map_err(|e| AnvilError::MalformedResponse {
                url: location.to_string(),
                details: e.to_string(),
            })?;
        Ok(joined.to_string())
    }

    async fn get(
        &self,
        url: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> AnvilResult<reqwest::Response> {
        let response = self
            .http
            .get(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| AnvilError::from_reqwest(url, e))?;
        Self::check_status(url, response).await
    }

    async fn check_status(url: &str, response: reqwest::Response) -> AnvilResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(512);
        Err(AnvilError::Http {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        })
    }

    async fn get_json(
        &self,
        url: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> AnvilResult<serde_json::Value> {
        let response = self.get(url, credentials, timeout).await?;
        response
            .json()
            .await
            .map_err(|e| AnvilError::MalformedResponse {
                url: url.to_string(),
                details: e.to_string(),
            })
    }

    /// `GET /redfish/v1/`: the liveness probe, also used while waiting
    /// for the controller to come back after a reboot.
    pub async fn probe_service_root(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> AnvilResult<serde_json::Value> {
        let url = format!("{}{}", Self::base_url(identity, credentials), SERVICE_ROOT);
        self.get_json(&url, credentials, self.probe_timeout).await
    }

    /// Collect the firmware inventory: the SoftwareInventory collection,
    /// then each member resource.
    pub async fn software_inventory(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> AnvilResult<InventorySnapshot> {
        let base = Self::base_url(identity, credentials);
        let url = format!("{base}{SOFTWARE_INVENTORY}");
        let collection = self.get_json(&url, credentials, self.request_timeout).await?;

        let mut components = std::collections::BTreeMap::new();
        let members = collection
            .get("Members")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();
        for member in &members {
            let Some(member_ref) = member.get("@odata.id").and_then(|v| v.as_str()) else {
                continue;
            };
            let member_url = Self::resolve_location(&base, member_ref)?;
            match self
                .get_json(&member_url, credentials, self.request_timeout)
                .await
            {
                Ok(resource) => {
                    if let Some(component) = component_from_member(&resource) {
                        components.insert(component.id.clone(), component);
                    }
                }
                Err(error) => {
                    // One unreadable member should not void the snapshot.
                    tracing::warn!(host = %identity, member = member_ref, %error,
                        "Skipping unreadable software inventory member");
                }
            }
        }

        Ok(InventorySnapshot {
            raw: collection,
            components,
        })
    }

    /// Bind this client to one endpoint for the task poller.
    pub fn endpoint(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Arc<dyn RedfishEndpoint> {
        Arc::new(BoundRedfishEndpoint {
            client: self.clone(),
            identity: identity.clone(),
            credentials: credentials.clone(),
        })
    }
}

/// Extract one inventory component from a SoftwareInventory member.
fn component_from_member(resource: &serde_json::Value) -> Option<InventoryComponent> {
    let id = resource.get("Id")?.as_str()?.to_string();
    let name = resource
        .get("Name")
        .and_then(|v| v.as_str())
        .unwrap_or(id.as_str())
        .to_string();
    let version = resource
        .get("Version")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let source = resource
        .get("@odata.id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(InventoryComponent {
        id,
        name,
        version,
        source,
    })
}

#[async_trait]
impl ProtocolClient for RedfishClient {
    fn protocol(&self) -> Protocol {
        Protocol::Redfish
    }

    async fn detect_capability(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolCapability {
        match self.probe_service_root(identity, credentials).await {
            Ok(root) => {
                let vendor = root
                    .get("Vendor")
                    .or_else(|| root.get("Product"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                ProtocolCapability::supported(
                    Protocol::Redfish,
                    vec![UpdateMode::Immediate, UpdateMode::Scheduled],
                    ControllerGeneration::Redfish,
                    vendor,
                )
            }
            Err(error) => {
                tracing::debug!(host = %identity, %error, "Redfish probe failed");
                ProtocolCapability::unsupported(Protocol::Redfish, Some(error.to_string()))
            }
        }
    }

    async fn health_check(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolHealth {
        let started = Instant::now();
        let outcome = self.probe_service_root(identity, credentials).await;
        let latency = started.elapsed();
        let (status, error) = match outcome {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(AnvilError::Http { status, url, body }) if status >= 500 => (
                HealthStatus::Degraded,
                Some(AnvilError::Http { status, url, body }.to_string()),
            ),
            Err(error @ AnvilError::Network { .. }) => {
                (HealthStatus::Unreachable, Some(error.to_string()))
            }
            Err(error) => (HealthStatus::Degraded, Some(error.to_string())),
        };
        ProtocolHealth {
            protocol: Protocol::Redfish,
            status,
            checked_at: Utc::now(),
            latency: Some(latency),
            error,
        }
    }

    async fn perform_firmware_update(
        &self,
        request: &FirmwareUpdateRequest,
    ) -> AnvilResult<FirmwareUpdateResult> {
        let component = request.components.first().ok_or_else(|| {
            AnvilError::Config("a Redfish update needs at least one component image".to_string())
        })?;
        let base = Self::base_url(&request.identity, &request.credentials);
        let url = format!("{base}{SIMPLE_UPDATE}");

        let mut body = json!({
            "ImageURI": component.image_uri,
            "TransferProtocol": "HTTP",
            "Targets": [],
        });
        if request.mode == UpdateMode::Scheduled {
            body["@Redfish.OperationApplyTime"] = json!("AtMaintenanceWindowStart");
            if let Some(window_start) = request.parameters.get("maintenance_window_start") {
                body["@Redfish.MaintenanceWindow"] = json!({
                    "MaintenanceWindowStartTime": window_start,
                });
            }
        }

        let started_at = Utc::now();
        tracing::info!(host = %request.identity, image = %component.image_uri,
            "Submitting Redfish SimpleUpdate");
        let response = self
            .http
            .post(&url)
            .basic_auth(&request.credentials.username, Some(&request.credentials.password))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnvilError::from_reqwest(&url, e))?;
        let response = Self::check_status(&url, response).await?;

        let mut messages = Vec::new();
        let mut metadata = HashMap::new();
        match response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            Some(location) => {
                let absolute = Self::resolve_location(&base, location)?;
                messages.push(format!("update task accepted at {absolute}"));
                metadata.insert(
                    FirmwareUpdateResult::TASK_LOCATION_KEY.to_string(),
                    json!(absolute),
                );
            }
            None => {
                // The poller treats a missing location as fatal; record the
                // anomaly but let the caller decide.
                messages.push("update accepted without a task location".to_string());
            }
        }

        Ok(FirmwareUpdateResult {
            protocol: Protocol::Redfish,
            status: UpdateStatus::Completed,
            started_at,
            completed_at: Utc::now(),
            messages,
            metadata,
        })
    }
}

/// One Redfish endpoint as the task poller sees it: a task resource to
/// fetch, a service root to probe, and an inventory to snapshot.
#[async_trait]
pub trait RedfishEndpoint: Send + Sync {
    async fn fetch_task(&self, location: &str) -> AnvilResult<TaskRecord>;
    async fn probe_service_root(&self) -> AnvilResult<()>;
    async fn fetch_inventory(&self) -> AnvilResult<InventorySnapshot>;
}

/// Creates poller endpoints for hosts; the state machine injects a pool so
/// tests can substitute scripted endpoints.
pub trait RedfishEndpointPool: Send + Sync {
    fn endpoint(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Arc<dyn RedfishEndpoint>;
}

impl RedfishEndpointPool for RedfishClient {
    fn endpoint(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Arc<dyn RedfishEndpoint> {
        RedfishClient::endpoint(self, identity, credentials)
    }
}

struct BoundRedfishEndpoint {
    client: RedfishClient,
    identity: ServerIdentity,
    credentials: Credentials,
}

#[async_trait]
impl RedfishEndpoint for BoundRedfishEndpoint {
    async fn fetch_task(&self, location: &str) -> AnvilResult<TaskRecord> {
        let value = self
            .client
            .get_json(location, &self.credentials, self.client.request_timeout)
            .await?;
        serde_json::from_value(value).map_err(|e| AnvilError::MalformedResponse {
            url: location.to_string(),
            details: e.to_string(),
        })
    }

    async fn probe_service_root(&self) -> AnvilResult<()> {
        self.client
            .probe_service_root(&self.identity, &self.credentials)
            .await
            .map(|_| ())
    }

    async fn fetch_inventory(&self) -> AnvilResult<InventorySnapshot> {
        self.client
            .software_inventory(&self.identity, &self.credentials)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_includes_optional_port() {
        let identity = ServerIdentity::new("10.1.2.3");
        let mut creds = Credentials {
            username: "root".into(),
            password: "calvin".into(),
            port: None,
        };
        assert_eq!(
            RedfishClient::base_url(&identity, &creds),
            "https://10.1.2.3"
        );
        creds.port = Some(8443);
        assert_eq!(
            RedfishClient::base_url(&identity, &creds),
            "https://10.1.2.3:8443"
        );
    }

    #[test]
    fn relative_locations_resolve_against_base() {
        let resolved = RedfishClient::resolve_location(
            "https://10.1.2.3",
            "/redfish/v1/TaskService/Tasks/17",
        )
        .unwrap();
        assert_eq!(resolved, "https://10.1.2.3/redfish/v1/TaskService/Tasks/17");
    }

    #[test]
    fn absolute_locations_pass_through() {
        let resolved = RedfishClient::resolve_location(
            "https://10.1.2.3",
            "https://other/redfish/v1/TaskService/Tasks/17",
        )
        .unwrap();
        assert_eq!(resolved, "https://other/redfish/v1/TaskService/Tasks/17");
    }

    #[test]
    fn inventory_member_parsing_tolerates_missing_fields() {
        let full = serde_json::json!({
            "@odata.id": "/redfish/v1/UpdateService/SoftwareInventory/BMC",
            "Id": "BMC",
            "Name": "BMC Firmware",
            "Version": "2.86.86.86",
        });
        let component = component_from_member(&full).unwrap();
        assert_eq!(component.id, "BMC");
        assert_eq!(component.version, "2.86.86.86");
        assert_eq!(
            component.source.as_deref(),
            Some("/redfish/v1/UpdateService/SoftwareInventory/BMC")
        );

        let no_name = serde_json::json!({"Id": "BIOS", "Version": "1.0"});
        let component = component_from_member(&no_name).unwrap();
        assert_eq!(component.name, "BIOS");

        let no_id = serde_json::json!({"Name": "orphan"});
        assert!(component_from_member(&no_id).is_none());
    }
}
