//! Raw IPMI client, detection and health checks only. Firmware cannot be
//! applied unattended over IPMI, so updates fail fast as permanent.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use utils::cmd::Cmd;

use crate::cfg::SubprocessConfig;
use crate::errors::{AnvilError, AnvilResult};
use crate::model::{
    Credentials, FirmwareUpdateRequest, FirmwareUpdateResult, HealthStatus, Protocol,
    ProtocolCapability, ProtocolHealth, ServerIdentity,
};
use crate::protocol::ProtocolClient;

pub struct IpmiClient {
    config: SubprocessConfig,
}

impl IpmiClient {
    pub fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }

    async fn chassis_status(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> AnvilResult<String> {
        let output = Cmd::new(&self.config.ipmitool_bin)
            .args([
                "-I",
                "lanplus",
                "-H",
                &identity.host,
                "-U",
                &credentials.username,
                "-P",
                &credentials.password,
                "chassis",
                "status",
            ])
            .timeout(self.config.probe_timeout())
            .output()
            .await?;
        Ok(output)
    }
}

#[async_trait]
impl ProtocolClient for IpmiClient {
    fn protocol(&self) -> Protocol {
        Protocol::Ipmi
    }

    /// IPMI answering tells us the controller exists, but it cannot drive
    /// a firmware update, so the capability is always `supported: false`.
    /// The detector still uses this probe to classify the generation.
    async fn detect_capability(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolCapability {
        match self.chassis_status(identity, credentials).await {
            Ok(output) => {
                let power = output.lines().find(|l| l.contains("System Power"));
                ProtocolCapability::unsupported(
                    Protocol::Ipmi,
                    Some(
                        power
                            .map(|l| l.trim().to_string())
                            .unwrap_or_else(|| "chassis status ok".to_string()),
                    ),
                )
            }
            Err(error) => {
                tracing::debug!(host = %identity, %error, "ipmitool probe failed");
                ProtocolCapability::unsupported(Protocol::Ipmi, Some(error.to_string()))
            }
        }
    }

    async fn health_check(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolHealth {
        let started = Instant::now();
        let outcome = self.chassis_status(identity, credentials).await;
        let latency = started.elapsed();
        let (status, error) = match outcome {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(error) if error.is_transient() => {
                (HealthStatus::Unreachable, Some(error.to_string()))
            }
            Err(error) => (HealthStatus::Degraded, Some(error.to_string())),
        };
        ProtocolHealth {
            protocol: Protocol::Ipmi,
            status,
            checked_at: Utc::now(),
            latency: Some(latency),
            error,
        }
    }

    async fn perform_firmware_update(
        &self,
        _request: &FirmwareUpdateRequest,
    ) -> AnvilResult<FirmwareUpdateResult> {
        Err(AnvilError::Unsupported {
            protocol: Protocol::Ipmi,
            operation: "firmware update",
        })
    }
}
