//! SSH client of last resort: non-interactive command execution for
//! detection and health checks. Updates are permanently unsupported.

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

const DEFAULT_SSH_PORT: u16 = 22;

pub struct SshClient {
    config: SubprocessConfig,
}

impl SshClient {
    pub fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }

    /// Run one command non-interactively. BatchMode forbids password
    /// prompts, so only key-based access works here; a controller that
    /// wants a password simply probes as unreachable.
    async fn run_remote(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
        command: &str,
    ) -> AnvilResult<String> {
        let port = credentials.port.unwrap_or(DEFAULT_SSH_PORT).to_string();
        let destination = format!("{}@{}", credentials.username, identity.host);
        let output = Cmd::new(&self.config.ssh_bin)
            .args([
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "-p",
                &port,
                &destination,
                command,
            ])
            .timeout(self.config.probe_timeout())
            .output()
            .await?;
        Ok(output)
    }
}

#[async_trait]
impl ProtocolClient for SshClient {
    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    /// Like IPMI, SSH is detection-only: reachable shells help classify a
    /// host, but no unattended firmware path exists over them.
    async fn detect_capability(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolCapability {
        match self.run_remote(identity, credentials, "true").await {
            Ok(_) => ProtocolCapability::unsupported(
                Protocol::Ssh,
                Some("shell reachable".to_string()),
            ),
            Err(error) => {
                tracing::debug!(host = %identity, %error, "ssh probe failed");
                ProtocolCapability::unsupported(Protocol::Ssh, Some(error.to_string()))
            }
        }
    }

    async fn health_check(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolHealth {
        let started = Instant::now();
        let outcome = self.run_remote(identity, credentials, "uptime").await;
        let latency = started.elapsed();
        let (status, error) = match outcome {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(error) if error.is_transient() => {
                (HealthStatus::Unreachable, Some(error.to_string()))
            }
            Err(error) => (HealthStatus::Degraded, Some(error.to_string())),
        };
        ProtocolHealth {
            protocol: Protocol::Ssh,
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
            protocol: Protocol::Ssh,
            operation: "firmware update",
        })
    }
}
