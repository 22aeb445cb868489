//! Vendor CLI protocol client. Shells out to `racadm` with bounded
//! timeouts; updates run through the repository-based `update` subcommand.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use utils::cmd::Cmd;

use crate::cfg::SubprocessConfig;
use crate::errors::{AnvilError, AnvilResult};
use crate::model::{
    ControllerGeneration, Credentials, FirmwareUpdateRequest, FirmwareUpdateResult, HealthStatus,
    Protocol, ProtocolCapability, ProtocolHealth, ServerIdentity, UpdateMode, UpdateStatus,
};
use crate::protocol::ProtocolClient;

pub struct RacadmClient {
    config: SubprocessConfig,
}

impl RacadmClient {
    pub fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }

    fn remote_args(identity: &ServerIdentity, credentials: &Credentials) -> Vec<String> {
        vec![
            "-r".to_string(),
            identity.host.clone(),
            "-u".to_string(),
            credentials.username.clone(),
            "-p".to_string(),
            credentials.password.clone(),
        ]
    }

    async fn run(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
        subcommand: &[&str],
        timeout: std::time::Duration,
    ) -> AnvilResult<String> {
        let mut args = Self::remote_args(identity, credentials);
        args.extend(subcommand.iter().map(|s| s.to_string()));
        let output = Cmd::new(&self.config.racadm_bin)
            .args(args)
            .timeout(timeout)
            .output()
            .await?;
        Ok(output)
    }

    /// `getversion` is the cheapest remote command that proves both
    /// reachability and working credentials.
    async fn probe(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> AnvilResult<String> {
        self.run(
            identity,
            credentials,
            &["getversion"],
            self.config.probe_timeout(),
        )
        .await
    }
}

#[async_trait]
impl ProtocolClient for RacadmClient {
    fn protocol(&self) -> Protocol {
        Protocol::Racadm
    }

    async fn detect_capability(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolCapability {
        match self.probe(identity, credentials).await {
            Ok(output) => {
                let first_line = output.lines().find(|l| !l.trim().is_empty());
                ProtocolCapability::supported(
                    Protocol::Racadm,
                    vec![UpdateMode::Repository],
                    ControllerGeneration::CliOnly,
                    first_line.map(|l| l.trim().to_string()),
                )
            }
            Err(error) => {
                tracing::debug!(host = %identity, %error, "racadm probe failed");
                ProtocolCapability::unsupported(Protocol::Racadm, Some(error.to_string()))
            }
        }
    }

    async fn health_check(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolHealth {
        let started = Instant::now();
        let outcome = self
            .run(
                identity,
                credentials,
                &["getsysinfo"],
                self.config.probe_timeout(),
            )
            .await;
        let latency = started.elapsed();
        let (status, error) = match outcome {
            Ok(_) => (HealthStatus::Healthy, None),
            // A killed probe means nothing answered in time.
            Err(error) if error.is_transient() => {
                (HealthStatus::Unreachable, Some(error.to_string()))
            }
            Err(error) => (HealthStatus::Degraded, Some(error.to_string())),
        };
        ProtocolHealth {
            protocol: Protocol::Racadm,
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
        let repository = request.repository_url.as_deref().ok_or_else(|| {
            AnvilError::Config("a racadm update needs a firmware repository URL".to_string())
        })?;

        let started_at = Utc::now();
        tracing::info!(host = %request.identity, repository,
            "Starting racadm repository update");
        let output = self
            .run(
                &request.identity,
                &request.credentials,
                &["update", "-f", "Catalog.xml", "-e", repository, "-a", "TRUE", "-t", "HTTP"],
                self.config.update_timeout(),
            )
            .await?;

        let messages: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let mut metadata = HashMap::new();
        metadata.insert("repository_url".to_string(), serde_json::json!(repository));

        Ok(FirmwareUpdateResult {
            protocol: Protocol::Racadm,
            status: UpdateStatus::Completed,
            started_at,
            completed_at: Utc::now(),
            messages,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(bin: &str) -> RacadmClient {
        RacadmClient::new(SubprocessConfig {
            racadm_bin: bin.to_string(),
            probe_timeout_secs: 2,
            update_timeout_minutes: 1,
            ..SubprocessConfig::default()
        })
    }

    fn target() -> (ServerIdentity, Credentials) {
        (
            ServerIdentity::new("10.0.0.9"),
            Credentials {
                username: "root".into(),
                password: "calvin".into(),
                port: None,
            },
        )
    }

    #[tokio::test]
    async fn missing_binary_reports_unsupported_not_panic() {
        let client = client("/nonexistent/racadm");
        let (identity, creds) = target();
        let capability = client.detect_capability(&identity, &creds).await;
        assert!(!capability.supported);
        assert!(capability.diagnostics.is_some());
    }

    #[tokio::test]
    async fn missing_binary_health_checks_as_degraded() {
        let client = client("/nonexistent/racadm");
        let (identity, creds) = target();
        let health = client.health_check(&identity, &creds).await;
        assert_ne!(health.status, HealthStatus::Healthy);
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn update_without_repository_url_is_a_config_error() {
        let client = client("racadm");
        let (identity, credentials) = target();
        let request = FirmwareUpdateRequest {
            identity,
            credentials,
            mode: UpdateMode::Repository,
            components: vec![],
            repository_url: None,
            parameters: HashMap::new(),
        };
        let error = client.perform_firmware_update(&request).await.unwrap_err();
        assert!(matches!(error, AnvilError::Config(_)));
    }

    #[test]
    fn remote_args_carry_host_and_credentials() {
        let (identity, creds) = target();
        let args = RacadmClient::remote_args(&identity, &creds);
        assert_eq!(args, vec!["-r", "10.0.0.9", "-u", "root", "-p", "calvin"]);
    }
}
