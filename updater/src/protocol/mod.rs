//! The protocol abstraction: one uniform contract over every management
//! protocol a BMC may expose, plus the manager that drives
//! priority-ordered fallback across them.

pub mod ipmi;
pub mod racadm;
pub mod redfish;
pub mod ssh;
pub mod wsman;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{AnvilError, AnvilResult};
use crate::model::{
    Credentials, FirmwareUpdateRequest, FirmwareUpdateResult, Protocol, ProtocolCapability,
    ProtocolHealth, ServerIdentity,
};

pub use ipmi::IpmiClient;
pub use racadm::RacadmClient;
pub use redfish::{RedfishClient, RedfishEndpoint, RedfishEndpointPool};
pub use ssh::SshClient;
pub use wsman::WsmanClient;

/// Uniform contract implemented by every protocol variant.
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    fn priority(&self) -> u8 {
        self.protocol().priority()
    }

    /// Cheap, side-effect-free probe. Never fails: a probe error is
    /// reported as `supported: false` with the error in the diagnostics.
    async fn detect_capability(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolCapability;

    /// Similar probe classified into healthy/degraded/unreachable.
    async fn health_check(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolHealth;

    /// Execute the update through this protocol. Variants that cannot
    /// apply firmware unattended fail fast with a permanent error.
    async fn perform_firmware_update(
        &self,
        request: &FirmwareUpdateRequest,
    ) -> AnvilResult<FirmwareUpdateResult>;

    /// Release held per-client resources. Must be safe to call multiple
    /// times; callers invoke it unconditionally, win or lose.
    async fn dispose(&self) {}
}

/// Holds the registered protocol clients and runs detection and
/// fallback-ordered updates across them.
pub struct ProtocolManager {
    clients: Vec<Arc<dyn ProtocolClient>>,
    disposed: AtomicBool,
}

impl ProtocolManager {
    pub fn new(clients: Vec<Arc<dyn ProtocolClient>>) -> Self {
        Self {
            clients,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn clients(&self) -> &[Arc<dyn ProtocolClient>] {
        &self.clients
    }

    /// Probe every registered client and return one capability per
    /// client, preserving registration order. Unlike single-answer
    /// detection this is a complete picture, meant for display and
    /// diagnostics.
    pub async fn detect(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Vec<ProtocolCapability> {
        self.disposed.store(false, Ordering::SeqCst);
        let mut capabilities = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            capabilities.push(client.detect_capability(identity, credentials).await);
        }
        capabilities
    }

    /// Health-check every registered client, registration order preserved.
    pub async fn health_check_all(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Vec<ProtocolHealth> {
        self.disposed.store(false, Ordering::SeqCst);
        let mut reports = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            reports.push(client.health_check(identity, credentials).await);
        }
        reports
    }

    /// Attempt the update through clients in ascending priority order.
    ///
    /// A client is attempted when the supplied capability hints (or a
    /// fresh probe, if no hint covers it) indicate support. The first
    /// successful client's result is returned and no further clients are
    /// tried. Errors are recorded and fallback continues; exhausting all
    /// clients yields a single aggregate error naming the protocols
    /// attempted and the last failure.
    pub async fn run_update(
        &self,
        request: &FirmwareUpdateRequest,
        hints: Option<&[ProtocolCapability]>,
    ) -> AnvilResult<FirmwareUpdateResult> {
        self.disposed.store(false, Ordering::SeqCst);
        let mut ordered: Vec<&Arc<dyn ProtocolClient>> = self.clients.iter().collect();
        ordered.sort_by_key(|client| client.priority());

        let mut attempted = Vec::new();
        let mut last_error: Option<AnvilError> = None;

        for client in ordered {
            let protocol = client.protocol();
            let supported = match hints.and_then(|caps| {
                caps.iter().find(|cap| cap.protocol == protocol)
            }) {
                Some(hint) => hint.supported,
                None => {
                    client
                        .detect_capability(&request.identity, &request.credentials)
                        .await
                        .supported
                }
            };
            if !supported {
                tracing::debug!(host = %request.identity, %protocol, "Skipping unsupported protocol");
                continue;
            }

            tracing::info!(host = %request.identity, %protocol, "Attempting firmware update");
            attempted.push(protocol);
            match client.perform_firmware_update(request).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    tracing::warn!(
                        host = %request.identity,
                        %protocol,
                        %error,
                        "Update attempt failed, falling back to next protocol"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(AnvilError::AllProtocolsFailed {
            host: request.identity.host.clone(),
            attempted,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no protocol reported support".to_string()),
        })
    }

    /// Release per-client resources. Safe to call multiple times; the
    /// latch re-arms when the manager is used again, so a manager shared
    /// across runs disposes once per work cycle.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for client in &self.clients {
            client.dispose().await;
        }
    }
}
