//! Capability detection: probe a host's management protocols in a fixed
//! precedence and classify its controller generation. Newer controllers
//! support strictly more capable protocols, so the first protocol that
//! answers fixes the label; the remaining probes never run.

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{
    ControllerGeneration, Credentials, HealthStatus, Protocol, ProtocolCapability, ServerIdentity,
};
use crate::protocol::ProtocolClient;

/// One probe in the detection chain. `responds` returns the capability
/// report when the protocol answered, `None` when it did not; like
/// `detect_capability` it never errors.
#[async_trait]
pub trait GenerationProbe: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// The generation label this probe assigns when it is the first to
    /// answer.
    fn generation(&self) -> ControllerGeneration;

    async fn responds(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Option<ProtocolCapability>;
}

/// The detector's answer: the cheapest sufficient classification, not a
/// complete protocol survey (that is `ProtocolManager::detect`).
#[derive(Debug, Clone)]
pub struct Classification {
    pub generation: ControllerGeneration,
    /// The winning probe's capability report; `None` when nothing answered.
    pub capability: Option<ProtocolCapability>,
    /// The probes that actually ran, in order.
    pub probed: Vec<Protocol>,
}

impl Classification {
    pub fn usable_protocol(&self) -> Option<Protocol> {
        self.capability
            .as_ref()
            .filter(|cap| cap.supported)
            .map(|cap| cap.protocol)
    }
}

pub struct CapabilityDetector {
    probes: Vec<Arc<dyn GenerationProbe>>,
}

impl CapabilityDetector {
    pub fn new(probes: Vec<Arc<dyn GenerationProbe>>) -> Self {
        Self { probes }
    }

    /// Build the production probe chain from protocol clients, in the
    /// fixed order redfish, wsman, racadm, then optionally ipmi.
    pub fn from_clients(clients: &[Arc<dyn ProtocolClient>], detect_ipmi: bool) -> Self {
        let find = |protocol: Protocol| {
            clients
                .iter()
                .find(|client| client.protocol() == protocol)
                .cloned()
        };

        let mut probes: Vec<Arc<dyn GenerationProbe>> = Vec::new();
        for (protocol, generation) in [
            (Protocol::Redfish, ControllerGeneration::Redfish),
            (Protocol::Wsman, ControllerGeneration::LegacyWsman),
            (Protocol::Racadm, ControllerGeneration::CliOnly),
        ] {
            if let Some(client) = find(protocol) {
                probes.push(Arc::new(CapabilityProbe { client, generation }));
            }
        }
        if detect_ipmi {
            if let Some(client) = find(Protocol::Ipmi) {
                probes.push(Arc::new(IpmiProbe { client }));
            }
        }
        Self::new(probes)
    }

    /// Run the probes strictly sequentially, stopping at the first one
    /// that answers. Probing is side-effect free, so calling this twice
    /// against unchanged endpoints yields the same classification.
    pub async fn classify(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Classification {
        let mut probed = Vec::new();
        for probe in &self.probes {
            probed.push(probe.protocol());
            if let Some(capability) = probe.responds(identity, credentials).await {
                tracing::info!(
                    host = %identity,
                    protocol = %probe.protocol(),
                    generation = %probe.generation(),
                    "Host classified"
                );
                return Classification {
                    generation: probe.generation(),
                    capability: Some(capability),
                    probed,
                };
            }
        }
        tracing::warn!(host = %identity, "No management protocol answered");
        Classification {
            generation: ControllerGeneration::Unknown,
            capability: None,
            probed,
        }
    }
}

/// Probe backed by a client's own capability detection: answered means
/// the client reported itself supported.
struct CapabilityProbe {
    client: Arc<dyn ProtocolClient>,
    generation: ControllerGeneration,
}

#[async_trait]
impl GenerationProbe for CapabilityProbe {
    fn protocol(&self) -> Protocol {
        self.client.protocol()
    }

    fn generation(&self) -> ControllerGeneration {
        self.generation
    }

    async fn responds(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Option<ProtocolCapability> {
        let capability = self.client.detect_capability(identity, credentials).await;
        capability.supported.then_some(capability)
    }
}

/// IPMI reports `supported: false` for updates even when the controller
/// answers, so "answered" is judged from the health check instead.
struct IpmiProbe {
    client: Arc<dyn ProtocolClient>,
}

#[async_trait]
impl GenerationProbe for IpmiProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Ipmi
    }

    fn generation(&self) -> ControllerGeneration {
        ControllerGeneration::IpmiOnly
    }

    async fn responds(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> Option<ProtocolCapability> {
        let health = self.client.health_check(identity, credentials).await;
        if health.status != HealthStatus::Healthy {
            return None;
        }
        Some(self.client.detect_capability(identity, credentials).await)
    }
}
