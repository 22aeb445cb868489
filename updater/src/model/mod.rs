//! Core data model shared across the protocol layer, the task poller,
//! and the host update state machine.

pub mod host_run;
pub mod inventory;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use host_run::{HostRun, HostRunState};
pub use inventory::{
    diff_inventories, ChangeType, InventoryChange, InventoryComponent, InventorySnapshot,
};

/// A management protocol a server's out-of-band controller may expose.
///
/// The numeric priority is fixed configuration (lower = preferred) and is
/// the order in which [`crate::protocol::ProtocolManager`] attempts
/// fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Redfish,
    Wsman,
    Racadm,
    Ipmi,
    Ssh,
}

impl Protocol {
    pub fn priority(&self) -> u8 {
        match self {
            Protocol::Redfish => 10,
            Protocol::Wsman => 20,
            Protocol::Racadm => 30,
            Protocol::Ipmi => 40,
            Protocol::Ssh => 50,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Redfish => "redfish",
            Protocol::Wsman => "wsman",
            Protocol::Racadm => "racadm",
            Protocol::Ipmi => "ipmi",
            Protocol::Ssh => "ssh",
        };
        write!(f, "{name}")
    }
}

/// The target of one operation: a network address plus an optional
/// operator-facing display name. Immutable per operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub host: String,
    pub name: Option<String>,
}

impl ServerIdentity {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: None,
        }
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.host),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Supplied per call by the external secret resolver; never persisted here.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub port: Option<u16>,
}

// Manual Debug so a stray debug log can never leak a password.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

/// Which update strategies a protocol can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Apply immediately; the controller schedules any required reboot.
    Immediate,
    /// Apply during a declared maintenance window.
    Scheduled,
    /// Pull images from a firmware repository URL.
    Repository,
}

/// Generation label assigned by capability detection. Newer controller
/// generations support strictly more capable protocols, so the first
/// successful probe fixes the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerGeneration {
    /// Speaks Redfish; the newest management generation.
    Redfish,
    /// Pre-Redfish controller that still answers WS-Man.
    LegacyWsman,
    /// Only reachable through the vendor CLI tool.
    CliOnly,
    /// Nothing but raw IPMI responded.
    IpmiOnly,
    /// No probe succeeded.
    Unknown,
}

impl fmt::Display for ControllerGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerGeneration::Redfish => "redfish",
            ControllerGeneration::LegacyWsman => "legacy-wsman",
            ControllerGeneration::CliOnly => "cli-only",
            ControllerGeneration::IpmiOnly => "ipmi-only",
            ControllerGeneration::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Result of probing one protocol on one host. Produced fresh on every
/// detection call; nothing here is cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolCapability {
    pub protocol: Protocol,
    pub supported: bool,
    pub update_modes: Vec<UpdateMode>,
    pub generation: Option<ControllerGeneration>,
    /// Raw probe output or the error that made the probe fail.
    pub diagnostics: Option<String>,
}

impl ProtocolCapability {
    /// A positive capability. Supported protocols must advertise at least
    /// one update mode.
    pub fn supported(
        protocol: Protocol,
        update_modes: Vec<UpdateMode>,
        generation: ControllerGeneration,
        diagnostics: Option<String>,
    ) -> Self {
        debug_assert!(!update_modes.is_empty());
        Self {
            protocol,
            supported: true,
            update_modes,
            generation: Some(generation),
            diagnostics,
        }
    }

    pub fn unsupported(protocol: Protocol, diagnostics: Option<String>) -> Self {
        Self {
            protocol,
            supported: false,
            update_modes: Vec::new(),
            generation: None,
            diagnostics,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolHealth {
    pub protocol: Protocol,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

/// One firmware component to update: a component id plus the image to
/// flash onto it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentUpdate {
    pub component_id: String,
    pub image_uri: String,
}

/// Everything one update attempt needs, passed by value into the chosen
/// protocol client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareUpdateRequest {
    pub identity: ServerIdentity,
    pub credentials: Credentials,
    pub mode: UpdateMode,
    pub components: Vec<ComponentUpdate>,
    pub repository_url: Option<String>,
    /// Protocol-specific knobs, e.g. a Redfish maintenance window.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    Completed,
    Failed,
}

/// Outcome of one update attempt through one protocol. A host run that
/// falls back across protocols produces one of these per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareUpdateResult {
    pub protocol: Protocol,
    pub status: UpdateStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub messages: Vec<String>,
    /// Opaque per-protocol detail, e.g. the Redfish task location.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl FirmwareUpdateResult {
    pub const TASK_LOCATION_KEY: &'static str = "task_location";

    pub fn task_location(&self) -> Option<&str> {
        self.metadata
            .get(Self::TASK_LOCATION_KEY)
            .and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_priorities_are_strictly_ordered() {
        let ordered = [
            Protocol::Redfish,
            Protocol::Wsman,
            Protocol::Racadm,
            Protocol::Ipmi,
            Protocol::Ssh,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
    }

    #[test]
    fn credentials_debug_never_prints_the_password() {
        let creds = Credentials {
            username: "root".into(),
            password: "hunter2".into(),
            port: None,
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("root"));
    }

    #[test]
    fn task_location_round_trips_through_metadata() {
        let mut result = FirmwareUpdateResult {
            protocol: Protocol::Redfish,
            status: UpdateStatus::Completed,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            messages: vec![],
            metadata: HashMap::new(),
        };
        assert!(result.task_location().is_none());
        result.metadata.insert(
            FirmwareUpdateResult::TASK_LOCATION_KEY.to_string(),
            serde_json::json!("/redfish/v1/TaskService/Tasks/42"),
        );
        assert_eq!(
            result.task_location(),
            Some("/redfish/v1/TaskService/Tasks/42")
        );
    }
}
