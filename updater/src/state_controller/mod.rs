//! Host update orchestration: the collaborator seams, the service
//! bundle handed to the workflow, and the controller that drives one
//! host run through its state machine.

pub mod handler;
pub mod io;

use std::sync::Arc;

use crate::cfg::AnvilConfig;
use crate::detect::CapabilityDetector;
use crate::poller::PollSink;
use crate::protocol::{ProtocolManager, RedfishEndpointPool};

pub use handler::HostUpdateController;
pub use io::{CredentialResolver, HostRunStore, MaintenanceController, PlanComponent, PlanStore, UpdatePlan};

/// Services available to the update workflow.
pub struct UpdateServices {
    /// Registered protocol clients and the fallback logic across them.
    pub manager: Arc<ProtocolManager>,

    /// Ordered generation probing for prechecks.
    pub detector: Arc<CapabilityDetector>,

    /// Creates poller endpoints; tests substitute scripted ones.
    pub endpoints: Arc<dyn RedfishEndpointPool>,

    /// External secret resolution.
    pub credentials: Arc<dyn CredentialResolver>,

    /// Cluster maintenance-mode control.
    pub maintenance: Arc<dyn MaintenanceController>,

    /// Plan and artifact lookup.
    pub plans: Arc<dyn PlanStore>,

    /// Durable run persistence.
    pub runs: Arc<dyn HostRunStore>,

    /// Structured poll events for live observation, if anyone is watching.
    pub poll_sink: Option<PollSink>,

    pub config: Arc<AnvilConfig>,
}
