//! Seams to the systems the update workflow depends on but does not own:
//! secret resolution, cluster maintenance mode, plan lookup, and the
//! durable run store.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::model::{Credentials, HostRun, UpdateMode};

/// Resolves out-of-band credentials for a host. Credentials are fetched
/// per run and never persisted by this crate.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, host_id: &str) -> eyre::Result<Credentials>;
}

/// Cluster-level maintenance mode: workloads are evacuated before any
/// firmware is touched and restored afterwards.
#[async_trait]
pub trait MaintenanceController: Send + Sync {
    async fn enter(&self, host_id: &str) -> eyre::Result<()>;
    async fn exit(&self, host_id: &str) -> eyre::Result<()>;
}

/// One component in an update plan, optionally carrying the version the
/// postchecks must observe after the update.
#[derive(Debug, Clone)]
pub struct PlanComponent {
    pub component_id: String,
    pub image_uri: String,
    pub expected_version: Option<String>,
}

/// The firmware plan for a set of hosts, resolved by id.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub mode: UpdateMode,
    pub components: Vec<PlanComponent>,
    pub repository_url: Option<String>,
    pub parameters: HashMap<String, String>,
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn plan(&self, plan_id: &str) -> eyre::Result<UpdatePlan>;
}

/// Persists run records so a workflow survives process restarts. The
/// controller saves after every state transition.
#[async_trait]
pub trait HostRunStore: Send + Sync {
    async fn save(&self, run: &HostRun) -> eyre::Result<()>;
}
