//! The per-host update workflow: prechecks, maintenance entry, apply,
//! job tracking, verification, maintenance exit. Phase failures land the
//! run in `Error` with diagnostics in its context; maintenance exit runs
//! on every path so a host is never left stuck evacuated.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;

use utils::backoff::retry;

use crate::errors::{AnvilError, AnvilResult};
use crate::model::{
    ComponentUpdate, Credentials, FirmwareUpdateRequest, HostRun, HostRunState, InventoryChange,
    InventorySnapshot, Protocol, ProtocolCapability, ServerIdentity,
};
use crate::poller::{PollerSettings, TaskPoller};
use crate::state_controller::UpdateServices;

pub struct HostUpdateController {
    services: Arc<UpdateServices>,
    active: Arc<Mutex<HashSet<String>>>,
}

/// Releases the per-host claim when the run finishes, on every exit path.
struct ActiveClaim {
    active: Arc<Mutex<HashSet<String>>>,
    host_id: String,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&self.host_id);
    }
}

impl HostUpdateController {
    pub fn new(services: Arc<UpdateServices>) -> Self {
        Self {
            services,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// At most one run may be in flight per host; the external job queue
    /// is not trusted to deduplicate.
    fn claim(&self, host_id: &str) -> AnvilResult<ActiveClaim> {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !active.insert(host_id.to_string()) {
            return Err(AnvilError::RunAlreadyActive {
                host_id: host_id.to_string(),
            });
        }
        Ok(ActiveClaim {
            active: self.active.clone(),
            host_id: host_id.to_string(),
        })
    }

    /// Drive a run from its current state to `Done` or `Error`,
    /// persisting after every transition. Returns the terminal record;
    /// phase failures are recorded in it, not raised.
    pub async fn process(&self, run: HostRun) -> AnvilResult<HostRun> {
        let _claim = self.claim(&run.host_id)?;
        let outcome = self.drive(run).await;
        // Release held protocol resources win or lose.
        self.services.manager.dispose().await;
        outcome
    }

    async fn drive(&self, mut run: HostRun) -> AnvilResult<HostRun> {
        tracing::info!(host = %run.host_id, plan = %run.plan_id, state = %run.state,
            attempt = run.attempts, "Starting host update run");

        let credentials = match self.services.credentials.resolve(&run.host_id).await {
            Ok(credentials) => credentials,
            Err(error) => {
                let phase = run.state;
                self.fail(&mut run, phase, AnvilError::Collaborator(error))
                    .await;
                self.save(&run).await?;
                return Ok(run);
            }
        };

        while !run.state.is_terminal() {
            let phase = run.state;
            let step = match phase {
                HostRunState::Prechecks => self.prechecks(&mut run, &credentials).await,
                HostRunState::EnterMaintenance => self.enter_maintenance(&mut run).await,
                HostRunState::Apply => self.apply(&mut run, &credentials).await,
                HostRunState::Reboot => self.track_job(&mut run, &credentials).await,
                HostRunState::Postchecks => self.postchecks(&run).await,
                HostRunState::ExitMaintenance => self.exit_maintenance(&mut run).await,
                HostRunState::Done | HostRunState::Error => break,
            };
            match step {
                Ok(()) => {
                    run.state = phase.next().unwrap_or(HostRunState::Done);
                    tracing::info!(host = %run.host_id, from = %phase, to = %run.state,
                        "Update phase complete");
                }
                Err(error) => {
                    self.fail(&mut run, phase, error).await;
                }
            }
            run.updated_at = Utc::now();
            self.save(&run).await?;
        }
        Ok(run)
    }

    async fn fail(&self, run: &mut HostRun, phase: HostRunState, error: AnvilError) {
        tracing::error!(host = %run.host_id, state = %phase, %error,
            class = ?error.class(), "Update phase failed");
        run.set_ctx("last_error", json!(error.to_string()));
        run.set_ctx("last_error_class", json!(format!("{:?}", error.class())));
        run.set_ctx("failed_state", json!(phase.to_string()));
        self.ensure_maintenance_exit(run).await;
        run.state = HostRunState::Error;
    }

    async fn save(&self, run: &HostRun) -> AnvilResult<()> {
        self.services
            .runs
            .save(run)
            .await
            .map_err(AnvilError::Collaborator)
    }

    fn identity(&self, run: &HostRun) -> ServerIdentity {
        ServerIdentity::new(run.host_id.clone())
    }

    async fn prechecks(&self, run: &mut HostRun, credentials: &Credentials) -> AnvilResult<()> {
        let identity = self.identity(run);
        let classification = self
            .services
            .detector
            .classify(&identity, credentials)
            .await;
        run.set_ctx("generation", json!(classification.generation.to_string()));

        let Some(protocol) = classification.usable_protocol() else {
            return Err(AnvilError::NoUsableProtocol {
                host: run.host_id.clone(),
            });
        };
        run.set_ctx("protocol", json!(protocol.to_string()));

        // The full survey is for diagnostics and doubles as the support
        // hints the apply phase hands to the protocol manager.
        let capabilities = self
            .services
            .manager
            .detect(&identity, credentials)
            .await;
        run.set_ctx("capabilities", json!(capabilities));

        // The baseline must predate the apply; re-capturing later would
        // hide the very changes the postchecks look for.
        if protocol == Protocol::Redfish {
            let endpoint = self.services.endpoints.endpoint(&identity, credentials);
            match endpoint.fetch_inventory().await {
                Ok(snapshot) => run.set_ctx("baseline_inventory", json!(snapshot)),
                Err(error) => {
                    tracing::warn!(host = %run.host_id, %error,
                        "Baseline inventory capture failed; diff will be after-only");
                }
            }
        }
        Ok(())
    }

    async fn enter_maintenance(&self, run: &mut HostRun) -> AnvilResult<()> {
        let host_id = run.host_id.clone();
        let maintenance = self.services.maintenance.clone();
        retry(self.services.config.backoff.policy(), || {
            let maintenance = maintenance.clone();
            let host_id = host_id.clone();
            async move { maintenance.enter(&host_id).await }
        })
        .await
        .map_err(AnvilError::Collaborator)?;
        run.set_ctx("maintenance_entered", json!(true));
        Ok(())
    }

    async fn apply(&self, run: &mut HostRun, credentials: &Credentials) -> AnvilResult<()> {
        let plan = self
            .services
            .plans
            .plan(&run.plan_id)
            .await
            .map_err(AnvilError::Collaborator)?;
        let request = FirmwareUpdateRequest {
            identity: self.identity(run),
            credentials: credentials.clone(),
            mode: plan.mode,
            components: plan
                .components
                .iter()
                .map(|c| ComponentUpdate {
                    component_id: c.component_id.clone(),
                    image_uri: c.image_uri.clone(),
                })
                .collect(),
            repository_url: plan.repository_url.clone(),
            parameters: plan.parameters.clone(),
        };

        let hints: Option<Vec<ProtocolCapability>> = run
            .ctx
            .get("capabilities")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let result = self
            .services
            .manager
            .run_update(&request, hints.as_deref())
            .await?;

        run.set_ctx("protocol", json!(result.protocol.to_string()));
        run.set_ctx("apply_messages", json!(result.messages));
        if let Some(location) = result.task_location() {
            run.set_ctx("task_location", json!(location));
        }
        Ok(())
    }

    /// Redfish applies hand back an asynchronous job; drive it through the
    /// task poller. CLI and WS-Man applies are synchronous and have
    /// nothing to track.
    async fn track_job(&self, run: &mut HostRun, credentials: &Credentials) -> AnvilResult<()> {
        if run.ctx_str("protocol") != Some("redfish") {
            tracing::debug!(host = %run.host_id, "No asynchronous job to track");
            return Ok(());
        }

        let identity = self.identity(run);
        let endpoint = self.services.endpoints.endpoint(&identity, credentials);
        let baseline: Option<InventorySnapshot> = run
            .ctx
            .get("baseline_inventory")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let settings = PollerSettings::with_deadline(self.services.config.poll_timeout());
        let mut poller = TaskPoller::new(endpoint, settings);
        if let Some(sink) = &self.services.poll_sink {
            poller = poller.with_sink(sink.clone());
        }

        let task_location = run.ctx_str("task_location").map(str::to_string);
        let outcome = poller.track(task_location.as_deref(), baseline).await?;

        run.set_ctx("inventory_changes", json!(outcome.inventory.changes));
        if !outcome.completed {
            return Err(AnvilError::TaskFailed {
                state: outcome.task.state().unwrap_or("<none>").to_string(),
                message: outcome
                    .task
                    .status_text()
                    .or_else(|| outcome.messages.first().cloned())
                    .unwrap_or_else(|| "no status text reported".to_string()),
            });
        }
        Ok(())
    }

    /// Job-state success alone is not trusted: every component the plan
    /// names with an expected version must show that version in the
    /// observed inventory diff.
    async fn postchecks(&self, run: &HostRun) -> AnvilResult<()> {
        let plan = self
            .services
            .plans
            .plan(&run.plan_id)
            .await
            .map_err(AnvilError::Collaborator)?;
        let expectations: Vec<_> = plan
            .components
            .iter()
            .filter_map(|c| {
                c.expected_version
                    .as_ref()
                    .map(|v| (c.component_id.clone(), v.clone()))
            })
            .collect();
        if expectations.is_empty() {
            return Ok(());
        }

        let changes: Vec<InventoryChange> = run
            .ctx
            .get("inventory_changes")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let mut mismatches = Vec::new();
        for (component_id, expected) in &expectations {
            let observed = changes
                .iter()
                .find(|change| &change.id == component_id)
                .and_then(|change| change.current_version.clone());
            match observed {
                Some(version) if &version == expected => {}
                Some(version) => {
                    mismatches.push(format!("{component_id}: expected {expected}, observed {version}"))
                }
                None => mismatches.push(format!("{component_id}: expected {expected}, no change observed")),
            }
        }
        if !mismatches.is_empty() {
            return Err(AnvilError::Other(eyre::eyre!(
                "inventory verification failed: {}",
                mismatches.join("; ")
            )));
        }
        Ok(())
    }

    async fn exit_maintenance(&self, run: &mut HostRun) -> AnvilResult<()> {
        let host_id = run.host_id.clone();
        let maintenance = self.services.maintenance.clone();
        retry(self.services.config.backoff.policy(), || {
            let maintenance = maintenance.clone();
            let host_id = host_id.clone();
            async move { maintenance.exit(&host_id).await }
        })
        .await
        .map_err(AnvilError::Collaborator)?;
        run.set_ctx("maintenance_exited", json!(true));
        Ok(())
    }

    /// Invoked on every failure path. A host left in maintenance mode is
    /// worse than a failed update, so the exit is attempted even when the
    /// failure happened before or during the apply.
    async fn ensure_maintenance_exit(&self, run: &mut HostRun) {
        if run.ctx.get("maintenance_entered") != Some(&json!(true)) {
            return;
        }
        if run.ctx.get("maintenance_exited") == Some(&json!(true)) {
            return;
        }
        match self.services.maintenance.exit(&run.host_id).await {
            Ok(()) => run.set_ctx("maintenance_exited", json!(true)),
            Err(error) => {
                tracing::error!(host = %run.host_id, %error,
                    "Failed to take host out of maintenance mode; operator action needed");
                run.set_ctx("maintenance_exit_error", json!(error.to_string()));
            }
        }
    }
}
