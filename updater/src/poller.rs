//! Tracks one asynchronous Redfish update job to a terminal state,
//! rides out transient faults and the controller's own reboot, and proves
//! the update through a before/after inventory diff.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{AnvilError, AnvilResult};
use crate::model::{diff_inventories, InventoryChange, InventorySnapshot};
use crate::protocol::RedfishEndpoint;

/// Terminal task states as vendors report them.
const TERMINAL_STATES: &[&str] = &[
    "Completed",
    "CompletedOK",
    "CompletedWithWarnings",
    "Cancelled",
    "Exception",
    "Killed",
    "Failed",
];

/// The subset of terminal states that mean the job failed.
const FAILURE_STATES: &[&str] = &["Exception", "Cancelled", "Killed", "Failed"];

static ERROR_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error|exception|fail").expect("static regex"));

/// One Redfish task/job resource. Vendors disagree on which of
/// `TaskState`/`JobState`/`Status` carries the truth, so all are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "Id", default)]
    pub id: Option<String>,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "TaskState", default)]
    pub task_state: Option<String>,
    #[serde(rename = "JobState", default)]
    pub job_state: Option<String>,
    #[serde(rename = "TaskStatus", default)]
    pub task_status: Option<String>,
    #[serde(rename = "Status", default)]
    pub status: Option<serde_json::Value>,
    #[serde(rename = "PercentComplete", default)]
    pub percent_complete: Option<i64>,
    #[serde(rename = "Messages", default)]
    pub messages: Vec<TaskMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
}

impl TaskRecord {
    /// The job state, whichever field the vendor populated.
    pub fn state(&self) -> Option<&str> {
        self.task_state
            .as_deref()
            .or(self.job_state.as_deref())
            .or_else(|| self.status.as_ref().and_then(|v| v.as_str()))
    }

    /// Human-readable status text: `TaskStatus`, or the `Status` field
    /// rendered whether it is a bare string or a `{State, Health}` object.
    pub fn status_text(&self) -> Option<String> {
        if let Some(status) = &self.task_status {
            return Some(status.clone());
        }
        match &self.status {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Object(map)) => {
                let state = map.get("State").and_then(|v| v.as_str()).unwrap_or("");
                let health = map.get("Health").and_then(|v| v.as_str()).unwrap_or("");
                Some(format!("{state} {health}").trim().to_string())
            }
            _ => None,
        }
    }

    pub fn message_texts(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter_map(|m| m.message.clone())
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.state()
            .map(|s| TERMINAL_STATES.contains(&s))
            .unwrap_or(false)
    }
}

/// Success requires both signals to agree: a terminal state outside the
/// failure set AND status text free of error/exception/failed markers.
/// Vendors report failures inconsistently between the two fields.
pub fn task_succeeded(task: &TaskRecord) -> bool {
    let state_ok = task
        .state()
        .map(|s| !FAILURE_STATES.contains(&s))
        .unwrap_or(false);
    if !state_ok {
        return false;
    }
    match task.status_text() {
        Some(text) => !ERROR_TEXT.is_match(&text),
        None => true,
    }
}

/// Structured events emitted at every poll/retry/terminal/recovery/error
/// transition, so an operator can watch a multi-hour update live.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PollEvent {
    PollStarted {
        task_location: String,
        at: DateTime<Utc>,
    },
    TaskPolled {
        state: Option<String>,
        percent_complete: Option<i64>,
        at: DateTime<Utc>,
    },
    TransientFault {
        error: String,
        retry_in_ms: u64,
        at: DateTime<Utc>,
    },
    TaskTerminal {
        state: String,
        completed: bool,
        at: DateTime<Utc>,
    },
    AwaitingController {
        elapsed_ms: u64,
        at: DateTime<Utc>,
    },
    ControllerBack {
        at: DateTime<Utc>,
    },
    InventoryCaptured {
        phase: &'static str,
        components: usize,
        at: DateTime<Utc>,
    },
    InventoryUnavailable {
        phase: &'static str,
        error: String,
        at: DateTime<Utc>,
    },
    Aborted {
        phase: &'static str,
        error: String,
        at: DateTime<Utc>,
    },
}

pub type PollSink = Arc<dyn Fn(&PollEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    /// Overall deadline measured from poll start. Exceeding it without a
    /// terminal state is a timeout, distinct from a failed job.
    pub deadline: Duration,
    pub poll_initial_delay: Duration,
    pub poll_max_delay: Duration,
    pub recovery_initial_delay: Duration,
    pub recovery_max_delay: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(90 * 60),
            poll_initial_delay: Duration::from_secs(2),
            poll_max_delay: Duration::from_secs(15),
            recovery_initial_delay: Duration::from_secs(1),
            recovery_max_delay: Duration::from_secs(5),
        }
    }
}

impl PollerSettings {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            ..Self::default()
        }
    }
}

/// Before/after snapshots plus the derived change set. `before` may be
/// missing when the baseline capture failed, in which case diffing
/// degrades to after-only reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryDelta {
    pub before: Option<InventorySnapshot>,
    pub after: Option<InventorySnapshot>,
    pub changes: Vec<InventoryChange>,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: TaskRecord,
    pub completed: bool,
    pub messages: Vec<String>,
    pub percent_complete: Option<i64>,
    pub duration: Duration,
    pub inventory: InventoryDelta,
}

pub struct TaskPoller {
    endpoint: Arc<dyn RedfishEndpoint>,
    settings: PollerSettings,
    sink: Option<PollSink>,
}

impl TaskPoller {
    pub fn new(endpoint: Arc<dyn RedfishEndpoint>, settings: PollerSettings) -> Self {
        Self {
            endpoint,
            settings,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: PollSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// A sink failure must never affect the poll's control flow.
    fn emit(&self, event: PollEvent) {
        if let Some(sink) = &self.sink {
            let outcome = catch_unwind(AssertUnwindSafe(|| sink(&event)));
            if outcome.is_err() {
                tracing::warn!("Poll event sink panicked; continuing");
            }
        }
    }

    fn fatal(&self, phase: &'static str, error: AnvilError) -> AnvilError {
        self.emit(PollEvent::Aborted {
            phase,
            error: error.to_string(),
            at: Utc::now(),
        });
        error
    }

    /// Drive the job at `task_location` to a terminal state, wait out the
    /// controller's reboot, and capture the inventory delta.
    ///
    /// A caller resuming an interrupted run supplies the baseline snapshot
    /// it captured the first time; re-capturing after the update started
    /// would hide the changes.
    pub async fn track(
        &self,
        task_location: Option<&str>,
        baseline: Option<InventorySnapshot>,
    ) -> AnvilResult<TaskOutcome> {
        let location = match task_location {
            Some(location) if !location.trim().is_empty() => location.to_string(),
            _ => return Err(self.fatal("resolve-location", AnvilError::MissingTaskLocation)),
        };
        let started = Instant::now();
        self.emit(PollEvent::PollStarted {
            task_location: location.clone(),
            at: Utc::now(),
        });

        let before = match baseline {
            Some(snapshot) => Some(snapshot),
            None => self.capture_inventory("baseline").await,
        };

        let task = self.poll_until_terminal(&location, started).await?;
        let completed = task_succeeded(&task);
        self.emit(PollEvent::TaskTerminal {
            state: task.state().unwrap_or("<none>").to_string(),
            completed,
            at: Utc::now(),
        });

        self.await_controller_recovery(started).await?;

        let after = self.capture_inventory("after").await;
        let changes = match (&before, &after) {
            (Some(before), Some(after)) => diff_inventories(before, after),
            _ => Vec::new(),
        };

        Ok(TaskOutcome {
            messages: task.message_texts(),
            percent_complete: task.percent_complete,
            completed,
            duration: started.elapsed(),
            inventory: InventoryDelta {
                before,
                after,
                changes,
            },
            task,
        })
    }

    async fn poll_until_terminal(
        &self,
        location: &str,
        started: Instant,
    ) -> AnvilResult<TaskRecord> {
        let mut delay = self.settings.poll_initial_delay;
        loop {
            if started.elapsed() >= self.settings.deadline {
                return Err(self.fatal(
                    "polling",
                    AnvilError::DeadlineExceeded {
                        deadline: self.settings.deadline,
                        elapsed: started.elapsed(),
                        phase: "polling",
                    },
                ));
            }

            match self.endpoint.fetch_task(location).await {
                Ok(task) => {
                    self.emit(PollEvent::TaskPolled {
                        state: task.state().map(str::to_string),
                        percent_complete: task.percent_complete,
                        at: Utc::now(),
                    });
                    if task.is_terminal() {
                        return Ok(task);
                    }
                }
                // 5xx and 404 (job not yet visible) and network faults are
                // transient; any other failure aborts the poll.
                Err(error) if error.is_transient() => {
                    self.emit(PollEvent::TransientFault {
                        error: error.to_string(),
                        retry_in_ms: delay.as_millis() as u64,
                        at: Utc::now(),
                    });
                }
                Err(error) => return Err(self.fatal("polling", error)),
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.settings.poll_max_delay);
        }
    }

    /// The management controller typically reboots while applying
    /// updates; probe its service root until it answers again.
    async fn await_controller_recovery(&self, started: Instant) -> AnvilResult<()> {
        let mut delay = self.settings.recovery_initial_delay;
        loop {
            match self.endpoint.probe_service_root().await {
                Ok(()) => {
                    self.emit(PollEvent::ControllerBack { at: Utc::now() });
                    return Ok(());
                }
                // 5xx means "not yet back"; so does a network-level fault.
                Err(AnvilError::Http { status, .. }) if status >= 500 => {}
                Err(AnvilError::Network { .. }) => {}
                Err(error) => return Err(self.fatal("controller-recovery", error)),
            }

            if started.elapsed() >= self.settings.deadline {
                return Err(self.fatal(
                    "controller-recovery",
                    AnvilError::DeadlineExceeded {
                        deadline: self.settings.deadline,
                        elapsed: started.elapsed(),
                        phase: "awaiting controller recovery",
                    },
                ));
            }

            self.emit(PollEvent::AwaitingController {
                elapsed_ms: started.elapsed().as_millis() as u64,
                at: Utc::now(),
            });
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(1.5).min(self.settings.recovery_max_delay);
        }
    }

    /// Best effort on both sides of the update: a missing snapshot
    /// degrades the diff, it does not fail the poll.
    async fn capture_inventory(&self, phase: &'static str) -> Option<InventorySnapshot> {
        match self.endpoint.fetch_inventory().await {
            Ok(snapshot) => {
                self.emit(PollEvent::InventoryCaptured {
                    phase,
                    components: snapshot.components.len(),
                    at: Utc::now(),
                });
                Some(snapshot)
            }
            Err(error) => {
                tracing::warn!(%error, phase, "Firmware inventory capture failed");
                self.emit(PollEvent::InventoryUnavailable {
                    phase,
                    error: error.to_string(),
                    at: Utc::now(),
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::model::{ChangeType, InventoryComponent};

    fn task_json(state: &str) -> TaskRecord {
        serde_json::from_value(serde_json::json!({
            "Id": "42",
            "TaskState": state,
            "TaskStatus": "OK",
            "PercentComplete": 50,
        }))
        .unwrap()
    }

    fn http(status: u16) -> AnvilError {
        AnvilError::Http {
            status,
            url: "https://bmc/redfish/v1/TaskService/Tasks/42".into(),
            body: String::new(),
        }
    }

    #[derive(Default)]
    struct ScriptedEndpoint {
        tasks: Mutex<VecDeque<AnvilResult<TaskRecord>>>,
        roots: Mutex<VecDeque<AnvilResult<()>>>,
        inventories: Mutex<VecDeque<AnvilResult<InventorySnapshot>>>,
    }

    impl ScriptedEndpoint {
        fn with_tasks(tasks: Vec<AnvilResult<TaskRecord>>) -> Arc<Self> {
            Arc::new(Self {
                tasks: Mutex::new(tasks.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl RedfishEndpoint for ScriptedEndpoint {
        async fn fetch_task(&self, _location: &str) -> AnvilResult<TaskRecord> {
            self.tasks
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(task_json("Running")))
        }

        async fn probe_service_root(&self) -> AnvilResult<()> {
            self.roots.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn fetch_inventory(&self) -> AnvilResult<InventorySnapshot> {
            self.inventories
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(InventorySnapshot::default()))
        }
    }

    fn fast_settings() -> PollerSettings {
        PollerSettings {
            deadline: Duration::from_secs(5),
            poll_initial_delay: Duration::from_millis(5),
            poll_max_delay: Duration::from_millis(20),
            recovery_initial_delay: Duration::from_millis(5),
            recovery_max_delay: Duration::from_millis(20),
        }
    }

    const LOCATION: Option<&str> = Some("https://bmc/redfish/v1/TaskService/Tasks/42");

    #[tokio::test]
    async fn rides_out_404_then_reaches_terminal() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![
            Err(http(404)),
            Ok(task_json("Running")),
            Ok(task_json("Completed")),
        ]);
        let poller = TaskPoller::new(endpoint, fast_settings());
        let outcome = poller.track(LOCATION, None).await.unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.task.state(), Some("Completed"));
    }

    #[tokio::test]
    async fn server_errors_are_transient_too() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![
            Err(http(503)),
            Ok(task_json("CompletedWithWarnings")),
        ]);
        let poller = TaskPoller::new(endpoint, fast_settings());
        let outcome = poller.track(LOCATION, None).await.unwrap();
        assert!(outcome.completed);
    }

    #[tokio::test]
    async fn auth_failure_aborts_the_poll() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![Err(http(401))]);
        let poller = TaskPoller::new(endpoint, fast_settings());
        let error = poller.track(LOCATION, None).await.unwrap_err();
        assert!(matches!(error, AnvilError::Http { status: 401, .. }));
    }

    #[tokio::test]
    async fn failure_state_is_terminal_but_not_completed() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![Ok(task_json("Exception"))]);
        let poller = TaskPoller::new(endpoint, fast_settings());
        let outcome = poller.track(LOCATION, None).await.unwrap();
        assert!(!outcome.completed);
        assert_eq!(outcome.task.state(), Some("Exception"));
    }

    #[tokio::test]
    async fn error_status_text_vetoes_a_success_state() {
        let task: TaskRecord = serde_json::from_value(serde_json::json!({
            "TaskState": "Completed",
            "TaskStatus": "Critical: an error occurred during flash",
        }))
        .unwrap();
        let endpoint = ScriptedEndpoint::with_tasks(vec![Ok(task)]);
        let poller = TaskPoller::new(endpoint, fast_settings());
        let outcome = poller.track(LOCATION, None).await.unwrap();
        assert!(!outcome.completed);
    }

    #[tokio::test]
    async fn missing_location_is_fatal_without_retry() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![]);
        let poller = TaskPoller::new(endpoint, fast_settings());
        let error = poller.track(None, None).await.unwrap_err();
        assert!(matches!(error, AnvilError::MissingTaskLocation));
    }

    #[tokio::test]
    async fn deadline_expires_while_nonterminal() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![]);
        let mut settings = fast_settings();
        settings.deadline = Duration::from_millis(40);
        let poller = TaskPoller::new(endpoint, settings);
        let error = poller.track(LOCATION, None).await.unwrap_err();
        assert!(matches!(error, AnvilError::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn waits_for_controller_recovery_through_5xx() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![Ok(task_json("Completed"))]);
        *endpoint.roots.lock().unwrap() =
            vec![Err(http(503)), Err(http(500)), Ok(())].into();
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let events_in_sink = events.clone();
        let sink: PollSink = Arc::new(move |event| {
            events_in_sink
                .lock()
                .unwrap()
                .push(format!("{event:?}"));
        });
        let poller = TaskPoller::new(endpoint, fast_settings()).with_sink(sink);
        let outcome = poller.track(LOCATION, None).await.unwrap();
        assert!(outcome.completed);
        let rendered = events.lock().unwrap().join("\n");
        assert!(rendered.contains("AwaitingController"));
        assert!(rendered.contains("ControllerBack"));
    }

    #[tokio::test]
    async fn unexpected_status_during_recovery_is_fatal() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![Ok(task_json("Completed"))]);
        *endpoint.roots.lock().unwrap() = vec![Err(http(403))].into();
        let poller = TaskPoller::new(endpoint, fast_settings());
        let error = poller.track(LOCATION, None).await.unwrap_err();
        assert!(matches!(error, AnvilError::Http { status: 403, .. }));
    }

    #[tokio::test]
    async fn computes_the_inventory_delta() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![Ok(task_json("Completed"))]);
        let after = InventorySnapshot::from_components([InventoryComponent {
            id: "BMC".into(),
            name: "BMC Firmware".into(),
            version: "2.0".into(),
            source: None,
        }]);
        *endpoint.inventories.lock().unwrap() = vec![Ok(after)].into();
        let baseline = InventorySnapshot::from_components([InventoryComponent {
            id: "BMC".into(),
            name: "BMC Firmware".into(),
            version: "1.0".into(),
            source: None,
        }]);
        let poller = TaskPoller::new(endpoint, fast_settings());
        let outcome = poller.track(LOCATION, Some(baseline)).await.unwrap();
        assert_eq!(outcome.inventory.changes.len(), 1);
        assert_eq!(outcome.inventory.changes[0].change_type, ChangeType::Updated);
        assert_eq!(
            outcome.inventory.changes[0].current_version.as_deref(),
            Some("2.0")
        );
    }

    #[tokio::test]
    async fn baseline_capture_failure_degrades_to_after_only() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![Ok(task_json("Completed"))]);
        *endpoint.inventories.lock().unwrap() = vec![
            Err(http(500)),
            Ok(InventorySnapshot::default()),
        ]
        .into();
        let poller = TaskPoller::new(endpoint, fast_settings());
        let outcome = poller.track(LOCATION, None).await.unwrap();
        assert!(outcome.completed);
        assert!(outcome.inventory.before.is_none());
        assert!(outcome.inventory.after.is_some());
        assert!(outcome.inventory.changes.is_empty());
    }

    #[tokio::test]
    async fn panicking_sink_never_aborts_the_poll() {
        let endpoint = ScriptedEndpoint::with_tasks(vec![Ok(task_json("Completed"))]);
        let sink: PollSink = Arc::new(|_| panic!("sink exploded"));
        let poller = TaskPoller::new(endpoint, fast_settings()).with_sink(sink);
        let outcome = poller.track(LOCATION, None).await.unwrap();
        assert!(outcome.completed);
    }

    #[test]
    fn task_record_reads_either_state_field() {
        let by_job: TaskRecord = serde_json::from_value(serde_json::json!({
            "JobState": "Running",
            "Status": {"State": "Enabled", "Health": "OK"},
        }))
        .unwrap();
        assert_eq!(by_job.state(), Some("Running"));
        assert_eq!(by_job.status_text().as_deref(), Some("Enabled OK"));

        let by_status_string: TaskRecord = serde_json::from_value(serde_json::json!({
            "Status": "Completed",
        }))
        .unwrap();
        assert_eq!(by_status_string.state(), Some("Completed"));
    }

    #[test]
    fn success_requires_both_signals() {
        assert!(task_succeeded(&task_json("Completed")));
        assert!(task_succeeded(&task_json("CompletedOK")));
        assert!(!task_succeeded(&task_json("Failed")));
        assert!(!task_succeeded(&task_json("Cancelled")));
        assert!(!task_succeeded(&task_json("Killed")));

        let bad_text: TaskRecord = serde_json::from_value(serde_json::json!({
            "TaskState": "Completed",
            "TaskStatus": "Firmware flash FAILED",
        }))
        .unwrap();
        assert!(!task_succeeded(&bad_text));

        let no_state = TaskRecord::default();
        assert!(!task_succeeded(&no_state));
    }
}
