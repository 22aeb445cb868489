//! The durable per-host record that makes a workflow resumable. The
//! external job queue persists this; the state machine only reads and
//! advances it.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position in the per-host update workflow. Transitions move strictly
/// forward through this graph or jump to `Error`; the only re-entry is an
/// explicit operator retry back into `Prechecks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRunState {
    Prechecks,
    EnterMaintenance,
    Apply,
    Reboot,
    Postchecks,
    ExitMaintenance,
    Done,
    Error,
}

impl HostRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostRunState::Done | HostRunState::Error)
    }

    /// The next phase in the forward-only graph. Terminal states have no
    /// successor.
    pub fn next(&self) -> Option<HostRunState> {
        match self {
            HostRunState::Prechecks => Some(HostRunState::EnterMaintenance),
            HostRunState::EnterMaintenance => Some(HostRunState::Apply),
            HostRunState::Apply => Some(HostRunState::Reboot),
            HostRunState::Reboot => Some(HostRunState::Postchecks),
            HostRunState::Postchecks => Some(HostRunState::ExitMaintenance),
            HostRunState::ExitMaintenance => Some(HostRunState::Done),
            HostRunState::Done | HostRunState::Error => None,
        }
    }
}

impl fmt::Display for HostRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostRunState::Prechecks => "PRECHECKS",
            HostRunState::EnterMaintenance => "ENTER_MAINT",
            HostRunState::Apply => "APPLY",
            HostRunState::Reboot => "REBOOT",
            HostRunState::Postchecks => "POSTCHECKS",
            HostRunState::ExitMaintenance => "EXIT_MAINT",
            HostRunState::Done => "DONE",
            HostRunState::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// One attempt (or chain of resumed attempts) to update one host.
///
/// `state` is the authoritative position, `ctx` carries intermediate
/// results across process restarts (chosen protocol, task location,
/// baseline inventory), and `attempts` bounds operator-level retries
/// separately from protocol-level retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRun {
    pub id: Uuid,
    pub plan_id: String,
    pub host_id: String,
    pub state: HostRunState,
    #[serde(default)]
    pub ctx: HashMap<String, serde_json::Value>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostRun {
    pub fn new(plan_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            plan_id: plan_id.into(),
            host_id: host_id.into(),
            state: HostRunState::Prechecks,
            ctx: HashMap::new(),
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_ctx(&mut self, key: &str, value: serde_json::Value) {
        self.ctx.insert(key.to_string(), value);
    }

    pub fn ctx_str(&self, key: &str) -> Option<&str> {
        self.ctx.get(key).and_then(|v| v.as_str())
    }

    /// Operator-triggered retry: re-enter `Prechecks` and count the
    /// attempt. Intermediate results from the failed pass are cleared;
    /// the error record is kept for diagnostics.
    pub fn reset_for_retry(&mut self) {
        self.attempts += 1;
        self.state = HostRunState::Prechecks;
        self.ctx.retain(|key, _| key.starts_with("last_error"));
        self.updated_at = Utc::now();
    }
}
