use std::time::Duration;

use crate::model::Protocol;
use utils::cmd::CmdError;

/// Coarse classification used to decide whether an operation is worth
/// retrying, has definitively failed, or ran out of time without an
/// answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff: network faults, 5xx, not-yet-visible resources,
    /// killed subprocess timeouts.
    Transient,
    /// Never retry: malformed requests, unsupported operations, 4xx.
    Permanent,
    /// The overall deadline elapsed while the outcome was still unknown.
    /// Distinct from a terminal-but-failed job.
    Timeout,
}

#[derive(thiserror::Error, Debug)]
pub enum AnvilError {
    #[error("HTTP {status} from {url}: {body}")]
    Http { status: u16, url: String, body: String },

    #[error("Network error talking to {url}: {details}")]
    Network { url: String, details: String },

    #[error("{operation} is not supported over {protocol}")]
    Unsupported {
        protocol: Protocol,
        operation: &'static str,
    },

    #[error("Update was accepted but no task location was returned")]
    MissingTaskLocation,

    #[error("Malformed response from {url}: {details}")]
    MalformedResponse { url: String, details: String },

    #[error("Deadline of {deadline:?} exceeded after {elapsed:?} while still {phase}")]
    DeadlineExceeded {
        deadline: Duration,
        elapsed: Duration,
        phase: &'static str,
    },

    #[error("Firmware job ended in {state}: {message}")]
    TaskFailed { state: String, message: String },

    #[error(transparent)]
    Subprocess(#[from] CmdError),

    #[error("All protocols failed for {host} (attempted {attempted:?}): {last_error}")]
    AllProtocolsFailed {
        host: String,
        attempted: Vec<Protocol>,
        last_error: String,
    },

    #[error("No usable management protocol detected for {host}")]
    NoUsableProtocol { host: String },

    #[error("An update run is already in flight for host {host_id}")]
    RunAlreadyActive { host_id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Collaborator failure: {0}")]
    Collaborator(#[source] eyre::Report),

    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl AnvilError {
    pub fn class(&self) -> ErrorClass {
        match self {
            // 404 on a job resource means "not yet visible", see the poller.
            AnvilError::Http { status, .. } if *status >= 500 || *status == 404 => {
                ErrorClass::Transient
            }
            AnvilError::Http { .. } => ErrorClass::Permanent,
            AnvilError::Network { .. } => ErrorClass::Transient,
            AnvilError::Subprocess(e) if e.is_transient() => ErrorClass::Transient,
            AnvilError::Subprocess(_) => ErrorClass::Permanent,
            AnvilError::DeadlineExceeded { .. } => ErrorClass::Timeout,
            AnvilError::Collaborator(_) => ErrorClass::Transient,
            AnvilError::Unsupported { .. }
            | AnvilError::MissingTaskLocation
            | AnvilError::MalformedResponse { .. }
            | AnvilError::TaskFailed { .. }
            | AnvilError::AllProtocolsFailed { .. }
            | AnvilError::NoUsableProtocol { .. }
            | AnvilError::RunAlreadyActive { .. }
            | AnvilError::Config(_)
            | AnvilError::Other(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Map a reqwest failure to either a network-level (transient) or a
    /// generic error, keeping the target URL for diagnostics.
    pub fn from_reqwest(url: &str, error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() || error.is_request() {
            AnvilError::Network {
                url: url.to_string(),
                details: error.to_string(),
            }
        } else {
            AnvilError::Other(eyre::Report::new(error))
        }
    }
}

pub type AnvilResult<T> = Result<T, AnvilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_classification_matches_policy() {
        let http = |status| AnvilError::Http {
            status,
            url: "https://bmc/redfish/v1".into(),
            body: String::new(),
        };
        assert_eq!(http(500).class(), ErrorClass::Transient);
        assert_eq!(http(503).class(), ErrorClass::Transient);
        assert_eq!(http(404).class(), ErrorClass::Transient);
        assert_eq!(http(401).class(), ErrorClass::Permanent);
        assert_eq!(http(400).class(), ErrorClass::Permanent);
    }

    #[test]
    fn deadline_is_timeout_not_permanent() {
        let err = AnvilError::DeadlineExceeded {
            deadline: Duration::from_secs(60),
            elapsed: Duration::from_secs(61),
            phase: "polling",
        };
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert!(!err.is_transient());
    }

    #[test]
    fn unsupported_update_is_permanent() {
        let err = AnvilError::Unsupported {
            protocol: Protocol::Ipmi,
            operation: "firmware update",
        };
        assert_eq!(err.class(), ErrorClass::Permanent);
    }
}
