use std::time::Duration;

use eyre::WrapErr;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use utils::backoff::RetryPolicy;

/// anvil configuration file content. Every knob has a sane default so an
/// empty file is a valid configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AnvilConfig {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub subprocess: SubprocessConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Overall deadline for tracking one asynchronous update job.
    #[serde(default = "default_poll_timeout_minutes")]
    pub poll_timeout_minutes: u64,

    /// Probe IPMI during capability detection. Some fleets firewall the
    /// UDP transport and would rather not wait out the timeout.
    #[serde(default = "default_true")]
    pub detect_ipmi: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HttpConfig {
    /// BMCs ship self-signed certificates; trusting them is the fleet
    /// default. Set to false where a site CA is provisioned.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,

    /// Per-request timeout for probes and liveness checks.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Per-request timeout for job fetches and inventory reads.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            accept_invalid_certs: true,
            probe_timeout_secs: default_probe_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubprocessConfig {
    #[serde(default = "default_racadm_bin")]
    pub racadm_bin: String,

    #[serde(default = "default_ipmitool_bin")]
    pub ipmitool_bin: String,

    #[serde(default = "default_ssh_bin")]
    pub ssh_bin: String,

    /// Timeout for cheap CLI probes.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Timeout for an actual CLI-driven firmware update.
    #[serde(default = "default_update_timeout_minutes")]
    pub update_timeout_minutes: u64,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            racadm_bin: default_racadm_bin(),
            ipmitool_bin: default_ipmitool_bin(),
            ssh_bin: default_ssh_bin(),
            probe_timeout_secs: default_probe_timeout_secs(),
            update_timeout_minutes: default_update_timeout_minutes(),
        }
    }
}

impl SubprocessConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_minutes * 60)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

impl Default for AnvilConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            subprocess: SubprocessConfig::default(),
            backoff: BackoffConfig::default(),
            poll_timeout_minutes: default_poll_timeout_minutes(),
            detect_ipmi: true,
        }
    }
}

impl AnvilConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_minutes * 60)
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout_minutes() -> u64 {
    90
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_update_timeout_minutes() -> u64 {
    30
}

fn default_racadm_bin() -> String {
    "racadm".to_string()
}

fn default_ipmitool_bin() -> String {
    "ipmitool".to_string()
}

fn default_ssh_bin() -> String {
    "ssh".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    60
}

/// Load configuration from an optional TOML document merged with
/// `ANVIL_`-prefixed environment variables.
pub fn parse_config(config_str: Option<&str>) -> eyre::Result<AnvilConfig> {
    let mut figment = Figment::new();
    if let Some(config_str) = config_str {
        figment = figment.merge(Toml::string(config_str));
    }

    figment
        .merge(Env::prefixed("ANVIL_").split("__"))
        .extract()
        .wrap_err("Failed to load configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config(None).unwrap();
        assert_eq!(config.poll_timeout_minutes, 90);
        assert_eq!(config.http.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.subprocess.racadm_bin, "racadm");
        assert!(config.detect_ipmi);
        let policy = config.backoff.policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn default_impl_matches_an_empty_config() {
        let config = AnvilConfig::default();
        assert_eq!(config.poll_timeout_minutes, 90);
        assert!(config.detect_ipmi);
        assert_eq!(config.subprocess.update_timeout(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = parse_config(Some(
            r#"
            poll_timeout_minutes = 30
            detect_ipmi = false

            [subprocess]
            racadm_bin = "/opt/dell/racadm"
            update_timeout_minutes = 45

            [backoff]
            max_attempts = 3
            "#,
        ))
        .unwrap();
        assert_eq!(config.poll_timeout(), Duration::from_secs(30 * 60));
        assert!(!config.detect_ipmi);
        assert_eq!(config.subprocess.racadm_bin, "/opt/dell/racadm");
        assert_eq!(
            config.subprocess.update_timeout(),
            Duration::from_secs(45 * 60)
        );
        assert_eq!(config.backoff.max_attempts, 3);
        // Unrelated sections keep their defaults.
        assert_eq!(config.http.request_timeout_secs, 30);
    }
}
