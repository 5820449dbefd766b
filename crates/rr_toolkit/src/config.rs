//! Per-run configuration. Each drill or probe receives its own values; there
//! is no process-wide state.

use std::time::Duration;

use crate::error::{DrillError, Result};
use crate::printer::{OutputFormat, Printer};
use crate::resp::RedisEndpoint;
use crate::sentinel::SentinelClient;

/// Default sentinel cluster name.
pub const DEFAULT_CLUSTER: &str = "mymaster";
/// Default bound on one failover drill.
pub const DEFAULT_DRILL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default key prefix for probe clients (`client_0`, `client_1`, ...).
pub const DEFAULT_KEY_PREFIX: &str = "client_";

/// Where the coordinator lives and which cluster it should be asked about.
#[derive(Clone, Debug)]
pub struct SentinelConfig {
    pub endpoint: RedisEndpoint,
    pub cluster_name: String,
}

impl SentinelConfig {
    /// Parse a `redis://` URL or bare `host:port`.
    pub fn parse(url: &str, cluster_name: impl Into<String>) -> Result<Self> {
        let cluster_name = cluster_name.into();
        if cluster_name.trim().is_empty() {
            return Err(DrillError::config("cluster name must not be empty"));
        }
        Ok(Self {
            endpoint: RedisEndpoint::parse(url)?,
            cluster_name,
        })
    }

    pub fn client(&self) -> SentinelClient {
        SentinelClient::new(self.endpoint.clone())
    }
}

/// How records reach stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub pretty: bool,
    /// Render debug events.
    pub verbose: bool,
}

impl OutputConfig {
    pub fn printer(&self) -> Printer {
        Printer::stdout(self.format, self.pretty)
    }
}

/// Inputs to one failover drill.
#[derive(Clone, Debug)]
pub struct DrillConfig {
    /// Sentinel name of the cluster under test.
    pub cluster_name: String,
    /// Pod to kill; derived from the primary's host name when unset.
    pub pod_name: Option<String>,
    pub namespace: String,
    /// Grace period passed to every delete. Zero deletes immediately.
    pub grace_period: Duration,
    /// Bound on the kill/promotion race.
    pub timeout: Duration,
}

impl DrillConfig {
    pub fn new(cluster_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            pod_name: None,
            namespace: namespace.into(),
            grace_period: Duration::ZERO,
            timeout: DEFAULT_DRILL_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(DrillError::config("cluster name must not be empty"));
        }
        if self.namespace.trim().is_empty() {
            return Err(DrillError::config("namespace must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(DrillError::config("timeout must be > 0"));
        }
        Ok(())
    }
}

/// Inputs to one replication probe.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Number of independent writer/reader pairs.
    pub clients: usize,
    /// Writes per pair.
    pub operations: usize,
    pub key_prefix: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            clients: 100,
            operations: 1000,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.clients == 0 {
            return Err(DrillError::config("clients must be > 0"));
        }
        Ok(())
    }

    pub fn key(&self, client: usize) -> String {
        format!("{}{client}", self.key_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drill_defaults_and_validation() {
        let config = DrillConfig::new(DEFAULT_CLUSTER, "default");
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(config.grace_period.is_zero());
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.cluster_name = " ".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.timeout = Duration::ZERO;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn sentinel_url_and_cluster() {
        let config = SentinelConfig::parse("redis://:secret@sentinel:26379", "mymaster").unwrap();
        assert_eq!(config.endpoint.addr(), "sentinel:26379");
        assert_eq!(config.client().endpoint().password.as_deref(), Some("secret"));
        assert!(SentinelConfig::parse("sentinel:26379", "").is_err());
    }

    #[test]
    fn probe_keys() {
        let config = ProbeConfig::default();
        assert_eq!(config.key(7), "client_7");
        assert!(ProbeConfig {
            clients: 0,
            ..ProbeConfig::default()
        }
        .validate()
        .is_err());
    }
}
