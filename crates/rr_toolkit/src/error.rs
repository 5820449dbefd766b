//! Error taxonomy shared by the drill, the probe and the protocol adapters.

use std::time::Duration;

/// Terminal outcomes of a drill or probe run.
///
/// Adapters surface `Connection`, `Protocol`, `NotFound` and `Orchestrator`;
/// the failover drill adds `VerificationMismatch` and `Timeout`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DrillError {
    /// The key-value store, coordinator or orchestrator API is unreachable.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Malformed response, wrong result shape or unparseable notification.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The promotion notification disagrees with what was observed.
    #[error("verification mismatch: {message}")]
    VerificationMismatch { message: String },

    /// The failover race was not decided in time.
    #[error("timeout after {}", human(.after))]
    Timeout { after: Duration },

    /// The target resource vanished or an administrative call failed.
    #[error("orchestrator error: {message}")]
    Orchestrator { message: String },

    /// The orchestrator reported the named resource as absent.
    #[error("{kind} {name} not found in namespace {namespace}")]
    NotFound {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    /// The caller cancelled the run before it finished.
    #[error("cancelled: {message}")]
    Cancelled { message: String },

    /// Invalid configuration (bad URL, empty cluster name, ...).
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// A worker task panicked or was aborted.
    #[error("task failed: {message}")]
    Task { message: String },
}

impl DrillError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::VerificationMismatch {
            message: message.into(),
        }
    }

    pub fn orchestrator(message: impl Into<String>) -> Self {
        Self::Orchestrator {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn human(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

pub type Result<T, E = DrillError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_renders_human_duration() {
        let err = DrillError::Timeout {
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "timeout after 1m 30s");
    }

    #[test]
    fn not_found_names_the_resource() {
        let err = DrillError::NotFound {
            kind: "pod",
            name: "redis-0".to_string(),
            namespace: "db".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "pod redis-0 not found in namespace db");
    }
}
