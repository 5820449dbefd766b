//! Resiliency checks for a Redis sentinel deployment on Kubernetes: a
//! failover drill that kills the primary's pod and verifies the promotion,
//! and a replication probe that counts stale replica reads.

pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod k8s;
pub mod printer;
pub mod probe;
pub mod resp;
pub mod sentinel;

pub use config::{DrillConfig, OutputConfig, ProbeConfig, SentinelConfig};
pub use error::{DrillError, Result};
pub use events::{Event, EventRecord, EventSender, Reporter};
pub use failover::{run_failover_drill, DrillReport, FailoverDrill};
pub use k8s::{KubePods, PodControl, PodNameStrategy};
pub use printer::{OutputFormat, Printer, Record};
pub use probe::{run_probe, KvConnector, ProbeSummary, RespConnector};
pub use sentinel::{Coordinator, PrimaryLocation, PromotionEvent, SentinelClient};
