//! Ordered event channel shared by the drill and probe tasks.
//!
//! Producers hold cheap `EventSender` clones; a single `Reporter` drains the
//! bounded queue in arrival order and hands each record to a sink (usually
//! the `Printer`). A full queue makes producers wait instead of dropping.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use crate::k8s::PodEventKind;
use crate::printer::Record;
use crate::sentinel::{PrimaryLocation, PromotionEvent};

/// Pending events a producer may queue before it has to wait.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Everything the drill and probe report while running.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    InitialPrimary {
        primary: PrimaryLocation,
    },
    TargetPod {
        name: String,
        namespace: String,
    },
    PodDeleted {
        name: String,
        namespace: String,
    },
    PodNotFound {
        name: String,
        namespace: String,
    },
    PodChanged {
        kind: PodEventKind,
        name: String,
        namespace: String,
    },
    SentinelMessage {
        channel: String,
        payload: String,
    },
    Promotion {
        promotion: PromotionEvent,
    },
    IgnoredPromotion {
        promotion: PromotionEvent,
    },
    VerificationError {
        reason: String,
    },
    Timeout {
        after: Duration,
    },
    FinalPrimary {
        primary: PrimaryLocation,
    },
    WrongValue {
        key: String,
        got: Option<String>,
        expected: String,
    },
    Done {
        key: String,
        total_reads: u64,
        stale_reads: u64,
        error_rate: Option<f64>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::InitialPrimary { .. } => "initial primary",
            Event::TargetPod { .. } => "pod name",
            Event::PodDeleted { .. } => "pod deleted",
            Event::PodNotFound { .. } => "pod not found",
            Event::PodChanged { .. } => "pod event",
            Event::SentinelMessage { .. } => "sentinel message",
            Event::Promotion { .. } => "switch master",
            Event::IgnoredPromotion { .. } => "ignored switch master",
            Event::VerificationError { .. } => "verification error",
            Event::Timeout { .. } => "timeout",
            Event::FinalPrimary { .. } => "final primary",
            Event::WrongValue { .. } => "wrong value",
            Event::Done { .. } => "done",
        }
    }

    /// Debug events are only rendered in verbose mode.
    pub fn is_debug(&self) -> bool {
        matches!(
            self,
            Event::PodChanged { .. } | Event::SentinelMessage { .. } | Event::IgnoredPromotion { .. }
        )
    }

    /// Typed fields flattened into `(column, value)` pairs, in display order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            Event::InitialPrimary { primary } | Event::FinalPrimary { primary } => vec![
                ("cluster", primary.cluster_name.clone()),
                ("msg", primary.addr()),
            ],
            Event::TargetPod { name, namespace }
            | Event::PodDeleted { name, namespace }
            | Event::PodNotFound { name, namespace } => vec![
                ("name", name.clone()),
                ("namespace", namespace.clone()),
            ],
            Event::PodChanged {
                kind,
                name,
                namespace,
            } => vec![
                ("type", kind.to_string()),
                ("name", name.clone()),
                ("namespace", namespace.clone()),
            ],
            Event::SentinelMessage { channel, payload } => {
                vec![("ch", channel.clone()), ("msg", payload.clone())]
            }
            Event::Promotion { promotion } | Event::IgnoredPromotion { promotion } => vec![
                ("cluster", promotion.cluster_name.clone()),
                (
                    "previous",
                    format!("{}:{}", promotion.old_host, promotion.old_port),
                ),
                ("msg", format!("{}:{}", promotion.new_host, promotion.new_port)),
            ],
            Event::VerificationError { reason } => vec![("msg", reason.clone())],
            Event::Timeout { after } => {
                vec![("duration", humantime::format_duration(*after).to_string())]
            }
            Event::WrongValue { key, got, expected } => vec![
                ("key", key.clone()),
                ("got", got.clone().unwrap_or_else(|| "(nil)".to_string())),
                ("expected", expected.clone()),
            ],
            Event::Done {
                key,
                total_reads,
                stale_reads,
                error_rate,
            } => vec![
                ("key", key.clone()),
                ("total_reads", total_reads.to_string()),
                ("stale_reads", stale_reads.to_string()),
                ("error_rate", format_rate(*error_rate)),
            ],
        }
    }
}

/// Error rate as text; `n/a` when nothing was read.
pub fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => format!("{rate:.4}"),
        None => "n/a".to_string(),
    }
}

/// An event stamped with the time it was emitted.
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub at: SystemTime,
    pub event: Event,
}

impl EventRecord {
    /// Column order used when rendering this record.
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = vec!["time", "event"];
        columns.extend(self.event.fields().into_iter().map(|(name, _)| name));
        columns
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            "time".to_string(),
            humantime::format_rfc3339_millis(self.at).to_string(),
        );
        record.insert("event".to_string(), self.event.kind().to_string());
        if self.event.is_debug() {
            record.insert("debug".to_string(), "true".to_string());
        }
        for (name, value) in self.event.fields() {
            record.insert(name.to_string(), value);
        }
        record
    }
}

/// Producer handle. Clone one per task.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<EventRecord>,
}

impl EventSender {
    /// Queue an event, waiting for room when the reporter is behind.
    pub async fn emit(&self, event: Event) {
        let record = EventRecord {
            at: SystemTime::now(),
            event,
        };
        if let Err(err) = self.tx.send(record).await {
            tracing::debug!(event = err.0.event.kind(), "reporter gone; event not rendered");
        }
    }
}

/// Create the channel. The receiving half becomes a `Reporter`.
pub fn channel() -> (EventSender, Reporter) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    (
        EventSender { tx },
        Reporter {
            rx,
            include_debug: false,
        },
    )
}

/// Single consumer of the event channel.
pub struct Reporter {
    rx: mpsc::Receiver<EventRecord>,
    include_debug: bool,
}

impl Reporter {
    pub fn include_debug(mut self, include_debug: bool) -> Self {
        self.include_debug = include_debug;
        self
    }

    /// Drain until every sender is dropped, passing records to `sink` in
    /// arrival order. Filtered debug records do not reorder the rest.
    pub async fn run<F>(mut self, mut sink: F)
    where
        F: FnMut(&EventRecord),
    {
        while let Some(record) = self.rx.recv().await {
            if record.event.is_debug() && !self.include_debug {
                continue;
            }
            sink(&record);
        }
    }

    /// Drain into a vector. Returns once all senders are dropped.
    pub async fn collect(self) -> Vec<EventRecord> {
        let mut out = Vec::new();
        self.run(|record| out.push(record.clone())).await;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary() -> PrimaryLocation {
        PrimaryLocation {
            host: "10.0.0.1".to_string(),
            port: 6379,
            cluster_name: "mycluster".to_string(),
        }
    }

    #[tokio::test]
    async fn preserves_order_and_filters_debug() {
        let (events, reporter) = channel();
        let collector = tokio::spawn(reporter.collect());

        events
            .emit(Event::InitialPrimary { primary: primary() })
            .await;
        events
            .emit(Event::SentinelMessage {
                channel: "+sdown".to_string(),
                payload: "master mycluster 10.0.0.1 6379".to_string(),
            })
            .await;
        events
            .emit(Event::Timeout {
                after: Duration::from_secs(60),
            })
            .await;
        drop(events);

        let kinds = collector
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.event.kind())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["initial primary", "timeout"]);
    }

    #[tokio::test]
    async fn verbose_reporter_keeps_debug_events() {
        let (events, reporter) = channel();
        let collector = tokio::spawn(reporter.include_debug(true).collect());
        events
            .emit(Event::PodChanged {
                kind: PodEventKind::Added,
                name: "redis-0".to_string(),
                namespace: "db".to_string(),
            })
            .await;
        drop(events);
        let records = collector.await.unwrap();
        assert_eq!(records.len(), 1);
        let record = records[0].to_record();
        assert_eq!(record["debug"], "true");
        assert_eq!(record["type"], "ADDED");
    }

    #[tokio::test]
    async fn many_producers_never_lose_events() {
        let (events, reporter) = channel();
        let collector = tokio::spawn(reporter.collect());
        let mut producers = Vec::new();
        for client in 0..8 {
            let events = events.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50u64 {
                    events
                        .emit(Event::Done {
                            key: format!("client_{client}"),
                            total_reads: i,
                            stale_reads: 0,
                            error_rate: Some(0.0),
                        })
                        .await;
                }
            }));
        }
        drop(events);
        for producer in producers {
            producer.await.unwrap();
        }
        let records = collector.await.unwrap();
        assert_eq!(records.len(), 8 * 50);
    }

    #[test]
    fn record_columns_follow_field_order() {
        let record = EventRecord {
            at: SystemTime::UNIX_EPOCH,
            event: Event::WrongValue {
                key: "client_3".to_string(),
                got: None,
                expected: "7".to_string(),
            },
        };
        assert_eq!(
            record.columns(),
            vec!["time", "event", "key", "got", "expected"]
        );
        let rendered = record.to_record();
        assert_eq!(rendered["time"], "1970-01-01T00:00:00.000Z");
        assert_eq!(rendered["got"], "(nil)");
    }

    #[test]
    fn undefined_error_rate_is_not_numeric() {
        assert_eq!(format_rate(None), "n/a");
        assert_eq!(format_rate(Some(0.5)), "0.5000");
    }
}
