//! Replication consistency probe.
//!
//! Each client owns one key and a writer/reader pair. The writer sets the
//! key to `0, 1, 2, ...` on the primary; after every write the reader fetches
//! the key from a replica and compares. Writer and reader advance in
//! lock-step through two single-slot channels, so exactly one write is
//! outstanding per pair at any time. A read that does not return the value
//! just written counts as stale.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::error::{DrillError, Result};
use crate::events::{Event, EventSender};
use crate::resp::{RedisEndpoint, RespClient};

/// A key/value connection owned by a single writer or reader task.
#[async_trait]
pub trait KvConnection: Send {
    async fn get(&mut self, key: &str) -> Result<Option<String>>;
    async fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

/// Opens one connection per task.
#[async_trait]
pub trait KvConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn KvConnection>>;
}

#[async_trait]
impl KvConnection for RespClient {
    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        RespClient::get(self, key).await
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        RespClient::set(self, key, value).await
    }
}

/// Connects to a Redis endpoint over RESP.
#[derive(Clone, Debug)]
pub struct RespConnector {
    endpoint: RedisEndpoint,
}

impl RespConnector {
    pub fn new(endpoint: RedisEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl KvConnector for RespConnector {
    async fn connect(&self) -> Result<Box<dyn KvConnection>> {
        let client = RespClient::connect(&self.endpoint).await?;
        Ok(Box::new(client))
    }
}

/// Read counts for one client key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub total_reads: u64,
    pub stale_reads: u64,
}

impl ProbeSummary {
    /// Stale reads over total reads; `None` when nothing was read.
    pub fn error_rate(&self) -> Option<f64> {
        if self.total_reads == 0 {
            None
        } else {
            Some(self.stale_reads as f64 / self.total_reads as f64)
        }
    }
}

impl Serialize for ProbeSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut summary = serializer.serialize_struct("ProbeSummary", 3)?;
        summary.serialize_field("total_reads", &self.total_reads)?;
        summary.serialize_field("stale_reads", &self.stale_reads)?;
        summary.serialize_field("error_rate", &self.error_rate())?;
        summary.end()
    }
}

/// Message from writer to reader.
enum Handoff {
    /// The key now holds this value on the primary.
    Written(String),
    Finished,
}

/// Run every pair to completion and return the per-key summaries.
///
/// The first failing task aborts the whole probe and its error is returned.
pub async fn run_probe(
    config: &ProbeConfig,
    writer: Arc<dyn KvConnector>,
    reader: Arc<dyn KvConnector>,
    events: EventSender,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, ProbeSummary>> {
    config.validate()?;
    let run = cancel.child_token();

    let mut pairs = Vec::with_capacity(config.clients);
    for client in 0..config.clients {
        let key = config.key(client);
        let (handoff_tx, handoff_rx) = mpsc::channel::<Handoff>(1);
        let (ack_tx, ack_rx) = mpsc::channel::<()>(1);

        let writer_task = tokio::spawn(cancellable(
            run.clone(),
            write_sequence(
                writer.clone(),
                key.clone(),
                config.operations,
                handoff_tx,
                ack_rx,
            ),
        ));
        let reader_task = tokio::spawn(cancellable(
            run.clone(),
            read_sequence(reader.clone(), key.clone(), handoff_rx, ack_tx, events.clone()),
        ));
        pairs.push((key, writer_task, reader_task));
    }
    drop(events);

    let mut summaries = BTreeMap::new();
    let mut first_error = None;
    for (key, writer_task, reader_task) in pairs {
        let written = join(writer_task).await;
        let read = join(reader_task).await;
        let err = match (written, read) {
            (Ok(()), Ok(summary)) => {
                summaries.insert(key, summary);
                continue;
            }
            (Err(DrillError::Cancelled { .. }), Err(err)) => err,
            (Err(err), _) | (Ok(()), Err(err)) => err,
        };
        // Pairs stopped by another pair's failure report `Cancelled`; keep
        // the failure that caused it.
        let replace = match &first_error {
            None => true,
            Some(DrillError::Cancelled { .. }) => !matches!(err, DrillError::Cancelled { .. }),
            Some(_) => false,
        };
        if replace {
            tracing::warn!(key = %key, error = %err, "probe client failed");
            first_error = Some(err);
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(DrillError::cancelled("replication probe cancelled"));
    }
    Ok(summaries)
}

async fn cancellable<T>(
    token: CancellationToken,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(DrillError::cancelled("replication probe cancelled")),
        result = work => result,
    };
    if result.is_err() {
        // One failed task stops every pair.
        token.cancel();
    }
    result
}

async fn join<T>(task: JoinHandle<Result<T>>) -> Result<T> {
    task.await.map_err(|err| DrillError::Task {
        message: format!("probe task failed: {err}"),
    })?
}

async fn write_sequence(
    connector: Arc<dyn KvConnector>,
    key: String,
    operations: usize,
    handoff: mpsc::Sender<Handoff>,
    mut acks: mpsc::Receiver<()>,
) -> Result<()> {
    let mut conn = connector.connect().await?;
    for value in 0..operations {
        let value = value.to_string();
        conn.set(&key, &value).await?;
        if handoff.send(Handoff::Written(value)).await.is_err() {
            return Err(reader_gone(&key));
        }
        if acks.recv().await.is_none() {
            return Err(reader_gone(&key));
        }
    }
    if handoff.send(Handoff::Finished).await.is_err() {
        return Err(reader_gone(&key));
    }
    Ok(())
}

/// A pair member only stops early after its own failure, which is reported
/// by that task. The survivor reports `Cancelled` so it never outranks it.
fn reader_gone(key: &str) -> DrillError {
    DrillError::cancelled(format!("reader for {key} stopped before the writer finished"))
}

fn writer_gone(key: &str, what: &str) -> DrillError {
    DrillError::cancelled(format!("writer for {key} {what}"))
}

async fn read_sequence(
    connector: Arc<dyn KvConnector>,
    key: String,
    mut handoff: mpsc::Receiver<Handoff>,
    acks: mpsc::Sender<()>,
    events: EventSender,
) -> Result<ProbeSummary> {
    let mut conn = connector.connect().await?;
    let mut summary = ProbeSummary::default();
    loop {
        match handoff.recv().await {
            Some(Handoff::Written(expected)) => {
                let got = conn.get(&key).await?;
                summary.total_reads += 1;
                if got.as_deref() != Some(expected.as_str()) {
                    summary.stale_reads += 1;
                    events
                        .emit(Event::WrongValue {
                            key: key.clone(),
                            got,
                            expected,
                        })
                        .await;
                }
                if acks.send(()).await.is_err() {
                    return Err(writer_gone(&key, "stopped waiting for reads"));
                }
            }
            Some(Handoff::Finished) => break,
            None => return Err(writer_gone(&key, "stopped without finishing")),
        }
    }
    events
        .emit(Event::Done {
            key,
            total_reads: summary.total_reads,
            stale_reads: summary.stale_reads,
            error_rate: summary.error_rate(),
        })
        .await;
    Ok(summary)
}
