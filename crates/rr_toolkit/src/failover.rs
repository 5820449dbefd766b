//! Failover drill.
//!
//! Kills the pod running the current primary, keeps killing it whenever it
//! comes back, and waits for the coordinator to announce a promotion. Three
//! tasks race for a single result slot:
//!
//! * the promotion watcher, which validates the `+switch-master`
//!   notification against the primary recorded before the drill and against
//!   a fresh coordinator query;
//! * the kill loop, which only ever reports failures;
//! * the timeout, which starts counting once the first delete was attempted.
//!
//! The first result wins. The losers are stopped through a drill-scoped
//! cancellation token, and the primary is queried once more regardless of
//! the outcome.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::DrillConfig;
use crate::error::{DrillError, Result};
use crate::events::{Event, EventSender};
use crate::k8s::{FirstHostLabel, PodControl, PodEventKind, PodNameStrategy};
use crate::sentinel::{Coordinator, MessageStream, PrimaryLocation, PromotionEvent, PROMOTION_CHANNEL};

/// Pattern subscribed on the coordinator. Non-promotion traffic is reported
/// as debug events.
pub const NOTIFICATION_PATTERN: &str = "*";

/// Tasks that may write to the result slot.
const RACERS: usize = 3;

type RaceResult = Result<PrimaryLocation>;

/// Outcome of a successful drill.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrillReport {
    pub initial_primary: PrimaryLocation,
    pub pod_name: String,
    /// Primary confirmed by the promotion watcher.
    pub promoted_primary: PrimaryLocation,
    /// Primary reported by the coordinator after the race.
    pub final_primary: PrimaryLocation,
}

/// Collaborators of one drill. Each run builds its own.
pub struct FailoverDrill {
    coordinator: Arc<dyn Coordinator>,
    pods: Arc<dyn PodControl>,
    naming: Arc<dyn PodNameStrategy>,
    events: EventSender,
}

impl FailoverDrill {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        pods: Arc<dyn PodControl>,
        events: EventSender,
    ) -> Self {
        Self {
            coordinator,
            pods,
            naming: Arc::new(FirstHostLabel),
            events,
        }
    }

    /// Replace the host-name-to-pod mapping.
    pub fn with_naming(mut self, naming: Arc<dyn PodNameStrategy>) -> Self {
        self.naming = naming;
        self
    }

    pub async fn run(&self, config: &DrillConfig, cancel: &CancellationToken) -> Result<DrillReport> {
        config.validate()?;
        let cluster = config.cluster_name.as_str();

        let initial = self.coordinator.query_primary(cluster).await?;
        self.events
            .emit(Event::InitialPrimary {
                primary: initial.clone(),
            })
            .await;

        let pod_name = match &config.pod_name {
            Some(name) => name.clone(),
            None => self.naming.pod_name(&initial.host)?,
        };
        self.events
            .emit(Event::TargetPod {
                name: pod_name.clone(),
                namespace: config.namespace.clone(),
            })
            .await;

        // Subscribe before the first delete so a fast promotion is not missed.
        let notifications = self.coordinator.subscribe(NOTIFICATION_PATTERN).await?;

        let race = cancel.child_token();
        let (slot, mut decided) = mpsc::channel::<RaceResult>(RACERS);

        let watch = PromotionWatch {
            coordinator: self.coordinator.clone(),
            notifications,
            initial: initial.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(watch_for_promotion(watch, slot.clone(), race.clone()));

        let (first_delete, deleted) = oneshot::channel();

        let target = PodTarget {
            name: pod_name.clone(),
            namespace: config.namespace.clone(),
            grace_period: config.grace_period,
        };
        tokio::spawn(keep_pod_dead(
            self.pods.clone(),
            target,
            self.events.clone(),
            first_delete,
            slot.clone(),
            race.clone(),
        ));

        tokio::spawn(expire_after(
            config.timeout,
            deleted,
            slot,
            race.clone(),
        ));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DrillError::cancelled("failover drill cancelled")),
            result = decided.recv() => result.unwrap_or_else(|| Err(DrillError::Task {
                message: "every racer exited without a result".to_string(),
            })),
        };
        race.cancel();
        drop(decided);
        // Only the winning result is reported.
        if let Err(DrillError::Timeout { after }) = &outcome {
            self.events.emit(Event::Timeout { after: *after }).await;
        }

        let final_primary = self.coordinator.query_primary(cluster).await;
        match &final_primary {
            Ok(primary) => {
                self.events
                    .emit(Event::FinalPrimary {
                        primary: primary.clone(),
                    })
                    .await;
            }
            Err(err) => tracing::warn!(cluster, error = %err, "final primary query failed"),
        }

        let promoted_primary = outcome?;
        let final_primary = final_primary?;
        if final_primary != promoted_primary {
            tracing::warn!(
                cluster,
                promoted = %promoted_primary,
                current = %final_primary,
                "primary moved again after the confirmed promotion"
            );
        }
        Ok(DrillReport {
            initial_primary: initial,
            pod_name,
            promoted_primary,
            final_primary,
        })
    }
}

/// Run one drill with the default pod naming.
pub async fn run_failover_drill(
    config: &DrillConfig,
    coordinator: Arc<dyn Coordinator>,
    pods: Arc<dyn PodControl>,
    events: EventSender,
    cancel: &CancellationToken,
) -> Result<DrillReport> {
    FailoverDrill::new(coordinator, pods, events)
        .run(config, cancel)
        .await
}

/// Write a racer's result unless the race is already decided.
fn decide(slot: &mpsc::Sender<RaceResult>, result: RaceResult, racer: &'static str) {
    if let Err(err) = slot.try_send(result) {
        tracing::debug!(racer, "race already decided; dropping late result: {err}");
    }
}

struct PromotionWatch {
    coordinator: Arc<dyn Coordinator>,
    notifications: MessageStream,
    initial: PrimaryLocation,
    events: EventSender,
}

async fn watch_for_promotion(
    watch: PromotionWatch,
    slot: mpsc::Sender<RaceResult>,
    race: CancellationToken,
) {
    let result = tokio::select! {
        _ = race.cancelled() => return,
        result = watch.confirm() => result,
    };
    decide(&slot, result, "promotion watcher");
}

impl PromotionWatch {
    async fn confirm(mut self) -> RaceResult {
        let cluster = self.initial.cluster_name.clone();
        while let Some(message) = self.notifications.next().await {
            let message = message?;
            self.events
                .emit(Event::SentinelMessage {
                    channel: message.channel.clone(),
                    payload: message.payload.clone(),
                })
                .await;
            if message.channel != PROMOTION_CHANNEL {
                continue;
            }

            let promotion: PromotionEvent = message.payload.parse()?;
            if promotion.cluster_name != cluster {
                tracing::info!(
                    cluster = %promotion.cluster_name,
                    expected = %cluster,
                    "ignoring promotion for another cluster"
                );
                self.events
                    .emit(Event::IgnoredPromotion { promotion })
                    .await;
                continue;
            }
            self.events
                .emit(Event::Promotion {
                    promotion: promotion.clone(),
                })
                .await;

            if !promotion.replaced(&self.initial) {
                let reason = format!(
                    "promotion replaced {}:{} but the drill started with primary {}",
                    promotion.old_host, promotion.old_port, self.initial
                );
                return Err(reject(&self.events, reason).await);
            }
            let current = self.coordinator.query_primary(&cluster).await?;
            if !promotion.promoted(&current) {
                let reason = format!(
                    "promotion announced {}:{} but the coordinator reports {}",
                    promotion.new_host, promotion.new_port, current
                );
                return Err(reject(&self.events, reason).await);
            }
            return Ok(current);
        }
        Err(DrillError::connection(
            "coordinator subscription closed before a promotion",
        ))
    }
}

async fn reject(events: &EventSender, reason: String) -> DrillError {
    events
        .emit(Event::VerificationError {
            reason: reason.clone(),
        })
        .await;
    DrillError::mismatch(reason)
}

struct PodTarget {
    name: String,
    namespace: String,
    grace_period: Duration,
}

async fn keep_pod_dead(
    pods: Arc<dyn PodControl>,
    target: PodTarget,
    events: EventSender,
    first_delete: oneshot::Sender<()>,
    slot: mpsc::Sender<RaceResult>,
    race: CancellationToken,
) {
    let result = tokio::select! {
        _ = race.cancelled() => return,
        result = kill_loop(pods.as_ref(), &target, &events, first_delete) => result,
    };
    let err = match result {
        Ok(()) => DrillError::orchestrator(format!(
            "pod watch in {} ended while keeping {} dead",
            target.namespace, target.name
        )),
        Err(err) => err,
    };
    decide(&slot, Err(err), "kill loop");
}

/// Delete the target, then delete it again every time it is (re)created or
/// modified. Only returns on failure or when the watch ends. `first_delete`
/// fires once the initial delete has been attempted.
async fn kill_loop(
    pods: &dyn PodControl,
    target: &PodTarget,
    events: &EventSender,
    first_delete: oneshot::Sender<()>,
) -> Result<()> {
    let version = pods
        .resource_version(&target.name, &target.namespace)
        .await
        .map_err(|err| {
            if err.is_not_found() {
                DrillError::orchestrator(format!(
                    "pod {} in {} does not exist; nothing to kill",
                    target.name, target.namespace
                ))
            } else {
                err
            }
        })?;
    let mut changes = pods.watch(&target.namespace, &version).await?;

    let deleted = delete_pod(pods, target, events, true).await;
    let _ = first_delete.send(());
    deleted?;

    while let Some(change) = changes.next().await {
        let change = change?;
        if change.name != target.name {
            continue;
        }
        events
            .emit(Event::PodChanged {
                kind: change.kind,
                name: change.name.clone(),
                namespace: change.namespace.clone(),
            })
            .await;
        match change.kind {
            // A pod that already has a deletion timestamp is on its way out.
            PodEventKind::Added | PodEventKind::Modified if !change.terminating => {
                delete_pod(pods, target, events, false).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Delete once. A missing pod is only an error on the first delete.
async fn delete_pod(
    pods: &dyn PodControl,
    target: &PodTarget,
    events: &EventSender,
    required: bool,
) -> Result<()> {
    match pods
        .delete(&target.name, &target.namespace, target.grace_period)
        .await
    {
        Ok(()) => {
            events
                .emit(Event::PodDeleted {
                    name: target.name.clone(),
                    namespace: target.namespace.clone(),
                })
                .await;
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            events
                .emit(Event::PodNotFound {
                    name: target.name.clone(),
                    namespace: target.namespace.clone(),
                })
                .await;
            if required {
                Err(DrillError::orchestrator(format!(
                    "pod {} in {} vanished before the first delete",
                    target.name, target.namespace
                )))
            } else {
                Ok(())
            }
        }
        Err(err) => Err(err),
    }
}

async fn expire_after(
    timeout: Duration,
    deleted: oneshot::Receiver<()>,
    slot: mpsc::Sender<RaceResult>,
    race: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = race.cancelled() => return,
        started = deleted => {
            // A kill loop that failed before deleting reports its own error.
            if started.is_err() {
                return;
            }
        }
    }
    tokio::select! {
        biased;
        _ = race.cancelled() => return,
        _ = tokio::time::sleep(timeout) => {}
    }
    decide(&slot, Err(DrillError::Timeout { after: timeout }), "timeout");
}
