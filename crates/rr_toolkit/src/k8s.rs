//! Kubernetes adapter: pod lookup, deletion with a grace period and a
//! namespace-wide pod watch that survives server-side watch timeouts.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::error::{DrillError, Result};

/// Server-side timeout for one watch request; the stream reconnects after it.
const WATCH_TIMEOUT_SECS: u32 = 60;
/// Pause before re-opening a watch that failed to start.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Namespace used when neither the caller nor the kubeconfig names one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Kind of change reported by a pod watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for PodEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodEventKind::Added => "ADDED",
            PodEventKind::Modified => "MODIFIED",
            PodEventKind::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// One pod change observed by the watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub name: String,
    pub namespace: String,
    /// The pod already carries a deletion timestamp.
    pub terminating: bool,
}

pub type PodEventStream = BoxStream<'static, Result<PodEvent>>;

/// Pod operations the failover drill needs from the orchestrator.
#[async_trait]
pub trait PodControl: Send + Sync + 'static {
    /// Get the pod by name and return its resource version.
    async fn resource_version(&self, name: &str, namespace: &str) -> Result<String>;

    /// Delete the pod. A missing pod is `DrillError::NotFound`.
    async fn delete(&self, name: &str, namespace: &str, grace_period: Duration) -> Result<()>;

    /// Watch all pods in `namespace`, starting after `resource_version`.
    async fn watch(&self, namespace: &str, resource_version: &str) -> Result<PodEventStream>;
}

/// Maps the primary's advertised host name to the pod that runs it.
pub trait PodNameStrategy: Send + Sync {
    fn pod_name(&self, host: &str) -> Result<String>;
}

impl<F> PodNameStrategy for F
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    fn pod_name(&self, host: &str) -> Result<String> {
        self(host)
    }
}

/// Headless-service naming: `redis-0.redis.db.svc.cluster.local` runs in pod
/// `redis-0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstHostLabel;

impl PodNameStrategy for FirstHostLabel {
    fn pod_name(&self, host: &str) -> Result<String> {
        match host.split('.').next() {
            Some(label) if !label.is_empty() => Ok(label.to_string()),
            _ => Err(DrillError::config(format!(
                "cannot derive a pod name from host {host:?}"
            ))),
        }
    }
}

/// Explicit namespace wins, then the kubeconfig context, then `default`.
pub fn resolve_namespace(explicit: Option<&str>, inferred: Option<&str>) -> String {
    explicit
        .filter(|ns| !ns.is_empty())
        .or(inferred.filter(|ns| !ns.is_empty()))
        .unwrap_or(DEFAULT_NAMESPACE)
        .to_string()
}

/// `PodControl` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePods {
    client: kube::Client,
    default_namespace: String,
}

impl KubePods {
    /// Build a client from `kubeconfig`, or infer one (in-cluster or
    /// `$KUBECONFIG` / `~/.kube/config`) when no path is given.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let raw = Kubeconfig::read_from(path).map_err(|err| {
                    DrillError::config(format!("read kubeconfig {}: {err}", path.display()))
                })?;
                kube::Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
                    .await
                    .map_err(|err| {
                        DrillError::config(format!("load kubeconfig {}: {err}", path.display()))
                    })?
            }
            None => kube::Config::infer()
                .await
                .map_err(|err| DrillError::config(format!("infer kubernetes config: {err}")))?,
        };
        let default_namespace = config.default_namespace.clone();
        let client = kube::Client::try_from(config)
            .map_err(|err| DrillError::connection(format!("build kubernetes client: {err}")))?;
        Ok(Self {
            client,
            default_namespace,
        })
    }

    /// Namespace of the kubeconfig's current context.
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodControl for KubePods {
    async fn resource_version(&self, name: &str, namespace: &str) -> Result<String> {
        let pod = self
            .pods(namespace)
            .get(name)
            .await
            .map_err(|err| classify(err, "get pod", name, namespace))?;
        Ok(pod.metadata.resource_version.unwrap_or_default())
    }

    async fn delete(&self, name: &str, namespace: &str, grace_period: Duration) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(grace_period.as_secs().min(u32::MAX as u64) as u32),
            ..DeleteParams::default()
        };
        self.pods(namespace)
            .delete(name, &params)
            .await
            .map_err(|err| classify(err, "delete pod", name, namespace))?;
        Ok(())
    }

    async fn watch(&self, namespace: &str, resource_version: &str) -> Result<PodEventStream> {
        let api = self.pods(namespace);
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        // The first watch is opened eagerly so a bad namespace or missing RBAC
        // fails the caller instead of retrying forever.
        let first = api
            .watch(&params, resource_version)
            .await
            .map_err(|err| classify(err, "watch pods", "*", namespace))?
            .boxed();
        let state = WatchState {
            api,
            namespace: namespace.to_string(),
            version: resource_version.to_string(),
            inner: Some(first),
        };
        Ok(stream::unfold(state, next_pod_event).boxed())
    }
}

struct WatchState {
    api: Api<Pod>,
    namespace: String,
    version: String,
    inner: Option<BoxStream<'static, kube::Result<WatchEvent<Pod>>>>,
}

async fn next_pod_event(mut state: WatchState) -> Option<(Result<PodEvent>, WatchState)> {
    loop {
        let Some(inner) = state.inner.as_mut() else {
            let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
            match state.api.watch(&params, &state.version).await {
                Ok(events) => state.inner = Some(events.boxed()),
                Err(err) => {
                    tracing::warn!(
                        namespace = %state.namespace,
                        error = %err,
                        "pod watch failed to restart; retrying"
                    );
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                }
            }
            continue;
        };

        let next = inner.next().await;
        let (kind, pod) = match next {
            None => {
                tracing::debug!(namespace = %state.namespace, version = %state.version, "pod watch closed; restarting");
                state.inner = None;
                continue;
            }
            Some(Err(err)) => {
                tracing::warn!(namespace = %state.namespace, error = %err, "pod watch interrupted; restarting");
                state.inner = None;
                continue;
            }
            Some(Ok(WatchEvent::Added(pod))) => (PodEventKind::Added, pod),
            Some(Ok(WatchEvent::Modified(pod))) => (PodEventKind::Modified, pod),
            Some(Ok(WatchEvent::Deleted(pod))) => (PodEventKind::Deleted, pod),
            Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                state.version = bookmark.metadata.resource_version;
                continue;
            }
            Some(Ok(WatchEvent::Error(resp))) if resp.code == 410 => {
                // Our resource version was compacted away; resume from "now".
                tracing::debug!(namespace = %state.namespace, "pod watch version expired; relisting");
                state.inner = None;
                match state
                    .api
                    .list_metadata(&ListParams::default().limit(1))
                    .await
                {
                    Ok(list) => state.version = list.metadata.resource_version.unwrap_or_default(),
                    Err(err) => {
                        tracing::warn!(namespace = %state.namespace, error = %err, "relist failed");
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                    }
                }
                continue;
            }
            Some(Ok(WatchEvent::Error(resp))) => {
                let err = DrillError::orchestrator(format!(
                    "pod watch in {}: {} ({})",
                    state.namespace, resp.message, resp.code
                ));
                state.inner = None;
                return Some((Err(err), state));
            }
        };

        if let Some(version) = pod.metadata.resource_version.clone() {
            state.version = version;
        }
        let event = PodEvent {
            kind,
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| state.namespace.clone()),
            terminating: pod.metadata.deletion_timestamp.is_some(),
        };
        return Some((Ok(event), state));
    }
}

fn classify(err: kube::Error, action: &str, name: &str, namespace: &str) -> DrillError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => DrillError::NotFound {
            kind: "pod",
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        kube::Error::Api(resp) => DrillError::orchestrator(format!(
            "{action} {name} in {namespace}: {} ({})",
            resp.message, resp.code
        )),
        kube::Error::HyperError(err) => {
            DrillError::connection(format!("{action} {name} in {namespace}: {err}"))
        }
        kube::Error::Service(err) => {
            DrillError::connection(format!("{action} {name} in {namespace}: {err}"))
        }
        other => DrillError::orchestrator(format!("{action} {name} in {namespace}: {other}")),
    }
}
