//! Sentinel coordinator adapter: primary lookup, administrative commands and
//! promotion notifications.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis_protocol::resp2::types::BytesFrame;
use tokio_util::sync::CancellationToken;

use crate::error::{DrillError, Result};
use crate::resp::{decode_string_slice, PubSubMessage, RedisEndpoint, RespClient};

/// Channel on which the coordinator announces a new primary.
pub const PROMOTION_CHANNEL: &str = "+switch-master";

/// Stream of pub/sub deliveries from the coordinator.
pub type MessageStream = BoxStream<'static, Result<PubSubMessage>>;

/// Where the coordinator says the primary of `cluster_name` lives.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct PrimaryLocation {
    pub host: String,
    pub port: u16,
    pub cluster_name: String,
}

impl PrimaryLocation {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PrimaryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Payload of a `+switch-master` notification:
/// `<cluster> <old-host> <old-port> <new-host> <new-port>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromotionEvent {
    pub cluster_name: String,
    pub old_host: String,
    pub old_port: u16,
    pub new_host: String,
    pub new_port: u16,
}

impl PromotionEvent {
    /// True when the notification's previous primary is `primary`.
    pub fn replaced(&self, primary: &PrimaryLocation) -> bool {
        self.old_host == primary.host && self.old_port == primary.port
    }

    /// True when the notification's new primary is `primary`.
    pub fn promoted(&self, primary: &PrimaryLocation) -> bool {
        self.new_host == primary.host && self.new_port == primary.port
    }

    pub fn new_primary(&self) -> PrimaryLocation {
        PrimaryLocation {
            host: self.new_host.clone(),
            port: self.new_port,
            cluster_name: self.cluster_name.clone(),
        }
    }
}

impl FromStr for PromotionEvent {
    type Err = DrillError;

    fn from_str(payload: &str) -> Result<Self> {
        let tokens = payload.split_whitespace().collect::<Vec<_>>();
        let [cluster, old_host, old_port, new_host, new_port] = tokens.as_slice() else {
            return Err(DrillError::protocol(format!(
                "promotion payload must have 5 tokens, got {}: {payload:?}",
                tokens.len()
            )));
        };
        let port = |raw: &str| {
            raw.parse::<u16>().map_err(|_| {
                DrillError::protocol(format!("invalid port {raw:?} in promotion payload"))
            })
        };
        Ok(Self {
            cluster_name: cluster.to_string(),
            old_host: old_host.to_string(),
            old_port: port(*old_port)?,
            new_host: new_host.to_string(),
            new_port: port(*new_port)?,
        })
    }
}

impl fmt::Display for PromotionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.cluster_name, self.old_host, self.old_port, self.new_host, self.new_port
        )
    }
}

/// The coordinator as seen by the failover drill.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Ask for the current primary of `cluster_name`.
    async fn query_primary(&self, cluster_name: &str) -> Result<PrimaryLocation>;

    /// Pattern-subscribe to coordinator notifications.
    async fn subscribe(&self, pattern: &str) -> Result<MessageStream>;
}

/// Sentinel client. Every call opens its own connection, so one handle can
/// be shared by concurrent tasks without locking.
#[derive(Clone, Debug)]
pub struct SentinelClient {
    endpoint: RedisEndpoint,
}

impl SentinelClient {
    pub fn new(endpoint: RedisEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &RedisEndpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<RespClient> {
        RespClient::connect(&self.endpoint).await
    }

    /// `SENTINEL master <name>`.
    pub async fn master(&self, cluster_name: &str) -> Result<BTreeMap<String, String>> {
        let mut conn = self.connect().await?;
        conn.string_map(&["SENTINEL", "master", cluster_name]).await
    }

    /// `SENTINEL replicas <name>`.
    pub async fn replicas(&self, cluster_name: &str) -> Result<Vec<BTreeMap<String, String>>> {
        let mut conn = self.connect().await?;
        conn.string_map_slice(&["SENTINEL", "replicas", cluster_name])
            .await
    }

    /// `SENTINEL sentinels <name>`.
    pub async fn sentinels(&self, cluster_name: &str) -> Result<Vec<BTreeMap<String, String>>> {
        let mut conn = self.connect().await?;
        conn.string_map_slice(&["SENTINEL", "sentinels", cluster_name])
            .await
    }

    /// `SENTINEL failover <name>`: ask the coordinator for a soft failover.
    pub async fn failover(&self, cluster_name: &str) -> Result<String> {
        let mut conn = self.connect().await?;
        conn.text(&["SENTINEL", "failover", cluster_name]).await
    }
}

#[async_trait]
impl Coordinator for SentinelClient {
    async fn query_primary(&self, cluster_name: &str) -> Result<PrimaryLocation> {
        let mut conn = self.connect().await?;
        let reply = conn
            .command(&["SENTINEL", "get-master-addr-by-name", cluster_name])
            .await?;
        if matches!(reply, BytesFrame::Null) {
            return Err(DrillError::protocol(format!(
                "coordinator does not know cluster {cluster_name:?}"
            )));
        }
        let addr = decode_string_slice(reply)?;
        let [host, port] = addr.as_slice() else {
            return Err(DrillError::protocol(format!(
                "get-master-addr-by-name returned {} elements, expected 2",
                addr.len()
            )));
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| DrillError::protocol(format!("invalid primary port {port:?}")))?;
        Ok(PrimaryLocation {
            host: host.clone(),
            port,
            cluster_name: cluster_name.to_string(),
        })
    }

    async fn subscribe(&self, pattern: &str) -> Result<MessageStream> {
        let conn = self.connect().await?;
        Ok(conn.psubscribe(pattern).await?.into_stream())
    }
}

/// Wait for the next promotion of `cluster_name`. Promotions of other
/// clusters are skipped.
pub async fn wait_for_promotion(
    coordinator: &dyn Coordinator,
    cluster_name: &str,
    cancel: &CancellationToken,
) -> Result<PromotionEvent> {
    let mut messages = coordinator.subscribe(PROMOTION_CHANNEL).await?;
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DrillError::cancelled("stopped waiting for a promotion"));
            }
            message = messages.next() => message,
        };
        let Some(message) = message else {
            return Err(DrillError::connection(
                "coordinator subscription closed before a promotion",
            ));
        };
        let message = message?;
        if message.channel != PROMOTION_CHANNEL {
            continue;
        }
        let promotion: PromotionEvent = message.payload.parse()?;
        if promotion.cluster_name == cluster_name {
            return Ok(promotion);
        }
        tracing::debug!(cluster = %promotion.cluster_name, "skipping promotion of another cluster");
    }
}
