//! Shared helpers for integration tests: an in-process RESP server that acts
//! as a key-value node, a lagging replica of it, or a sentinel.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Timeout for anything a test waits on.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Key space shared by a primary and its replicas.
#[derive(Default)]
pub struct Store {
    current: Mutex<HashMap<String, String>>,
    /// Value each key held before its latest SET.
    previous: Mutex<HashMap<String, String>>,
}

/// Options for one fake server.
#[derive(Clone)]
pub struct FakeOptions {
    pub password: Option<String>,
    /// Serve GETs from the value before the latest write.
    pub lag_reads: bool,
    pub cluster: String,
    pub primary: (String, u16),
    pub replica: (String, u16),
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            password: None,
            lag_reads: false,
            cluster: "mycluster".to_string(),
            primary: ("10.0.0.1".to_string(), 6379),
            replica: ("10.0.0.2".to_string(), 6379),
        }
    }
}

struct Topology {
    primary: (String, u16),
    replica: (String, u16),
}

struct State {
    store: Arc<Store>,
    options: FakeOptions,
    topology: Mutex<Topology>,
    published: broadcast::Sender<(String, String)>,
}

/// A running fake server. Stops when dropped.
pub struct FakeRedis {
    addr: SocketAddr,
    state: Arc<State>,
    accept: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.accept.abort();
    }
}

impl FakeRedis {
    pub async fn start(options: FakeOptions) -> Self {
        Self::start_with_store(Arc::new(Store::default()), options).await
    }

    /// A second server over the same key space, e.g. a replica.
    pub async fn replica_of(primary: &FakeRedis, lag_reads: bool) -> Self {
        let options = FakeOptions {
            lag_reads,
            ..primary.state.options.clone()
        };
        Self::start_with_store(primary.state.store.clone(), options).await
    }

    async fn start_with_store(store: Arc<Store>, options: FakeOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (published, _) = broadcast::channel(64);
        let state = Arc::new(State {
            store,
            topology: Mutex::new(Topology {
                primary: options.primary.clone(),
                replica: options.replica.clone(),
            }),
            options,
            published,
        });
        let shutdown = CancellationToken::new();
        let accept_state = state.clone();
        let connections = shutdown.clone();
        let accept = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                let stop = connections.clone();
                tokio::spawn(async move {
                    // Dropping `serve` closes the socket.
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        result = serve(socket, state) => {
                            if let Err(err) = result {
                                tracing::debug!(error = ?err, "fake redis connection closed");
                            }
                        }
                    }
                });
            }
        });
        Self {
            addr,
            state,
            accept,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// Deliver a pub/sub message to every subscriber whose pattern matches.
    pub fn publish(&self, channel: &str, payload: &str) {
        let _ = self
            .state
            .published
            .send((channel.to_string(), payload.to_string()));
    }

    pub fn subscribers(&self) -> usize {
        self.state.published.receiver_count()
    }

    pub async fn wait_for_subscribers(&self, count: usize) {
        tokio::time::timeout(IO_TIMEOUT, async {
            while self.subscribers() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber never connected");
    }

    pub fn primary(&self) -> (String, u16) {
        self.state.topology.lock().unwrap().primary.clone()
    }

    /// Promote the replica and announce it, as a sentinel would.
    pub fn promote_replica(&self) {
        self.state.promote();
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.state.store.current.lock().unwrap().get(key).cloned()
    }
}

impl State {
    fn promote(&self) {
        let (old, new) = {
            let mut topology = self.topology.lock().unwrap();
            let Topology { primary, replica } = &mut *topology;
            std::mem::swap(primary, replica);
            (topology.replica.clone(), topology.primary.clone())
        };
        let payload = format!(
            "{} {} {} {} {}",
            self.options.cluster, old.0, old.1, new.0, new.1
        );
        let _ = self
            .published
            .send(("+switch-master".to_string(), payload));
    }

    fn execute(&self, args: &[String]) -> BytesFrame {
        let name = args[0].to_ascii_uppercase();
        match (name.as_str(), args.len()) {
            ("SELECT", 2) => ok(),
            ("PING", 1) => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
            ("GET", 2) => {
                let map = if self.options.lag_reads {
                    self.store.previous.lock().unwrap()
                } else {
                    self.store.current.lock().unwrap()
                };
                match map.get(&args[1]) {
                    Some(value) => bulk(value),
                    None => BytesFrame::Null,
                }
            }
            ("SET", 3) => {
                let old = self
                    .store
                    .current
                    .lock()
                    .unwrap()
                    .insert(args[1].clone(), args[2].clone());
                if let Some(old) = old {
                    self.store
                        .previous
                        .lock()
                        .unwrap()
                        .insert(args[1].clone(), old);
                }
                ok()
            }
            ("SENTINEL", 3) => self.sentinel(&args[1].to_ascii_lowercase(), &args[2]),
            (other, _) => error(&format!("ERR unknown command '{other}'")),
        }
    }

    fn sentinel(&self, sub: &str, cluster: &str) -> BytesFrame {
        if cluster != self.options.cluster {
            return match sub {
                "get-master-addr-by-name" => BytesFrame::Null,
                _ => error("ERR No such master with that name"),
            };
        }
        let (primary, replica) = {
            let topology = self.topology.lock().unwrap();
            (topology.primary.clone(), topology.replica.clone())
        };
        match sub {
            "get-master-addr-by-name" => BytesFrame::Array(vec![
                bulk(&primary.0),
                bulk(&primary.1.to_string()),
            ]),
            "master" => flat_map(&[
                ("name", cluster.to_string()),
                ("ip", primary.0),
                ("port", primary.1.to_string()),
                ("flags", "master".to_string()),
                ("quorum", "2".to_string()),
                ("config-epoch", "3".to_string()),
                ("num-slaves", "1".to_string()),
            ]),
            "replicas" | "slaves" => BytesFrame::Array(vec![flat_map(&[
                ("name", format!("{}:{}", replica.0, replica.1)),
                ("ip", replica.0),
                ("port", replica.1.to_string()),
                ("flags", "slave".to_string()),
                ("master-link-status", "ok".to_string()),
                ("slave-repl-offset", "4242".to_string()),
            ])]),
            "sentinels" => BytesFrame::Array(vec![flat_map(&[
                ("name", "0123456789abcdef".to_string()),
                ("ip", "10.0.0.9".to_string()),
                ("port", "26379".to_string()),
                ("flags", "sentinel".to_string()),
            ])]),
            "failover" => {
                self.promote();
                ok()
            }
            other => error(&format!("ERR unknown sentinel subcommand '{other}'")),
        }
    }
}

async fn serve(socket: TcpStream, state: Arc<State>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    let mut authenticated = state.options.password.is_none();
    while let Some(frame) = framed.next().await {
        let args = command_args(frame?)?;
        if args.is_empty() {
            continue;
        }
        let name = args[0].to_ascii_uppercase();
        if name == "AUTH" {
            let given = args.last().map(String::as_str);
            let reply = if args.len() >= 2 && state.options.password.as_deref() == given {
                authenticated = true;
                ok()
            } else {
                error("WRONGPASS invalid username-password pair or user is disabled.")
            };
            framed.send(reply).await?;
            continue;
        }
        if !authenticated {
            framed.send(error("NOAUTH Authentication required.")).await?;
            continue;
        }
        if name == "PSUBSCRIBE" && args.len() == 2 {
            return stream_messages(framed, state, args[1].clone()).await;
        }
        let reply = state.execute(&args);
        framed.send(reply).await?;
    }
    Ok(())
}

async fn stream_messages(
    mut framed: Framed<TcpStream, Resp2>,
    state: Arc<State>,
    pattern: String,
) -> anyhow::Result<()> {
    // Register before confirming so nothing published after the reply is lost.
    let mut published = state.published.subscribe();
    framed
        .send(BytesFrame::Array(vec![
            bulk("psubscribe"),
            bulk(&pattern),
            BytesFrame::Integer(1),
        ]))
        .await?;
    loop {
        tokio::select! {
            message = published.recv() => match message {
                Ok((channel, payload)) => {
                    if pattern_matches(&pattern, &channel) {
                        framed
                            .send(BytesFrame::Array(vec![
                                bulk("pmessage"),
                                bulk(&pattern),
                                bulk(&channel),
                                bulk(&payload),
                            ]))
                            .await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            frame = framed.next() => {
                if frame.is_none() {
                    return Ok(());
                }
            }
        }
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

fn command_args(frame: BytesFrame) -> anyhow::Result<Vec<String>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    parts
        .iter()
        .map(|part| match part {
            BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
                Ok(String::from_utf8_lossy(b).into_owned())
            }
            other => anyhow::bail!("unexpected argument frame {other:?}"),
        })
        .collect()
}

fn bulk(value: &str) -> BytesFrame {
    BytesFrame::BulkString(Bytes::copy_from_slice(value.as_bytes()))
}

fn ok() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

fn error(message: &str) -> BytesFrame {
    BytesFrame::Error(message.to_string().into())
}

fn flat_map(pairs: &[(&str, String)]) -> BytesFrame {
    BytesFrame::Array(
        pairs
            .iter()
            .flat_map(|(key, value)| [bulk(key), bulk(value)])
            .collect(),
    )
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
