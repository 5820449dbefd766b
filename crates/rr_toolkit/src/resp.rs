//! RESP2 client for the key-value store and its sentinel coordinator.
//!
//! This is a thin request/response adapter: one command in flight per
//! connection, no retries, no interpretation of payloads beyond framing and
//! typed result decoding.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Url;

use crate::error::{DrillError, Result};

/// Port assumed when an endpoint omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Connection target parsed from `redis://[user][:password@]host[:port][/db]`
/// or a bare `host:port`.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: Option<u32>,
}

impl RedisEndpoint {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DrillError::config("redis url must not be empty"));
        }
        if !input.contains("://") {
            return Self::parse_host_port(input);
        }

        let url = Url::parse(input)
            .map_err(|err| DrillError::config(format!("invalid redis url {input:?}: {err}")))?;
        if url.scheme() != "redis" {
            return Err(DrillError::config(format!(
                "unsupported scheme {:?} in {input:?} (expected redis://)",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| DrillError::config(format!("missing host in {input:?}")))?
            .to_string();
        let username = Some(url.username())
            .filter(|user| !user.is_empty())
            .map(str::to_string);
        let db = match url.path().trim_start_matches('/') {
            "" => None,
            db => Some(
                db.parse::<u32>()
                    .map_err(|_| DrillError::config(format!("invalid database {db:?} in url")))?,
            ),
        };
        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password: url.password().map(str::to_string),
            db,
        })
    }

    fn parse_host_port(input: &str) -> Result<Self> {
        let (host, port) = match input.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| DrillError::config(format!("invalid port in {input:?}")))?;
                (host, port)
            }
            None => (input, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(DrillError::config(format!("missing host in {input:?}")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            username: None,
            password: None,
            db: None,
        })
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Credentials stay out of logs and error messages.
impl fmt::Display for RedisEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(db) = self.db {
            write!(f, "/{db}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RedisEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .finish()
    }
}

/// A single RESP2 connection.
pub struct RespClient {
    framed: Framed<TcpStream, Resp2>,
    addr: String,
}

impl RespClient {
    /// Connect and run `AUTH` / `SELECT` when the endpoint carries them.
    pub async fn connect(endpoint: &RedisEndpoint) -> Result<Self> {
        let addr = endpoint.addr();
        let socket = TcpStream::connect(&addr)
            .await
            .map_err(|err| DrillError::connection(format!("connect to {addr}: {err}")))?;
        socket.set_nodelay(true).ok();
        let mut client = Self {
            framed: Framed::new(socket, Resp2::default()),
            addr,
        };

        if let Some(password) = endpoint.password.as_deref() {
            let mut args = vec!["AUTH"];
            if let Some(user) = endpoint.username.as_deref() {
                args.push(user);
            }
            args.push(password);
            client.expect_ok(&args).await?;
        }
        if let Some(db) = endpoint.db {
            let db = db.to_string();
            client.expect_ok(&["SELECT", &db]).await?;
        }
        tracing::debug!(addr = %client.addr, "resp connection established");
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one command and read exactly one reply frame.
    ///
    /// Error replies are surfaced as `DrillError::Protocol`.
    pub async fn command(&mut self, args: &[&str]) -> Result<BytesFrame> {
        let name = args.first().copied().unwrap_or("<empty>");
        self.framed
            .send(make_command(args))
            .await
            .map_err(|err| DrillError::connection(format!("send {name} to {}: {err}", self.addr)))?;

        match self.framed.next().await {
            Some(Ok(BytesFrame::Error(err))) => Err(DrillError::protocol(format!(
                "{name} rejected by {}: {err}",
                self.addr
            ))),
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) => Err(DrillError::protocol(format!(
                "decode {name} reply from {}: {err}",
                self.addr
            ))),
            None => Err(DrillError::connection(format!(
                "{} closed the connection",
                self.addr
            ))),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.command(&["GET", key]).await? {
            BytesFrame::Null => Ok(None),
            BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => {
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            other => Err(DrillError::protocol(format!(
                "unexpected GET response: {other:?}"
            ))),
        }
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.expect_ok(&["SET", key, value]).await
    }

    pub async fn string_slice(&mut self, args: &[&str]) -> Result<Vec<String>> {
        decode_string_slice(self.command(args).await?)
    }

    pub async fn string_map(&mut self, args: &[&str]) -> Result<BTreeMap<String, String>> {
        decode_string_map(self.command(args).await?)
    }

    pub async fn string_map_slice(
        &mut self,
        args: &[&str],
    ) -> Result<Vec<BTreeMap<String, String>>> {
        decode_string_map_slice(self.command(args).await?)
    }

    /// Issue a command whose reply is a status or bulk string.
    pub async fn text(&mut self, args: &[&str]) -> Result<String> {
        let frame = self.command(args).await?;
        frame_to_string(&frame)
            .ok_or_else(|| DrillError::protocol(format!("expected string reply, got {frame:?}")))
    }

    async fn expect_ok(&mut self, args: &[&str]) -> Result<()> {
        match self.command(args).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
            other => Err(DrillError::protocol(format!(
                "unexpected {} response: {other:?}",
                args.first().copied().unwrap_or("<empty>")
            ))),
        }
    }

    /// Switch this connection into pattern-subscribe mode.
    pub async fn psubscribe(mut self, pattern: &str) -> Result<Subscription> {
        let reply = self.command(&["PSUBSCRIBE", pattern]).await?;
        let confirmed = match &reply {
            BytesFrame::Array(items) => {
                items.first().and_then(frame_to_string).as_deref() == Some("psubscribe")
            }
            _ => false,
        };
        if !confirmed {
            return Err(DrillError::protocol(format!(
                "unexpected PSUBSCRIBE confirmation: {reply:?}"
            )));
        }
        tracing::debug!(addr = %self.addr, pattern, "subscribed");
        Ok(Subscription {
            framed: self.framed,
            addr: self.addr,
        })
    }
}

/// One pub/sub delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubMessage {
    pub pattern: Option<String>,
    pub channel: String,
    pub payload: String,
}

/// A connection in subscribe mode. Infinite until the server hangs up.
pub struct Subscription {
    framed: Framed<TcpStream, Resp2>,
    addr: String,
}

impl Subscription {
    /// Next message, skipping subscription confirmations. `None` on EOF.
    pub async fn next_message(&mut self) -> Result<Option<PubSubMessage>> {
        loop {
            let frame = match self.framed.next().await {
                None => return Ok(None),
                Some(Err(err)) => {
                    return Err(DrillError::protocol(format!(
                        "decode pub/sub frame from {}: {err}",
                        self.addr
                    )))
                }
                Some(Ok(frame)) => frame,
            };
            if let Some(message) = parse_pubsub_frame(frame)? {
                return Ok(Some(message));
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<PubSubMessage>> {
        stream::unfold(Some(self), |state| async move {
            let mut sub = state?;
            match sub.next_message().await {
                Ok(Some(message)) => Some((Ok(message), Some(sub))),
                Ok(None) => None,
                // A framing error leaves the connection unusable; end after reporting it.
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }
}

/// Build a RESP command array.
pub fn make_command(args: &[&str]) -> BytesFrame {
    BytesFrame::Array(
        args.iter()
            .map(|arg| BytesFrame::BulkString(Bytes::copy_from_slice(arg.as_bytes())))
            .collect(),
    )
}

/// Scalar frame rendered as text; `None` for arrays, nulls and errors.
pub fn frame_to_string(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        BytesFrame::Integer(value) => Some(value.to_string()),
        _ => None,
    }
}

pub fn decode_string_slice(frame: BytesFrame) -> Result<Vec<String>> {
    match frame {
        BytesFrame::Array(items) => items
            .iter()
            .map(|item| {
                frame_to_string(item).ok_or_else(|| {
                    DrillError::protocol(format!("expected string element, got {item:?}"))
                })
            })
            .collect(),
        BytesFrame::Null => Err(DrillError::protocol("nil reply where array expected")),
        other => Err(DrillError::protocol(format!(
            "expected array reply, got {other:?}"
        ))),
    }
}

/// Decode a flat `[k1, v1, k2, v2, ...]` reply.
pub fn decode_string_map(frame: BytesFrame) -> Result<BTreeMap<String, String>> {
    let flat = decode_string_slice(frame)?;
    if flat.len() % 2 != 0 {
        return Err(DrillError::protocol(format!(
            "map reply has odd element count {}",
            flat.len()
        )));
    }
    let mut out = BTreeMap::new();
    let mut iter = flat.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        out.insert(key, value);
    }
    Ok(out)
}

pub fn decode_string_map_slice(frame: BytesFrame) -> Result<Vec<BTreeMap<String, String>>> {
    match frame {
        BytesFrame::Array(items) => items.into_iter().map(decode_string_map).collect(),
        other => Err(DrillError::protocol(format!(
            "expected array of maps, got {other:?}"
        ))),
    }
}

fn parse_pubsub_frame(frame: BytesFrame) -> Result<Option<PubSubMessage>> {
    let BytesFrame::Array(items) = frame else {
        return Err(DrillError::protocol(format!(
            "unexpected frame in subscribe mode: {frame:?}"
        )));
    };
    let field = |idx: usize| items.get(idx).and_then(frame_to_string);
    let kind = field(0).unwrap_or_default();
    match (kind.as_str(), items.len()) {
        ("pmessage", 4) => Ok(Some(PubSubMessage {
            pattern: field(1),
            channel: field(2).unwrap_or_default(),
            payload: field(3).unwrap_or_default(),
        })),
        ("message", 3) => Ok(Some(PubSubMessage {
            pattern: None,
            channel: field(1).unwrap_or_default(),
            payload: field(2).unwrap_or_default(),
        })),
        ("psubscribe" | "subscribe" | "punsubscribe" | "unsubscribe" | "pong", _) => Ok(None),
        _ => Err(DrillError::protocol(format!(
            "unexpected pub/sub frame of kind {kind:?} with {} elements",
            items.len()
        ))),
    }
}
