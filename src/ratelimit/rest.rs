//! Networked counting backend over a Redis-compatible REST interface.
//!
//! Every check is one `multi-exec` round trip carrying three commands:
//!
//! 1. `INCR key` increments server-side, so concurrent callers never lose
//!    an update.
//! 2. `EXPIRE key <secs> NX` sets the window length only if no expiry is set,
//!    so racing callers cannot keep pushing the window forward.
//! 3. `PTTL key` reads back the time left in the window.
//!
//! The correctness of (2) rests on the store's set-if-unset expiry primitive.
//! Pointing this at a different store requires an equivalent atomic
//! conditional expiry.
//!
//! No request timeout is applied here: a hung store call hangs the request
//! unless the surrounding runtime bounds it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use super::backend::{BackendError, BackendKind, CounterSnapshot, CountingBackend};

/// A single store command, serialized as a JSON array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Command(Vec<String>);

impl Command {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    /// Command name followed by its arguments.
    pub fn args(&self) -> &[String] {
        &self.0
    }
}

/// Ships a batch of commands to the store and returns its raw JSON reply.
///
/// The batch must be executed atomically, in order.
#[async_trait]
pub trait PipelineTransport: Send + Sync {
    async fn exec(&self, commands: &[Command]) -> Result<Value, BackendError>;
}

/// Transport talking to the store's HTTP `multi-exec` endpoint.
#[derive(Debug, Clone)]
pub struct HttpPipelineTransport {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpPipelineTransport {
    pub fn new(rest_url: &str, token: &str) -> Self {
        Self::with_client(reqwest::Client::new(), rest_url, token)
    }

    pub fn with_client(client: reqwest::Client, rest_url: &str, token: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/multi-exec", rest_url.trim_end_matches('/')),
            token: token.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PipelineTransport for HttpPipelineTransport {
    async fn exec(&self, commands: &[Command]) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(commands)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// One command's reply, in either of the two shapes stores are known to use.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplyEntry {
    /// `{"result": 1}` or `{"error": "ERR ..."}`
    Object(ObjectReply),
    /// `[null, 1]` or `["ERR ...", null]`
    Pair(Option<String>, Option<i64>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ObjectReply {
    #[serde(default)]
    result: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

impl ReplyEntry {
    fn into_integer(self, command: &str) -> Result<i64, BackendError> {
        match self {
            ReplyEntry::Object(ObjectReply { error: Some(e), .. })
            | ReplyEntry::Pair(Some(e), _) => Err(BackendError::Command(format!("{}: {}", command, e))),
            ReplyEntry::Object(ObjectReply { result: Some(v), .. })
            | ReplyEntry::Pair(None, Some(v)) => Ok(v),
            _ => Err(BackendError::UnexpectedShape(format!(
                "{} reply carries no value",
                command
            ))),
        }
    }
}

/// Decode the reply to an `INCR` / `EXPIRE NX` / `PTTL` batch.
///
/// A TTL the store reports as negative (no expiry, or key gone) is taken to be
/// a full window; the TTL is otherwise clamped to the window length.
pub fn decode_reply(reply: Value, window_ms: u64) -> Result<CounterSnapshot, BackendError> {
    let entries: Vec<ReplyEntry> =
        serde_json::from_value(reply).map_err(|e| BackendError::UnexpectedShape(e.to_string()))?;

    let [incr, expire, pttl]: [ReplyEntry; 3] = entries.try_into().map_err(|rest: Vec<ReplyEntry>| {
        BackendError::UnexpectedShape(format!("expected 3 replies, got {}", rest.len()))
    })?;

    let count = incr.into_integer("INCR")?;
    if count < 1 {
        return Err(BackendError::UnexpectedShape(format!(
            "INCR returned {}",
            count
        )));
    }
    expire.into_integer("EXPIRE")?;
    let ttl = pttl.into_integer("PTTL")?;

    let ttl_ms = u64::try_from(ttl).map_or(window_ms, |ttl| ttl.min(window_ms));

    Ok(CounterSnapshot {
        count: count as u64,
        ttl_ms,
    })
}

/// Commands that count one request against `key` in a window of `window_ms`.
pub fn window_commands(key: &str, window_ms: u64) -> [Command; 3] {
    let window_secs = window_ms.div_ceil(1000).max(1);
    [
        Command::new(["INCR", key]),
        Command::new(["EXPIRE".to_string(), key.to_string(), window_secs.to_string(), "NX".to_string()]),
        Command::new(["PTTL", key]),
    ]
}

/// Counting backend whose counters live in a shared networked store.
///
/// Counts are shared by every instance pointed at the same store.
pub struct RestCounterStore<T = HttpPipelineTransport> {
    transport: T,
}

impl RestCounterStore<HttpPipelineTransport> {
    /// Create a store talking HTTP to `rest_url` with a bearer `token`.
    pub fn new(rest_url: &str, token: &str) -> Self {
        Self::with_transport(HttpPipelineTransport::new(rest_url, token))
    }
}

impl<T: PipelineTransport> RestCounterStore<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<T: PipelineTransport> CountingBackend for RestCounterStore<T> {
    fn kind(&self) -> BackendKind {
        BackendKind::Rest
    }

    async fn hit(&self, key: &str, window_ms: u64) -> Result<CounterSnapshot, BackendError> {
        let commands = window_commands(key, window_ms);
        trace!(key = %key, window_ms = window_ms, "Sending counter batch");

        let reply = self.transport.exec(&commands).await?;
        decode_reply(reply, window_ms)
    }
}
