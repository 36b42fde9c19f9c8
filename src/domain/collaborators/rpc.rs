use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use crate::error::TransferError;

/// Default reply timeout for agent commands.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub cmd: String,
    pub target: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(cmd: impl Into<String>, target: impl Into<String>, params: Value) -> Self {
        RpcRequest { cmd: cmd.into(), target: target.into(), params }
    }
}

/// Correlated reply of an RPC. `timed_out` replies carry no body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub body: Value,
}

impl RpcReply {
    pub fn ok(body: Value) -> Self {
        RpcReply { timed_out: false, body }
    }

    pub fn timeout() -> Self {
        RpcReply { timed_out: true, body: Value::Null }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        RpcReply::ok(json!({ "error": message.into() }))
    }

    /// The explicit `error` field of the reply, if the agent set one.
    pub fn error(&self) -> Option<String> {
        match self.body.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// Sends a command to a named queue and waits, up to `timeout`, for the correlated reply.
#[async_trait]
pub trait RpcClient: std::fmt::Debug + Send + Sync {
    async fn call(&self, queue: &str, request: RpcRequest, timeout: Duration) -> RpcReply;
}

/// A command addressed to this scheduler, waiting for a reply keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCommand {
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub params: Value,
}

/// Receiving side of the message bus: commands other sites and agents send to our queue.
#[async_trait]
pub trait CommandInbox: std::fmt::Debug + Send + Sync {
    /// Waits up to `wait` for commands on `queue`. An empty batch is not an error.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Vec<InboundCommand>, TransferError>;

    async fn respond(&self, command: &InboundCommand, body: Value) -> Result<(), TransferError>;
}

/// Issues `request` and maps timeouts, agent errors and malformed bodies onto [`TransferError::Remote`].
pub async fn call_checked<T: DeserializeOwned>(
    rpc: &dyn RpcClient,
    queue: &str,
    request: RpcRequest,
    timeout: Duration,
) -> Result<T, TransferError> {
    let cmd = request.cmd.clone();
    let reply = rpc.call(queue, request, timeout).await;

    if reply.timed_out {
        return Err(TransferError::Remote(format!("{} on queue {} timed out after {}s", cmd, queue, timeout.as_secs())));
    }
    if let Some(error) = reply.error() {
        return Err(TransferError::Remote(format!("{} on queue {} failed: {}", cmd, queue, error)));
    }
    reply.parse().map_err(|e| TransferError::Remote(format!("{} on queue {} returned an unexpected reply: {}", cmd, queue, e)))
}

#[derive(Debug, Serialize)]
struct GatewayCall<'a> {
    queue: &'a str,
    request: &'a RpcRequest,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct GatewayReceive<'a> {
    queue: &'a str,
    wait_secs: u64,
}

#[derive(Debug, Deserialize)]
struct GatewayBatch {
    #[serde(default)]
    commands: Vec<InboundCommand>,
}

#[derive(Debug, Serialize)]
struct GatewayReply<'a> {
    id: &'a str,
    body: &'a Value,
}

/// [`RpcClient`] and [`CommandInbox`] speaking to an HTTP gateway that fronts the message bus.
#[derive(Debug, Clone)]
pub struct HttpRpcGateway {
    client: reqwest::Client,
    base: String,
    url: String,
}

impl HttpRpcGateway {
    pub fn new(gateway_url: impl Into<String>) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let base = gateway_url.into().trim_end_matches('/').to_string();
        Ok(HttpRpcGateway { client, url: format!("{}/call", base), base })
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T, timeout: Duration) -> Result<Value, TransferError> {
        let url = format!("{}/{}", self.base, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TransferError::Remote(format!("RPC gateway {} unreachable: {}", url, e)))?;

        let status = response.status();
        let body = response.json::<Value>().await.map_err(|e| TransferError::Remote(format!("RPC gateway {} answered {} with an unreadable body: {}", url, status, e)))?;
        if !status.is_success() {
            return Err(TransferError::Remote(format!("RPC gateway {} answered {}: {}", url, status, body)));
        }
        Ok(body)
    }
}

#[async_trait]
impl RpcClient for HttpRpcGateway {
    async fn call(&self, queue: &str, request: RpcRequest, timeout: Duration) -> RpcReply {
        let body = GatewayCall { queue, request: &request, timeout_secs: timeout.as_secs() };
        let response = match self.client.post(&self.url).json(&body).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return RpcReply::timeout(),
            Err(e) => {
                log::warn!("RPC gateway {} unreachable for {} on {}: {}", self.url, request.cmd, queue, e);
                return RpcReply::failure(e.to_string());
            }
        };

        let status = response.status();
        match response.json::<Value>().await {
            Ok(body) if body.get("timed_out").and_then(Value::as_bool) == Some(true) => RpcReply::timeout(),
            Ok(body) if status.is_success() => RpcReply::ok(body),
            Ok(body) => RpcReply::failure(format!("gateway answered {}: {}", status, body)),
            Err(e) if e.is_timeout() => RpcReply::timeout(),
            Err(e) => RpcReply::failure(format!("gateway answered {} with an unreadable body: {}", status, e)),
        }
    }
}

#[async_trait]
impl CommandInbox for HttpRpcGateway {
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Vec<InboundCommand>, TransferError> {
        let request = GatewayReceive { queue, wait_secs: wait.as_secs() };
        let body = self.post_json("receive", &request, wait + DEFAULT_RPC_TIMEOUT).await?;
        let batch = GatewayBatch::deserialize(&body).map_err(|e| TransferError::Remote(format!("malformed command batch from {}: {}", queue, e)))?;
        Ok(batch.commands)
    }

    async fn respond(&self, command: &InboundCommand, body: Value) -> Result<(), TransferError> {
        self.post_json("reply", &GatewayReply { id: &command.id, body: &body }, DEFAULT_RPC_TIMEOUT).await.map(|_| ())
    }
}
