//! Scripted collaborators for tests and dry runs.
//!
//! Every call is recorded; replies come from per-command responders that also
//! receive how many times the command was issued before.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crate::domain::collaborators::portal::{PortalClient, PortalRequest, PortalResponse};
use crate::domain::collaborators::rpc::{CommandInbox, InboundCommand, RpcClient, RpcReply, RpcRequest};
use crate::error::{PortalError, TransferError};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPortalCall {
    pub url: String,
    pub cmd: String,
    pub params: Value,
}

type PortalResponder = Box<dyn Fn(&RecordedPortalCall, usize) -> PortalResponse + Send + Sync>;

#[derive(Default)]
pub struct ScriptedPortal {
    calls: Mutex<Vec<RecordedPortalCall>>,
    responders: Mutex<HashMap<String, PortalResponder>>,
}

impl ScriptedPortal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<F>(&self, cmd: &str, responder: F)
    where
        F: Fn(&RecordedPortalCall, usize) -> PortalResponse + Send + Sync + 'static,
    {
        self.responders.lock().expect("Mutex poisoned").insert(cmd.to_string(), Box::new(responder));
    }

    /// Always answers `cmd` with `body` and status 200.
    pub fn respond_json(&self, cmd: &str, body: Value) {
        self.respond(cmd, move |_, _| PortalResponse::ok(body.clone()));
    }

    pub fn calls(&self) -> Vec<RecordedPortalCall> {
        self.calls.lock().expect("Mutex poisoned").clone()
    }

    pub fn calls_for(&self, cmd: &str) -> Vec<RecordedPortalCall> {
        self.calls().into_iter().filter(|c| c.cmd == cmd).collect()
    }
}

impl fmt::Debug for ScriptedPortal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedPortal").field("calls", &self.calls.lock().map(|c| c.len()).unwrap_or_default()).finish()
    }
}

#[async_trait]
impl PortalClient for ScriptedPortal {
    async fn post(&self, url: &str, request: PortalRequest) -> Result<PortalResponse, PortalError> {
        let call = RecordedPortalCall { url: url.to_string(), cmd: request.cmd, params: request.params };
        let nth = {
            let mut calls = self.calls.lock().expect("Mutex poisoned");
            let nth = calls.iter().filter(|c| c.cmd == call.cmd).count();
            calls.push(call.clone());
            nth
        };

        let responders = self.responders.lock().expect("Mutex poisoned");
        Ok(match responders.get(&call.cmd) {
            Some(responder) => responder(&call, nth),
            None => PortalResponse::ok(json!({})),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRpcCall {
    pub queue: String,
    pub request: RpcRequest,
    pub timeout: Duration,
}

type RpcResponder = Box<dyn Fn(&RecordedRpcCall, usize) -> RpcReply + Send + Sync>;

#[derive(Default)]
pub struct ScriptedRpc {
    calls: Mutex<Vec<RecordedRpcCall>>,
    responders: Mutex<HashMap<String, RpcResponder>>,
    inbound: Mutex<VecDeque<InboundCommand>>,
    replies: Mutex<Vec<(String, Value)>>,
}

impl ScriptedRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<F>(&self, cmd: &str, responder: F)
    where
        F: Fn(&RecordedRpcCall, usize) -> RpcReply + Send + Sync + 'static,
    {
        self.responders.lock().expect("Mutex poisoned").insert(cmd.to_string(), Box::new(responder));
    }

    pub fn respond_json(&self, cmd: &str, body: Value) {
        self.respond(cmd, move |_, _| RpcReply::ok(body.clone()));
    }

    pub fn calls(&self) -> Vec<RecordedRpcCall> {
        self.calls.lock().expect("Mutex poisoned").clone()
    }

    pub fn calls_for(&self, cmd: &str) -> Vec<RecordedRpcCall> {
        self.calls().into_iter().filter(|c| c.request.cmd == cmd).collect()
    }

    /// Queues a command for the next [`CommandInbox::receive`].
    pub fn deliver(&self, id: &str, cmd: &str, params: Value) {
        let command = InboundCommand { id: id.to_string(), cmd: cmd.to_string(), params };
        self.inbound.lock().expect("Mutex poisoned").push_back(command);
    }

    /// Replies sent to delivered commands, as `(command id, body)`.
    pub fn replies(&self) -> Vec<(String, Value)> {
        self.replies.lock().expect("Mutex poisoned").clone()
    }
}

impl fmt::Debug for ScriptedRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRpc").field("calls", &self.calls.lock().map(|c| c.len()).unwrap_or_default()).finish()
    }
}

#[async_trait]
impl RpcClient for ScriptedRpc {
    async fn call(&self, queue: &str, request: RpcRequest, timeout: Duration) -> RpcReply {
        let call = RecordedRpcCall { queue: queue.to_string(), request, timeout };
        let nth = {
            let mut calls = self.calls.lock().expect("Mutex poisoned");
            let nth = calls.iter().filter(|c| c.request.cmd == call.request.cmd).count();
            calls.push(call.clone());
            nth
        };

        let responders = self.responders.lock().expect("Mutex poisoned");
        match responders.get(&call.request.cmd) {
            Some(responder) => responder(&call, nth),
            None => RpcReply::ok(json!({})),
        }
    }
}

#[async_trait]
impl CommandInbox for ScriptedRpc {
    async fn receive(&self, _queue: &str, wait: Duration) -> Result<Vec<InboundCommand>, TransferError> {
        let batch: Vec<InboundCommand> = self.inbound.lock().expect("Mutex poisoned").drain(..).collect();
        if batch.is_empty() {
            tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
        }
        Ok(batch)
    }

    async fn respond(&self, command: &InboundCommand, body: Value) -> Result<(), TransferError> {
        self.replies.lock().expect("Mutex poisoned").push((command.id.clone(), body));
        Ok(())
    }
}
