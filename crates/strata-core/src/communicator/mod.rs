// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message-bus plumbing: RPC, broadcasts and the task queue.
//!
//! A [`Broker`] moves raw JSON messages. The [`Communicator`] wraps a broker
//! with timeouts and with the payload encoding that turns node and group
//! references into portable identifiers (see [`encoding`]).
//!
//! Three message patterns are supported:
//! - **RPC**: request/response addressed to a subscriber identifier (a pid).
//! - **Broadcast**: fire-and-forget fan-out, filtered by sender and subject.
//! - **Task queue**: work items delivered to one of the task subscribers,
//!   redelivered if that subscriber goes away before acknowledging.
//!
//! [`InProcessBroker`] serves a single OS process. Separate processes share
//! a [`BrokerServer`] through one [`RemoteBroker`] connection each.

pub mod broker;
pub mod encoding;
pub mod remote;
pub mod server;
mod wire;

pub use self::broker::{Broker, InProcessBroker};
pub use self::remote::RemoteBroker;
pub use self::server::BrokerServer;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::payload::{Inputs, Payload};
use crate::persistence::NodeStore;

/// Identifies a broadcast or task subscription.
pub type SubscriberId = Uuid;

/// Handles an RPC request, returning the reply body.
pub type RpcHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, CommunicatorError>> + Send + Sync>;

/// Receives broadcasts matching its filter.
pub type BroadcastHandler = Arc<dyn Fn(BroadcastMessage) + Send + Sync>;

/// Handles a task; returning is the acknowledgement.
pub type TaskHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, CommunicatorError>> + Send + Sync>;

/// Errors raised by the message bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CommunicatorError {
    /// No subscriber is listening on the recipient identifier.
    #[error("no subscriber for '{0}'")]
    Unroutable(String),

    /// The broker connection is gone.
    #[error("connection to the message broker is closed")]
    ConnectionClosed,

    /// No reply arrived in time. The remote side may still act on the request.
    #[error("timed out after {0:?} waiting for a reply")]
    Timeout(Duration),

    /// The remote handler failed.
    #[error("remote error: {0}")]
    Remote(String),

    /// A payload could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A task handler declined the task; it is put back on the queue.
    #[error("task rejected: {0}")]
    TaskRejected(String),

    /// An RPC subscriber with this identifier already exists.
    #[error("a subscriber for '{0}' already exists")]
    DuplicateSubscriber(String),
}

impl From<StoreError> for CommunicatorError {
    fn from(err: StoreError) -> Self {
        CommunicatorError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for CommunicatorError {
    fn from(err: serde_json::Error) -> Self {
        CommunicatorError::Encoding(err.to_string())
    }
}

/// A fan-out message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Sender identifier, a pid for process events.
    pub sender: Option<String>,
    /// Dotted subject, e.g. `state_changed.running.finished`.
    pub subject: String,
    /// Message body.
    pub body: Value,
}

impl BroadcastMessage {
    /// Build a message.
    pub fn new(sender: Option<String>, subject: impl Into<String>, body: Value) -> Self {
        Self {
            sender,
            subject: subject.into(),
            body,
        }
    }
}

/// Selects broadcasts by sender and subject.
///
/// Subject patterns are dotted; a `*` segment matches any single segment.
/// An empty pattern list matches every subject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastFilter {
    sender: Option<String>,
    subjects: Vec<String>,
}

impl BroadcastFilter {
    /// Filter matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only messages from `sender`.
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Also accept subjects matching `pattern`.
    pub fn subject(mut self, pattern: impl Into<String>) -> Self {
        self.subjects.push(pattern.into());
        self
    }

    /// Whether `message` passes the filter.
    pub fn matches(&self, message: &BroadcastMessage) -> bool {
        if let Some(sender) = &self.sender
            && message.sender.as_deref() != Some(sender.as_str())
        {
            return false;
        }
        self.subjects.is_empty()
            || self
                .subjects
                .iter()
                .any(|pattern| subject_matches(pattern, &message.subject))
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_parts = pattern.split('.');
    let mut subject_parts = subject.split('.');
    loop {
        match (pattern_parts.next(), subject_parts.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) if p == "*" || p == s => continue,
            _ => return false,
        }
    }
}

/// Subject of a process state change broadcast.
pub fn state_changed_subject(from: &str, to: &str) -> String {
    format!("state_changed.{from}.{to}")
}

/// Broker access with timeouts and payload encoding.
#[derive(Clone)]
pub struct Communicator {
    broker: Arc<dyn Broker>,
    store: Arc<dyn NodeStore>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("connected", &self.broker.is_connected())
            .finish()
    }
}

impl Communicator {
    /// Wrap `broker`; `store` resolves node references when decoding.
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn NodeStore>) -> Self {
        Self { broker, store }
    }

    /// The underlying broker.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Store used to resolve node references.
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Whether the broker connection is alive.
    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Send an RPC request and wait up to `timeout` for the reply.
    pub async fn rpc_send(
        &self,
        recipient: &str,
        message: Value,
        timeout: Duration,
    ) -> Result<Value, CommunicatorError> {
        tokio::time::timeout(timeout, self.broker.rpc_send(recipient, message))
            .await
            .map_err(|_| CommunicatorError::Timeout(timeout))?
    }

    /// Listen for RPC requests addressed to `identifier`.
    pub fn add_rpc_subscriber(
        &self,
        identifier: &str,
        handler: RpcHandler,
    ) -> Result<(), CommunicatorError> {
        self.broker.add_rpc_subscriber(identifier, handler)
    }

    /// Stop listening on `identifier`.
    pub fn remove_rpc_subscriber(&self, identifier: &str) {
        self.broker.remove_rpc_subscriber(identifier);
    }

    /// Publish a broadcast.
    pub fn broadcast_send(&self, message: BroadcastMessage) -> Result<(), CommunicatorError> {
        self.broker.broadcast_send(message)
    }

    /// Subscribe to broadcasts matching `filter`.
    pub fn add_broadcast_subscriber(
        &self,
        filter: BroadcastFilter,
        handler: BroadcastHandler,
    ) -> Result<SubscriberId, CommunicatorError> {
        self.broker.add_broadcast_subscriber(filter, handler)
    }

    /// Remove a broadcast subscription. Returns whether it existed.
    pub fn remove_broadcast_subscriber(&self, id: SubscriberId) -> bool {
        self.broker.remove_broadcast_subscriber(id)
    }

    /// Queue a task and wait for its result.
    pub async fn task_send(&self, task: Value) -> Result<Value, CommunicatorError> {
        self.broker.task_send(task).await
    }

    /// Consume tasks.
    pub fn add_task_subscriber(&self, handler: TaskHandler) -> Result<SubscriberId, CommunicatorError> {
        self.broker.add_task_subscriber(handler)
    }

    /// Stop consuming tasks; unacknowledged tasks are redelivered.
    pub fn remove_task_subscriber(&self, id: SubscriberId) {
        self.broker.remove_task_subscriber(id);
    }

    /// Wait until earlier subscription changes took effect on the broker.
    pub async fn flush(&self) -> Result<(), CommunicatorError> {
        self.broker.flush().await
    }

    /// Encode a payload for transmission.
    pub fn encode(&self, payload: &Payload) -> Result<Value, CommunicatorError> {
        encoding::encode(payload)
    }

    /// Decode a received payload, loading referenced nodes and groups.
    pub async fn decode(&self, value: &Value) -> Result<Payload, CommunicatorError> {
        encoding::decode(value, self.store.as_ref()).await
    }

    /// Encode port inputs.
    pub fn encode_inputs(&self, inputs: &Inputs) -> Result<Value, CommunicatorError> {
        encoding::encode_inputs(inputs)
    }

    /// Decode port inputs.
    pub async fn decode_inputs(&self, value: &Value) -> Result<Inputs, CommunicatorError> {
        encoding::decode_inputs(value, self.store.as_ref()).await
    }

    /// Close the broker connection.
    pub async fn close(&self) {
        self.broker.close().await;
    }
}
