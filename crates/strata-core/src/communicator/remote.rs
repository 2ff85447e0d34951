// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker client connected to a [`BrokerServer`](super::BrokerServer) over TCP.
//!
//! Runners, controllers and daemons in different OS processes talk to each
//! other by connecting a [`RemoteBroker`] each to the same server. Handlers
//! stay in the client: the server forwards RPC requests and task deliveries
//! to the connection that registered them, and fans every broadcast out to
//! every connection, where the local filters apply.
//!
//! Subscription changes are one-way events applied by the server in the
//! order they were sent; [`Broker::flush`] waits until all of them took
//! effect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::broker::Broker;
use super::wire::{Event, Frame, MessageType, Operation, Peer, Reply, Request, read_frame};
use super::{
    BroadcastFilter, BroadcastHandler, BroadcastMessage, CommunicatorError, RpcHandler,
    SubscriberId, TaskHandler,
};

#[derive(Default)]
struct Handlers {
    rpc: HashMap<String, RpcHandler>,
    broadcast: Vec<(SubscriberId, BroadcastFilter, BroadcastHandler)>,
    tasks: HashMap<SubscriberId, TaskHandler>,
}

struct ClientShared {
    peer: Arc<Peer>,
    handlers: Mutex<Handlers>,
}

/// Broker reached over a TCP connection.
pub struct RemoteBroker {
    shared: Arc<ClientShared>,
    server_addr: SocketAddr,
}

impl std::fmt::Debug for RemoteBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBroker")
            .field("server_addr", &self.server_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RemoteBroker {
    /// Connect to the server at `url`, written `tcp://host:port` or
    /// `host:port`.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Arc<Self>, CommunicatorError> {
        let address = url.strip_prefix("tcp://").unwrap_or(url);
        let stream = TcpStream::connect(address).await.map_err(|e| {
            warn!(url = %url, error = %e, "Failed to connect to broker");
            CommunicatorError::ConnectionClosed
        })?;
        let server_addr = stream
            .peer_addr()
            .map_err(|_| CommunicatorError::ConnectionClosed)?;

        let (peer, reader) = Peer::start(stream);
        let shared = Arc::new(ClientShared {
            peer,
            handlers: Mutex::new(Handlers::default()),
        });
        tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        info!(%server_addr, "Connected to broker");
        Ok(Arc::new(Self {
            shared,
            server_addr,
        }))
    }

    /// Address of the server.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    fn ensure_open(&self) -> Result<(), CommunicatorError> {
        if self.shared.peer.is_closed() {
            Err(CommunicatorError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for RemoteBroker {
    fn drop(&mut self) {
        self.shared.peer.shutdown();
    }
}

#[async_trait::async_trait]
impl Broker for RemoteBroker {
    fn is_connected(&self) -> bool {
        !self.shared.peer.is_closed()
    }

    async fn rpc_send(&self, recipient: &str, message: Value) -> Result<Value, CommunicatorError> {
        self.shared
            .peer
            .request(Operation::Rpc {
                recipient: recipient.to_string(),
                body: message,
            })
            .await
    }

    fn add_rpc_subscriber(
        &self,
        identifier: &str,
        handler: RpcHandler,
    ) -> Result<(), CommunicatorError> {
        self.ensure_open()?;
        {
            let mut handlers = self.shared.handlers.lock();
            if handlers.rpc.contains_key(identifier) {
                return Err(CommunicatorError::DuplicateSubscriber(identifier.to_string()));
            }
            handlers.rpc.insert(identifier.to_string(), handler);
        }
        let event = Event::AddRpcSubscriber {
            identifier: identifier.to_string(),
        };
        if let Err(e) = self.shared.peer.event(&event) {
            self.shared.handlers.lock().rpc.remove(identifier);
            return Err(e);
        }
        Ok(())
    }

    fn remove_rpc_subscriber(&self, identifier: &str) {
        if self.shared.handlers.lock().rpc.remove(identifier).is_some() {
            let _ = self.shared.peer.event(&Event::RemoveRpcSubscriber {
                identifier: identifier.to_string(),
            });
        }
    }

    fn broadcast_send(&self, message: BroadcastMessage) -> Result<(), CommunicatorError> {
        self.shared.peer.event(&Event::Broadcast { message })
    }

    fn add_broadcast_subscriber(
        &self,
        filter: BroadcastFilter,
        handler: BroadcastHandler,
    ) -> Result<SubscriberId, CommunicatorError> {
        self.ensure_open()?;
        let id = Uuid::new_v4();
        self.shared.handlers.lock().broadcast.push((id, filter, handler));
        Ok(id)
    }

    fn remove_broadcast_subscriber(&self, id: SubscriberId) -> bool {
        let mut handlers = self.shared.handlers.lock();
        let before = handlers.broadcast.len();
        handlers.broadcast.retain(|(sid, _, _)| *sid != id);
        handlers.broadcast.len() != before
    }

    async fn task_send(&self, task: Value) -> Result<Value, CommunicatorError> {
        self.shared.peer.request(Operation::Task { body: task }).await
    }

    fn add_task_subscriber(&self, handler: TaskHandler) -> Result<SubscriberId, CommunicatorError> {
        self.ensure_open()?;
        let id = Uuid::new_v4();
        self.shared.handlers.lock().tasks.insert(id, handler);
        if let Err(e) = self.shared.peer.event(&Event::AddTaskSubscriber { subscriber: id }) {
            self.shared.handlers.lock().tasks.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    fn remove_task_subscriber(&self, id: SubscriberId) {
        if self.shared.handlers.lock().tasks.remove(&id).is_some() {
            let _ = self
                .shared
                .peer
                .event(&Event::RemoveTaskSubscriber { subscriber: id });
        }
    }

    async fn flush(&self) -> Result<(), CommunicatorError> {
        self.shared.peer.request(Operation::Flush).await.map(|_| ())
    }

    async fn close(&self) {
        if self.shared.peer.is_closed() {
            return;
        }
        self.shared.peer.shutdown();
        *self.shared.handlers.lock() = Handlers::default();
        info!(server_addr = %self.server_addr, "Disconnected from broker");
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<ClientShared>) {
    let closed = shared.peer.closed().clone();
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Broker connection lost");
                break;
            }
        };
        if let Err(e) = dispatch(&shared, frame) {
            warn!(error = %e, "Dropping malformed frame from broker");
        }
    }
    shared.peer.shutdown();
}

fn dispatch(shared: &Arc<ClientShared>, frame: Frame) -> Result<(), CommunicatorError> {
    match frame.message_type {
        MessageType::Reply => shared.peer.complete(frame.decode::<Reply>()?),
        MessageType::Event => match frame.decode::<Event>()? {
            Event::Broadcast { message } => deliver_broadcast(shared, message),
            other => debug!(event = ?other, "Ignoring unexpected event from broker"),
        },
        MessageType::Request => {
            let Request { id, operation } = frame.decode()?;
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let result = handle_request(&shared, operation).await;
                shared.peer.reply(id, result);
            });
        }
    }
    Ok(())
}

async fn handle_request(shared: &ClientShared, operation: Operation) -> Result<Value, CommunicatorError> {
    match operation {
        Operation::Rpc { recipient, body } => {
            let handler = shared.handlers.lock().rpc.get(&recipient).cloned();
            match handler {
                Some(handler) => handler(body).await,
                None => Err(CommunicatorError::Unroutable(recipient)),
            }
        }
        Operation::Deliver { subscriber, body } => {
            let handler = shared.handlers.lock().tasks.get(&subscriber).cloned();
            match handler {
                Some(handler) => handler(body).await,
                None => Err(CommunicatorError::TaskRejected("subscriber is gone".to_string())),
            }
        }
        Operation::Task { .. } | Operation::Flush => Err(CommunicatorError::Remote(
            "clients do not serve this operation".to_string(),
        )),
    }
}

fn deliver_broadcast(shared: &ClientShared, message: BroadcastMessage) {
    let handlers: Vec<BroadcastHandler> = shared
        .handlers
        .lock()
        .broadcast
        .iter()
        .filter(|(_, filter, _)| filter.matches(&message))
        .map(|(_, _, handler)| Arc::clone(handler))
        .collect();
    for handler in handlers {
        handler(message.clone());
    }
}
