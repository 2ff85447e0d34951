// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP broker server.
//!
//! The server owns an [`InProcessBroker`] hub and exposes it to
//! [`RemoteBroker`](super::RemoteBroker) clients. Every connection is a
//! session: the RPC identifiers and task subscribers it registers live in
//! the hub as forwarders back to the connection, and are removed with it, so
//! unacknowledged tasks of a lost client are requeued for the others.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::broker::{Broker, InProcessBroker};
use super::wire::{Event, Frame, MessageType, Operation, Peer, Request, read_frame};
use super::{BroadcastFilter, CommunicatorError, RpcHandler, SubscriberId, TaskHandler};

/// Serves a shared broker to remote clients.
pub struct BrokerServer {
    hub: Arc<InProcessBroker>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer")
            .field("local_addr", &self.local_addr)
            .field("running", &!self.shutdown.is_cancelled())
            .finish()
    }
}

impl BrokerServer {
    /// Bind to `addr` and start accepting connections.
    ///
    /// `prefetch_count` bounds the unacknowledged tasks per task subscriber.
    #[instrument(skip(addr))]
    pub async fn bind(addr: impl ToSocketAddrs, prefetch_count: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let hub = InProcessBroker::with_prefetch_count(prefetch_count);
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, Arc::clone(&hub), shutdown.clone()));
        info!(%local_addr, "Broker server listening");
        Ok(Self {
            hub,
            local_addr,
            shutdown,
        })
    }

    /// Address the server accepts connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `tcp://` URL clients connect to.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    /// The broker shared by all connections.
    pub fn hub(&self) -> &Arc<InProcessBroker> {
        &self.hub
    }

    /// Stop accepting, drop every connection and close the hub. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.hub.close().await;
        info!(local_addr = %self.local_addr, "Broker server stopped");
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, hub: Arc<InProcessBroker>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote_addr)) => {
                debug!(%remote_addr, "Accepted broker connection");
                tokio::spawn(serve(stream, remote_addr, Arc::clone(&hub), shutdown.clone()));
            }
            Err(e) => warn!(error = %e, "Failed to accept broker connection"),
        }
    }
}

/// Hub registrations made on behalf of one connection.
struct Session {
    peer: Arc<Peer>,
    hub: Arc<InProcessBroker>,
    rpc: Mutex<HashSet<String>>,
    tasks: Mutex<HashMap<SubscriberId, SubscriberId>>,
}

async fn serve(stream: TcpStream, remote_addr: SocketAddr, hub: Arc<InProcessBroker>, shutdown: CancellationToken) {
    let (peer, mut reader) = Peer::start(stream);
    let session = Session {
        peer: Arc::clone(&peer),
        hub: Arc::clone(&hub),
        rpc: Mutex::new(HashSet::new()),
        tasks: Mutex::new(HashMap::new()),
    };

    let fan_out = {
        let peer = Arc::downgrade(&peer);
        hub.add_broadcast_subscriber(
            BroadcastFilter::new(),
            Arc::new(move |message| {
                if let Some(peer) = peer.upgrade() {
                    let _ = peer.event(&Event::Broadcast { message });
                }
            }),
        )
    };

    let closed = peer.closed().clone();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = closed.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(frame) => {
                if let Err(e) = session.dispatch(frame) {
                    warn!(%remote_addr, error = %e, "Dropping malformed frame");
                }
            }
            Err(e) => {
                debug!(%remote_addr, error = %e, "Broker connection closed");
                break;
            }
        }
    }

    if let Ok(id) = fan_out {
        hub.remove_broadcast_subscriber(id);
    }
    session.release();
    peer.shutdown();
}

impl Session {
    fn dispatch(&self, frame: Frame) -> Result<(), CommunicatorError> {
        match frame.message_type {
            MessageType::Reply => self.peer.complete(frame.decode()?),
            MessageType::Event => self.apply(frame.decode()?),
            MessageType::Request => {
                let Request { id, operation } = frame.decode()?;
                self.route(id, operation);
            }
        }
        Ok(())
    }

    /// Apply an event in arrival order.
    fn apply(&self, event: Event) {
        match event {
            Event::AddRpcSubscriber { identifier } => {
                let handler = rpc_forwarder(Arc::clone(&self.peer), identifier.clone());
                match self.hub.add_rpc_subscriber(&identifier, handler) {
                    Ok(()) => {
                        self.rpc.lock().insert(identifier);
                    }
                    Err(e) => warn!(identifier = %identifier, error = %e, "Remote RPC subscription refused"),
                }
            }
            Event::RemoveRpcSubscriber { identifier } => {
                if self.rpc.lock().remove(&identifier) {
                    self.hub.remove_rpc_subscriber(&identifier);
                }
            }
            Event::AddTaskSubscriber { subscriber } => {
                let handler = task_forwarder(Arc::clone(&self.peer), subscriber);
                match self.hub.add_task_subscriber(handler) {
                    Ok(hub_id) => {
                        self.tasks.lock().insert(subscriber, hub_id);
                    }
                    Err(e) => warn!(%subscriber, error = %e, "Remote task subscription refused"),
                }
            }
            Event::RemoveTaskSubscriber { subscriber } => {
                let hub_id = self.tasks.lock().remove(&subscriber);
                if let Some(hub_id) = hub_id {
                    self.hub.remove_task_subscriber(hub_id);
                }
            }
            Event::Broadcast { message } => {
                if let Err(e) = self.hub.broadcast_send(message) {
                    debug!(error = %e, "Broadcast not delivered");
                }
            }
        }
    }

    /// Answer a client request; RPCs and tasks complete in the background.
    fn route(&self, id: u64, operation: Operation) {
        match operation {
            Operation::Flush => self.peer.reply(id, Ok(Value::Null)),
            Operation::Rpc { recipient, body } => {
                let peer = Arc::clone(&self.peer);
                let hub = Arc::clone(&self.hub);
                tokio::spawn(async move {
                    let result = hub.rpc_send(&recipient, body).await;
                    peer.reply(id, result);
                });
            }
            Operation::Task { body } => {
                let peer = Arc::clone(&self.peer);
                let hub = Arc::clone(&self.hub);
                tokio::spawn(async move {
                    let result = hub.task_send(body).await;
                    peer.reply(id, result);
                });
            }
            Operation::Deliver { .. } => self.peer.reply(
                id,
                Err(CommunicatorError::Remote("the server does not consume tasks".to_string())),
            ),
        }
    }

    /// Drop every hub registration of this connection.
    fn release(&self) {
        let identifiers: Vec<String> = self.rpc.lock().drain().collect();
        for identifier in &identifiers {
            self.hub.remove_rpc_subscriber(identifier);
        }
        let subscribers: Vec<SubscriberId> = self.tasks.lock().drain().map(|(_, id)| id).collect();
        for id in &subscribers {
            self.hub.remove_task_subscriber(*id);
        }
        debug!(
            rpc = identifiers.len(),
            tasks = subscribers.len(),
            "Released remote subscriptions"
        );
    }
}

fn rpc_forwarder(peer: Arc<Peer>, identifier: String) -> RpcHandler {
    Arc::new(move |body: Value| {
        let peer = Arc::clone(&peer);
        let recipient = identifier.clone();
        async move {
            let operation = Operation::Rpc {
                recipient: recipient.clone(),
                body,
            };
            peer.request(operation).await.map_err(|e| match e {
                CommunicatorError::ConnectionClosed => CommunicatorError::Unroutable(recipient),
                other => other,
            })
        }
        .boxed()
    })
}

fn task_forwarder(peer: Arc<Peer>, subscriber: SubscriberId) -> TaskHandler {
    Arc::new(move |body: Value| {
        let peer = Arc::clone(&peer);
        async move {
            peer.request(Operation::Deliver { subscriber, body })
                .await
                .map_err(|e| match e {
                    CommunicatorError::ConnectionClosed => {
                        CommunicatorError::TaskRejected("subscriber disconnected".to_string())
                    }
                    other => other,
                })
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{BroadcastMessage, RemoteBroker};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn server() -> BrokerServer {
        BrokerServer::bind("127.0.0.1:0", 10).await.unwrap()
    }

    #[tokio::test]
    async fn test_rpc_between_clients() {
        let server = server().await;
        let a = RemoteBroker::connect(&server.url()).await.unwrap();
        let b = RemoteBroker::connect(&server.url()).await.unwrap();

        a.add_rpc_subscriber(
            "7",
            Arc::new(|body: Value| async move { Ok(json!({"echo": body})) }.boxed()),
        )
        .unwrap();
        a.flush().await.unwrap();

        let reply = b.rpc_send("7", json!("ping")).await.unwrap();
        assert_eq!(reply, json!({"echo": "ping"}));
        assert_eq!(
            b.rpc_send("8", json!("ping")).await.unwrap_err(),
            CommunicatorError::Unroutable("8".to_string())
        );

        a.remove_rpc_subscriber("7");
        a.flush().await.unwrap();
        assert!(b.rpc_send("7", json!("ping")).await.is_err());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcasts_reach_every_client() {
        let server = server().await;
        let a = RemoteBroker::connect(&server.url()).await.unwrap();
        let b = RemoteBroker::connect(&server.url()).await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        b.add_broadcast_subscriber(
            BroadcastFilter::new().subject("state_changed.*.finished"),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let send = |subject: &str| {
            a.broadcast_send(BroadcastMessage::new(
                Some("3".to_string()),
                subject,
                json!({}),
            ))
            .unwrap()
        };
        send("state_changed.running.finished");
        send("state_changed.created.running");
        a.flush().await.unwrap();
        b.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_consumer_task_is_requeued() {
        let server = server().await;
        let producer = RemoteBroker::connect(&server.url()).await.unwrap();
        let flaky = RemoteBroker::connect(&server.url()).await.unwrap();

        // takes the task and never answers
        flaky
            .add_task_subscriber(Arc::new(|_: Value| {
                futures::future::pending::<Result<Value, CommunicatorError>>().boxed()
            }))
            .unwrap();
        flaky.flush().await.unwrap();

        let sender = {
            let producer = Arc::clone(&producer);
            tokio::spawn(async move { producer.task_send(json!({"n": 4})).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.hub().in_flight_tasks() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        flaky.close().await;
        let steady = RemoteBroker::connect(&server.url()).await.unwrap();
        steady
            .add_task_subscriber(Arc::new(|task: Value| {
                async move { Ok(json!(task["n"].as_i64().unwrap_or(0) * 2)) }.boxed()
            }))
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), sender)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, json!(8));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_shutdown_disconnects_clients() {
        let server = server().await;
        let client = RemoteBroker::connect(&server.url()).await.unwrap();
        assert!(client.is_connected());

        server.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            client.task_send(json!({})).await.unwrap_err(),
            CommunicatorError::ConnectionClosed
        );
    }
}
