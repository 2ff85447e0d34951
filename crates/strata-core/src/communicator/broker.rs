// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker abstraction and the in-process implementation.
//!
//! [`InProcessBroker`] connects every runner that shares the same instance,
//! with the delivery guarantees of a durable queue: tasks are delivered to
//! one subscriber at a time, at most `prefetch_count` in flight per
//! subscriber, and requeued when the subscriber is removed before the
//! handler returns.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BroadcastFilter, BroadcastHandler, BroadcastMessage, CommunicatorError, RpcHandler,
    SubscriberId, TaskHandler,
};

/// Default maximum number of unacknowledged tasks per subscriber.
pub const DEFAULT_PREFETCH_COUNT: usize = 200;

/// A message bus connection.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Whether the connection is alive.
    fn is_connected(&self) -> bool;

    /// Send a request to `recipient` and wait for the reply.
    async fn rpc_send(&self, recipient: &str, message: Value) -> Result<Value, CommunicatorError>;

    /// Listen for requests addressed to `identifier`.
    fn add_rpc_subscriber(&self, identifier: &str, handler: RpcHandler)
    -> Result<(), CommunicatorError>;

    /// Stop listening on `identifier`.
    fn remove_rpc_subscriber(&self, identifier: &str);

    /// Publish a broadcast.
    fn broadcast_send(&self, message: BroadcastMessage) -> Result<(), CommunicatorError>;

    /// Subscribe to broadcasts.
    fn add_broadcast_subscriber(
        &self,
        filter: BroadcastFilter,
        handler: BroadcastHandler,
    ) -> Result<SubscriberId, CommunicatorError>;

    /// Remove a broadcast subscription.
    fn remove_broadcast_subscriber(&self, id: SubscriberId) -> bool;

    /// Queue a task and wait for the consumer's result.
    async fn task_send(&self, task: Value) -> Result<Value, CommunicatorError>;

    /// Consume tasks.
    fn add_task_subscriber(&self, handler: TaskHandler) -> Result<SubscriberId, CommunicatorError>;

    /// Stop consuming tasks; in-flight tasks are requeued.
    fn remove_task_subscriber(&self, id: SubscriberId);

    /// Wait until earlier subscription changes are visible to other
    /// connections. Immediate for brokers that apply them synchronously.
    async fn flush(&self) -> Result<(), CommunicatorError> {
        Ok(())
    }

    /// Close the connection. Pending requests fail with `ConnectionClosed`.
    async fn close(&self);
}

struct PendingTask {
    body: Value,
    reply: oneshot::Sender<Result<Value, CommunicatorError>>,
    deliveries: u32,
}

struct InFlight {
    subscriber: SubscriberId,
    task: PendingTask,
    abort: AbortHandle,
}

struct TaskSubscriber {
    id: SubscriberId,
    handler: TaskHandler,
    in_flight: usize,
}

#[derive(Default)]
struct BrokerState {
    rpc: HashMap<String, RpcHandler>,
    broadcast: Vec<(SubscriberId, BroadcastFilter, BroadcastHandler)>,
    pending: VecDeque<PendingTask>,
    task_subscribers: Vec<TaskSubscriber>,
    in_flight: HashMap<u64, InFlight>,
    next_delivery: u64,
    cursor: usize,
}

struct Shared {
    state: Mutex<BrokerState>,
    prefetch_count: usize,
    closed: CancellationToken,
}

impl Shared {
    /// Hand pending tasks to subscribers with free prefetch slots.
    fn dispatch(shared: &Arc<Shared>) {
        let mut state = shared.state.lock();
        while !state.pending.is_empty() {
            let count = state.task_subscribers.len();
            let start = state.cursor;
            let Some(index) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| state.task_subscribers[i].in_flight < shared.prefetch_count)
            else {
                break;
            };
            let Some(mut task) = state.pending.pop_front() else {
                break;
            };

            state.cursor = index + 1;
            task.deliveries += 1;
            let subscriber = &mut state.task_subscribers[index];
            subscriber.in_flight += 1;
            let subscriber_id = subscriber.id;
            let handler = Arc::clone(&subscriber.handler);

            let delivery = state.next_delivery;
            state.next_delivery += 1;

            let body = task.body.clone();
            let completion = Arc::clone(shared);
            let handle = tokio::spawn(async move {
                let result = handler(body).await;
                Shared::complete(&completion, delivery, result);
            });

            state.in_flight.insert(
                delivery,
                InFlight {
                    subscriber: subscriber_id,
                    task,
                    abort: handle.abort_handle(),
                },
            );
        }
    }

    fn complete(shared: &Arc<Shared>, delivery: u64, result: Result<Value, CommunicatorError>) {
        {
            let mut state = shared.state.lock();
            let Some(flight) = state.in_flight.remove(&delivery) else {
                // subscriber went away and the task was requeued
                return;
            };
            if let Some(subscriber) = state
                .task_subscribers
                .iter_mut()
                .find(|s| s.id == flight.subscriber)
            {
                subscriber.in_flight = subscriber.in_flight.saturating_sub(1);
            }

            match result {
                Err(CommunicatorError::TaskRejected(reason)) => {
                    debug!(delivery, reason = %reason, "Task rejected, requeueing");
                    state.pending.push_back(flight.task);
                }
                other => {
                    let _ = flight.task.reply.send(other);
                }
            }
        }
        Shared::dispatch(shared);
    }
}

/// Broker living inside this process.
///
/// Clone the `Arc` to connect several runners to the same bus.
pub struct InProcessBroker {
    shared: Arc<Shared>,
}

impl InProcessBroker {
    /// Broker with the default prefetch count.
    pub fn new() -> Arc<Self> {
        Self::with_prefetch_count(DEFAULT_PREFETCH_COUNT)
    }

    /// Broker allowing `prefetch_count` unacknowledged tasks per subscriber.
    pub fn with_prefetch_count(prefetch_count: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                prefetch_count: prefetch_count.max(1),
                closed: CancellationToken::new(),
            }),
        })
    }

    /// Tasks waiting for a subscriber.
    pub fn pending_tasks(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Number of live broadcast subscriptions.
    pub fn broadcast_subscribers(&self) -> usize {
        self.shared.state.lock().broadcast.len()
    }

    /// Tasks delivered but not yet acknowledged.
    pub fn in_flight_tasks(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    fn ensure_open(&self) -> Result<(), CommunicatorError> {
        if self.shared.closed.is_cancelled() {
            Err(CommunicatorError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Broker for InProcessBroker {
    fn is_connected(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    async fn rpc_send(&self, recipient: &str, message: Value) -> Result<Value, CommunicatorError> {
        self.ensure_open()?;
        let handler = self
            .shared
            .state
            .lock()
            .rpc
            .get(recipient)
            .cloned()
            .ok_or_else(|| CommunicatorError::Unroutable(recipient.to_string()))?;

        // The handler runs detached so a caller timeout does not cancel it
        let reply = tokio::spawn(handler(message));
        tokio::select! {
            _ = self.shared.closed.cancelled() => Err(CommunicatorError::ConnectionClosed),
            joined = reply => joined.map_err(|e| CommunicatorError::Remote(e.to_string()))?,
        }
    }

    fn add_rpc_subscriber(
        &self,
        identifier: &str,
        handler: RpcHandler,
    ) -> Result<(), CommunicatorError> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        if state.rpc.contains_key(identifier) {
            return Err(CommunicatorError::DuplicateSubscriber(identifier.to_string()));
        }
        state.rpc.insert(identifier.to_string(), handler);
        Ok(())
    }

    fn remove_rpc_subscriber(&self, identifier: &str) {
        self.shared.state.lock().rpc.remove(identifier);
    }

    fn broadcast_send(&self, message: BroadcastMessage) -> Result<(), CommunicatorError> {
        self.ensure_open()?;
        let handlers: Vec<BroadcastHandler> = self
            .shared
            .state
            .lock()
            .broadcast
            .iter()
            .filter(|(_, filter, _)| filter.matches(&message))
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(message.clone());
        }
        Ok(())
    }

    fn add_broadcast_subscriber(
        &self,
        filter: BroadcastFilter,
        handler: BroadcastHandler,
    ) -> Result<SubscriberId, CommunicatorError> {
        self.ensure_open()?;
        let id = Uuid::new_v4();
        self.shared.state.lock().broadcast.push((id, filter, handler));
        Ok(id)
    }

    fn remove_broadcast_subscriber(&self, id: SubscriberId) -> bool {
        let mut state = self.shared.state.lock();
        let before = state.broadcast.len();
        state.broadcast.retain(|(sid, _, _)| *sid != id);
        state.broadcast.len() != before
    }

    async fn task_send(&self, task: Value) -> Result<Value, CommunicatorError> {
        self.ensure_open()?;
        let (reply, result) = oneshot::channel();
        self.shared.state.lock().pending.push_back(PendingTask {
            body: task,
            reply,
            deliveries: 0,
        });
        Shared::dispatch(&self.shared);

        tokio::select! {
            _ = self.shared.closed.cancelled() => Err(CommunicatorError::ConnectionClosed),
            outcome = result => outcome.map_err(|_| CommunicatorError::ConnectionClosed)?,
        }
    }

    fn add_task_subscriber(&self, handler: TaskHandler) -> Result<SubscriberId, CommunicatorError> {
        self.ensure_open()?;
        let id = Uuid::new_v4();
        self.shared.state.lock().task_subscribers.push(TaskSubscriber {
            id,
            handler,
            in_flight: 0,
        });
        Shared::dispatch(&self.shared);
        Ok(id)
    }

    fn remove_task_subscriber(&self, id: SubscriberId) {
        {
            let mut state = self.shared.state.lock();
            state.task_subscribers.retain(|s| s.id != id);

            let orphaned: Vec<u64> = state
                .in_flight
                .iter()
                .filter(|(_, flight)| flight.subscriber == id)
                .map(|(delivery, _)| *delivery)
                .collect();
            for delivery in orphaned {
                if let Some(flight) = state.in_flight.remove(&delivery) {
                    flight.abort.abort();
                    warn!(
                        delivery,
                        deliveries = flight.task.deliveries,
                        "Requeueing unacknowledged task"
                    );
                    state.pending.push_front(flight.task);
                }
            }
        }
        Shared::dispatch(&self.shared);
    }

    async fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.closed.cancel();
        let mut state = self.shared.state.lock();
        for (_, flight) in state.in_flight.drain() {
            flight.abort.abort();
        }
        let dropped = state.pending.len();
        state.pending.clear();
        state.rpc.clear();
        state.broadcast.clear();
        state.task_subscribers.clear();
        info!(dropped_tasks = dropped, "In-process broker closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn echo_handler() -> RpcHandler {
        Arc::new(|message: Value| async move { Ok(json!({"echo": message})) }.boxed())
    }

    #[tokio::test]
    async fn test_rpc_round_trip_and_unroutable() {
        let broker = InProcessBroker::new();
        broker.add_rpc_subscriber("7", echo_handler()).unwrap();

        let reply = broker.rpc_send("7", json!("ping")).await.unwrap();
        assert_eq!(reply, json!({"echo": "ping"}));

        let err = broker.rpc_send("8", json!("ping")).await.unwrap_err();
        assert_eq!(err, CommunicatorError::Unroutable("8".to_string()));

        assert!(matches!(
            broker.add_rpc_subscriber("7", echo_handler()),
            Err(CommunicatorError::DuplicateSubscriber(_))
        ));

        broker.remove_rpc_subscriber("7");
        assert!(broker.rpc_send("7", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast_filtering() {
        let broker = InProcessBroker::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = broker
            .add_broadcast_subscriber(
                BroadcastFilter::new().sender("1").subject("state_changed.*.finished"),
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let send = |sender: &str, subject: &str| {
            broker
                .broadcast_send(BroadcastMessage::new(
                    Some(sender.to_string()),
                    subject,
                    json!({}),
                ))
                .unwrap()
        };
        send("1", "state_changed.running.finished");
        send("2", "state_changed.running.finished");
        send("1", "state_changed.created.running");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(broker.remove_broadcast_subscriber(id));
        assert!(!broker.remove_broadcast_subscriber(id));
        send("1", "state_changed.running.finished");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_waits_for_subscriber() {
        let broker = InProcessBroker::new();
        let sender = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.task_send(json!({"n": 2})).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.pending_tasks(), 1);

        broker
            .add_task_subscriber(Arc::new(|task: Value| {
                async move { Ok(json!(task["n"].as_i64().unwrap_or(0) * 2)) }.boxed()
            }))
            .unwrap();

        assert_eq!(sender.await.unwrap().unwrap(), json!(4));
        assert_eq!(broker.pending_tasks(), 0);
        assert_eq!(broker.in_flight_tasks(), 0);
    }

    #[tokio::test]
    async fn test_unacknowledged_task_is_redelivered() {
        let broker = InProcessBroker::new();

        // first consumer never acknowledges
        let stuck = broker
            .add_task_subscriber(Arc::new(|_task: Value| {
                async move {
                    futures::future::pending::<()>().await;
                    Ok(Value::Null)
                }
                .boxed()
            }))
            .unwrap();

        let sender = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.task_send(json!("work")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.in_flight_tasks(), 1);

        broker
            .add_task_subscriber(Arc::new(|task: Value| async move { Ok(task) }.boxed()))
            .unwrap();
        broker.remove_task_subscriber(stuck);

        let result = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, json!("work"));
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight_tasks() {
        let broker = InProcessBroker::with_prefetch_count(1);
        let gate = Arc::new(tokio::sync::Notify::new());
        let waiting = Arc::clone(&gate);
        broker
            .add_task_subscriber(Arc::new(move |task: Value| {
                let gate = Arc::clone(&waiting);
                async move {
                    gate.notified().await;
                    Ok(task)
                }
                .boxed()
            }))
            .unwrap();

        let mut senders = Vec::new();
        for i in 0..2 {
            let broker = Arc::clone(&broker);
            senders.push(tokio::spawn(async move { broker.task_send(json!(i)).await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.in_flight_tasks(), 1);
        assert_eq!(broker.pending_tasks(), 1);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_one();
        for sender in senders {
            assert!(sender.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let broker = InProcessBroker::new();
        let sender = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.task_send(json!(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.close().await;
        broker.close().await;
        assert!(!broker.is_connected());
        assert_eq!(
            sender.await.unwrap().unwrap_err(),
            CommunicatorError::ConnectionClosed
        );
        assert_eq!(
            broker.rpc_send("1", json!(1)).await.unwrap_err(),
            CommunicatorError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_close_interrupts_rpc_in_progress() {
        let broker = InProcessBroker::new();
        broker
            .add_rpc_subscriber(
                "slow",
                Arc::new(|_| {
                    async move {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(Value::Null)
                    }
                    .boxed()
                }),
            )
            .unwrap();

        let call = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.rpc_send("slow", json!(null)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.close().await;
        assert_eq!(
            call.await.unwrap().unwrap_err(),
            CommunicatorError::ConnectionClosed
        );
    }
}
