// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Await the termination of a process by pid.
//!
//! A [`ProcessFuture`] listens for the process's terminal state-change
//! broadcasts, polls the record at a fixed interval, or both. It subscribes
//! first and checks the record second, so a broadcast sent before the
//! future existed is never missed: an already terminated process resolves
//! at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::communicator::{
    BroadcastFilter, BroadcastHandler, Communicator, CommunicatorError, SubscriberId,
};
use crate::error::StoreError;
use crate::node::{Node, NodeId, Pk};
use crate::persistence::NodeStore;
use crate::process::{ProcessError, ProcessState};

/// Errors raised while awaiting a process.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FutureError {
    /// Neither a poll interval nor a communicator was given.
    #[error("a poll interval or a communicator is required to await a process")]
    NoStrategy,

    /// Loading the record failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Subscribing to broadcasts failed.
    #[error(transparent)]
    Communicator(#[from] CommunicatorError),

    /// The watcher stopped before the process terminated.
    #[error("stopped watching process {0} before it terminated")]
    Cancelled(Pk),
}

impl From<FutureError> for ProcessError {
    fn from(err: FutureError) -> Self {
        match err {
            FutureError::Store(e) => ProcessError::Store(e),
            FutureError::Communicator(e) => ProcessError::Communicator(e),
            other => ProcessError::Failed(other.to_string()),
        }
    }
}

/// Resolves with the sealed record once process `pid` terminated.
pub struct ProcessFuture {
    pid: Pk,
    receiver: oneshot::Receiver<Result<Node, FutureError>>,
    communicator: Option<Communicator>,
    subscription: Option<SubscriberId>,
    watcher: Option<AbortHandle>,
    cleaned: bool,
}

impl std::fmt::Debug for ProcessFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessFuture")
            .field("pid", &self.pid)
            .field("subscribed", &self.subscription.is_some())
            .field("polling", &self.watcher.is_some())
            .finish()
    }
}

impl ProcessFuture {
    /// Start watching `pid`.
    ///
    /// At least one of `poll_interval` and `communicator` is required.
    pub async fn new(
        pid: Pk,
        store: Arc<dyn NodeStore>,
        poll_interval: Option<Duration>,
        communicator: Option<Communicator>,
    ) -> Result<Self, FutureError> {
        if poll_interval.is_none() && communicator.is_none() {
            return Err(FutureError::NoStrategy);
        }

        let notify = Arc::new(Notify::new());
        let subscription = match &communicator {
            Some(communicator) => {
                let handler: BroadcastHandler = {
                    let notify = Arc::clone(&notify);
                    Arc::new(move |_| notify.notify_one())
                };
                match communicator.add_broadcast_subscriber(terminal_filter(pid), handler) {
                    Ok(id) => Some(id),
                    // the record poll still resolves the future
                    Err(e) if poll_interval.is_some() => {
                        warn!(pid, error = %e, "Broadcast subscription failed, polling only");
                        None
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => None,
        };

        let (tx, receiver) = oneshot::channel();
        let mut future = Self {
            pid,
            receiver,
            communicator,
            subscription,
            watcher: None,
            cleaned: false,
        };

        let record = store.load_node(NodeId::Pk(pid)).await?;
        if record.is_terminated() {
            debug!(pid, "Process already terminated");
            let _ = tx.send(Ok(record));
            future.cleanup();
            return Ok(future);
        }

        let watcher = tokio::spawn(watch(pid, store, poll_interval, notify, tx));
        future.watcher = Some(watcher.abort_handle());
        Ok(future)
    }

    /// Pid being awaited.
    pub fn pid(&self) -> Pk {
        self.pid
    }

    /// Unsubscribe and stop polling. Runs once.
    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        if let (Some(communicator), Some(id)) = (&self.communicator, self.subscription.take()) {
            communicator.remove_broadcast_subscriber(id);
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        trace!(pid = self.pid, "Process future cleaned up");
    }
}

impl Future for ProcessFuture {
    type Output = Result<Node, FutureError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let pid = self.pid;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(result) => {
                self.cleanup();
                Poll::Ready(result.unwrap_or_else(|_| Err(FutureError::Cancelled(pid))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProcessFuture {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn terminal_filter(pid: Pk) -> BroadcastFilter {
    [ProcessState::Finished, ProcessState::Killed, ProcessState::Excepted]
        .into_iter()
        .fold(BroadcastFilter::new().sender(pid.to_string()), |filter, state| {
            filter.subject(format!("state_changed.*.{}", state.as_str()))
        })
}

async fn watch(
    pid: Pk,
    store: Arc<dyn NodeStore>,
    poll_interval: Option<Duration>,
    notify: Arc<Notify>,
    tx: oneshot::Sender<Result<Node, FutureError>>,
) {
    loop {
        match poll_interval {
            Some(interval) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            None => notify.notified().await,
        }

        match store.load_node(NodeId::Pk(pid)).await {
            Ok(record) if record.is_terminated() => {
                let _ = tx.send(Ok(record));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(e.into()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{BroadcastMessage, InProcessBroker, state_changed_subject};
    use crate::node::attrs;
    use crate::persistence::MemoryStore;
    use serde_json::json;

    async fn record(store: &MemoryStore) -> Pk {
        store
            .store_node(&Node::process_record("tests.Watched", "Watched"))
            .await
            .unwrap()
            .pk
            .unwrap()
    }

    async fn terminate(store: &MemoryStore, pid: Pk) {
        store
            .set_attribute(pid, attrs::PROCESS_STATE, json!("finished"))
            .await
            .unwrap();
        store.seal(pid).await.unwrap();
    }

    #[tokio::test]
    async fn test_requires_a_strategy() {
        let store = Arc::new(MemoryStore::new());
        let pid = record(&store).await;
        let result = ProcessFuture::new(pid, store, None, None).await;
        assert!(matches!(result, Err(FutureError::NoStrategy)));
    }

    #[tokio::test]
    async fn test_already_terminated_resolves_without_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let broker = InProcessBroker::new();
        let communicator = Communicator::new(broker.clone(), store.clone());
        let pid = record(&store).await;
        terminate(&store, pid).await;

        // the terminal broadcast went out before anyone listened
        let future = ProcessFuture::new(pid, store.clone(), None, Some(communicator))
            .await
            .unwrap();
        assert_eq!(broker.broadcast_subscribers(), 0);
        let node = future.await.unwrap();
        assert!(node.is_terminated());
    }

    #[tokio::test]
    async fn test_resolves_on_broadcast_and_unsubscribes() {
        let store = Arc::new(MemoryStore::new());
        let broker = InProcessBroker::new();
        let communicator = Communicator::new(broker.clone(), store.clone());
        let pid = record(&store).await;

        let future = ProcessFuture::new(pid, store.clone(), None, Some(communicator.clone()))
            .await
            .unwrap();
        assert_eq!(broker.broadcast_subscribers(), 1);

        terminate(&store, pid).await;
        communicator
            .broadcast_send(BroadcastMessage::new(
                Some(pid.to_string()),
                state_changed_subject("running", "finished"),
                json!({}),
            ))
            .unwrap();

        let node = future.await.unwrap();
        assert_eq!(node.pk, Some(pid));
        assert_eq!(broker.broadcast_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_by_polling() {
        let store = Arc::new(MemoryStore::new());
        let pid = record(&store).await;
        let future = ProcessFuture::new(pid, store.clone(), Some(Duration::from_millis(50)), None)
            .await
            .unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                terminate(&store, pid).await;
            })
        };
        assert!(future.await.unwrap().is_terminated());
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_bus_falls_back_to_polling() {
        let store = Arc::new(MemoryStore::new());
        let communicator = Communicator::new(InProcessBroker::new(), store.clone());
        communicator.close().await;
        let pid = record(&store).await;

        let future = ProcessFuture::new(
            pid,
            store.clone(),
            Some(Duration::from_millis(50)),
            Some(communicator.clone()),
        )
        .await
        .unwrap();
        terminate(&store, pid).await;
        assert!(future.await.unwrap().is_terminated());

        // without a poll interval there is nothing left to wait with
        let other = record(&store).await;
        let result = ProcessFuture::new(other, store, None, Some(communicator)).await;
        assert!(matches!(result, Err(FutureError::Communicator(_))));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let store = Arc::new(MemoryStore::new());
        let broker = InProcessBroker::new();
        let communicator = Communicator::new(broker.clone(), store.clone());
        let pid = record(&store).await;

        let future = ProcessFuture::new(pid, store, None, Some(communicator))
            .await
            .unwrap();
        assert_eq!(broker.broadcast_subscribers(), 1);
        drop(future);
        assert_eq!(broker.broadcast_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = Arc::new(MemoryStore::new());
        let result = ProcessFuture::new(404, store, Some(Duration::from_millis(10)), None).await;
        assert!(matches!(result, Err(FutureError::Store(e)) if e.is_not_existent()));
    }
}
