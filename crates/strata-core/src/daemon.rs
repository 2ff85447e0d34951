// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daemon runner: executes processes received from the task queue.
//!
//! Tasks are delivered at least once, so both task kinds are idempotent:
//!
//! - `launch` uses the task's launch id as the record UUID. A redelivered
//!   launch finds the record; a sealed one is skipped and an unsealed one is
//!   continued from its checkpoint.
//! - `continue` skips sealed records and processes already running here.
//!
//! Ownership of a process between workers is an exclusive lease in the
//! node store, acquired before the process is driven, renewed every third
//! of its TTL and released when the process stops. [`DaemonRunner::recover`]
//! uses the same lease to resume orphaned checkpoints after a restart.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::communicator::{CommunicatorError, SubscriberId, TaskHandler, encoding};
use crate::controller::{TaskMessage, TaskOutcome};
use crate::node::{Node, NodeId, Pk};
use crate::persistence::NodeStore;
use crate::process::Outputs;
use crate::runner::{Runner, RunnerError};

/// Default lease lifetime.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// A runner consuming launch and continue tasks.
pub struct DaemonRunner {
    shared: Arc<DaemonShared>,
    subscription: Mutex<Option<SubscriberId>>,
}

struct DaemonShared {
    runner: Runner,
    worker_id: String,
    lease_ttl: Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DaemonRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonRunner")
            .field("worker_id", &self.shared.worker_id)
            .field("lease_ttl", &self.shared.lease_ttl)
            .field("started", &self.is_started())
            .finish()
    }
}

impl DaemonRunner {
    /// Wrap `runner`, which needs a communicator and a persister.
    pub fn new(runner: Runner, worker_id: impl Into<String>, lease_ttl: Duration) -> Result<Self, RunnerError> {
        if runner.communicator().is_none() {
            return Err(RunnerError::Configuration(
                "a daemon runner requires a communicator".to_string(),
            ));
        }
        if runner.persister().is_none() {
            return Err(RunnerError::Configuration(
                "a daemon runner requires a persister".to_string(),
            ));
        }
        Ok(Self {
            shared: Arc::new(DaemonShared {
                runner,
                worker_id: worker_id.into(),
                lease_ttl,
                shutdown: CancellationToken::new(),
            }),
            subscription: Mutex::new(None),
        })
    }

    /// The underlying runner.
    pub fn runner(&self) -> &Runner {
        &self.shared.runner
    }

    /// Lease owner identity.
    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    /// Whether the task subscription is active.
    pub fn is_started(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Start consuming tasks. Idempotent.
    pub fn start(&self) -> Result<(), RunnerError> {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }
        let communicator = self
            .shared
            .runner
            .communicator()
            .ok_or_else(|| RunnerError::Configuration("communicator is gone".to_string()))?;

        let shared = Arc::clone(&self.shared);
        let handler: TaskHandler = Arc::new(move |body: Value| {
            let shared = Arc::clone(&shared);
            async move { shared.handle_task(body).await }.boxed()
        });
        *subscription = Some(communicator.add_task_subscriber(handler)?);
        info!(worker_id = %self.shared.worker_id, "Daemon runner listening for tasks");
        Ok(())
    }

    /// Resume every checkpointed process that is not running anywhere.
    ///
    /// Checkpoints of sealed records are stale and deleted. A process is
    /// considered alive when this runner drives it or when it answers a
    /// status request. Returns the resumed pids.
    #[instrument(skip(self), fields(worker_id = %self.shared.worker_id))]
    pub async fn recover(&self) -> Result<Vec<Pk>, RunnerError> {
        self.shared.recover().await
    }

    /// Run [`recover`](Self::recover) every `interval` until stopped.
    pub async fn run_recovery_loop(&self, interval: Duration) {
        info!(
            interval_secs = interval.as_secs(),
            worker_id = %self.shared.worker_id,
            "Recovery loop started"
        );
        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => {
                    info!("Recovery loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.shared.recover().await {
                        error!(error = %e, "Recovery pass failed");
                    }
                }
            }
        }
    }

    /// Stop consuming tasks and close the runner.
    ///
    /// Unacknowledged tasks go back to the queue; leases expire.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let subscription = self.subscription.lock().take();
        if let (Some(id), Some(communicator)) = (subscription, self.shared.runner.communicator()) {
            communicator.remove_task_subscriber(id);
        }
        self.shared.runner.close().await;
        info!(worker_id = %self.shared.worker_id, "Daemon runner stopped");
    }
}

impl DaemonShared {
    fn store(&self) -> &Arc<dyn NodeStore> {
        self.runner.store()
    }

    async fn handle_task(&self, body: Value) -> Result<Value, CommunicatorError> {
        if self.shutdown.is_cancelled() {
            return Err(CommunicatorError::TaskRejected("daemon is stopping".to_string()));
        }
        let task: TaskMessage = serde_json::from_value(body)?;
        debug!(worker_id = %self.worker_id, task = ?task, "Task received");

        let outcome = match task {
            TaskMessage::Launch {
                launch_id,
                process_type,
                inputs,
            } => self.launch(launch_id, &process_type, &inputs).await,
            TaskMessage::Continue { pid } => self.continue_process(pid).await,
        };

        match outcome {
            Ok(outcome) => Ok(serde_json::to_value(outcome)?),
            Err(RunnerError::Closed) => Err(CommunicatorError::TaskRejected("runner is closed".to_string())),
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "Task failed");
                Err(CommunicatorError::Remote(e.to_string()))
            }
        }
    }

    #[instrument(skip(self, inputs), fields(worker_id = %self.worker_id))]
    async fn launch(&self, launch_id: Uuid, process_type: &str, inputs: &Value) -> Result<TaskOutcome, RunnerError> {
        match self.store().load_node(NodeId::Uuid(launch_id)).await {
            Ok(record) => {
                let pid = record.stored_pk()?;
                if record.sealed {
                    info!(pid, "Launch already completed, skipping");
                    return Ok(skipped(pid, &record));
                }
                info!(pid, "Launch redelivered, continuing from checkpoint");
                return self.continue_process(pid).await;
            }
            Err(e) if e.is_not_existent() => {}
            Err(e) => return Err(e.into()),
        }

        let factory = self.runner.registry().resolve(process_type)?;
        let inputs = encoding::decode_inputs(inputs, self.store().as_ref()).await?;
        let driver = self
            .runner
            .create_driver(&factory, inputs, None, Some(launch_id))
            .await?;
        let pid = driver.pid();
        // a redelivery of this launch may have claimed the new record already
        let Some(lease) = Lease::acquire(self, pid).await? else {
            info!(pid, "New process leased by another worker, skipping");
            let record = self.store().load_node(NodeId::Pk(pid)).await?;
            return Ok(skipped(pid, &record));
        };

        let result = self.runner.run_driver(driver).await;
        lease.release().await;
        self.outcome(pid, result).await
    }

    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    async fn continue_process(&self, pid: Pk) -> Result<TaskOutcome, RunnerError> {
        let record = self.store().load_node(NodeId::Pk(pid)).await?;
        if record.sealed {
            info!(pid, "Process already terminated, skipping");
            return Ok(skipped(pid, &record));
        }
        if self.runner.is_running(pid) {
            info!(pid, "Process already running on this worker, skipping");
            return Ok(skipped(pid, &record));
        }
        let Some(lease) = Lease::acquire(self, pid).await? else {
            info!(pid, "Process leased by another worker, skipping");
            return Ok(skipped(pid, &record));
        };

        let result = self.runner.continue_process(pid).await;
        lease.release().await;
        self.outcome(pid, result).await
    }

    async fn outcome(
        &self,
        pid: Pk,
        result: Result<(Outputs, Node), RunnerError>,
    ) -> Result<TaskOutcome, RunnerError> {
        let record = match result {
            Ok((_, record)) => record,
            Err(RunnerError::Excepted { .. } | RunnerError::Killed { .. }) => {
                self.store().load_node(NodeId::Pk(pid)).await?
            }
            Err(RunnerError::AlreadyRunning(_)) => {
                let record = self.store().load_node(NodeId::Pk(pid)).await?;
                return Ok(skipped(pid, &record));
            }
            Err(e) => return Err(e),
        };
        Ok(TaskOutcome {
            pid,
            state: record.process_state(),
            exit_status: record.exit_status(),
            skipped: false,
        })
    }

    async fn recover(&self) -> Result<Vec<Pk>, RunnerError> {
        let persister = self
            .runner
            .persister()
            .cloned()
            .ok_or_else(|| RunnerError::Configuration("recovery requires a persister".to_string()))?;
        let controller = self.runner.controller();
        let mut resumed = Vec::new();

        for pid in persister.list_checkpoints().await? {
            if self.shutdown.is_cancelled() {
                break;
            }
            let record = match self.store().load_node(NodeId::Pk(pid)).await {
                Ok(record) => record,
                Err(e) if e.is_not_existent() => {
                    warn!(pid, "Checkpoint without a record, deleting");
                    persister.delete_checkpoint(pid).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if record.sealed {
                debug!(pid, "Deleting stale checkpoint of a terminated process");
                persister.delete_checkpoint(pid).await?;
                continue;
            }
            if self.runner.is_running(pid) {
                continue;
            }
            if let Some(controller) = &controller {
                match controller.status(pid).await {
                    Ok(Some(_)) | Err(CommunicatorError::Timeout(_)) => {
                        debug!(pid, "Process is alive elsewhere");
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(pid, error = %e, "Status check failed, relying on the lease"),
                }
            }
            let Some(lease) = Lease::acquire(self, pid).await? else {
                debug!(pid, "Process leased by another worker");
                continue;
            };

            match self.runner.resume(pid).await {
                Ok(handle) => {
                    tokio::spawn(async move {
                        match handle.wait().await {
                            Ok(_) => debug!(pid, "Recovered process finished"),
                            Err(e) => debug!(pid, error = %e, "Recovered process ended"),
                        }
                        lease.release().await;
                    });
                    resumed.push(pid);
                }
                Err(e) => {
                    warn!(pid, error = %e, "Failed to resume process");
                    lease.release().await;
                }
            }
        }

        info!(worker_id = %self.worker_id, resumed = resumed.len(), "Recovery pass finished");
        Ok(resumed)
    }
}

fn skipped(pid: Pk, record: &Node) -> TaskOutcome {
    TaskOutcome {
        pid,
        state: record.process_state().filter(|state| state.is_terminal()),
        exit_status: record.exit_status(),
        skipped: true,
    }
}

/// An exclusive claim on a process, renewed in the background.
struct Lease {
    pid: Pk,
    owner: String,
    store: Arc<dyn NodeStore>,
    renewal: JoinHandle<()>,
}

impl Lease {
    async fn acquire(daemon: &DaemonShared, pid: Pk) -> Result<Option<Self>, RunnerError> {
        let store = Arc::clone(daemon.store());
        let owner = daemon.worker_id.clone();
        let ttl = daemon.lease_ttl;
        if !store.acquire_lease(pid, &owner, ttl).await? {
            return Ok(None);
        }
        trace!(pid, owner = %owner, "Lease acquired");

        let renewal = {
            let store = Arc::clone(&store);
            let owner = owner.clone();
            tokio::spawn(async move {
                let period = (ttl / 3).max(Duration::from_millis(10));
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match store.acquire_lease(pid, &owner, ttl).await {
                        Ok(true) => trace!(pid, "Lease renewed"),
                        Ok(false) => warn!(pid, owner = %owner, "Lease lost to another worker"),
                        Err(e) => warn!(pid, error = %e, "Failed to renew lease"),
                    }
                }
            })
        };
        Ok(Some(Self {
            pid,
            owner,
            store,
            renewal,
        }))
    }

    async fn release(self) {
        self.renewal.abort();
        if let Err(e) = self.store.release_lease(self.pid, &self.owner).await {
            warn!(pid = self.pid, error = %e, "Failed to release lease");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
