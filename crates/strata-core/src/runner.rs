// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The execution context for processes.
//!
//! A [`Runner`] ties together the node store, the persister, the optional
//! communicator, the transport queue and the process registry. It drives
//! processes either inline ([`Runner::run`]) or in their own tokio task
//! ([`Runner::submit`]), resumes them from checkpoints, and answers control
//! RPCs for every process it is driving.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strata_core::persistence::MemoryStore;
//! use strata_core::runner::Runner;
//!
//! let store = Arc::new(MemoryStore::new());
//! let runner = Runner::builder()
//!     .store(store.clone())
//!     .persister(store)
//!     .build()?;
//!
//! let outputs = runner.run::<AddOne>(inputs).await?;
//! runner.close().await;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::communicator::{Communicator, CommunicatorError, RpcHandler};
use crate::controller::{ControlMessage, Controller, ProcessStatusReport};
use crate::error::StoreError;
use crate::node::{Direction, LinkType, Node, NodeId, Pk};
use crate::payload::Inputs;
use crate::persistence::{NodeStore, Persister};
use crate::process::context::Services;
use crate::process::control::ProcessControl;
use crate::process::driver::{Outcome, ProcessDriver};
use crate::process::{Outputs, Process, ProcessError, ProcessFactory, ProcessRegistry, ProcessState};
use crate::process_future::{FutureError, ProcessFuture};
use crate::transport::TransportQueue;

/// Runtime settings of a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Save checkpoints on every non-terminal transition.
    pub persistence_enabled: bool,
    /// Timeout of control RPCs sent by the runner.
    pub rpc_timeout: Duration,
    /// Poll fallback for awaiting other processes; `None` relies on broadcasts.
    pub poll_interval: Option<Duration>,
    /// Bounded wait for children to acknowledge a kill.
    pub kill_children_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            persistence_enabled: true,
            rpc_timeout: Duration::from_secs(10),
            poll_interval: Some(Duration::from_secs(1)),
            kill_children_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors returned by runner entry points.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The process could not be created or driven.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The process ended in EXCEPTED.
    #[error("process {pid} excepted: {message}")]
    Excepted {
        /// Process record pk.
        pid: Pk,
        /// Recorded exception.
        message: String,
    },

    /// The process ended in KILLED.
    #[error("process {pid} was killed: {message}")]
    Killed {
        /// Process record pk.
        pid: Pk,
        /// Kill message.
        message: String,
    },

    /// The runner was closed.
    #[error("runner is closed")]
    Closed,

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The message bus failed.
    #[error(transparent)]
    Communicator(#[from] CommunicatorError),

    /// A collaborator needed for the operation is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The process is already driven by this runner.
    #[error("process {0} is already running")]
    AlreadyRunning(Pk),

    /// The process task panicked.
    #[error("process task failed: {0}")]
    Join(String),
}

impl From<FutureError> for RunnerError {
    fn from(err: FutureError) -> Self {
        match err {
            FutureError::Store(e) => RunnerError::Store(e),
            FutureError::Communicator(e) => RunnerError::Communicator(e),
            other => RunnerError::Configuration(other.to_string()),
        }
    }
}

impl From<RunnerError> for ProcessError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Process(e) => e,
            RunnerError::Excepted { pid, message } | RunnerError::Killed { pid, message } => {
                ProcessError::Child { pid, message }
            }
            RunnerError::Closed => ProcessError::RunnerClosed,
            RunnerError::Store(e) => ProcessError::Store(e),
            RunnerError::Communicator(e) => ProcessError::Communicator(e),
            other => ProcessError::Failed(other.to_string()),
        }
    }
}

/// Builder for a [`Runner`].
#[derive(Default)]
pub struct RunnerBuilder {
    store: Option<Arc<dyn NodeStore>>,
    persister: Option<Arc<dyn Persister>>,
    communicator: Option<Communicator>,
    registry: Option<Arc<ProcessRegistry>>,
    transport_queue: Option<TransportQueue>,
    config: RunnerConfig,
}

impl std::fmt::Debug for RunnerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("persister", &self.persister.as_ref().map(|_| "..."))
            .field("communicator", &self.communicator)
            .field("config", &self.config)
            .finish()
    }
}

impl RunnerBuilder {
    /// Node store (required).
    pub fn store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Checkpoint persister. Without one, checkpoints are skipped with a warning.
    pub fn persister(mut self, persister: Arc<dyn Persister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Message bus for control RPCs and state broadcasts.
    pub fn communicator(mut self, communicator: Communicator) -> Self {
        self.communicator = Some(communicator);
        self
    }

    /// Registry used to resolve stored process types.
    pub fn registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Transport queue; a fresh one by default.
    pub fn transport_queue(mut self, queue: TransportQueue) -> Self {
        self.transport_queue = Some(queue);
        self
    }

    /// Runtime settings.
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runner.
    pub fn build(self) -> Result<Runner, RunnerError> {
        let store = self
            .store
            .ok_or_else(|| RunnerError::Configuration("a node store is required".to_string()))?;
        let inner = RunnerInner {
            id: Uuid::new_v4(),
            store,
            persister: self.persister,
            communicator: self.communicator,
            registry: self.registry.unwrap_or_default(),
            transport_queue: self.transport_queue.unwrap_or_default(),
            config: self.config,
            processes: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        info!(
            runner_id = %inner.id,
            persistence = inner.config.persistence_enabled && inner.persister.is_some(),
            communicator = inner.communicator.is_some(),
            "Runner created"
        );
        Ok(Runner {
            inner: Arc::new(inner),
        })
    }
}

pub(crate) struct RunnerInner {
    id: Uuid,
    store: Arc<dyn NodeStore>,
    persister: Option<Arc<dyn Persister>>,
    communicator: Option<Communicator>,
    registry: Arc<ProcessRegistry>,
    transport_queue: TransportQueue,
    config: RunnerConfig,
    processes: Mutex<HashMap<Pk, Arc<ProcessControl>>>,
    tasks: Mutex<HashMap<Pk, AbortHandle>>,
    closed: AtomicBool,
}

impl RunnerInner {
    /// Control handle of a process driven by this runner.
    pub(crate) fn local_control(&self, pid: Pk) -> Option<Arc<ProcessControl>> {
        self.processes.lock().get(&pid).cloned()
    }
}

/// Drives processes. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.inner.id)
            .field("running", &self.inner.processes.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A process started with [`Runner::submit`].
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pk,
    node: Node,
    task: JoinHandle<Result<(Outputs, Node), RunnerError>>,
}

impl ProcessHandle {
    /// Process record pk.
    pub fn pid(&self) -> Pk {
        self.pid
    }

    /// The record as it was when the process was started.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Whether the process task ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the outputs and the sealed record.
    pub async fn wait(self) -> Result<(Outputs, Node), RunnerError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(RunnerError::Closed),
            Err(e) => Err(RunnerError::Join(e.to_string())),
        }
    }

    /// Wait for the outputs.
    pub async fn outputs(self) -> Result<Outputs, RunnerError> {
        self.wait().await.map(|(outputs, _)| outputs)
    }
}

impl Runner {
    /// Start building a runner.
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<RunnerInner>) -> Self {
        Self { inner }
    }

    /// Unique id of this runner.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The node store.
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.inner.store
    }

    /// The checkpoint persister, if any.
    pub fn persister(&self) -> Option<&Arc<dyn Persister>> {
        self.inner.persister.as_ref()
    }

    /// The message bus, if any.
    pub fn communicator(&self) -> Option<&Communicator> {
        self.inner.communicator.as_ref()
    }

    /// Registered process types.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.inner.registry
    }

    /// Shared transport queue.
    pub fn transport_queue(&self) -> &TransportQueue {
        &self.inner.transport_queue
    }

    /// Runtime settings.
    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Controller over this runner's communicator.
    pub fn controller(&self) -> Option<Controller> {
        self.inner
            .communicator
            .clone()
            .map(|c| Controller::new(c, self.inner.config.rpc_timeout))
    }

    /// Run `P` to completion and return its outputs.
    pub async fn run<P: Process + Default>(&self, inputs: Inputs) -> Result<Outputs, RunnerError> {
        self.run_get_node::<P>(inputs).await.map(|(outputs, _)| outputs)
    }

    /// Run `P` to completion and return its outputs with the sealed record.
    pub async fn run_get_node<P: Process + Default>(
        &self,
        inputs: Inputs,
    ) -> Result<(Outputs, Node), RunnerError> {
        self.run_factory(&ProcessFactory::of::<P>(), inputs).await
    }

    /// Run a registered process type to completion.
    pub async fn run_type(&self, process_type: &str, inputs: Inputs) -> Result<Outputs, RunnerError> {
        let factory = self.inner.registry.resolve(process_type)?;
        self.run_factory(&factory, inputs)
            .await
            .map(|(outputs, _)| outputs)
    }

    #[instrument(skip(self, factory, inputs), fields(process_type = %factory.process_type()))]
    async fn run_factory(
        &self,
        factory: &ProcessFactory,
        inputs: Inputs,
    ) -> Result<(Outputs, Node), RunnerError> {
        let driver = self.create_driver(factory, inputs, None, None).await?;
        self.run_driver(driver).await
    }

    /// Start `P` in its own task and return immediately.
    pub async fn submit<P: Process + Default>(&self, inputs: Inputs) -> Result<ProcessHandle, RunnerError> {
        self.submit_factory(ProcessFactory::of::<P>(), inputs, None, None)
            .await
    }

    /// Start a registered process type in its own task.
    pub async fn submit_type(&self, process_type: &str, inputs: Inputs) -> Result<ProcessHandle, RunnerError> {
        let factory = self.inner.registry.resolve(process_type)?;
        self.submit_factory(factory, inputs, None, None).await
    }

    pub(crate) async fn submit_child(
        &self,
        factory: ProcessFactory,
        inputs: Inputs,
        parent: Pk,
    ) -> Result<ProcessHandle, RunnerError> {
        self.submit_factory(factory, inputs, Some(parent), None)
            .await
    }

    #[instrument(skip(self, factory, inputs), fields(process_type = %factory.process_type(), parent = ?parent))]
    pub(crate) async fn submit_factory(
        &self,
        factory: ProcessFactory,
        inputs: Inputs,
        parent: Option<Pk>,
        uuid: Option<Uuid>,
    ) -> Result<ProcessHandle, RunnerError> {
        let driver = self.create_driver(&factory, inputs, parent, uuid).await?;
        self.spawn(driver).await
    }

    /// Create the record and first checkpoint without driving the process.
    pub(crate) async fn create_driver(
        &self,
        factory: &ProcessFactory,
        inputs: Inputs,
        parent: Option<Pk>,
        uuid: Option<Uuid>,
    ) -> Result<ProcessDriver, RunnerError> {
        self.ensure_open()?;
        Ok(ProcessDriver::create(factory, inputs, parent, uuid, self.services()).await?)
    }

    /// Drive a created or loaded process to completion in this task.
    pub(crate) async fn run_driver(&self, driver: ProcessDriver) -> Result<(Outputs, Node), RunnerError> {
        let registration = Registration::new(&self.inner, driver.control())?;
        registration.settle().await;
        drive(registration, driver).await
    }

    /// Resume `pid` from its checkpoint in its own task.
    #[instrument(skip(self))]
    pub async fn resume(&self, pid: Pk) -> Result<ProcessHandle, RunnerError> {
        self.ensure_open()?;
        let driver = self.load_driver(pid).await?;
        self.spawn(driver).await
    }

    /// Resume `pid` from its checkpoint and run it to completion.
    #[instrument(skip(self))]
    pub async fn continue_process(&self, pid: Pk) -> Result<(Outputs, Node), RunnerError> {
        self.ensure_open()?;
        let driver = self.load_driver(pid).await?;
        self.run_driver(driver).await
    }

    /// Create `P` here and hand it to a daemon runner.
    ///
    /// The record and its first checkpoint are written locally; a daemon
    /// picks the process up through a continue task. Returns the record.
    pub async fn submit_to_daemon<P: Process + Default>(&self, inputs: Inputs) -> Result<Node, RunnerError> {
        self.submit_factory_to_daemon(&ProcessFactory::of::<P>(), inputs)
            .await
    }

    /// Create a registered process type here and hand it to a daemon runner.
    pub async fn submit_type_to_daemon(&self, process_type: &str, inputs: Inputs) -> Result<Node, RunnerError> {
        let factory = self.inner.registry.resolve(process_type)?;
        self.submit_factory_to_daemon(&factory, inputs).await
    }

    async fn submit_factory_to_daemon(
        &self,
        factory: &ProcessFactory,
        inputs: Inputs,
    ) -> Result<Node, RunnerError> {
        self.ensure_open()?;
        let controller = self.controller().ok_or_else(|| {
            RunnerError::Configuration("submitting to a daemon requires a communicator".to_string())
        })?;
        if self.inner.persister.is_none() || !self.inner.config.persistence_enabled {
            return Err(RunnerError::Configuration(
                "submitting to a daemon requires persistence".to_string(),
            ));
        }

        let pid = self.create_driver(factory, inputs, None, None).await?.pid();

        tokio::spawn(async move {
            match controller.continue_process(pid).await {
                Ok(outcome) => debug!(pid, state = ?outcome.state, skipped = outcome.skipped, "Daemon task completed"),
                Err(e) => warn!(pid, error = %e, "Daemon task failed"),
            }
        });
        info!(pid, "Process handed to daemon");
        Ok(self.inner.store.load_node(NodeId::Pk(pid)).await?)
    }

    /// Future resolving once `pid` terminated.
    pub async fn get_process_future(&self, pid: Pk) -> Result<ProcessFuture, RunnerError> {
        Ok(ProcessFuture::new(
            pid,
            Arc::clone(&self.inner.store),
            self.inner.config.poll_interval,
            self.inner.communicator.clone(),
        )
        .await?)
    }

    /// Whether `pid` is being driven by this runner.
    pub fn is_running(&self, pid: Pk) -> bool {
        self.inner.processes.lock().contains_key(&pid)
    }

    /// Pids driven by this runner, sorted.
    pub fn running_processes(&self) -> Vec<Pk> {
        let mut pids: Vec<Pk> = self.inner.processes.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub(crate) fn local_control(&self, pid: Pk) -> Option<Arc<ProcessControl>> {
        self.inner.local_control(pid)
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the transport queue, drop RPC subscriptions and stop process
    /// tasks, in that order. Idempotent.
    ///
    /// Stopped processes keep their last checkpoint and can be resumed.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.transport_queue.close().await;

        let pids: Vec<Pk> = self.inner.processes.lock().keys().copied().collect();
        if let Some(communicator) = &self.inner.communicator {
            for pid in &pids {
                communicator.remove_rpc_subscriber(&pid.to_string());
            }
        }

        let tasks: Vec<(Pk, AbortHandle)> = self.inner.tasks.lock().drain().collect();
        for (_, task) in &tasks {
            task.abort();
        }
        info!(runner_id = %self.inner.id, stopped = tasks.len(), "Runner closed");
    }

    fn ensure_open(&self) -> Result<(), RunnerError> {
        if self.is_closed() {
            return Err(RunnerError::Closed);
        }
        Ok(())
    }

    fn services(&self) -> Services {
        Services {
            store: Arc::clone(&self.inner.store),
            persister: self.inner.persister.clone(),
            communicator: self.inner.communicator.clone(),
            transport_queue: self.inner.transport_queue.clone(),
            config: self.inner.config.clone(),
            runner: Arc::downgrade(&self.inner),
        }
    }

    async fn load_driver(&self, pid: Pk) -> Result<ProcessDriver, RunnerError> {
        let persister = self.inner.persister.as_ref().ok_or_else(|| {
            RunnerError::Configuration("resuming a process requires a persister".to_string())
        })?;
        if self.is_running(pid) {
            return Err(RunnerError::AlreadyRunning(pid));
        }
        let bundle = persister.load_checkpoint(pid).await?;
        let factory = self.inner.registry.resolve(&bundle.process_type)?;
        Ok(ProcessDriver::load(&factory, bundle, self.services()).await?)
    }

    async fn spawn(&self, driver: ProcessDriver) -> Result<ProcessHandle, RunnerError> {
        let pid = driver.pid();
        let registration = Registration::new(&self.inner, driver.control())?;
        registration.settle().await;
        let node = self.inner.store.load_node(NodeId::Pk(pid)).await?;

        let inner = Arc::clone(&self.inner);
        let mut tasks = self.inner.tasks.lock();
        let task = tokio::spawn(async move {
            let result = drive(registration, driver).await;
            inner.tasks.lock().remove(&pid);
            result
        });
        tasks.insert(pid, task.abort_handle());
        drop(tasks);

        debug!(pid, "Process task spawned");
        Ok(ProcessHandle { pid, node, task })
    }
}

/// Execute a registered driver and map its terminal state.
async fn drive(registration: Registration, driver: ProcessDriver) -> Result<(Outputs, Node), RunnerError> {
    let outcome = driver.execute().await;
    drop(registration);
    into_result(outcome?)
}

fn into_result(outcome: Outcome) -> Result<(Outputs, Node), RunnerError> {
    let Outcome { record, outputs } = outcome;
    let pid = record.stored_pk()?;
    match record.process_state() {
        Some(ProcessState::Excepted) => Err(RunnerError::Excepted {
            pid,
            message: record.exception().unwrap_or("process excepted").to_string(),
        }),
        Some(ProcessState::Killed) => Err(RunnerError::Killed {
            pid,
            message: record.process_status().unwrap_or("process was killed").to_string(),
        }),
        _ => Ok((outputs, record)),
    }
}

/// Makes a process controllable for as long as it is driven.
///
/// A process whose RPC subscription fails still runs; it is then only
/// controllable from this runner.
struct Registration {
    pid: Pk,
    inner: Arc<RunnerInner>,
    subscribed: bool,
}

impl Registration {
    fn new(inner: &Arc<RunnerInner>, control: Arc<ProcessControl>) -> Result<Self, RunnerError> {
        let pid = control.pid();
        {
            let mut processes = inner.processes.lock();
            if processes.contains_key(&pid) {
                return Err(RunnerError::AlreadyRunning(pid));
            }
            processes.insert(pid, Arc::clone(&control));
        }

        let mut subscribed = false;
        if let Some(communicator) = &inner.communicator {
            let handler = control_handler(control, Arc::clone(&inner.store));
            match communicator.add_rpc_subscriber(&pid.to_string(), handler) {
                Ok(()) => subscribed = true,
                Err(CommunicatorError::DuplicateSubscriber(_)) => {
                    inner.processes.lock().remove(&pid);
                    return Err(RunnerError::AlreadyRunning(pid));
                }
                Err(e) => {
                    warn!(pid, error = %e, "RPC subscription failed, running without remote control");
                }
            }
        }

        Ok(Self {
            pid,
            inner: Arc::clone(inner),
            subscribed,
        })
    }

    /// Wait until the RPC subscription is reachable from other connections.
    async fn settle(&self) {
        if self.subscribed
            && let Some(communicator) = &self.inner.communicator
            && let Err(e) = communicator.flush().await
        {
            debug!(pid = self.pid, error = %e, "Broker flush failed");
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.processes.lock().remove(&self.pid);
        if self.subscribed
            && let Some(communicator) = &self.inner.communicator
        {
            communicator.remove_rpc_subscriber(&self.pid.to_string());
        }
    }
}

/// RPC handler answering [`ControlMessage`]s for one process.
fn control_handler(control: Arc<ProcessControl>, store: Arc<dyn NodeStore>) -> RpcHandler {
    Arc::new(move |body: Value| {
        let control = Arc::clone(&control);
        let store = Arc::clone(&store);
        async move {
            let message: ControlMessage = serde_json::from_value(body)?;
            debug!(pid = control.pid(), message = ?message, "Control message received");
            let reply = match message {
                ControlMessage::Pause { message } => Value::Bool(control.pause(message).await),
                ControlMessage::Play => Value::Bool(control.play().await),
                ControlMessage::Kill { message } => Value::Bool(control.kill(message).await),
                ControlMessage::Status => {
                    let report = status_report(&control, store.as_ref()).await?;
                    serde_json::to_value(report)?
                }
            };
            Ok(reply)
        }
        .boxed()
    })
}

async fn status_report(
    control: &ProcessControl,
    store: &dyn NodeStore,
) -> Result<ProcessStatusReport, CommunicatorError> {
    let pid = control.pid();
    let status = control.status();
    let children = store
        .get_links(pid, Direction::Outgoing, Some(LinkType::Call))
        .await?
        .into_iter()
        .map(|link| link.target)
        .collect();
    Ok(ProcessStatusReport {
        pid,
        state: status.state,
        paused: status.paused,
        process_status: status.process_status,
        step: status.step,
        children,
    })
}
