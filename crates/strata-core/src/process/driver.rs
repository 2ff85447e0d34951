// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drives a process through its state machine.
//!
//! [`ProcessDriver::create`] validates inputs and builds the record and its
//! input links; [`ProcessDriver::load`] rebuilds a process from a checkpoint.
//! [`ProcessDriver::execute`] then runs steps until the process terminates,
//! honouring pause and kill requests at every step boundary and while
//! waiting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointBundle;
use crate::communicator::{BroadcastFilter, Communicator, CommunicatorError, SubscriberId, encoding};
use crate::controller::Controller;
use crate::error::StoreError;
use crate::node::{Direction, Link, LinkType, Node, NodeId, Pk, attrs};
use crate::payload::{Inputs, store_input_nodes};
use crate::persistence::REPORT_LEVEL;
use crate::process_future::ProcessFuture;

use super::context::{ContextInit, ERROR_LEVEL, Services};
use super::control::ProcessControl;
use super::spec::linkable_inputs;
use super::{
    Awaitable, ExitCode, Outputs, Process, ProcessContext, ProcessError, ProcessFactory,
    ProcessState, Step, WaitResult,
};

/// Result of a process that reached a terminal state.
pub(crate) struct Outcome {
    /// The sealed record.
    pub record: Node,
    /// Outputs emitted before termination.
    pub outputs: Outputs,
}

pub(crate) struct ProcessDriver {
    process: Box<dyn Process>,
    ctx: ProcessContext,
}

impl ProcessDriver {
    /// Validate inputs, store the record and link the inputs.
    ///
    /// Invalid inputs fail before anything is stored. A failure after the
    /// record was stored seals it as EXCEPTED.
    pub(crate) async fn create(
        factory: &ProcessFactory,
        inputs: Inputs,
        parent: Option<Pk>,
        uuid: Option<Uuid>,
        services: Services,
    ) -> Result<Self, ProcessError> {
        let mut inputs = inputs;
        factory.spec().validate_inputs(&mut inputs)?;

        let mut record = Node::process_record(factory.process_type(), factory.label());
        if let Some(uuid) = uuid {
            record = record.with_uuid(uuid);
        }
        let record = services.store.store_node(&record).await?;
        let pid = record.stored_pk()?;

        if let Err(e) = link_inputs(&services, pid, parent, factory, &mut inputs).await {
            fail_creation(&services, pid, &e).await;
            return Err(e);
        }

        let process = factory.instantiate();
        let init = ContextInit {
            pid,
            uuid: record.uuid,
            process_type: factory.process_type().to_string(),
            label: factory.label().to_string(),
            spec: Arc::clone(factory.spec()),
            inputs,
            outputs: BTreeMap::new(),
            parent,
            state: ProcessState::Created,
            paused: false,
            step: process.entry_step().to_string(),
            waiting_on: None,
            instance_state: process.save_state(),
            process_status: None,
        };
        let mut ctx = ProcessContext::new(init, services);
        ctx.save_checkpoint().await;

        info!(pid, process_type = %factory.process_type(), parent = ?parent, "Process created");
        Ok(Self { process, ctx })
    }

    /// Rebuild a process from its checkpoint.
    pub(crate) async fn load(
        factory: &ProcessFactory,
        bundle: CheckpointBundle,
        services: Services,
    ) -> Result<Self, ProcessError> {
        let store = Arc::clone(&services.store);
        let record = store.load_node(NodeId::Pk(bundle.pid)).await?;
        if record.sealed {
            return Err(StoreError::node_immutable(bundle.pid, "the process already terminated").into());
        }

        let mut process = factory.instantiate();
        process.load_state(bundle.instance_state.clone())?;

        let inputs = encoding::decode_inputs(&bundle.inputs, store.as_ref()).await?;
        let mut outputs = BTreeMap::new();
        for (name, pk) in bundle.outputs {
            outputs.insert(name, store.load_node(NodeId::Pk(pk)).await?);
        }

        info!(
            pid = bundle.pid,
            state = %bundle.state,
            step = %bundle.step,
            paused = bundle.paused,
            "Process loaded from checkpoint"
        );
        let init = ContextInit {
            pid: bundle.pid,
            uuid: record.uuid,
            process_type: bundle.process_type,
            label: record
                .process_label()
                .unwrap_or(factory.label())
                .to_string(),
            spec: Arc::clone(factory.spec()),
            inputs,
            outputs,
            parent: bundle.parent,
            state: bundle.state,
            paused: bundle.paused,
            step: bundle.step,
            waiting_on: bundle.waiting_on,
            instance_state: bundle.instance_state,
            process_status: record.process_status().map(str::to_string),
        };
        Ok(Self {
            process,
            ctx: ProcessContext::new(init, services),
        })
    }

    pub(crate) fn pid(&self) -> Pk {
        self.ctx.pid()
    }

    pub(crate) fn uuid(&self) -> Uuid {
        self.ctx.uuid()
    }

    pub(crate) fn control(&self) -> Arc<ProcessControl> {
        Arc::clone(self.ctx.control())
    }

    /// Run to a terminal state.
    ///
    /// Process failures end in EXCEPTED and kills in KILLED; both are
    /// reported through the outcome's record, not as errors.
    pub(crate) async fn execute(mut self) -> Result<Outcome, ProcessError> {
        let kill = self.ctx.control().kill_token();
        let terminal = match self.run_steps(&kill).await {
            Ok(code) => self.finish(code).await,
            Err(ProcessError::Killed(message)) => self.kill(message).await,
            Err(error) => self.except(error).await,
        };
        terminal?;

        let record = self.ctx.store().load_node(NodeId::Pk(self.ctx.pid())).await?;
        Ok(Outcome {
            record,
            outputs: self.ctx.take_outputs(),
        })
    }

    async fn run_steps(&mut self, kill: &CancellationToken) -> Result<ExitCode, ProcessError> {
        if self.ctx.state() == ProcessState::Created {
            self.ctx.hold_while_paused().await?;
            self.ctx.transition(ProcessState::Running).await?;
        }

        loop {
            self.ctx.hold_while_paused().await?;

            if let Some(awaitable) = self.ctx.waiting_on().cloned() {
                if self.ctx.state() != ProcessState::Waiting {
                    self.ctx.transition(ProcessState::Waiting).await?;
                }
                let result = self.await_event(awaitable, kill).await?;
                self.ctx.set_wait_result(result);
                self.ctx.set_waiting_on(None);
                self.ctx.hold_while_paused().await?;
                self.ctx.transition(ProcessState::Running).await?;
                continue;
            }
            if self.ctx.state() == ProcessState::Waiting {
                // interrupted while waiting inside a step
                self.ctx.transition(ProcessState::Running).await?;
            }

            let step = self.ctx.step_name().to_string();
            let outcome = tokio::select! {
                biased;
                _ = kill.cancelled() => None,
                outcome = self.process.step(&step, &mut self.ctx) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                return Err(ProcessError::Killed(self.ctx.control().kill_message()));
            };

            match outcome? {
                Step::Next(next) => {
                    self.ctx.set_step(next);
                    self.ctx.set_instance_state(self.process.save_state());
                    self.ctx.save_checkpoint().await;
                }
                Step::Wait { on, resume } => {
                    self.ctx.set_step(resume);
                    self.ctx.set_waiting_on(Some(on));
                    self.ctx.set_instance_state(self.process.save_state());
                    self.ctx.hold_while_paused().await?;
                    self.ctx.transition(ProcessState::Waiting).await?;
                }
                Step::Done(code) => return Ok(code),
            }
        }
    }

    /// Wait for `awaitable` while still answering pause and kill requests.
    async fn await_event(
        &mut self,
        awaitable: Awaitable,
        kill: &CancellationToken,
    ) -> Result<WaitResult, ProcessError> {
        let wait = wait_for(awaitable, self.ctx.services().clone());
        tokio::pin!(wait);
        let mut requests = self.ctx.control().subscribe_requests();

        loop {
            tokio::select! {
                biased;
                _ = kill.cancelled() => {
                    return Err(ProcessError::Killed(self.ctx.control().kill_message()));
                }
                changed = requests.changed() => {
                    if changed.is_err() {
                        return (&mut wait).await;
                    }
                    let requested = *requests.borrow_and_update();
                    if requested != self.ctx.is_paused() {
                        self.ctx.set_paused(requested).await;
                    }
                }
                result = &mut wait => return result,
            }
        }
    }

    async fn finish(&mut self, code: ExitCode) -> Result<(), ProcessError> {
        if code.is_ok()
            && let Err(e) = self.ctx.spec().validate_outputs(self.ctx.outputs())
        {
            return self.except(e.into()).await;
        }

        let mut attributes = Map::new();
        attributes.insert(attrs::EXIT_STATUS.to_string(), Value::from(code.status));
        if let Some(message) = &code.message {
            attributes.insert(attrs::EXIT_MESSAGE.to_string(), Value::String(message.clone()));
        }
        self.ctx.write_attributes(attributes).await;
        self.ctx.transition(ProcessState::Finished).await
    }

    async fn except(&mut self, error: ProcessError) -> Result<(), ProcessError> {
        error!(pid = self.ctx.pid(), error = %error, "Process excepted");
        let mut attributes = Map::new();
        attributes.insert(attrs::EXCEPTION.to_string(), Value::String(error.to_string()));
        self.ctx.write_attributes(attributes).await;
        self.ctx
            .log(ERROR_LEVEL, &format!("Process excepted: {error}"))
            .await;
        self.ctx.transition(ProcessState::Excepted).await
    }

    async fn kill(&mut self, message: String) -> Result<(), ProcessError> {
        kill_children(self.ctx.pid(), self.ctx.services().clone(), &message).await;
        self.ctx.set_status(Some(message.clone())).await;
        self.ctx.log(REPORT_LEVEL, &format!("Killed: {message}")).await;
        self.ctx.transition(ProcessState::Killed).await
    }
}

/// Kill every called child of `pid`, waiting at most `kill_children_timeout`.
async fn kill_children(pid: Pk, services: Services, message: &str) {
    let children: Vec<Pk> = match services
        .store
        .get_links(pid, Direction::Outgoing, Some(LinkType::Call))
        .await
    {
        Ok(links) => links.into_iter().map(|link| link.target).collect(),
        Err(e) => {
            warn!(pid, error = %e, "Failed to list children, not propagating kill");
            return;
        }
    };
    if children.is_empty() {
        return;
    }

    let runner = services.runner.upgrade();
    let controller = services
        .communicator
        .clone()
        .map(|c| Controller::new(c, services.config.kill_children_timeout));
    let child_message = format!("Killed by parent <{pid}>: {message}");

    let kills = children.into_iter().map(|child| {
        let local = runner.as_ref().and_then(|r| r.local_control(child));
        let controller = controller.clone();
        let store = Arc::clone(&services.store);
        let message = child_message.clone();
        async move {
            if store
                .load_node(NodeId::Pk(child))
                .await
                .is_ok_and(|node| node.is_terminated())
            {
                return (child, true);
            }
            let killed = match (local, controller) {
                (Some(control), _) => control.kill(Some(message)).await,
                (None, Some(controller)) => controller
                    .kill_process(child, Some(&message))
                    .await
                    .unwrap_or(false),
                (None, None) => false,
            };
            (child, killed)
        }
    });

    let timeout = services.config.kill_children_timeout;
    match tokio::time::timeout(timeout, futures::future::join_all(kills)).await {
        Ok(results) => {
            for (child, killed) in results {
                if !killed {
                    warn!(pid, child, "Child did not confirm the kill, potential zombie");
                }
            }
        }
        Err(_) => warn!(
            pid,
            timeout_ms = timeout.as_millis() as u64,
            "Timed out killing children, potential zombies"
        ),
    }
}

/// Store unstored input nodes and create the CALL and input links.
async fn link_inputs(
    services: &Services,
    pid: Pk,
    parent: Option<Pk>,
    factory: &ProcessFactory,
    inputs: &mut Inputs,
) -> Result<(), ProcessError> {
    let store = &services.store;
    if let Some(parent) = parent {
        store
            .add_link(&Link::new(parent, pid, LinkType::Call, factory.label()))
            .await?;
    }

    let created = store_input_nodes(store.as_ref(), inputs).await?;

    for (label, node) in linkable_inputs(&factory.spec().inputs, inputs) {
        let node_pk = node.stored_pk()?;
        if let Some(parent) = parent
            && created.contains(&node.uuid)
        {
            store
                .add_link(&Link::new(parent, node_pk, LinkType::Create, label.as_str()))
                .await?;
        }
        store
            .add_link(&Link::new(node_pk, pid, LinkType::Input, label))
            .await?;
    }
    Ok(())
}

async fn fail_creation(services: &Services, pid: Pk, error: &ProcessError) {
    error!(pid, error = %error, "Process creation failed");
    let store = &services.store;
    let mut attributes = Map::new();
    attributes.insert(
        attrs::PROCESS_STATE.to_string(),
        Value::String(ProcessState::Excepted.as_str().to_string()),
    );
    attributes.insert(attrs::EXCEPTION.to_string(), Value::String(error.to_string()));
    if let Err(e) = store.set_attributes(pid, attributes).await {
        warn!(pid, error = %e, "Failed to record creation failure");
    }
    if let Err(e) = store
        .add_log(pid, ERROR_LEVEL, &format!("Process creation failed: {error}"))
        .await
    {
        warn!(pid, error = %e, "Failed to write process log");
    }
    if let Err(e) = store.seal(pid).await {
        warn!(pid, error = %e, "Failed to seal process record");
    }
}

/// Removes a broadcast subscription when dropped.
struct BroadcastSubscription {
    communicator: Communicator,
    id: SubscriberId,
}

impl Drop for BroadcastSubscription {
    fn drop(&mut self) {
        self.communicator.remove_broadcast_subscriber(self.id);
    }
}

async fn wait_for(awaitable: Awaitable, services: Services) -> Result<WaitResult, ProcessError> {
    match awaitable {
        Awaitable::Process { pid } => {
            let future = ProcessFuture::new(
                pid,
                Arc::clone(&services.store),
                services.config.poll_interval,
                services.communicator.clone(),
            )
            .await?;
            Ok(WaitResult::Process(future.await?))
        }
        Awaitable::Sleep { until } => {
            let remaining = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;
            Ok(WaitResult::Elapsed)
        }
        Awaitable::Broadcast { sender, subject } => {
            let communicator = services.communicator.ok_or_else(|| {
                ProcessError::failed("waiting on a broadcast requires a communicator")
            })?;
            let mut filter = BroadcastFilter::new().subject(subject);
            if let Some(sender) = sender {
                filter = filter.sender(sender);
            }

            let (tx, rx) = oneshot::channel();
            let slot = Mutex::new(Some(tx));
            let id = communicator.add_broadcast_subscriber(
                filter,
                Arc::new(move |message| {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(message);
                    }
                }),
            )?;
            let _subscription = BroadcastSubscription { communicator, id };

            let message = rx.await.map_err(|_| CommunicatorError::ConnectionClosed)?;
            Ok(WaitResult::Broadcast(message))
        }
    }
}
