// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The handle a process step uses to talk to the engine.
//!
//! [`ProcessContext`] owns the in-memory side of a process: inputs, emitted
//! outputs, lifecycle state and the pending wait. Every lifecycle change goes
//! through [`ProcessContext::transition`], which mirrors it onto the record,
//! checkpoints or seals, and broadcasts it, in that order.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{BUNDLE_VERSION, CheckpointBundle};
use crate::communicator::{BroadcastMessage, Communicator, encoding, state_changed_subject};
use crate::error::StoreError;
use crate::node::{Link, LinkType, Node, Pk, attrs};
use crate::payload::{Inputs, Payload};
use crate::persistence::{NodeStore, Persister, REPORT_LEVEL};
use crate::runner::{Runner, RunnerConfig, RunnerInner};
use crate::transport::{AuthInfo, Transport, TransportError, TransportQueue, TransportRequest};

use super::control::{ControlStatus, ProcessControl};
use super::{
    Awaitable, ExitCode, Outputs, Process, ProcessError, ProcessFactory, ProcessSpec,
    ProcessState, WaitResult,
};

/// Log level of error entries in the process report.
pub(crate) const ERROR_LEVEL: &str = "ERROR";

/// Collaborators shared by every process of a runner.
#[derive(Clone)]
pub(crate) struct Services {
    pub store: Arc<dyn NodeStore>,
    pub persister: Option<Arc<dyn Persister>>,
    pub communicator: Option<Communicator>,
    pub transport_queue: TransportQueue,
    pub config: RunnerConfig,
    pub runner: Weak<RunnerInner>,
}

/// Initial in-memory state of a context, fresh or restored.
pub(crate) struct ContextInit {
    pub pid: Pk,
    pub uuid: Uuid,
    pub process_type: String,
    pub label: String,
    pub spec: Arc<ProcessSpec>,
    pub inputs: Inputs,
    pub outputs: BTreeMap<String, Node>,
    pub parent: Option<Pk>,
    pub state: ProcessState,
    pub paused: bool,
    pub step: String,
    pub waiting_on: Option<Awaitable>,
    pub instance_state: Value,
    pub process_status: Option<String>,
}

/// Engine access for a running process.
pub struct ProcessContext {
    pid: Pk,
    uuid: Uuid,
    process_type: String,
    label: String,
    spec: Arc<ProcessSpec>,
    inputs: Inputs,
    outputs: BTreeMap<String, Node>,
    parent: Option<Pk>,
    state: ProcessState,
    paused: bool,
    step: String,
    waiting_on: Option<Awaitable>,
    wait_result: Option<WaitResult>,
    instance_state: Value,
    process_status: Option<String>,
    services: Services,
    control: Arc<ProcessControl>,
    warned_no_persister: bool,
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("pid", &self.pid)
            .field("process_type", &self.process_type)
            .field("state", &self.state)
            .field("paused", &self.paused)
            .field("step", &self.step)
            .finish()
    }
}

impl ProcessContext {
    pub(crate) fn new(init: ContextInit, services: Services) -> Self {
        let control = Arc::new(ProcessControl::new(
            init.pid,
            ControlStatus {
                state: init.state,
                paused: init.paused,
                step: init.step.clone(),
                process_status: init.process_status.clone(),
            },
        ));
        Self {
            pid: init.pid,
            uuid: init.uuid,
            process_type: init.process_type,
            label: init.label,
            spec: init.spec,
            inputs: init.inputs,
            outputs: init.outputs,
            parent: init.parent,
            state: init.state,
            paused: init.paused,
            step: init.step,
            waiting_on: init.waiting_on,
            wait_result: None,
            instance_state: init.instance_state,
            process_status: init.process_status,
            services,
            control,
            warned_no_persister: false,
        }
    }

    /// Pk of the process record.
    pub fn pid(&self) -> Pk {
        self.pid
    }

    /// UUID of the process record.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Registered type string.
    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    /// Record label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Pk of the calling process.
    pub fn parent(&self) -> Option<Pk> {
        self.parent
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether the pause overlay is set.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Name of the step being run.
    pub fn step_name(&self) -> &str {
        &self.step
    }

    /// Validated inputs, defaults applied.
    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    /// Input on port `name`.
    pub fn input(&self, name: &str) -> Option<&Payload> {
        self.inputs.get(name)
    }

    /// Node input on port `name`.
    pub fn input_node(&self, name: &str) -> Option<&Node> {
        self.input(name).and_then(Payload::as_node)
    }

    /// Outputs emitted so far.
    pub fn outputs(&self) -> &BTreeMap<String, Node> {
        &self.outputs
    }

    /// What the last wait resolved with.
    pub fn wait_result(&self) -> Option<&WaitResult> {
        self.wait_result.as_ref()
    }

    /// Take what the last wait resolved with.
    pub fn take_wait_result(&mut self) -> Option<WaitResult> {
        self.wait_result.take()
    }

    /// The graph store.
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.services.store
    }

    /// Named exit code declared by the process spec.
    pub fn exit_code(&self, label: &str) -> Result<ExitCode, ProcessError> {
        self.spec
            .get_exit_code(label)
            .cloned()
            .ok_or_else(|| ProcessError::failed(format!("no exit code labelled '{label}'")))
    }

    /// Emit an output.
    ///
    /// Unstored nodes are stored and linked with CREATE; nodes that already
    /// exist are linked with RETURN. The first emission on a port wins.
    pub async fn out(&mut self, name: &str, node: Node) -> Result<Node, ProcessError> {
        if self.state.is_terminal() {
            return Err(StoreError::node_immutable(self.pid, "the process has terminated").into());
        }
        if self.outputs.contains_key(name) {
            return Err(ProcessError::OutputAlreadyEmitted(name.to_string()));
        }
        self.spec.validate_output(name, &node)?;

        let (node, link_type) = if node.is_stored() {
            (node, LinkType::Return)
        } else {
            (self.services.store.store_node(&node).await?, LinkType::Create)
        };
        let link = Link::new(self.pid, node.stored_pk()?, link_type, name);
        self.services.store.add_link(&link).await?;

        debug!(pid = self.pid, port = %name, link = %link_type, "Output emitted");
        self.outputs.insert(name.to_string(), node.clone());
        Ok(node)
    }

    /// Append a line to the process report.
    pub async fn report(&self, message: impl Into<String>) {
        self.log(REPORT_LEVEL, &message.into()).await;
    }

    /// Set or clear the free-text status on the record.
    pub async fn set_status(&mut self, status: Option<String>) {
        let store = &self.services.store;
        let result = match &status {
            Some(text) => {
                store
                    .set_attribute(self.pid, attrs::PROCESS_STATUS, Value::String(text.clone()))
                    .await
            }
            None => store.delete_attribute(self.pid, attrs::PROCESS_STATUS).await,
        };
        if let Err(e) = result {
            warn!(pid = self.pid, error = %e, "Failed to update process status");
        }
        self.control
            .update(|s| s.process_status.clone_from(&status));
        self.process_status = status;
    }

    /// Submit `P` as a child; returns its record without waiting.
    pub async fn submit<P: Process + Default>(&self, inputs: Inputs) -> Result<Node, ProcessError> {
        self.submit_factory(ProcessFactory::of::<P>(), inputs).await
    }

    /// Submit a registered process type as a child.
    pub async fn submit_type(&self, process_type: &str, inputs: Inputs) -> Result<Node, ProcessError> {
        let factory = self.runner()?.registry().resolve(process_type)?;
        self.submit_factory(factory, inputs).await
    }

    async fn submit_factory(&self, factory: ProcessFactory, inputs: Inputs) -> Result<Node, ProcessError> {
        let handle = self
            .runner()?
            .submit_child(factory, inputs, self.pid)
            .await?;
        Ok(handle.node().clone())
    }

    /// Run `P` as a child and wait for its outputs.
    ///
    /// The child runs in its own task; a child that does not finish is an
    /// error of this step.
    pub async fn run_child<P: Process + Default>(&self, inputs: Inputs) -> Result<Outputs, ProcessError> {
        let handle = self
            .runner()?
            .submit_child(ProcessFactory::of::<P>(), inputs, self.pid)
            .await?;
        Ok(handle.outputs().await?)
    }

    /// Run `f` with a shared transport for `auth`.
    ///
    /// The process is WAITING while the transport queue opens the
    /// connection and RUNNING again when `f` is called. Pause requests are
    /// acknowledged while the grant is pending.
    pub async fn with_transport<F, Fut, T>(&mut self, auth: &dyn AuthInfo, f: F) -> Result<T, ProcessError>
    where
        F: FnOnce(Arc<dyn Transport>) -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        self.hold_while_paused().await?;
        let mut request = self.services.transport_queue.request_transport(auth)?;
        self.transition(ProcessState::Waiting).await?;
        let granted = match self.await_grant(&mut request).await {
            Ok(granted) => granted,
            Err(e) => {
                request.release().await;
                return Err(e);
            }
        };
        if let Err(e) = self.hold_while_paused().await {
            request.release().await;
            return Err(e);
        }
        self.transition(ProcessState::Running).await?;

        let transport = match granted {
            Ok(transport) => transport,
            Err(e) => {
                request.release().await;
                return Err(e.into());
            }
        };
        let output = f(transport).await;
        request.release().await;
        Ok(output)
    }

    async fn await_grant(
        &mut self,
        request: &mut TransportRequest,
    ) -> Result<Result<Arc<dyn Transport>, TransportError>, ProcessError> {
        let kill = self.control.kill_token();
        let mut requests = self.control.subscribe_requests();
        let grant = request.transport();
        tokio::pin!(grant);

        loop {
            tokio::select! {
                biased;
                _ = kill.cancelled() => {
                    return Err(ProcessError::Killed(self.control.kill_message()));
                }
                changed = requests.changed() => {
                    if changed.is_err() {
                        return Ok((&mut grant).await);
                    }
                    let requested = *requests.borrow_and_update();
                    if requested != self.paused {
                        self.set_paused(requested).await;
                    }
                }
                granted = &mut grant => return Ok(granted),
            }
        }
    }

    fn runner(&self) -> Result<Runner, ProcessError> {
        self.services
            .runner
            .upgrade()
            .map(Runner::from_inner)
            .ok_or(ProcessError::RunnerClosed)
    }

    pub(crate) fn control(&self) -> &Arc<ProcessControl> {
        &self.control
    }

    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) fn spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    pub(crate) fn set_step(&mut self, step: String) {
        self.control.update(|s| s.step.clone_from(&step));
        self.step = step;
    }

    pub(crate) fn waiting_on(&self) -> Option<&Awaitable> {
        self.waiting_on.as_ref()
    }

    pub(crate) fn set_waiting_on(&mut self, awaitable: Option<Awaitable>) {
        self.waiting_on = awaitable;
    }

    pub(crate) fn set_wait_result(&mut self, result: WaitResult) {
        self.wait_result = Some(result);
    }

    pub(crate) fn set_instance_state(&mut self, state: Value) {
        self.instance_state = state;
    }

    pub(crate) fn take_outputs(&mut self) -> Outputs {
        Outputs::new(std::mem::take(&mut self.outputs))
    }

    /// Merge attributes into the record, logging failures.
    pub(crate) async fn write_attributes(&self, attributes: Map<String, Value>) {
        if let Err(e) = self.services.store.set_attributes(self.pid, attributes).await {
            warn!(pid = self.pid, error = %e, "Failed to update process record");
        }
    }

    pub(crate) async fn log(&self, level: &str, message: &str) {
        if let Err(e) = self.services.store.add_log(self.pid, level, message).await {
            warn!(pid = self.pid, error = %e, "Failed to write process log");
        }
    }

    /// Enter `to`.
    ///
    /// Order: in-memory state, record attributes, then a checkpoint for
    /// non-terminal states or checkpoint deletion and sealing for terminal
    /// ones, then the state-changed broadcast. Storage failures are logged;
    /// only an illegal transition is an error.
    pub(crate) async fn transition(&mut self, to: ProcessState) -> Result<(), ProcessError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(ProcessError::InvalidTransition { from, to });
        }
        self.state = to;

        let mut attributes = Map::new();
        attributes.insert(
            attrs::PROCESS_STATE.to_string(),
            Value::String(to.as_str().to_string()),
        );
        self.write_attributes(attributes).await;

        if to.is_terminal() {
            if self.paused {
                self.paused = false;
                if let Err(e) = self.services.store.delete_attribute(self.pid, attrs::PAUSED).await {
                    warn!(pid = self.pid, error = %e, "Failed to clear paused flag");
                }
            }
            self.delete_checkpoint().await;
            if let Err(e) = self.services.store.seal(self.pid).await {
                warn!(pid = self.pid, error = %e, "Failed to seal process record");
            }
        } else {
            self.save_checkpoint().await;
        }

        let paused = self.paused;
        self.control.update(|s| {
            s.state = to;
            s.paused = paused;
        });
        self.broadcast_state_change(from, to);
        info!(pid = self.pid, from = %from, to = %to, "Process state changed");
        Ok(())
    }

    fn broadcast_state_change(&self, from: ProcessState, to: ProcessState) {
        let Some(communicator) = &self.services.communicator else {
            return;
        };
        let message = BroadcastMessage::new(
            Some(self.pid.to_string()),
            state_changed_subject(from.as_str(), to.as_str()),
            json!({"pid": self.pid, "from": from, "to": to}),
        );
        if let Err(e) = communicator.broadcast_send(message) {
            debug!(pid = self.pid, error = %e, "State change broadcast not sent");
        }
    }

    /// Set or lift the pause overlay and mirror it onto the record.
    pub(crate) async fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        let store = &self.services.store;
        let result = if paused {
            store.set_attribute(self.pid, attrs::PAUSED, Value::Bool(true)).await
        } else {
            store.delete_attribute(self.pid, attrs::PAUSED).await
        };
        if let Err(e) = result {
            warn!(pid = self.pid, error = %e, "Failed to update paused flag");
        }

        let message = if paused {
            match self.control.pause_message() {
                Some(reason) => format!("Paused: {reason}"),
                None => "Paused".to_string(),
            }
        } else {
            "Played".to_string()
        };
        self.log(REPORT_LEVEL, &message).await;
        self.save_checkpoint().await;
        self.control.update(|s| s.paused = paused);
        info!(pid = self.pid, paused, "Pause overlay changed");
    }

    /// Block at a safe point while a pause is requested.
    ///
    /// Returns `Killed` if a kill arrives first.
    pub(crate) async fn hold_while_paused(&mut self) -> Result<(), ProcessError> {
        let kill = self.control.kill_token();
        let mut requests = self.control.subscribe_requests();
        loop {
            if kill.is_cancelled() {
                return Err(ProcessError::Killed(self.control.kill_message()));
            }
            let requested = *requests.borrow_and_update();
            if requested != self.paused {
                self.set_paused(requested).await;
            }
            if !self.paused {
                return Ok(());
            }
            tokio::select! {
                _ = kill.cancelled() => {}
                changed = requests.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub(crate) fn bundle(&self) -> Result<CheckpointBundle, ProcessError> {
        let outputs = self
            .outputs
            .iter()
            .map(|(name, node)| Ok((name.clone(), node.stored_pk()?)))
            .collect::<Result<BTreeMap<_, _>, StoreError>>()?;
        Ok(CheckpointBundle {
            version: BUNDLE_VERSION,
            pid: self.pid,
            process_type: self.process_type.clone(),
            state: self.state,
            paused: self.paused,
            step: self.step.clone(),
            waiting_on: self.waiting_on.clone(),
            instance_state: self.instance_state.clone(),
            inputs: encoding::encode_inputs(&self.inputs)?,
            outputs,
            parent: self.parent,
            saved_at: chrono::Utc::now(),
        })
    }

    /// Save a checkpoint. Failures are logged; the run continues.
    pub(crate) async fn save_checkpoint(&mut self) {
        if !self.services.config.persistence_enabled {
            return;
        }
        let Some(persister) = self.services.persister.clone() else {
            if !self.warned_no_persister {
                warn!(pid = self.pid, "No persister configured, checkpoints are skipped");
                self.warned_no_persister = true;
            }
            return;
        };
        let bundle = match self.bundle() {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to build checkpoint");
                return;
            }
        };
        match persister.save_checkpoint(&bundle).await {
            Ok(()) => debug!(pid = self.pid, state = %self.state, step = %self.step, "Checkpoint saved"),
            Err(e) => warn!(pid = self.pid, error = %e, "Failed to save checkpoint"),
        }
    }

    async fn delete_checkpoint(&self) {
        let Some(persister) = &self.services.persister else {
            return;
        };
        if let Err(e) = persister.delete_checkpoint(self.pid).await {
            warn!(pid = self.pid, error = %e, "Failed to delete checkpoint");
        }
    }
}
