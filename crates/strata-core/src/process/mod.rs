// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processes: the checkpointable unit of execution.
//!
//! A process type implements [`Process`]: it declares its ports once in
//! [`Process::define`] and runs as a sequence of named steps. Each step
//! returns a [`Step`] telling the driver what happens next:
//!
//! - [`Step::Next`]: continue with another step (a checkpoint is taken).
//! - [`Step::Wait`]: suspend on an [`Awaitable`] and resume at a given step.
//! - [`Step::Done`]: finish with an [`ExitCode`].
//!
//! Steps are the only resumption points. A process resumed from a checkpoint
//! re-enters the step recorded in the bundle, with the state it returned from
//! [`Process::save_state`] restored through [`Process::load_state`].
//!
//! ```ignore
//! #[derive(Default)]
//! struct AddOne;
//!
//! #[async_trait::async_trait]
//! impl Process for AddOne {
//!     fn define(spec: &mut ProcessSpec) {
//!         spec.input(PortSpec::new("x").valid_type("data.int"))
//!             .output(PortSpec::new("result"));
//!     }
//!
//!     async fn step(&mut self, _step: &str, ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
//!         let x = ctx.input_node("x").and_then(Node::as_int).unwrap_or_default();
//!         ctx.out("result", Node::int(x + 1)).await?;
//!         Ok(Step::done())
//!     }
//! }
//! ```

pub mod context;
pub(crate) mod control;
pub(crate) mod driver;
pub mod registry;
pub mod spec;
pub mod state;

pub use self::context::ProcessContext;
pub use self::registry::{ProcessFactory, ProcessRegistry};
pub use self::spec::{
    ExitCode, Port, PortNamespace, PortSpec, ProcessSpec, ValidationError, Validator,
};
pub use self::state::ProcessState;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::communicator::{BroadcastMessage, CommunicatorError};
use crate::error::StoreError;
use crate::node::{Node, Pk};
use crate::transport::TransportError;

/// Name of the step a fresh process starts at.
pub const DEFAULT_ENTRY_STEP: &str = "run";

/// A process implementation.
#[async_trait::async_trait]
pub trait Process: Send + 'static {
    /// Declare ports and exit codes.
    fn define(spec: &mut ProcessSpec)
    where
        Self: Sized;

    /// Stable type string stored on the record and used by the registry.
    fn type_string() -> String
    where
        Self: Sized,
    {
        std::any::type_name::<Self>().to_string()
    }

    /// Human-readable label; the last path segment of the type string.
    fn label() -> String
    where
        Self: Sized,
    {
        let type_string = Self::type_string();
        type_string
            .rsplit("::")
            .next()
            .unwrap_or(type_string.as_str())
            .to_string()
    }

    /// Step a fresh process starts at.
    fn entry_step(&self) -> &str {
        DEFAULT_ENTRY_STEP
    }

    /// Run one step.
    async fn step(&mut self, step: &str, ctx: &mut ProcessContext) -> Result<Step, ProcessError>;

    /// State to store in checkpoints.
    fn save_state(&self) -> Value {
        Value::Null
    }

    /// Restore state saved by [`save_state`](Self::save_state).
    fn load_state(&mut self, _state: Value) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// What the driver does after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Continue with the named step.
    Next(String),
    /// Suspend until `on` resolves, then run `resume`.
    Wait {
        /// What to wait for.
        on: Awaitable,
        /// Step to run once it resolved.
        resume: String,
    },
    /// Finish.
    Done(ExitCode),
}

impl Step {
    /// Continue with `step`.
    pub fn next(step: impl Into<String>) -> Self {
        Step::Next(step.into())
    }

    /// Wait for `on`, then run `resume`.
    pub fn wait(on: Awaitable, resume: impl Into<String>) -> Self {
        Step::Wait {
            on,
            resume: resume.into(),
        }
    }

    /// Finish successfully.
    pub fn done() -> Self {
        Step::Done(ExitCode::ok())
    }

    /// Finish with `code`.
    pub fn exit(code: ExitCode) -> Self {
        Step::Done(code)
    }
}

/// Something a waiting process is suspended on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Awaitable {
    /// Another process reaching a terminal state.
    Process {
        /// Process record pk.
        pid: Pk,
    },
    /// A wall-clock deadline. Survives restarts: a resumed process only
    /// sleeps for the remainder.
    Sleep {
        /// Wake-up time.
        until: DateTime<Utc>,
    },
    /// A broadcast matching sender and subject pattern.
    Broadcast {
        /// Required sender, if any.
        sender: Option<String>,
        /// Subject pattern.
        subject: String,
    },
}

impl Awaitable {
    /// Wait for process `pid`.
    pub fn process(pid: Pk) -> Self {
        Awaitable::Process { pid }
    }

    /// Sleep for `duration` from now.
    pub fn sleep(duration: Duration) -> Self {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        let until = Utc::now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Awaitable::Sleep { until }
    }

    /// Wait for a broadcast.
    pub fn broadcast(sender: Option<String>, subject: impl Into<String>) -> Self {
        Awaitable::Broadcast {
            sender,
            subject: subject.into(),
        }
    }
}

/// Value an [`Awaitable`] resolved with, available to the resumed step.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitResult {
    /// The awaited process terminated; its sealed record.
    Process(Node),
    /// The sleep elapsed.
    Elapsed,
    /// The awaited broadcast.
    Broadcast(BroadcastMessage),
}

/// Outputs of a terminated process, by port name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outputs(BTreeMap<String, Node>);

impl Outputs {
    /// Wrap emitted outputs.
    pub fn new(outputs: BTreeMap<String, Node>) -> Self {
        Self(outputs)
    }

    /// Output emitted on `name`.
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.0.get(name)
    }

    /// The output, when exactly one was emitted.
    pub fn single(&self) -> Option<&Node> {
        match self.0.len() {
            1 => self.0.values().next(),
            _ => None,
        }
    }

    /// Number of outputs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was emitted.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, node)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.0.iter()
    }

    /// The underlying map.
    pub fn into_inner(self) -> BTreeMap<String, Node> {
        self.0
    }
}

/// Errors raised while creating or running a process.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// Inputs or outputs do not match the process spec.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// An output port was emitted twice.
    #[error("output '{0}' was already emitted")]
    OutputAlreadyEmitted(String),

    /// The process was killed.
    #[error("killed: {0}")]
    Killed(String),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The message bus failed.
    #[error(transparent)]
    Communicator(#[from] CommunicatorError),

    /// A transition not allowed by the state machine.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: ProcessState,
        /// Requested state.
        to: ProcessState,
    },

    /// A child process did not finish.
    #[error("child process {pid} failed: {message}")]
    Child {
        /// Child record pk.
        pid: Pk,
        /// Why it failed.
        message: String,
    },

    /// The step name is not known to the process.
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    /// No process type registered under this string.
    #[error("unknown process type '{0}'")]
    UnknownProcessType(String),

    /// The owning runner was closed or dropped.
    #[error("runner is closed")]
    RunnerClosed,

    /// Process logic failed.
    #[error("{0}")]
    Failed(String),
}

impl ProcessError {
    /// Failure raised by process logic.
    pub fn failed(message: impl Into<String>) -> Self {
        ProcessError::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_awaitable_serialization() {
        let value = serde_json::to_value(Awaitable::process(7)).unwrap();
        assert_eq!(value, json!({"kind": "process", "pid": 7}));

        let sleep = Awaitable::sleep(Duration::from_secs(60));
        let Awaitable::Sleep { until } = sleep else {
            panic!("expected a sleep");
        };
        assert!(until > Utc::now() + TimeDelta::seconds(50));

        let broadcast = Awaitable::broadcast(None, "ready.*");
        let back: Awaitable =
            serde_json::from_value(serde_json::to_value(&broadcast).unwrap()).unwrap();
        assert_eq!(back, broadcast);
    }

    #[test]
    fn test_sleep_saturates() {
        let Awaitable::Sleep { until } = Awaitable::sleep(Duration::MAX) else {
            panic!("expected a sleep");
        };
        assert_eq!(until, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_outputs_single() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Node::int(1));
        let outputs = Outputs::new(map.clone());
        assert_eq!(outputs.single().and_then(Node::as_int), Some(1));

        map.insert("b".to_string(), Node::int(2));
        let outputs = Outputs::new(map);
        assert!(outputs.single().is_none());
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs.get("b").and_then(Node::as_int), Some(2));
    }

    struct Named;

    #[async_trait::async_trait]
    impl Process for Named {
        fn define(_spec: &mut ProcessSpec) {}

        async fn step(&mut self, _step: &str, _ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
            Ok(Step::done())
        }
    }

    #[test]
    fn test_default_label_is_last_segment() {
        assert!(Named::type_string().ends_with("::Named"));
        assert_eq!(Named::label(), "Named");
    }
}
