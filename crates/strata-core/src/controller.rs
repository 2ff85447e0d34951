// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote control of processes over the communicator.
//!
//! Every running process listens for RPC messages on its pid. The
//! [`Controller`] sends [`ControlMessage`]s there and maps the control
//! protocol's failure cases (unknown or terminated target) to `Ok(false)`;
//! only a timeout or a lost broker connection surfaces as an error, and a
//! timeout does not mean the remote side ignored the request.
//!
//! Launch and continue requests for daemon runners go through the task
//! queue as [`TaskMessage`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::communicator::{Communicator, CommunicatorError};
use crate::node::{NodeId, Pk};
use crate::payload::{Inputs, store_input_nodes};
use crate::process::ProcessState;

/// RPC body understood by a running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Suspend at the next safe point.
    Pause {
        /// Reason written to the process report.
        message: Option<String>,
    },
    /// Lift a pause.
    Play,
    /// Terminate the process and its children.
    Kill {
        /// Reason stored as the process status.
        message: Option<String>,
    },
    /// Report live state.
    Status,
}

/// Live state of a running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatusReport {
    /// Process record pk.
    pub pid: Pk,
    /// Current state.
    pub state: ProcessState,
    /// Whether the pause overlay is set.
    pub paused: bool,
    /// Free-text status.
    pub process_status: Option<String>,
    /// Step the process is in or resumes at.
    pub step: String,
    /// Processes it called.
    pub children: Vec<Pk>,
}

/// Task queue message consumed by daemon runners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskMessage {
    /// Create and run a new process.
    Launch {
        /// Becomes the record UUID, so a redelivered launch finds its record.
        launch_id: Uuid,
        /// Registered process type.
        process_type: String,
        /// Encoded inputs.
        inputs: Value,
    },
    /// Resume a process from its checkpoint.
    Continue {
        /// Process record pk.
        pid: Pk,
    },
}

/// Reply to a [`TaskMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Process record pk.
    pub pid: Pk,
    /// State the process ended in, unless skipped.
    pub state: Option<ProcessState>,
    /// Exit status of a finished process.
    pub exit_status: Option<i32>,
    /// The task was a duplicate or the process runs elsewhere.
    pub skipped: bool,
}

/// Sends control messages and tasks.
#[derive(Debug, Clone)]
pub struct Controller {
    communicator: Communicator,
    timeout: Duration,
}

impl Controller {
    /// Controller waiting at most `timeout` for each reply.
    pub fn new(communicator: Communicator, timeout: Duration) -> Self {
        Self {
            communicator,
            timeout,
        }
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pause `pid`. Returns whether it acknowledged the pause.
    #[instrument(skip(self, message), fields(pid = pid))]
    pub async fn pause_process(&self, pid: Pk, message: Option<&str>) -> Result<bool, CommunicatorError> {
        let reply = self
            .send(
                pid,
                ControlMessage::Pause {
                    message: message.map(str::to_string),
                },
            )
            .await?;
        Ok(reply.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Play `pid`. Returns whether it resumed.
    #[instrument(skip(self), fields(pid = pid))]
    pub async fn play_process(&self, pid: Pk) -> Result<bool, CommunicatorError> {
        let reply = self.send(pid, ControlMessage::Play).await?;
        Ok(reply.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Kill `pid` and its call tree.
    ///
    /// Killing a process whose record is already KILLED returns `true`.
    #[instrument(skip(self, message), fields(pid = pid))]
    pub async fn kill_process(&self, pid: Pk, message: Option<&str>) -> Result<bool, CommunicatorError> {
        let reply = self
            .send(
                pid,
                ControlMessage::Kill {
                    message: message.map(str::to_string),
                },
            )
            .await?;
        match reply {
            Some(value) => Ok(value.as_bool().unwrap_or(false)),
            None => Ok(self
                .communicator
                .store()
                .load_node(NodeId::Pk(pid))
                .await
                .is_ok_and(|record| record.is_killed())),
        }
    }

    /// Live status of `pid`, or `None` when it is not running anywhere.
    #[instrument(skip(self), fields(pid = pid))]
    pub async fn status(&self, pid: Pk) -> Result<Option<ProcessStatusReport>, CommunicatorError> {
        match self.send(pid, ControlMessage::Status).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Ask a daemon to create and run a process, waiting for it to terminate.
    ///
    /// Unstored input nodes are stored first so the task can reference them.
    #[instrument(skip(self, inputs), fields(process_type = %process_type))]
    pub async fn launch_process(
        &self,
        process_type: &str,
        inputs: &Inputs,
    ) -> Result<TaskOutcome, CommunicatorError> {
        let mut inputs = inputs.clone();
        let stored = store_input_nodes(self.communicator.store().as_ref(), &mut inputs).await?;
        if !stored.is_empty() {
            debug!(process_type = %process_type, count = stored.len(), "Stored launch inputs");
        }
        let task = TaskMessage::Launch {
            launch_id: Uuid::new_v4(),
            process_type: process_type.to_string(),
            inputs: self.communicator.encode_inputs(&inputs)?,
        };
        self.send_task(task).await
    }

    /// Ask a daemon to resume `pid`, waiting for it to terminate.
    #[instrument(skip(self), fields(pid = pid))]
    pub async fn continue_process(&self, pid: Pk) -> Result<TaskOutcome, CommunicatorError> {
        self.send_task(TaskMessage::Continue { pid }).await
    }

    async fn send_task(&self, task: TaskMessage) -> Result<TaskOutcome, CommunicatorError> {
        let reply = self
            .communicator
            .task_send(serde_json::to_value(&task)?)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Send `message` to `pid`; `None` when nothing listens on it.
    async fn send(&self, pid: Pk, message: ControlMessage) -> Result<Option<Value>, CommunicatorError> {
        let body = serde_json::to_value(&message)?;
        match self
            .communicator
            .rpc_send(&pid.to_string(), body, self.timeout)
            .await
        {
            Ok(reply) => Ok(Some(reply)),
            Err(CommunicatorError::Unroutable(recipient)) => {
                debug!(recipient = %recipient, "Control message unroutable, process is not running");
                Ok(None)
            }
            Err(CommunicatorError::Remote(reason)) => {
                debug!(pid, reason = %reason, "Control message rejected");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::InProcessBroker;
    use crate::node::Node;
    use crate::payload::Payload;
    use crate::persistence::{MemoryStore, NodeStore};
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Arc;

    fn controller(store: Arc<MemoryStore>) -> (Controller, Communicator) {
        let communicator = Communicator::new(InProcessBroker::new(), store);
        (
            Controller::new(communicator.clone(), Duration::from_secs(1)),
            communicator,
        )
    }

    #[test]
    fn test_message_wire_format() {
        let value = serde_json::to_value(ControlMessage::Kill {
            message: Some("stop".into()),
        })
        .unwrap();
        assert_eq!(value, json!({"intent": "kill", "message": "stop"}));
        assert_eq!(
            serde_json::to_value(ControlMessage::Status).unwrap(),
            json!({"intent": "status"})
        );

        let task: TaskMessage = serde_json::from_value(json!({"task": "continue", "pid": 3})).unwrap();
        assert_eq!(task, TaskMessage::Continue { pid: 3 });
    }

    #[tokio::test]
    async fn test_unknown_target_is_false() {
        let (controller, _) = controller(Arc::new(MemoryStore::new()));
        assert!(!controller.pause_process(99, None).await.unwrap());
        assert!(!controller.play_process(99).await.unwrap());
        assert!(!controller.kill_process(99, None).await.unwrap());
        assert!(controller.status(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kill_of_killed_record_is_true() {
        let store = Arc::new(MemoryStore::new());
        let record = store
            .store_node(&Node::process_record("tests.Killed", "Killed"))
            .await
            .unwrap();
        let pid = record.pk.unwrap();
        store
            .set_attribute(pid, crate::node::attrs::PROCESS_STATE, json!("killed"))
            .await
            .unwrap();
        store.seal(pid).await.unwrap();

        let (controller, _) = controller(store);
        assert!(controller.kill_process(pid, Some("again")).await.unwrap());
    }

    #[tokio::test]
    async fn test_reply_passthrough() {
        let (controller, communicator) = controller(Arc::new(MemoryStore::new()));
        communicator
            .add_rpc_subscriber(
                "5",
                Arc::new(|body| {
                    async move {
                        let message: ControlMessage = serde_json::from_value(body)?;
                        Ok(match message {
                            ControlMessage::Status => json!({
                                "pid": 5,
                                "state": "waiting",
                                "paused": true,
                                "process_status": null,
                                "step": "gather",
                                "children": [6, 7],
                            }),
                            _ => json!(true),
                        })
                    }
                    .boxed()
                }),
            )
            .unwrap();

        assert!(controller.pause_process(5, Some("hold")).await.unwrap());
        let report = controller.status(5).await.unwrap().unwrap();
        assert_eq!(report.state, ProcessState::Waiting);
        assert!(report.paused);
        assert_eq!(report.children, vec![6, 7]);
    }

    #[tokio::test]
    async fn test_launch_stores_fresh_inputs() {
        let store = Arc::new(MemoryStore::new());
        let (controller, communicator) = controller(store.clone());
        let decoder = communicator.clone();
        communicator
            .add_task_subscriber(Arc::new(move |body| {
                let decoder = decoder.clone();
                async move {
                    let TaskMessage::Launch { inputs, .. } = serde_json::from_value(body)? else {
                        return Err(CommunicatorError::Remote("expected a launch".into()));
                    };
                    let inputs = decoder.decode_inputs(&inputs).await?;
                    let x = inputs.get("x").and_then(Payload::as_node).and_then(Node::as_int);
                    Ok(json!({"pid": 1, "state": "finished", "exit_status": x, "skipped": false}))
                }
                .boxed()
            }))
            .unwrap();

        let fresh = Node::int(5);
        let inputs = Inputs::from([("x".to_string(), Payload::Node(fresh.clone()))]);
        let outcome = controller.launch_process("tests.AddOne", &inputs).await.unwrap();
        assert_eq!(outcome.exit_status, Some(5));
        assert!(store.load_node(NodeId::Uuid(fresh.uuid)).await.unwrap().is_stored());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_as_error() {
        let (controller, communicator) = controller(Arc::new(MemoryStore::new()));
        communicator
            .add_rpc_subscriber(
                "8",
                Arc::new(|_| futures::future::pending::<Result<Value, CommunicatorError>>().boxed()),
            )
            .unwrap();
        let result = controller.pause_process(8, None).await;
        assert!(matches!(result, Err(CommunicatorError::Timeout(_))));
    }
}
