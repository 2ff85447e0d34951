// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mailbox between a running process and whoever controls it.
//!
//! The runner's RPC handler turns pause/play/kill/status messages into calls
//! on [`ProcessControl`]; the driver observes the requests at its safe points
//! and publishes every state change back through the status channel, which
//! is what the control calls wait on for their acknowledgement.

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::node::Pk;
use crate::process::ProcessState;

/// Live state published by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ControlStatus {
    pub state: ProcessState,
    pub paused: bool,
    pub step: String,
    pub process_status: Option<String>,
}

pub(crate) struct ProcessControl {
    pid: Pk,
    kill: CancellationToken,
    kill_message: Mutex<Option<String>>,
    pause_message: Mutex<Option<String>>,
    pause_requested: watch::Sender<bool>,
    status: watch::Sender<ControlStatus>,
}

impl ProcessControl {
    pub(crate) fn new(pid: Pk, initial: ControlStatus) -> Self {
        let (pause_requested, _) = watch::channel(initial.paused);
        let (status, _) = watch::channel(initial);
        Self {
            pid,
            kill: CancellationToken::new(),
            kill_message: Mutex::new(None),
            pause_message: Mutex::new(None),
            pause_requested,
            status,
        }
    }

    pub(crate) fn pid(&self) -> Pk {
        self.pid
    }

    pub(crate) fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub(crate) fn kill_requested(&self) -> bool {
        self.kill.is_cancelled()
    }

    pub(crate) fn kill_message(&self) -> String {
        self.kill_message
            .lock()
            .clone()
            .unwrap_or_else(|| "Killed through the controller".to_string())
    }

    pub(crate) fn pause_requested(&self) -> bool {
        *self.pause_requested.borrow()
    }

    pub(crate) fn pause_message(&self) -> Option<String> {
        self.pause_message.lock().clone()
    }

    pub(crate) fn subscribe_requests(&self) -> watch::Receiver<bool> {
        self.pause_requested.subscribe()
    }

    pub(crate) fn status(&self) -> ControlStatus {
        self.status.borrow().clone()
    }

    /// Publish a new status. Called by the driver only.
    pub(crate) fn publish(&self, status: ControlStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut ControlStatus)) {
        self.status.send_modify(f);
    }

    /// Request a pause and wait until the driver acknowledged it.
    ///
    /// Returns `false` when the process terminated instead.
    pub(crate) async fn pause(&self, message: Option<String>) -> bool {
        if self.status.borrow().state.is_terminal() {
            return false;
        }
        *self.pause_message.lock() = message;
        self.pause_requested.send_replace(true);
        debug!(pid = self.pid, "Pause requested");

        let mut status = self.status.subscribe();
        status
            .wait_for(|s| s.paused || s.state.is_terminal())
            .await
            .map(|s| s.paused && !s.state.is_terminal())
            .unwrap_or(false)
    }

    /// Lift a pause and wait until the driver resumed.
    pub(crate) async fn play(&self) -> bool {
        if self.status.borrow().state.is_terminal() {
            return false;
        }
        self.pause_requested.send_replace(false);
        debug!(pid = self.pid, "Play requested");

        let mut status = self.status.subscribe();
        status
            .wait_for(|s| !s.paused || s.state.is_terminal())
            .await
            .map(|s| !s.state.is_terminal())
            .unwrap_or(false)
    }

    /// Request a kill and wait for the process to terminate.
    ///
    /// Killing an already killed process succeeds; one that terminated
    /// otherwise returns `false`.
    pub(crate) async fn kill(&self, message: Option<String>) -> bool {
        let current = self.status.borrow().state;
        if current == ProcessState::Killed {
            return true;
        }
        if current.is_terminal() {
            return false;
        }
        if let Some(message) = message {
            self.kill_message.lock().get_or_insert(message);
        }
        self.kill.cancel();
        debug!(pid = self.pid, "Kill requested");

        let mut status = self.status.subscribe();
        status
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|s| s.state == ProcessState::Killed)
            .unwrap_or(false)
    }
}
