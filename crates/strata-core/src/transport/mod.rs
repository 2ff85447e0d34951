// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connections to compute resources.
//!
//! A [`Transport`] is an openable connection (local shell, SSH, ...). An
//! [`AuthInfo`] names one connection configuration and produces transports
//! for it. Processes never open transports directly: they go through the
//! [`TransportQueue`], which shares one open transport among all concurrent
//! requests for the same configuration.

pub mod local;
pub mod queue;

pub use self::local::{LocalAuthInfo, LocalTransport};
pub use self::queue::{TransportQueue, TransportRequest};

use std::sync::Arc;
use std::time::Duration;

/// Errors raised by transports and the transport queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Opening the connection failed.
    #[error("failed to open transport '{key}': {message}")]
    Open {
        /// Connection configuration key.
        key: String,
        /// Underlying error.
        message: String,
    },

    /// The transport was used while closed.
    #[error("transport is not open")]
    NotOpen,

    /// A command could not be run.
    #[error("command failed: {0}")]
    Exec(String),

    /// Closing the connection failed.
    #[error("failed to close transport: {0}")]
    Close(String),

    /// The queue was closed while the request was pending.
    #[error("transport queue is closed")]
    QueueClosed,
}

/// Result of a command run over a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code, -1 when killed by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// An openable connection to a compute resource.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection.
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the connection is open.
    fn is_open(&self) -> bool;

    /// Minimum delay before opening, to avoid flooding the resource.
    fn safe_open_interval(&self) -> Duration;

    /// Run a shell command.
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError>;
}

/// A connection configuration.
pub trait AuthInfo: Send + Sync {
    /// Identity of the configuration; requests with equal keys share a transport.
    fn key(&self) -> String;

    /// Create a new, unopened transport for this configuration.
    fn transport(&self) -> Arc<dyn Transport>;
}
