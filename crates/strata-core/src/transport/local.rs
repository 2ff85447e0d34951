// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport running commands on the local machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::{AuthInfo, ExecOutput, Transport, TransportError};

/// Runs commands through `sh -c` on this machine.
#[derive(Debug, Default)]
pub struct LocalTransport {
    open: AtomicBool,
    safe_open_interval: Duration,
}

impl LocalTransport {
    /// Transport with the given open interval.
    pub fn new(safe_open_interval: Duration) -> Self {
        Self {
            open: AtomicBool::new(false),
            safe_open_interval,
        }
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn safe_open_interval(&self) -> Duration {
        self.safe_open_interval
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        debug!(command = %command, "Running local command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| TransportError::Exec(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Connection configuration for the local machine.
#[derive(Debug, Clone)]
pub struct LocalAuthInfo {
    key: String,
    safe_open_interval: Duration,
}

impl LocalAuthInfo {
    /// Local configuration named `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            safe_open_interval: Duration::ZERO,
        }
    }

    /// Set the open interval of produced transports.
    pub fn with_safe_open_interval(mut self, interval: Duration) -> Self {
        self.safe_open_interval = interval;
        self
    }
}

impl AuthInfo for LocalAuthInfo {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(LocalTransport::new(self.safe_open_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_requires_open() {
        let transport = LocalTransport::default();
        assert_eq!(
            transport.exec("true").await.unwrap_err(),
            TransportError::NotOpen
        );
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let transport = LocalTransport::default();
        transport.open().await.unwrap();
        assert!(transport.is_open());

        let output = transport.exec("echo hello; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");

        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }

    #[test]
    fn test_auth_info_produces_fresh_transports() {
        let auth = LocalAuthInfo::new("localhost").with_safe_open_interval(Duration::from_millis(5));
        assert_eq!(auth.key(), "localhost");
        let transport = auth.transport();
        assert!(!transport.is_open());
        assert_eq!(transport.safe_open_interval(), Duration::from_millis(5));
    }
}
