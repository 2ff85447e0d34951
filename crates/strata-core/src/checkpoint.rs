// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serialized process snapshots.
//!
//! A [`CheckpointBundle`] holds everything needed to rebuild a running process
//! in another worker: its type, lifecycle position, the step to resume at, the
//! process's own state, its encoded inputs and the outputs emitted so far.
//! Bundles are stored as JSON bytes by a [`Persister`], one per process id,
//! replaced atomically on every save.
//!
//! [`Persister`]: crate::persistence::Persister

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::node::Pk;
use crate::process::{Awaitable, ProcessState};

/// Current bundle format version.
pub const BUNDLE_VERSION: u32 = 1;

/// Snapshot of a non-terminal process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointBundle {
    /// Format version.
    pub version: u32,
    /// Process record pk.
    pub pid: Pk,
    /// Registered process type.
    pub process_type: String,
    /// Lifecycle state at save time.
    pub state: ProcessState,
    /// Whether the process was paused.
    pub paused: bool,
    /// Step to run when resumed.
    pub step: String,
    /// Awaitable the process was suspended on, if waiting.
    pub waiting_on: Option<Awaitable>,
    /// State saved by the process implementation.
    pub instance_state: Value,
    /// Inputs, encoded with node references.
    pub inputs: Value,
    /// Outputs emitted so far, by port name.
    pub outputs: BTreeMap<String, Pk>,
    /// Calling process, if any.
    pub parent: Option<Pk>,
    /// When the bundle was taken.
    pub saved_at: DateTime<Utc>,
}

impl CheckpointBundle {
    /// Serialize for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a stored bundle, rejecting unknown versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bundle: CheckpointBundle = serde_json::from_slice(bytes)?;
        if bundle.version != BUNDLE_VERSION {
            return Err(StoreError::Serialization(format!(
                "unsupported checkpoint version {} (expected {})",
                bundle.version, BUNDLE_VERSION
            )));
        }
        Ok(bundle)
    }
}

#[cfg(test)]
pub(crate) fn sample_bundle(pid: Pk) -> CheckpointBundle {
    CheckpointBundle {
        version: BUNDLE_VERSION,
        pid,
        process_type: "tests.Sample".to_string(),
        state: ProcessState::Running,
        paused: false,
        step: "run".to_string(),
        waiting_on: None,
        instance_state: serde_json::json!({"counter": 1}),
        inputs: serde_json::json!({}),
        outputs: BTreeMap::new(),
        parent: None,
        saved_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let mut bundle = sample_bundle(7);
        bundle.state = ProcessState::Waiting;
        bundle.waiting_on = Some(Awaitable::Process { pid: 9 });
        bundle.outputs.insert("result".to_string(), 12);

        let bytes = bundle.to_bytes().unwrap();
        let restored = CheckpointBundle::from_bytes(&bytes).unwrap();
        assert_eq!(restored, bundle);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut bundle = sample_bundle(1);
        bundle.version = 99;
        let bytes = bundle.to_bytes().unwrap();
        let err = CheckpointBundle::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(CheckpointBundle::from_bytes(b"not json").is_err());
    }
}
