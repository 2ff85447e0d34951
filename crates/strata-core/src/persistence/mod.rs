// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for strata-core.
//!
//! Two collaborators live here:
//! - [`NodeStore`]: the provenance graph (nodes, links, groups, report logs
//!   and process leases).
//! - [`Persister`]: per-process checkpoint bundles.
//!
//! Both backends implement both traits, so a single store instance can be
//! shared by the runner for graph access and checkpointing.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::checkpoint::CheckpointBundle;
use crate::error::Result;
use crate::node::{Direction, Group, GroupId, Link, LinkType, Node, NodeFilter, NodeId, Pk};

/// Log level used for process reports.
pub const REPORT_LEVEL: &str = "REPORT";

/// Log entry attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LogRecord {
    /// Database primary key.
    pub id: i64,
    /// Node the entry belongs to.
    pub node_pk: Pk,
    /// Level name (REPORT, WARNING, ERROR).
    pub level: String,
    /// Message text.
    pub message: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// Storage collaborator for the provenance graph.
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    /// Store a new node and return it with its pk assigned.
    async fn store_node(&self, node: &Node) -> Result<Node>;

    /// Load a node by pk or UUID.
    async fn load_node(&self, id: NodeId) -> Result<Node>;

    /// Merge attributes into a mutable node.
    async fn set_attributes(&self, pk: Pk, attributes: Map<String, Value>) -> Result<()>;

    /// Remove an attribute from a mutable node. Missing keys are ignored.
    async fn delete_attribute(&self, pk: Pk, key: &str) -> Result<()>;

    /// Seal a node. Sealing an already sealed node is a no-op.
    async fn seal(&self, pk: Pk) -> Result<()>;

    /// Add a link between two stored nodes.
    async fn add_link(&self, link: &Link) -> Result<()>;

    /// Links touching `pk` in the given direction, optionally of one type.
    async fn get_links(
        &self,
        pk: Pk,
        direction: Direction,
        link_type: Option<LinkType>,
    ) -> Result<Vec<Link>>;

    /// Nodes matching `filter`, ordered by pk.
    async fn query(&self, filter: &NodeFilter) -> Result<Vec<Node>>;

    /// Create a group with a unique label.
    async fn create_group(&self, label: &str) -> Result<Group>;

    /// Load a group.
    async fn load_group(&self, id: GroupId) -> Result<Group>;

    /// Add stored nodes to a group. Existing members are ignored.
    async fn add_nodes_to_group(&self, group: Pk, nodes: &[Pk]) -> Result<()>;

    /// Members of a group, ordered by pk.
    async fn group_members(&self, group: Pk) -> Result<Vec<Node>>;

    /// Append a log entry to a node.
    async fn add_log(&self, pk: Pk, level: &str, message: &str) -> Result<()>;

    /// Log entries of a node, oldest first.
    async fn get_logs(&self, pk: Pk) -> Result<Vec<LogRecord>>;

    /// Take or renew the lease on a process.
    ///
    /// Succeeds when no lease exists, the existing lease expired, or `owner`
    /// already holds it.
    async fn acquire_lease(&self, pk: Pk, owner: &str, ttl: Duration) -> Result<bool>;

    /// Drop a lease held by `owner`.
    async fn release_lease(&self, pk: Pk, owner: &str) -> Result<()>;

    /// Single attribute of a node.
    async fn get_attribute(&self, pk: Pk, key: &str) -> Result<Option<Value>> {
        let node = self.load_node(NodeId::Pk(pk)).await?;
        Ok(node.attributes.get(key).cloned())
    }

    /// Set a single attribute.
    async fn set_attribute(&self, pk: Pk, key: &str, value: Value) -> Result<()> {
        let mut attributes = Map::new();
        attributes.insert(key.to_string(), value);
        self.set_attributes(pk, attributes).await
    }

    /// Check database connectivity.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Storage collaborator for checkpoint bundles.
#[async_trait::async_trait]
pub trait Persister: Send + Sync {
    /// Save (atomically replace) the bundle for `bundle.pid`.
    async fn save_checkpoint(&self, bundle: &CheckpointBundle) -> Result<()>;

    /// Load the bundle of a process. Missing bundles are `NotExistent`.
    async fn load_checkpoint(&self, pid: Pk) -> Result<CheckpointBundle>;

    /// Delete the bundle of a process. Missing bundles are ignored.
    async fn delete_checkpoint(&self, pid: Pk) -> Result<()>;

    /// Pids that currently have a bundle.
    async fn list_checkpoints(&self) -> Result<Vec<Pk>>;
}
