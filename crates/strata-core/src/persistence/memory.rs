// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory node store and persister.
//!
//! Keeps everything in a single mutex-guarded state. Used for tests and for
//! runners that do not need durability across restarts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::checkpoint::CheckpointBundle;
use crate::error::{Result, StoreError};
use crate::node::{Direction, Group, GroupId, Link, LinkType, Node, NodeFilter, NodeId, Pk};

use super::{LogRecord, NodeStore, Persister};

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<Pk, Node>,
    uuids: HashMap<Uuid, Pk>,
    links: Vec<Link>,
    groups: BTreeMap<Pk, Group>,
    group_members: BTreeMap<Pk, BTreeSet<Pk>>,
    logs: Vec<LogRecord>,
    checkpoints: HashMap<Pk, Vec<u8>>,
    leases: HashMap<Pk, (String, DateTime<Utc>)>,
    next_pk: Pk,
    next_group_pk: Pk,
}

impl MemoryState {
    fn node(&self, pk: Pk) -> Result<&Node> {
        self.nodes.get(&pk).ok_or_else(|| StoreError::node_not_found(pk))
    }

    fn node_mut(&mut self, pk: Pk) -> Result<&mut Node> {
        self.nodes
            .get_mut(&pk)
            .ok_or_else(|| StoreError::node_not_found(pk))
    }
}

/// Node store and persister backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl NodeStore for MemoryStore {
    async fn store_node(&self, node: &Node) -> Result<Node> {
        let mut state = self.state.lock();
        if node.pk.is_some() || state.uuids.contains_key(&node.uuid) {
            return Err(StoreError::Validation {
                field: "uuid".to_string(),
                message: format!("node {} is already stored", node.uuid),
            });
        }
        state.next_pk += 1;
        let pk = state.next_pk;
        let mut stored = node.clone();
        stored.pk = Some(pk);
        state.uuids.insert(stored.uuid, pk);
        state.nodes.insert(pk, stored.clone());
        Ok(stored)
    }

    async fn load_node(&self, id: NodeId) -> Result<Node> {
        let state = self.state.lock();
        let pk = match id {
            NodeId::Pk(pk) => pk,
            NodeId::Uuid(uuid) => *state
                .uuids
                .get(&uuid)
                .ok_or_else(|| StoreError::node_not_found(uuid))?,
        };
        state.node(pk).cloned()
    }

    async fn set_attributes(&self, pk: Pk, attributes: Map<String, Value>) -> Result<()> {
        let mut state = self.state.lock();
        let node = state.node_mut(pk)?;
        node.ensure_mutable()?;
        node.attributes.extend(attributes);
        Ok(())
    }

    async fn delete_attribute(&self, pk: Pk, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        let node = state.node_mut(pk)?;
        node.ensure_mutable()?;
        node.attributes.remove(key);
        Ok(())
    }

    async fn seal(&self, pk: Pk) -> Result<()> {
        let mut state = self.state.lock();
        state.node_mut(pk)?.sealed = true;
        Ok(())
    }

    async fn add_link(&self, link: &Link) -> Result<()> {
        let mut state = self.state.lock();
        let source = state.node(link.source)?;
        let target = state.node(link.target)?;
        link.validate(source, target)?;
        state.links.push(link.clone());
        Ok(())
    }

    async fn get_links(
        &self,
        pk: Pk,
        direction: Direction,
        link_type: Option<LinkType>,
    ) -> Result<Vec<Link>> {
        let state = self.state.lock();
        Ok(state
            .links
            .iter()
            .filter(|link| match direction {
                Direction::Incoming => link.target == pk,
                Direction::Outgoing => link.source == pk,
            })
            .filter(|link| link_type.is_none_or(|lt| link.link_type == lt))
            .cloned()
            .collect())
    }

    async fn query(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let state = self.state.lock();
        let limit = filter
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);
        Ok(state
            .nodes
            .values()
            .filter(|node| filter.matches(node))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_group(&self, label: &str) -> Result<Group> {
        let mut state = self.state.lock();
        if state.groups.values().any(|g| g.label == label) {
            return Err(StoreError::Validation {
                field: "label".to_string(),
                message: format!("group '{label}' already exists"),
            });
        }
        state.next_group_pk += 1;
        let group = Group {
            pk: state.next_group_pk,
            uuid: Uuid::new_v4(),
            label: label.to_string(),
        };
        state.groups.insert(group.pk, group.clone());
        Ok(group)
    }

    async fn load_group(&self, id: GroupId) -> Result<Group> {
        let state = self.state.lock();
        state
            .groups
            .values()
            .find(|g| match &id {
                GroupId::Pk(pk) => g.pk == *pk,
                GroupId::Uuid(uuid) => g.uuid == *uuid,
                GroupId::Label(label) => &g.label == label,
            })
            .cloned()
            .ok_or_else(|| StoreError::NotExistent {
                entity: "group",
                identifier: id.to_string(),
            })
    }

    async fn add_nodes_to_group(&self, group: Pk, nodes: &[Pk]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.groups.contains_key(&group) {
            return Err(StoreError::NotExistent {
                entity: "group",
                identifier: group.to_string(),
            });
        }
        for pk in nodes {
            state.node(*pk)?;
        }
        state
            .group_members
            .entry(group)
            .or_default()
            .extend(nodes.iter().copied());
        Ok(())
    }

    async fn group_members(&self, group: Pk) -> Result<Vec<Node>> {
        let state = self.state.lock();
        let members = state.group_members.get(&group).cloned().unwrap_or_default();
        members
            .into_iter()
            .map(|pk| state.node(pk).cloned())
            .collect()
    }

    async fn add_log(&self, pk: Pk, level: &str, message: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.node(pk)?;
        let id = state.logs.len() as i64 + 1;
        state.logs.push(LogRecord {
            id,
            node_pk: pk,
            level: level.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_logs(&self, pk: Pk) -> Result<Vec<LogRecord>> {
        let state = self.state.lock();
        Ok(state
            .logs
            .iter()
            .filter(|log| log.node_pk == pk)
            .cloned()
            .collect())
    }

    async fn acquire_lease(&self, pk: Pk, owner: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let free = match state.leases.get(&pk) {
            None => true,
            Some((holder, expires_at)) => holder == owner || *expires_at <= now,
        };
        if free {
            let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
            let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.leases.insert(pk, (owner.to_string(), expires_at));
        }
        Ok(free)
    }

    async fn release_lease(&self, pk: Pk, owner: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .leases
            .get(&pk)
            .is_some_and(|(holder, _)| holder == owner)
        {
            state.leases.remove(&pk);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Persister for MemoryStore {
    async fn save_checkpoint(&self, bundle: &CheckpointBundle) -> Result<()> {
        let bytes = bundle.to_bytes()?;
        self.state.lock().checkpoints.insert(bundle.pid, bytes);
        Ok(())
    }

    async fn load_checkpoint(&self, pid: Pk) -> Result<CheckpointBundle> {
        let bytes = self
            .state
            .lock()
            .checkpoints
            .get(&pid)
            .cloned()
            .ok_or_else(|| StoreError::checkpoint_not_found(pid))?;
        CheckpointBundle::from_bytes(&bytes)
    }

    async fn delete_checkpoint(&self, pid: Pk) -> Result<()> {
        self.state.lock().checkpoints.remove(&pid);
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Pk>> {
        let mut pids: Vec<Pk> = self.state.lock().checkpoints.keys().copied().collect();
        pids.sort_unstable();
        Ok(pids)
    }
}
