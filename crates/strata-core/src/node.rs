// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provenance graph entities: nodes, links and groups.
//!
//! A [`Node`] is either a data node (`data.*`, immutable once stored) or a
//! process record (`process`), whose attributes mirror the lifecycle of the
//! process it represents until it is sealed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::process::{ExitCode, ProcessState};

/// Primary key of a stored node.
pub type Pk = i64;

/// Node type of every process record.
pub const PROCESS_NODE_TYPE: &str = "process";

/// Prefix shared by all data node types.
pub const DATA_NODE_PREFIX: &str = "data.";

/// Attribute keys written on process records.
pub mod attrs {
    /// Current lifecycle state.
    pub const PROCESS_STATE: &str = "process_state";
    /// Free-form status line.
    pub const PROCESS_STATUS: &str = "process_status";
    /// Human-readable process label.
    pub const PROCESS_LABEL: &str = "process_label";
    /// Registered process type string.
    pub const PROCESS_TYPE: &str = "process_type";
    /// Present and `true` while the process is paused.
    pub const PAUSED: &str = "paused";
    /// Exit status of a finished process.
    pub const EXIT_STATUS: &str = "exit_status";
    /// Exit message of a finished process.
    pub const EXIT_MESSAGE: &str = "exit_message";
    /// Error text of an excepted process.
    pub const EXCEPTION: &str = "exception";
    /// Value held by a data node.
    pub const VALUE: &str = "value";
}

/// Identifies a node either by primary key or by UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    /// Database primary key.
    Pk(Pk),
    /// Globally unique identifier.
    Uuid(Uuid),
}

impl From<Pk> for NodeId {
    fn from(pk: Pk) -> Self {
        NodeId::Pk(pk)
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        NodeId::Uuid(uuid)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Pk(pk) => write!(f, "{pk}"),
            NodeId::Uuid(uuid) => write!(f, "{uuid}"),
        }
    }
}

/// A node of the provenance graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Primary key, `None` until stored.
    pub pk: Option<Pk>,
    /// Globally unique identifier.
    pub uuid: Uuid,
    /// `process` or `data.<kind>`.
    pub node_type: String,
    /// Optional label.
    pub label: String,
    /// Attribute dictionary.
    pub attributes: Map<String, Value>,
    /// Sealed nodes reject attribute changes and new outgoing links.
    pub sealed: bool,
    /// Creation time.
    pub ctime: DateTime<Utc>,
}

impl Node {
    /// Create an unstored node of the given type.
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            pk: None,
            uuid: Uuid::new_v4(),
            node_type: node_type.into(),
            label: String::new(),
            attributes: Map::new(),
            sealed: false,
            ctime: Utc::now(),
        }
    }

    /// Create an unstored data node `data.<kind>` holding `value`.
    pub fn data(kind: &str, value: Value) -> Self {
        let mut node = Self::new(format!("{DATA_NODE_PREFIX}{kind}"));
        node.attributes.insert(attrs::VALUE.to_string(), value);
        node
    }

    /// Integer data node.
    pub fn int(value: i64) -> Self {
        Self::data("int", Value::from(value))
    }

    /// Float data node.
    pub fn float(value: f64) -> Self {
        Self::data("float", Value::from(value))
    }

    /// String data node.
    pub fn string(value: impl Into<String>) -> Self {
        Self::data("str", Value::String(value.into()))
    }

    /// Boolean data node.
    pub fn boolean(value: bool) -> Self {
        Self::data("bool", Value::Bool(value))
    }

    /// Dictionary data node.
    pub fn dict(value: Map<String, Value>) -> Self {
        Self::data("dict", Value::Object(value))
    }

    /// Unstored process record in the CREATED state.
    pub fn process_record(process_type: &str, process_label: &str) -> Self {
        let mut node = Self::new(PROCESS_NODE_TYPE);
        node.label = process_label.to_string();
        node.attributes.insert(
            attrs::PROCESS_STATE.to_string(),
            Value::String(ProcessState::Created.as_str().to_string()),
        );
        node.attributes.insert(
            attrs::PROCESS_TYPE.to_string(),
            Value::String(process_type.to_string()),
        );
        node.attributes.insert(
            attrs::PROCESS_LABEL.to_string(),
            Value::String(process_label.to_string()),
        );
        node
    }

    /// Set the label, builder style.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the UUID, builder style.
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Whether the node has been stored.
    pub fn is_stored(&self) -> bool {
        self.pk.is_some()
    }

    /// Primary key of a stored node.
    pub fn stored_pk(&self) -> Result<Pk> {
        self.pk.ok_or_else(|| StoreError::Validation {
            field: "pk".to_string(),
            message: format!("node {} is not stored", self.uuid),
        })
    }

    /// Whether this is a process record.
    pub fn is_process(&self) -> bool {
        self.node_type == PROCESS_NODE_TYPE
    }

    /// Whether this is a data node.
    pub fn is_data(&self) -> bool {
        self.node_type.starts_with(DATA_NODE_PREFIX)
    }

    /// The value held by a data node.
    pub fn value(&self) -> Option<&Value> {
        self.attributes.get(attrs::VALUE)
    }

    /// The integer held by a `data.int` node.
    pub fn as_int(&self) -> Option<i64> {
        self.value().and_then(Value::as_i64)
    }

    /// Look up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Current lifecycle state of a process record.
    pub fn process_state(&self) -> Option<ProcessState> {
        self.attribute_str(attrs::PROCESS_STATE)
            .and_then(|s| s.parse().ok())
    }

    /// Status line of a process record.
    pub fn process_status(&self) -> Option<&str> {
        self.attribute_str(attrs::PROCESS_STATUS)
    }

    /// Label of a process record.
    pub fn process_label(&self) -> Option<&str> {
        self.attribute_str(attrs::PROCESS_LABEL)
    }

    /// Registered type string of a process record.
    pub fn process_type(&self) -> Option<&str> {
        self.attribute_str(attrs::PROCESS_TYPE)
    }

    /// Whether the process record is flagged as paused.
    pub fn paused(&self) -> bool {
        self.attributes
            .get(attrs::PAUSED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Exit status of a finished process.
    pub fn exit_status(&self) -> Option<i32> {
        self.attributes
            .get(attrs::EXIT_STATUS)
            .and_then(Value::as_i64)
            .and_then(|s| i32::try_from(s).ok())
    }

    /// Exit message of a finished process.
    pub fn exit_message(&self) -> Option<&str> {
        self.attribute_str(attrs::EXIT_MESSAGE)
    }

    /// Exit code of a finished process.
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.exit_status().map(|status| ExitCode {
            status,
            message: self.exit_message().map(str::to_string),
        })
    }

    /// Error text of an excepted process.
    pub fn exception(&self) -> Option<&str> {
        self.attribute_str(attrs::EXCEPTION)
    }

    /// Whether the process reached a terminal state.
    pub fn is_terminated(&self) -> bool {
        self.process_state().is_some_and(ProcessState::is_terminal)
    }

    /// Whether the process finished (with any exit status).
    pub fn is_finished(&self) -> bool {
        self.process_state() == Some(ProcessState::Finished)
    }

    /// Whether the process finished with exit status zero.
    pub fn is_finished_ok(&self) -> bool {
        self.is_finished() && self.exit_status() == Some(0)
    }

    /// Whether the process was killed.
    pub fn is_killed(&self) -> bool {
        self.process_state() == Some(ProcessState::Killed)
    }

    /// Whether the process excepted.
    pub fn is_excepted(&self) -> bool {
        self.process_state() == Some(ProcessState::Excepted)
    }

    /// Reject attribute changes on sealed nodes and stored data nodes.
    pub fn ensure_mutable(&self) -> Result<()> {
        let identifier = self.pk.map(|pk| pk.to_string()).unwrap_or_else(|| self.uuid.to_string());
        if self.sealed {
            return Err(StoreError::node_immutable(identifier, "the node is sealed"));
        }
        if self.is_data() && self.is_stored() {
            return Err(StoreError::node_immutable(
                identifier,
                "data nodes are immutable once stored",
            ));
        }
        Ok(())
    }
}

/// Kind of a provenance link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Process created a new data node.
    Create,
    /// Data node was an input of a process.
    Input,
    /// Process returned an already stored data node.
    Return,
    /// Process called a child process.
    Call,
}

impl LinkType {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Create => "create",
            LinkType::Input => "input",
            LinkType::Return => "return",
            LinkType::Call => "call",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(LinkType::Create),
            "input" => Ok(LinkType::Input),
            "return" => Ok(LinkType::Return),
            "call" => Ok(LinkType::Call),
            other => Err(StoreError::Validation {
                field: "link_type".to_string(),
                message: format!("unknown link type '{other}'"),
            }),
        }
    }
}

/// Direction of links relative to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Links whose target is the node.
    Incoming,
    /// Links whose source is the node.
    Outgoing,
}

/// A labelled, typed edge between two stored nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    /// Source node pk.
    pub source: Pk,
    /// Target node pk.
    pub target: Pk,
    /// Link kind.
    pub link_type: LinkType,
    /// Port name or call label.
    pub label: String,
}

impl Link {
    /// Build a link.
    pub fn new(source: Pk, target: Pk, link_type: LinkType, label: impl Into<String>) -> Self {
        Self {
            source,
            target,
            link_type,
            label: label.into(),
        }
    }

    /// Check endpoint types and sealing for this link.
    ///
    /// The process endpoint must not be sealed: outgoing CREATE, RETURN and
    /// CALL links come from the source process, INPUT links go into the
    /// target process.
    pub fn validate(&self, source: &Node, target: &Node) -> Result<()> {
        let invalid = |message: &str| StoreError::Validation {
            field: "link".to_string(),
            message: format!(
                "{} link {} -> {}: {}",
                self.link_type, self.source, self.target, message
            ),
        };

        let (process, process_pk) = match self.link_type {
            LinkType::Create | LinkType::Return => {
                if !source.is_process() || !target.is_data() {
                    return Err(invalid("must go from a process to a data node"));
                }
                (source, self.source)
            }
            LinkType::Input => {
                if !source.is_data() || !target.is_process() {
                    return Err(invalid("must go from a data node to a process"));
                }
                (target, self.target)
            }
            LinkType::Call => {
                if !source.is_process() || !target.is_process() {
                    return Err(invalid("must connect two processes"));
                }
                (source, self.source)
            }
        };

        if process.sealed {
            return Err(StoreError::node_immutable(
                process_pk,
                format!("cannot add {} link to a sealed process", self.link_type),
            ));
        }
        Ok(())
    }
}

/// Identifies a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupId {
    /// Database primary key.
    Pk(Pk),
    /// Globally unique identifier.
    Uuid(Uuid),
    /// Unique label.
    Label(String),
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupId::Pk(pk) => write!(f, "{pk}"),
            GroupId::Uuid(uuid) => write!(f, "{uuid}"),
            GroupId::Label(label) => f.write_str(label),
        }
    }
}

/// A labelled collection of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Primary key.
    pub pk: Pk,
    /// Globally unique identifier.
    pub uuid: Uuid,
    /// Unique label.
    pub label: String,
}

/// Filter for node queries. All set criteria must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeFilter {
    /// Node type prefix, e.g. `process` or `data.`.
    pub node_type_prefix: Option<String>,
    /// Exact label.
    pub label: Option<String>,
    /// Lowercase hex prefix of the dash-stripped UUID.
    pub uuid_prefix: Option<String>,
    /// Attribute equality constraints.
    pub attributes: Vec<(String, Value)>,
    /// Sealing state.
    pub sealed: Option<bool>,
    /// Maximum number of results.
    pub limit: Option<i64>,
}

impl NodeFilter {
    /// Empty filter matching every node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only process records.
    pub fn processes() -> Self {
        Self::new().node_type_prefix(PROCESS_NODE_TYPE)
    }

    /// Restrict to node types starting with `prefix`.
    pub fn node_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.node_type_prefix = Some(prefix.into());
        self
    }

    /// Restrict to an exact label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Restrict to UUIDs whose dash-stripped hex starts with `prefix`.
    pub fn uuid_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.uuid_prefix = Some(prefix.into().replace('-', "").to_lowercase());
        self
    }

    /// Require an attribute to equal `value`.
    pub fn attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.push((key.into(), value));
        self
    }

    /// Restrict to sealed or unsealed nodes.
    pub fn sealed(mut self, sealed: bool) -> Self {
        self.sealed = Some(sealed);
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-memory evaluation of the filter.
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(prefix) = &self.node_type_prefix
            && !node.node_type.starts_with(prefix.as_str())
        {
            return false;
        }
        if let Some(label) = &self.label
            && &node.label != label
        {
            return false;
        }
        if let Some(prefix) = &self.uuid_prefix
            && !node.uuid.simple().to_string().starts_with(prefix.as_str())
        {
            return false;
        }
        if let Some(sealed) = self.sealed
            && node.sealed != sealed
        {
            return false;
        }
        self.attributes
            .iter()
            .all(|(key, value)| node.attributes.get(key) == Some(value))
    }
}
