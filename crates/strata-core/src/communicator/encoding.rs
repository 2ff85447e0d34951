// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-safe wire encoding of [`Payload`] values.
//!
//! Nodes and groups travel as tagged strings holding their UUID and are
//! reloaded from the store on decode. Map keys that are not strings are
//! written as tagged JSON. Plain strings that happen to start with the tag
//! prefix are escaped, so every payload survives a round trip:
//!
//! | Value | Wire form |
//! |-------|-----------|
//! | stored node | `"strata:node:<uuid>"` |
//! | group | `"strata:group:<uuid>"` |
//! | string starting with `strata:` | `"strata:str:<string>"` |
//! | non-string map key | `"strata:key:<json>"` |

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{Map, Number, Value};
use uuid::Uuid;

use super::CommunicatorError;
use crate::node::{Group, GroupId, Node, NodeId};
use crate::payload::{Inputs, MapKey, Payload};
use crate::persistence::NodeStore;

const TAG_PREFIX: &str = "strata:";
const NODE_TAG: &str = "strata:node:";
const GROUP_TAG: &str = "strata:group:";
const STR_TAG: &str = "strata:str:";
const KEY_TAG: &str = "strata:key:";

type Result<T> = std::result::Result<T, CommunicatorError>;

fn encoding_error(message: impl Into<String>) -> CommunicatorError {
    CommunicatorError::Encoding(message.into())
}

/// Encode a payload into plain JSON.
pub fn encode(payload: &Payload) -> Result<Value> {
    Ok(match payload {
        Payload::Null => Value::Null,
        Payload::Bool(b) => Value::Bool(*b),
        Payload::Int(i) => Value::from(*i),
        Payload::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| encoding_error(format!("cannot encode non-finite float {f}")))?,
        Payload::String(s) => Value::String(escape_str(s)),
        Payload::List(items) => Value::Array(items.iter().map(encode).collect::<Result<_>>()?),
        Payload::Map(entries) => {
            let mut object = Map::new();
            for (key, value) in entries {
                object.insert(encode_key(key)?, encode(value)?);
            }
            Value::Object(object)
        }
        Payload::Node(node) => {
            if !node.is_stored() {
                return Err(encoding_error(format!(
                    "node {} must be stored before it can be sent",
                    node.uuid
                )));
            }
            Value::String(format!("{NODE_TAG}{}", node.uuid))
        }
        Payload::Group(group) => Value::String(format!("{GROUP_TAG}{}", group.uuid)),
    })
}

/// Encode port inputs as a JSON object.
pub fn encode_inputs(inputs: &Inputs) -> Result<Value> {
    let mut object = Map::new();
    for (name, value) in inputs {
        object.insert(escape_str(name), encode(value)?);
    }
    Ok(Value::Object(object))
}

/// Decode a payload, loading every referenced node and group from `store`.
pub async fn decode(value: &Value, store: &dyn NodeStore) -> Result<Payload> {
    let entities = Entities::load(value, store).await?;
    entities.rebuild(value)
}

/// Decode port inputs produced by [`encode_inputs`].
pub async fn decode_inputs(value: &Value, store: &dyn NodeStore) -> Result<Inputs> {
    let Value::Object(object) = value else {
        return Err(encoding_error("inputs must be a JSON object"));
    };
    let entities = Entities::load(value, store).await?;
    object
        .iter()
        .map(|(name, value)| Ok((unescape_str(name), entities.rebuild(value)?)))
        .collect()
}

fn escape_str(s: &str) -> String {
    if s.starts_with(TAG_PREFIX) {
        format!("{STR_TAG}{s}")
    } else {
        s.to_string()
    }
}

fn unescape_str(s: &str) -> String {
    s.strip_prefix(STR_TAG).unwrap_or(s).to_string()
}

fn encode_key(key: &MapKey) -> Result<String> {
    match key {
        MapKey::Str(s) => Ok(escape_str(s)),
        other => Ok(format!("{KEY_TAG}{}", serde_json::to_string(&key_to_json(other))?)),
    }
}

fn key_to_json(key: &MapKey) -> Value {
    match key {
        MapKey::Str(s) => Value::String(s.clone()),
        MapKey::Int(i) => Value::from(*i),
        MapKey::Bool(b) => Value::Bool(*b),
        MapKey::Tuple(items) => Value::Array(items.iter().map(key_to_json).collect()),
    }
}

fn key_from_json(value: Value) -> Result<MapKey> {
    match value {
        Value::String(s) => Ok(MapKey::Str(s)),
        Value::Bool(b) => Ok(MapKey::Bool(b)),
        Value::Number(n) => n
            .as_i64()
            .map(MapKey::Int)
            .ok_or_else(|| encoding_error(format!("invalid integer map key {n}"))),
        Value::Array(items) => Ok(MapKey::Tuple(
            items.into_iter().map(key_from_json).collect::<Result<_>>()?,
        )),
        other => Err(encoding_error(format!("invalid map key {other}"))),
    }
}

fn decode_key(raw: &str) -> Result<MapKey> {
    match raw.strip_prefix(KEY_TAG) {
        Some(json) => key_from_json(serde_json::from_str(json)?),
        None => Ok(MapKey::Str(unescape_str(raw))),
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| encoding_error(format!("invalid uuid '{raw}': {e}")))
}

/// Nodes and groups referenced by an encoded value, loaded up front.
#[derive(Default)]
struct Entities {
    nodes: HashMap<Uuid, Node>,
    groups: HashMap<Uuid, Group>,
}

impl Entities {
    async fn load(value: &Value, store: &dyn NodeStore) -> Result<Self> {
        let mut node_ids = HashSet::new();
        let mut group_ids = HashSet::new();
        collect_references(value, &mut node_ids, &mut group_ids)?;

        let mut entities = Entities::default();
        for uuid in node_ids {
            let node = store.load_node(NodeId::Uuid(uuid)).await?;
            entities.nodes.insert(uuid, node);
        }
        for uuid in group_ids {
            let group = store.load_group(GroupId::Uuid(uuid)).await?;
            entities.groups.insert(uuid, group);
        }
        Ok(entities)
    }

    fn rebuild(&self, value: &Value) -> Result<Payload> {
        Ok(match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Payload::Int(i),
                None => Payload::Float(
                    n.as_f64()
                        .ok_or_else(|| encoding_error(format!("invalid number {n}")))?,
                ),
            },
            Value::String(s) => {
                if let Some(raw) = s.strip_prefix(NODE_TAG) {
                    let uuid = parse_uuid(raw)?;
                    Payload::Node(
                        self.nodes
                            .get(&uuid)
                            .cloned()
                            .ok_or_else(|| encoding_error(format!("node {uuid} not loaded")))?,
                    )
                } else if let Some(raw) = s.strip_prefix(GROUP_TAG) {
                    let uuid = parse_uuid(raw)?;
                    Payload::Group(
                        self.groups
                            .get(&uuid)
                            .cloned()
                            .ok_or_else(|| encoding_error(format!("group {uuid} not loaded")))?,
                    )
                } else {
                    Payload::String(unescape_str(s))
                }
            }
            Value::Array(items) => {
                Payload::List(items.iter().map(|item| self.rebuild(item)).collect::<Result<_>>()?)
            }
            Value::Object(object) => {
                let mut entries = BTreeMap::new();
                for (key, value) in object {
                    entries.insert(decode_key(key)?, self.rebuild(value)?);
                }
                Payload::Map(entries)
            }
        })
    }
}

fn collect_references(
    value: &Value,
    nodes: &mut HashSet<Uuid>,
    groups: &mut HashSet<Uuid>,
) -> Result<()> {
    match value {
        Value::String(s) => {
            if let Some(raw) = s.strip_prefix(NODE_TAG) {
                nodes.insert(parse_uuid(raw)?);
            } else if let Some(raw) = s.strip_prefix(GROUP_TAG) {
                groups.insert(parse_uuid(raw)?);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, nodes, groups)?;
            }
        }
        Value::Object(object) => {
            for value in object.values() {
                collect_references(value, nodes, groups)?;
            }
        }
        _ => {}
    }
    Ok(())
}
