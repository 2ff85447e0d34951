// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Values passed between processes: port inputs, task bodies and RPC payloads.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::node::{Group, Node};
use crate::persistence::NodeStore;

/// Input values keyed by port name.
pub type Inputs = BTreeMap<String, Payload>;

/// Key of a [`Payload::Map`].
///
/// Besides strings, integer, boolean and tuple keys are supported and survive
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    /// String key.
    Str(String),
    /// Integer key.
    Int(i64),
    /// Boolean key.
    Bool(bool),
    /// Tuple key.
    Tuple(Vec<MapKey>),
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::Str(s.to_string())
    }
}

impl From<String> for MapKey {
    fn from(s: String) -> Self {
        MapKey::Str(s)
    }
}

impl From<i64> for MapKey {
    fn from(i: i64) -> Self {
        MapKey::Int(i)
    }
}

/// A value that may reference graph entities.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    String(String),
    /// Ordered list.
    List(Vec<Payload>),
    /// Mapping with structured keys.
    Map(BTreeMap<MapKey, Payload>),
    /// Reference to a node.
    Node(Node),
    /// Reference to a group.
    Group(Group),
}

impl Payload {
    /// Build a string-keyed map.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<MapKey>,
        I: IntoIterator<Item = (K, Payload)>,
    {
        Payload::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Short kind name, matched against `valid_types` of non-stored ports.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Null => "null",
            Payload::Bool(_) => "bool",
            Payload::Int(_) => "int",
            Payload::Float(_) => "float",
            Payload::String(_) => "str",
            Payload::List(_) => "list",
            Payload::Map(_) => "dict",
            Payload::Node(_) => "node",
            Payload::Group(_) => "group",
        }
    }

    /// The referenced node, if any.
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Payload::Node(node) => Some(node),
            _ => None,
        }
    }

    /// The string value, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    /// The integer value, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Convert a string-keyed map into port inputs.
    ///
    /// Returns `None` for non-map payloads or maps with non-string keys.
    pub fn into_inputs(self) -> Option<Inputs> {
        match self {
            Payload::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| match k {
                    MapKey::Str(k) => Some((k, v)),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Convert port inputs into a string-keyed map payload.
    pub fn from_inputs(inputs: Inputs) -> Self {
        Payload::map(inputs)
    }

    /// Build a payload from plain JSON (no entity references).
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Payload::Int(i),
                None => Payload::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::from_json).collect()),
            Value::Object(map) => Payload::Map(
                map.into_iter()
                    .map(|(k, v)| (MapKey::Str(k), Payload::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Store every unstored node referenced by `inputs`, in place.
///
/// Returns the UUIDs of the nodes stored by this call.
pub(crate) async fn store_input_nodes(
    store: &dyn NodeStore,
    inputs: &mut Inputs,
) -> Result<HashSet<Uuid>, StoreError> {
    let mut nodes = Vec::new();
    for payload in inputs.values_mut() {
        collect_nodes_mut(payload, &mut nodes);
    }
    let mut created = HashSet::new();
    for node in nodes {
        if !node.is_stored() {
            *node = store.store_node(node).await?;
            created.insert(node.uuid);
        }
    }
    Ok(created)
}

fn collect_nodes_mut<'a>(payload: &'a mut Payload, out: &mut Vec<&'a mut Node>) {
    match payload {
        Payload::Node(node) => out.push(node),
        Payload::List(items) => items.iter_mut().for_each(|item| collect_nodes_mut(item, out)),
        Payload::Map(entries) => entries
            .values_mut()
            .for_each(|value| collect_nodes_mut(value, out)),
        _ => {}
    }
}

impl From<Node> for Payload {
    fn from(node: Node) -> Self {
        Payload::Node(node)
    }
}

impl From<Group> for Payload {
    fn from(group: Group) -> Self {
        Payload::Group(group)
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Payload::Int(i)
    }
}

impl From<f64> for Payload {
    fn from(f: f64) -> Self {
        Payload::Float(f)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Bool(b)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::String(s)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(items: Vec<Payload>) -> Self {
        Payload::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind() {
        assert_eq!(Payload::Null.kind(), "null");
        assert_eq!(Payload::from(1).kind(), "int");
        assert_eq!(Payload::from(1.5).kind(), "float");
        assert_eq!(Payload::from("x").kind(), "str");
        assert_eq!(Payload::map([("a", Payload::Null)]).kind(), "dict");
        assert_eq!(Payload::from(Node::int(1)).kind(), "node");
    }

    #[test]
    fn test_inputs_conversion() {
        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Payload::from(1));
        inputs.insert("y".to_string(), Payload::from("two"));

        let payload = Payload::from_inputs(inputs.clone());
        assert_eq!(payload.into_inputs(), Some(inputs));

        let tuple_keyed = Payload::Map(BTreeMap::from([(
            MapKey::Tuple(vec![MapKey::Int(1), MapKey::Int(2)]),
            Payload::Null,
        )]));
        assert_eq!(tuple_keyed.into_inputs(), None);
        assert_eq!(Payload::from(3).into_inputs(), None);
    }

    #[test]
    fn test_from_json() {
        let payload = Payload::from_json(json!({"a": [1, 2.5, "s", null, true]}));
        assert_eq!(
            payload,
            Payload::map([(
                "a",
                Payload::List(vec![
                    Payload::Int(1),
                    Payload::Float(2.5),
                    Payload::String("s".into()),
                    Payload::Null,
                    Payload::Bool(true),
                ])
            )])
        );
    }
}
