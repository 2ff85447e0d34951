// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process specifications: input and output ports, namespaces and exit codes.
//!
//! A [`ProcessSpec`] is built once per process type by [`Process::define`]
//! and shared by every instance. Input validation fills in defaults and
//! checks types before the process record is stored, so invalid inputs
//! never produce a record.
//!
//! [`Process::define`]: crate::process::Process::define

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::payload::{Inputs, MapKey, Payload};

/// Custom check run on a port value after the type check.
pub type Validator = Arc<dyn Fn(&Payload) -> Result<(), String> + Send + Sync>;

/// Separator between namespace and port names in error paths and link labels.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// A port failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("port '{port}': {message}")]
pub struct ValidationError {
    /// Port path, namespaces joined with `__`.
    pub port: String,
    /// What is wrong.
    pub message: String,
}

impl ValidationError {
    fn new(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            message: message.into(),
        }
    }
}

/// Exit status and message of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitCode {
    /// Zero means success.
    pub status: i32,
    /// Optional explanation.
    pub message: Option<String>,
}

impl ExitCode {
    /// Successful exit.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Exit with `status` and `message`.
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    /// Whether the status is zero.
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Declaration of a single port.
#[derive(Clone)]
pub struct PortSpec {
    /// Port name.
    pub name: String,
    /// Accepted node types (stored ports) or payload kinds (non-stored ports).
    /// Empty accepts anything.
    pub valid_types: Vec<String>,
    /// Value used when the port is not provided.
    pub default: Option<Payload>,
    /// Whether a value must be provided (after defaults).
    pub required: bool,
    /// Whether the value is a stored data node linked to the record.
    pub is_db_stored: bool,
    /// Extra validation.
    pub validator: Option<Validator>,
    /// Help text.
    pub help: Option<String>,
}

impl fmt::Debug for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSpec")
            .field("name", &self.name)
            .field("valid_types", &self.valid_types)
            .field("default", &self.default)
            .field("required", &self.required)
            .field("is_db_stored", &self.is_db_stored)
            .field("validator", &self.validator.as_ref().map(|_| "..."))
            .field("help", &self.help)
            .finish()
    }
}

impl PortSpec {
    /// Required port holding a stored data node of any type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            valid_types: Vec::new(),
            default: None,
            required: true,
            is_db_stored: true,
            validator: None,
            help: None,
        }
    }

    /// Accept `node_type` (or payload kind for non-stored ports).
    pub fn valid_type(mut self, node_type: impl Into<String>) -> Self {
        self.valid_types.push(node_type.into());
        self
    }

    /// Default value.
    pub fn default_value(mut self, value: impl Into<Payload>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Make the port optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Pass the value through without storing or linking it.
    pub fn non_db(mut self) -> Self {
        self.is_db_stored = false;
        self
    }

    /// Custom validator.
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Payload) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Help text.
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    fn validate(&self, path: &str, value: &Payload) -> Result<(), ValidationError> {
        if self.is_db_stored {
            let Payload::Node(node) = value else {
                return Err(ValidationError::new(
                    path,
                    format!("expected a data node, got {}", value.kind()),
                ));
            };
            if !node.is_data() {
                return Err(ValidationError::new(
                    path,
                    format!("expected a data node, got {}", node.node_type),
                ));
            }
            if !self.valid_types.is_empty() && !self.valid_types.contains(&node.node_type) {
                return Err(ValidationError::new(
                    path,
                    format!(
                        "type {} is not one of [{}]",
                        node.node_type,
                        self.valid_types.join(", ")
                    ),
                ));
            }
        } else {
            if matches!(value, Payload::Node(_)) {
                return Err(ValidationError::new(
                    path,
                    "non-stored port does not accept nodes",
                ));
            }
            let kind = value.kind();
            if !self.valid_types.is_empty() && !self.valid_types.iter().any(|t| t == kind) {
                return Err(ValidationError::new(
                    path,
                    format!("type {kind} is not one of [{}]", self.valid_types.join(", ")),
                ));
            }
        }

        if let Some(validator) = &self.validator {
            validator(value).map_err(|message| ValidationError::new(path, message))?;
        }
        Ok(())
    }
}

/// A port or a nested namespace of ports.
#[derive(Debug, Clone)]
pub enum Port {
    /// Single value.
    Value(PortSpec),
    /// Nested namespace.
    Namespace(PortNamespace),
}

/// A named group of ports.
#[derive(Debug, Clone, Default)]
pub struct PortNamespace {
    /// Namespace name, empty for the top level.
    pub name: String,
    /// Ports by name.
    pub ports: BTreeMap<String, Port>,
    /// Whether undeclared keys are accepted.
    pub dynamic: bool,
    /// Help text.
    pub help: Option<String>,
}

impl PortNamespace {
    /// Empty static namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Accept undeclared keys.
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Add a port.
    pub fn port(mut self, port: PortSpec) -> Self {
        self.insert_port(port);
        self
    }

    /// Add a nested namespace.
    pub fn namespace(mut self, namespace: PortNamespace) -> Self {
        self.ports
            .insert(namespace.name.clone(), Port::Namespace(namespace));
        self
    }

    /// Add a port in place.
    pub fn insert_port(&mut self, port: PortSpec) {
        self.ports.insert(port.name.clone(), Port::Value(port));
    }

    /// Look up a direct child port.
    pub fn get(&self, name: &str) -> Option<&Port> {
        self.ports.get(name)
    }

    fn has_required(&self) -> bool {
        self.ports.values().any(|port| match port {
            Port::Value(spec) => spec.required && spec.default.is_none(),
            Port::Namespace(ns) => ns.has_required(),
        })
    }

    /// Validate `values` against this namespace, filling in defaults.
    pub fn validate(&self, values: &mut Inputs) -> Result<(), ValidationError> {
        self.validate_at("", values)
    }

    fn validate_at(&self, prefix: &str, values: &mut Inputs) -> Result<(), ValidationError> {
        let path = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}{NAMESPACE_SEPARATOR}{name}")
            }
        };

        if !self.dynamic
            && let Some(unknown) = values.keys().find(|key| !self.ports.contains_key(*key))
        {
            return Err(ValidationError::new(path(unknown.as_str()), "unexpected port"));
        }

        for (name, port) in &self.ports {
            let port_path = path(name.as_str());
            match port {
                Port::Value(spec) => {
                    if !values.contains_key(name)
                        && let Some(default) = &spec.default
                    {
                        values.insert(name.clone(), default.clone());
                    }
                    match values.get(name) {
                        Some(value) => spec.validate(&port_path, value)?,
                        None if spec.required => {
                            return Err(ValidationError::new(
                                port_path,
                                "required value was not provided",
                            ));
                        }
                        None => {}
                    }
                }
                Port::Namespace(namespace) => {
                    let provided = values.remove(name);
                    let mut nested = match provided {
                        Some(payload) => payload.into_inputs().ok_or_else(|| {
                            ValidationError::new(&port_path, "expected a mapping of ports")
                        })?,
                        None if namespace.has_required() => Inputs::new(),
                        None => continue,
                    };
                    namespace.validate_at(&port_path, &mut nested)?;
                    values.insert(name.clone(), Payload::from_inputs(nested));
                }
            }
        }
        Ok(())
    }

    /// Whether the value at `name` is a stored data node to be linked.
    ///
    /// Undeclared keys of dynamic namespaces are linked when they hold nodes.
    pub fn is_db_stored(&self, name: &str) -> bool {
        match self.ports.get(name) {
            Some(Port::Value(spec)) => spec.is_db_stored,
            Some(Port::Namespace(_)) => false,
            None => self.dynamic,
        }
    }
}

/// Ports and exit codes of a process type.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Input ports.
    pub inputs: PortNamespace,
    /// Output ports.
    pub outputs: PortNamespace,
    exit_codes: BTreeMap<String, ExitCode>,
}

impl ProcessSpec {
    /// Empty spec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an input port.
    pub fn input(&mut self, port: PortSpec) -> &mut Self {
        self.inputs.insert_port(port);
        self
    }

    /// Declare an input namespace.
    pub fn input_namespace(&mut self, namespace: PortNamespace) -> &mut Self {
        self.inputs
            .ports
            .insert(namespace.name.clone(), Port::Namespace(namespace));
        self
    }

    /// Declare an output port. Output ports always hold stored data nodes.
    pub fn output(&mut self, port: PortSpec) -> &mut Self {
        let mut port = port;
        port.is_db_stored = true;
        self.outputs.insert_port(port);
        self
    }

    /// Accept undeclared inputs.
    pub fn dynamic_inputs(&mut self) -> &mut Self {
        self.inputs.dynamic = true;
        self
    }

    /// Accept undeclared outputs.
    pub fn dynamic_outputs(&mut self) -> &mut Self {
        self.outputs.dynamic = true;
        self
    }

    /// Declare a named exit code.
    pub fn exit_code(&mut self, status: i32, label: &str, message: &str) -> &mut Self {
        self.exit_codes
            .insert(label.to_string(), ExitCode::new(status, message));
        self
    }

    /// Look up a named exit code.
    pub fn get_exit_code(&self, label: &str) -> Option<&ExitCode> {
        self.exit_codes.get(label)
    }

    /// Validate inputs, filling in defaults.
    pub fn validate_inputs(&self, inputs: &mut Inputs) -> Result<(), ValidationError> {
        self.inputs.validate(inputs)
    }

    /// Validate a single emitted output.
    pub fn validate_output(&self, name: &str, node: &Node) -> Result<(), ValidationError> {
        match self.outputs.get(name) {
            Some(Port::Value(spec)) => spec.validate(name, &Payload::Node(node.clone())),
            Some(Port::Namespace(_)) => Err(ValidationError::new(
                name,
                "cannot emit a node onto a namespace",
            )),
            None if self.outputs.dynamic => {
                if node.is_data() {
                    Ok(())
                } else {
                    Err(ValidationError::new(name, "outputs must be data nodes"))
                }
            }
            None => Err(ValidationError::new(name, "unexpected output port")),
        }
    }

    /// Check that every required output was emitted.
    pub fn validate_outputs(&self, emitted: &BTreeMap<String, Node>) -> Result<(), ValidationError> {
        for (name, port) in &self.outputs.ports {
            if let Port::Value(spec) = port
                && spec.required
                && !emitted.contains_key(name)
            {
                return Err(ValidationError::new(
                    name.as_str(),
                    "required output was not emitted",
                ));
            }
        }
        Ok(())
    }
}

/// Flatten nested input namespaces into `(link_label, node)` pairs of stored ports.
pub(crate) fn linkable_inputs<'a>(
    namespace: &PortNamespace,
    inputs: &'a Inputs,
) -> Vec<(String, &'a Node)> {
    let entries: Vec<(&str, &Payload)> = inputs.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let mut out = Vec::new();
    collect_linkable(namespace, &entries, "", &mut out);
    out
}

fn collect_linkable<'a>(
    namespace: &PortNamespace,
    entries: &[(&'a str, &'a Payload)],
    prefix: &str,
    out: &mut Vec<(String, &'a Node)>,
) {
    for &(name, value) in entries {
        let label = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}{NAMESPACE_SEPARATOR}{name}")
        };
        match (namespace.get(name), value) {
            (Some(Port::Namespace(nested)), Payload::Map(map)) => {
                let nested_entries: Vec<(&str, &Payload)> = map
                    .iter()
                    .filter_map(|(k, v)| match k {
                        MapKey::Str(k) => Some((k.as_str(), v)),
                        _ => None,
                    })
                    .collect();
                collect_linkable(nested, &nested_entries, &label, out);
            }
            (_, Payload::Node(node)) if namespace.is_db_stored(name) => {
                out.push((label, node));
            }
            _ => {}
        }
    }
}
