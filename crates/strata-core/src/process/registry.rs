// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mapping from stored type strings to process constructors.
//!
//! Records only carry a `process_type` string. Resuming a checkpoint or
//! launching from a task looks the string up here; registration happens at
//! startup by whatever discovers the application's process types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Process, ProcessError, ProcessSpec};

/// Builds a fresh, unstarted process instance.
pub type ProcessConstructor = fn() -> Box<dyn Process>;

fn construct<P: Process + Default>() -> Box<dyn Process> {
    Box::new(P::default())
}

/// Everything needed to instantiate one process type.
#[derive(Clone)]
pub struct ProcessFactory {
    process_type: String,
    label: String,
    spec: Arc<ProcessSpec>,
    constructor: ProcessConstructor,
}

impl fmt::Debug for ProcessFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessFactory")
            .field("process_type", &self.process_type)
            .field("label", &self.label)
            .finish()
    }
}

impl ProcessFactory {
    /// Factory for `P`, with its spec built once.
    pub fn of<P: Process + Default>() -> Self {
        let mut spec = ProcessSpec::new();
        P::define(&mut spec);
        Self {
            process_type: P::type_string(),
            label: P::label(),
            spec: Arc::new(spec),
            constructor: construct::<P>,
        }
    }

    /// Stored type string.
    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    /// Label written on new records.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Shared spec of the type.
    pub fn spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    /// New instance.
    pub fn instantiate(&self) -> Box<dyn Process> {
        (self.constructor)()
    }
}

/// Registered process types, keyed by type string.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    factories: RwLock<HashMap<String, ProcessFactory>>,
}

impl ProcessRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `P` and return its factory. Re-registering replaces the entry.
    pub fn register<P: Process + Default>(&self) -> ProcessFactory {
        let factory = ProcessFactory::of::<P>();
        self.register_factory(factory.clone());
        factory
    }

    /// Register a prepared factory.
    pub fn register_factory(&self, factory: ProcessFactory) {
        self.factories
            .write()
            .insert(factory.process_type.clone(), factory);
    }

    /// Factory registered under `process_type`.
    pub fn resolve(&self, process_type: &str) -> Result<ProcessFactory, ProcessError> {
        self.factories
            .read()
            .get(process_type)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownProcessType(process_type.to_string()))
    }

    /// Whether `process_type` is registered.
    pub fn contains(&self, process_type: &str) -> bool {
        self.factories.read().contains_key(process_type)
    }

    /// Registered type strings, sorted.
    pub fn process_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{PortSpec, ProcessContext, Step};

    #[derive(Default)]
    struct Echo;

    #[async_trait::async_trait]
    impl Process for Echo {
        fn define(spec: &mut ProcessSpec) {
            spec.input(PortSpec::new("x").valid_type("data.int"));
        }

        fn type_string() -> String {
            "tests.Echo".to_string()
        }

        async fn step(&mut self, _step: &str, _ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
            Ok(Step::done())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ProcessRegistry::new();
        let factory = registry.register::<Echo>();
        assert_eq!(factory.process_type(), "tests.Echo");
        assert_eq!(factory.label(), "tests.Echo");
        assert!(factory.spec().inputs.get("x").is_some());

        let resolved = registry.resolve("tests.Echo").unwrap();
        assert_eq!(resolved.process_type(), "tests.Echo");
        assert_eq!(resolved.instantiate().entry_step(), "run");
        assert_eq!(registry.process_types(), vec!["tests.Echo".to_string()]);
    }

    #[test]
    fn test_unknown_type() {
        let registry = ProcessRegistry::new();
        assert!(!registry.contains("nope"));
        assert!(matches!(
            registry.resolve("nope"),
            Err(ProcessError::UnknownProcessType(t)) if t == "nope"
        ));
    }
}
