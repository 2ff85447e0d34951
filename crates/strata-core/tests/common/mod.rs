// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for strata-core integration tests.
//!
//! Provides TestContext wiring a store, a broker and a runner together, and
//! a handful of process types used across the suites.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use strata_core::communicator::{Communicator, InProcessBroker};
use strata_core::controller::Controller;
use strata_core::node::{Node, NodeId, Pk};
use strata_core::payload::{Inputs, Payload};
use strata_core::persistence::{MemoryStore, NodeStore, Persister, SqliteStore};
use strata_core::process::{
    Awaitable, PortSpec, Process, ProcessContext, ProcessError, ProcessRegistry, ProcessSpec,
    ProcessState, Step,
};
use strata_core::runner::{Runner, RunnerConfig};
use strata_core::transport::LocalAuthInfo;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Store, broker and a runner sharing them.
pub struct TestContext {
    pub store: Arc<dyn NodeStore>,
    pub persister: Arc<dyn Persister>,
    pub broker: Arc<InProcessBroker>,
    pub communicator: Communicator,
    pub registry: Arc<ProcessRegistry>,
    pub runner: Runner,
}

impl TestContext {
    /// Context backed by the in-memory store.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_backend(store.clone(), store)
    }

    /// Context backed by a fresh in-memory SQLite database.
    pub async fn sqlite() -> Self {
        let store = Arc::new(
            SqliteStore::in_memory()
                .await
                .expect("Failed to open in-memory SQLite store"),
        );
        Self::with_backend(store.clone(), store)
    }

    /// Context backed by a SQLite file at `path`.
    pub async fn sqlite_file(path: &Path) -> Self {
        let store = Arc::new(
            SqliteStore::from_path(path)
                .await
                .expect("Failed to open SQLite store"),
        );
        Self::with_backend(store.clone(), store)
    }

    fn with_backend(store: Arc<dyn NodeStore>, persister: Arc<dyn Persister>) -> Self {
        init_tracing();
        let broker = InProcessBroker::new();
        let communicator = Communicator::new(broker.clone(), store.clone());
        let registry = Arc::new(ProcessRegistry::new());
        registry.register::<AddOne>();
        registry.register::<Sleeper>();
        registry.register::<Napper>();
        registry.register::<Parent>();

        let runner = build_runner(&store, &persister, &communicator, &registry);
        Self {
            store,
            persister,
            broker,
            communicator,
            registry,
            runner,
        }
    }

    /// Another runner on the same store and bus, like a second worker.
    pub fn new_runner(&self) -> Runner {
        build_runner(&self.store, &self.persister, &self.communicator, &self.registry)
    }

    /// Controller talking to the shared bus.
    pub fn controller(&self) -> Controller {
        Controller::new(self.communicator.clone(), Duration::from_secs(5))
    }

    /// Load the record of `pid`.
    pub async fn record(&self, pid: Pk) -> Node {
        self.store
            .load_node(NodeId::Pk(pid))
            .await
            .expect("Failed to load process record")
    }

    /// Block until the record of `pid` reaches `state`.
    pub async fn wait_for_state(&self, pid: Pk, state: ProcessState) {
        let store = Arc::clone(&self.store);
        tokio::time::timeout(TEST_TIMEOUT, async move {
            loop {
                let record = store.load_node(NodeId::Pk(pid)).await.expect("record");
                if record.process_state() == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("process {pid} never reached {state}"));
    }

    /// Whether a checkpoint exists for `pid`.
    pub async fn has_checkpoint(&self, pid: Pk) -> bool {
        self.persister.load_checkpoint(pid).await.is_ok()
    }
}

fn build_runner(
    store: &Arc<dyn NodeStore>,
    persister: &Arc<dyn Persister>,
    communicator: &Communicator,
    registry: &Arc<ProcessRegistry>,
) -> Runner {
    Runner::builder()
        .store(Arc::clone(store))
        .persister(Arc::clone(persister))
        .communicator(communicator.clone())
        .registry(Arc::clone(registry))
        .config(RunnerConfig {
            rpc_timeout: Duration::from_secs(5),
            poll_interval: Some(Duration::from_millis(20)),
            kill_children_timeout: Duration::from_secs(5),
            ..RunnerConfig::default()
        })
        .build()
        .expect("Failed to build runner")
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("strata_core=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// `{"x": Int(value)}`
pub fn x(value: i64) -> Inputs {
    Inputs::from([("x".to_string(), Payload::Node(Node::int(value)))])
}

/// Adds one to `x`.
#[derive(Default)]
pub struct AddOne;

#[async_trait::async_trait]
impl Process for AddOne {
    fn define(spec: &mut ProcessSpec) {
        spec.input(PortSpec::new("x").valid_type("data.int"))
            .output(PortSpec::new("result").valid_type("data.int"));
    }

    fn type_string() -> String {
        "tests.AddOne".to_string()
    }

    async fn step(&mut self, _step: &str, ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
        let x = ctx.input_node("x").and_then(Node::as_int).unwrap_or_default();
        ctx.out("result", Node::int(x + 1)).await?;
        Ok(Step::done())
    }
}

/// Sleeps for an hour; only useful to be paused or killed.
#[derive(Default)]
pub struct Sleeper;

#[async_trait::async_trait]
impl Process for Sleeper {
    fn define(_spec: &mut ProcessSpec) {}

    fn type_string() -> String {
        "tests.Sleeper".to_string()
    }

    async fn step(&mut self, step: &str, _ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
        match step {
            "run" => Ok(Step::wait(Awaitable::sleep(Duration::from_secs(3600)), "done")),
            _ => Ok(Step::done()),
        }
    }
}

/// Sleeps briefly, then reports how many times it was woken.
#[derive(Default)]
pub struct Napper {
    naps: i64,
}

#[async_trait::async_trait]
impl Process for Napper {
    fn define(spec: &mut ProcessSpec) {
        spec.output(PortSpec::new("naps").valid_type("data.int"));
    }

    fn type_string() -> String {
        "tests.Napper".to_string()
    }

    async fn step(&mut self, step: &str, ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
        match step {
            "run" => Ok(Step::wait(Awaitable::sleep(Duration::from_millis(300)), "wake")),
            _ => {
                self.naps += 1;
                ctx.out("naps", Node::int(self.naps)).await?;
                Ok(Step::done())
            }
        }
    }

    fn save_state(&self) -> Value {
        json!({ "naps": self.naps })
    }

    fn load_state(&mut self, state: Value) -> Result<(), ProcessError> {
        self.naps = state["naps"].as_i64().unwrap_or_default();
        Ok(())
    }
}

/// Submits two sleepers and waits for the first.
#[derive(Default)]
pub struct Parent {
    children: Vec<Pk>,
}

#[async_trait::async_trait]
impl Process for Parent {
    fn define(_spec: &mut ProcessSpec) {}

    fn type_string() -> String {
        "tests.Parent".to_string()
    }

    async fn step(&mut self, step: &str, ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
        match step {
            "run" => {
                for _ in 0..2 {
                    let child = ctx.submit::<Sleeper>(Inputs::new()).await?;
                    self.children.push(child.stored_pk()?);
                }
                Ok(Step::wait(Awaitable::process(self.children[0]), "done"))
            }
            _ => Ok(Step::done()),
        }
    }

    fn save_state(&self) -> Value {
        json!({ "children": self.children })
    }

    fn load_state(&mut self, state: Value) -> Result<(), ProcessError> {
        self.children = serde_json::from_value(state["children"].clone())
            .map_err(|e| ProcessError::failed(e.to_string()))?;
        Ok(())
    }
}

/// Runs `hostname` over a shared local transport and outputs the address of
/// the transport it was given.
#[derive(Default)]
pub struct TransportUser;

#[async_trait::async_trait]
impl Process for TransportUser {
    fn define(spec: &mut ProcessSpec) {
        spec.output(PortSpec::new("transport").valid_type("data.int"));
    }

    fn type_string() -> String {
        "tests.TransportUser".to_string()
    }

    async fn step(&mut self, _step: &str, ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
        let auth = LocalAuthInfo::new("localhost").with_safe_open_interval(Duration::from_millis(100));
        let address = ctx
            .with_transport(&auth, |transport| async move {
                let output = transport.exec("true").await;
                // keep the connection while the sibling is still inside
                tokio::time::sleep(Duration::from_millis(50)).await;
                output.map(|_| Arc::as_ptr(&transport) as *const () as usize as i64)
            })
            .await??;
        ctx.out("transport", Node::int(address)).await?;
        Ok(Step::done())
    }
}
