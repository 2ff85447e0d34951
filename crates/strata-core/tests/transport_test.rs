// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for transport sharing between processes.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use strata_core::node::Node;
use strata_core::payload::Inputs;
use strata_core::persistence::REPORT_LEVEL;
use strata_core::process::{
    PortSpec, Process, ProcessContext, ProcessError, ProcessSpec, ProcessState, Step,
};
use strata_core::transport::{
    AuthInfo, ExecOutput, LocalAuthInfo, Transport, TransportError, TransportQueue,
};

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

struct CountingTransport {
    counters: Arc<Counters>,
    open: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl Transport for CountingTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn safe_open_interval(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn exec(&self, _command: &str) -> Result<ExecOutput, TransportError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

struct CountingAuth {
    counters: Arc<Counters>,
}

impl AuthInfo for CountingAuth {
    fn key(&self) -> String {
        "cluster".to_string()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(CountingTransport {
            counters: Arc::clone(&self.counters),
            open: Default::default(),
        })
    }
}

#[tokio::test]
async fn test_nested_requests_share_one_connection() {
    let counters = Arc::new(Counters::default());
    let auth = CountingAuth {
        counters: Arc::clone(&counters),
    };
    let queue = TransportQueue::new();

    let mut outer = queue.request_transport(&auth).unwrap();
    let mut middle = queue.request_transport(&auth).unwrap();
    let mut inner = queue.request_transport(&auth).unwrap();

    let a = outer.transport().await.unwrap();
    let b = middle.transport().await.unwrap();
    let c = inner.transport().await.unwrap();
    assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
    assert!(a.is_open() && b.is_open() && c.is_open());

    inner.release().await;
    middle.release().await;
    assert!(a.is_open());
    outer.release().await;

    assert!(!a.is_open());
    assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    assert!(queue.active_keys().is_empty());
}

#[tokio::test]
async fn test_concurrent_processes_share_transport() {
    let ctx = TestContext::memory();

    let first = ctx.runner.submit::<TransportUser>(Inputs::new()).await.unwrap();
    let second = ctx.runner.submit::<TransportUser>(Inputs::new()).await.unwrap();

    let (a, _) = first.wait().await.unwrap();
    let (b, _) = second.wait().await.unwrap();
    let a = a.get("transport").and_then(Node::as_int).unwrap();
    let b = b.get("transport").and_then(Node::as_int).unwrap();
    assert_eq!(a, b);
    assert!(ctx.runner.transport_queue().active_keys().is_empty());
}

#[tokio::test]
async fn test_closed_runner_rejects_transport() {
    let ctx = TestContext::memory();
    ctx.runner.close().await;
    assert!(ctx.runner.transport_queue().is_closed());

    let auth = LocalAuthInfo::new("localhost");
    let err = ctx.runner.transport_queue().request_transport(&auth).unwrap_err();
    assert_eq!(err, TransportError::QueueClosed);
}

/// Queues on a transport that only opens after half a second.
#[derive(Default)]
struct QueuedUser;

#[async_trait::async_trait]
impl Process for QueuedUser {
    fn define(spec: &mut ProcessSpec) {
        spec.output(PortSpec::new("exit_code").valid_type("data.int"));
    }

    fn type_string() -> String {
        "tests.QueuedUser".to_string()
    }

    async fn step(&mut self, _step: &str, ctx: &mut ProcessContext) -> Result<Step, ProcessError> {
        let auth = LocalAuthInfo::new("slow-host").with_safe_open_interval(Duration::from_millis(500));
        let output = ctx
            .with_transport(&auth, |transport| async move { transport.exec("true").await })
            .await??;
        ctx.out("exit_code", Node::int(i64::from(output.exit_code))).await?;
        Ok(Step::done())
    }
}

#[tokio::test]
async fn test_pause_while_queued_on_transport() {
    let ctx = TestContext::memory();
    let controller = ctx.controller();
    let handle = ctx.runner.submit::<QueuedUser>(Inputs::new()).await.unwrap();
    let pid = handle.pid();
    ctx.wait_for_state(pid, ProcessState::Waiting).await;

    assert!(controller.pause_process(pid, Some("maintenance")).await.unwrap());
    assert!(ctx.record(pid).await.paused());

    // the grant arrives but the process stays put until played
    tokio::time::sleep(Duration::from_millis(800)).await;
    let report = controller.status(pid).await.unwrap().unwrap();
    assert!(report.paused);
    assert_eq!(report.state, ProcessState::Waiting);

    assert!(controller.play_process(pid).await.unwrap());
    let (outputs, record) = tokio::time::timeout(TEST_TIMEOUT, handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outputs.get("exit_code").and_then(Node::as_int), Some(0));
    assert!(record.is_finished_ok());
    assert!(ctx.runner.transport_queue().active_keys().is_empty());

    let report: Vec<String> = ctx
        .store
        .get_logs(pid)
        .await
        .unwrap()
        .into_iter()
        .filter(|log| log.level == REPORT_LEVEL)
        .map(|log| log.message)
        .collect();
    assert_eq!(report, vec!["Paused: maintenance", "Played"]);
}

#[tokio::test]
async fn test_kill_while_queued_on_transport() {
    let ctx = TestContext::memory();
    let handle = ctx.runner.submit::<QueuedUser>(Inputs::new()).await.unwrap();
    let pid = handle.pid();
    ctx.wait_for_state(pid, ProcessState::Waiting).await;

    assert!(ctx.controller().kill_process(pid, Some("cancelled")).await.unwrap());
    assert!(handle.wait().await.is_err());
    assert!(ctx.record(pid).await.is_killed());
}
