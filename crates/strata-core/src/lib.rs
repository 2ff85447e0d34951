// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strata Core - checkpointed process engine
//!
//! This crate runs *processes*: units of computation whose inputs, outputs and
//! call relations are recorded as a provenance graph of nodes and links, and
//! whose progress is checkpointed so they survive a crash of the worker that
//! runs them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │          Controller          │  RPC   │            Runner            │
//! │  pause / play / kill /status │───────►│  drives processes, answers   │
//! │  launch / continue (tasks)   │        │  control RPCs per pid        │
//! └──────────────────────────────┘        └──────────────────────────────┘
//!                │ tasks                          │            │
//!                ▼                                ▼            ▼
//! ┌──────────────────────────────┐        ┌──────────────┐ ┌──────────────┐
//! │         DaemonRunner         │        │  NodeStore   │ │  Persister   │
//! │  task queue consumer, leases │        │ nodes, links │ │ checkpoints  │
//! │  recovery of orphans         │        │ logs, leases │ │              │
//! └──────────────────────────────┘        └──────────────┘ └──────────────┘
//! ```
//!
//! # Process lifecycle
//!
//! ```text
//! CREATED ──► RUNNING ◄──► WAITING
//!                │            │
//!                ▼            ▼
//!      FINISHED | KILLED | EXCEPTED   (terminal, record sealed)
//! ```
//!
//! PAUSED is an overlay on any non-terminal state: a paused process stops at
//! its next safe point until it is played.
//!
//! A process is a sequence of named steps. After every step the runner saves a
//! [`CheckpointBundle`]; a resumed process re-enters the recorded step with its
//! saved state. Terminal processes have their record sealed and their
//! checkpoint deleted.
//!
//! Within one OS process the bus is an [`InProcessBroker`]. Workers in
//! separate processes each connect a [`RemoteBroker`] to a shared
//! [`BrokerServer`] (`STRATA_BROKER_URL`).
//!
//! # Getting started
//!
//! ```ignore
//! use strata_core::{Config, Manager};
//!
//! let manager = Manager::new(Config::from_env()?);
//! manager.registry().register::<AddOne>();
//!
//! let runner = manager.get_runner().await?;
//! let outputs = runner.run::<AddOne>(inputs).await?;
//!
//! manager.reset().await;
//! ```
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.

#![deny(missing_docs)]

/// Checkpoint bundles: the serialized resume state of a process.
pub mod checkpoint;

/// Message bus: RPC, broadcasts and the task queue.
pub mod communicator;

/// Configuration loaded from environment variables.
pub mod config;

/// Remote control of processes and daemon task messages.
pub mod controller;

/// Daemon runner consuming the task queue.
pub mod daemon;

/// Error types for storage operations.
pub mod error;

/// Resolution of pk, UUID and label identifiers.
pub mod identifier;

/// Lazily created store, communicator and runners.
pub mod manager;

/// Embedded SQLite migrations.
pub mod migrations;

/// Provenance graph entities.
pub mod node;

/// Values passed between processes.
pub mod payload;

/// Node storage and checkpoint persistence backends.
pub mod persistence;

/// Process trait, specs, states and the step driver.
pub mod process;

/// Awaiting the termination of a process.
pub mod process_future;

/// Process execution context.
pub mod runner;

/// Shared connections to remote computers.
pub mod transport;

pub use checkpoint::CheckpointBundle;
pub use communicator::{BrokerServer, Communicator, CommunicatorError, InProcessBroker, RemoteBroker};
pub use config::{Config, ConfigError};
pub use controller::{ControlMessage, Controller, ProcessStatusReport};
pub use daemon::DaemonRunner;
pub use error::StoreError;
pub use identifier::{resolve_identifier, resolve_process};
pub use manager::Manager;
pub use node::{Node, NodeId, Pk};
pub use payload::{Inputs, Payload};
pub use persistence::{MemoryStore, NodeStore, Persister, SqliteStore};
pub use process::{
    Awaitable, ExitCode, Outputs, PortSpec, Process, ProcessContext, ProcessError, ProcessSpec,
    ProcessState, Step,
};
pub use process_future::ProcessFuture;
pub use runner::{ProcessHandle, Runner, RunnerConfig, RunnerError};
pub use transport::{TransportError, TransportQueue};
