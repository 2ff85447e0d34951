// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Explicit owner of the shared collaborators.
//!
//! A [`Manager`] is built from a [`Config`] and creates the store, the
//! communicator, the default runner and the daemon runner on first use.
//! The communicator talks to the broker server named by
//! [`Config::broker_url`] when one is set.
//! Every getter hands out the same instance until [`Manager::reset`] tears
//! them down.
//!
//! ```ignore
//! let manager = Manager::new(Config::from_env()?);
//! manager.registry().register::<AddOne>();
//! let runner = manager.get_runner().await?;
//! let outputs = runner.run::<AddOne>(inputs).await?;
//! manager.reset().await;
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::communicator::{Broker, Communicator, InProcessBroker, RemoteBroker};
use crate::config::Config;
use crate::daemon::DaemonRunner;
use crate::persistence::SqliteStore;
use crate::process::ProcessRegistry;
use crate::runner::{Runner, RunnerError};

/// Lazily created collaborators sharing one configuration.
pub struct Manager {
    config: Config,
    registry: Arc<ProcessRegistry>,
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    store: Option<Arc<SqliteStore>>,
    communicator: Option<Communicator>,
    runner: Option<Runner>,
    daemon: Option<Arc<DaemonRunner>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("database_url", &self.config.database_url)
            .field("worker_id", &self.config.worker_id)
            .finish()
    }
}

impl Manager {
    /// Manager with an empty process registry.
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, Arc::new(ProcessRegistry::new()))
    }

    /// Manager whose runners resolve process types through `registry`.
    pub fn with_registry(config: Config, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            config,
            registry,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registry shared by every runner of this manager. Survives [`reset`](Self::reset).
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// The store, connecting and migrating on first use.
    pub async fn get_store(&self) -> Result<Arc<SqliteStore>, RunnerError> {
        let mut state = self.state.lock().await;
        self.store_locked(&mut state).await
    }

    /// The communicator, connecting on first use.
    pub async fn get_communicator(&self) -> Result<Communicator, RunnerError> {
        let mut state = self.state.lock().await;
        self.communicator_locked(&mut state).await
    }

    /// The default runner, created on first use.
    pub async fn get_runner(&self) -> Result<Runner, RunnerError> {
        let mut state = self.state.lock().await;
        if let Some(runner) = &state.runner
            && !runner.is_closed()
        {
            return Ok(runner.clone());
        }
        let runner = self.build_runner(&mut state).await?;
        state.runner = Some(runner.clone());
        Ok(runner)
    }

    /// A new runner sharing the store and communicator but with its own
    /// transport queue. The caller owns it and must close it.
    pub async fn create_runner(&self) -> Result<Runner, RunnerError> {
        let mut state = self.state.lock().await;
        self.build_runner(&mut state).await
    }

    /// The daemon runner, created and started on first use.
    pub async fn get_daemon_runner(&self) -> Result<Arc<DaemonRunner>, RunnerError> {
        let mut state = self.state.lock().await;
        if let Some(daemon) = &state.daemon {
            return Ok(Arc::clone(daemon));
        }
        let runner = self.build_runner(&mut state).await?;
        let daemon = Arc::new(DaemonRunner::new(
            runner,
            self.config.worker_id.clone(),
            self.config.lease_ttl,
        )?);
        daemon.start()?;
        state.daemon = Some(Arc::clone(&daemon));
        Ok(daemon)
    }

    /// Stop the daemon, close the runner and the communicator, and forget
    /// the store. The next getter call starts from scratch.
    pub async fn reset(&self) {
        let state = std::mem::take(&mut *self.state.lock().await);
        if let Some(daemon) = state.daemon {
            daemon.stop().await;
        }
        if let Some(runner) = state.runner {
            runner.close().await;
        }
        if let Some(communicator) = state.communicator {
            communicator.close().await;
        }
        if let Some(store) = state.store {
            store.pool().close().await;
        }
        info!("Manager reset");
    }

    async fn store_locked(&self, state: &mut ManagerState) -> Result<Arc<SqliteStore>, RunnerError> {
        if let Some(store) = &state.store {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(SqliteStore::connect(&self.config.database_url).await?);
        debug!(database_url = %self.config.database_url, "Store connected");
        state.store = Some(Arc::clone(&store));
        Ok(store)
    }

    async fn communicator_locked(&self, state: &mut ManagerState) -> Result<Communicator, RunnerError> {
        if let Some(communicator) = &state.communicator
            && communicator.is_connected()
        {
            return Ok(communicator.clone());
        }
        let store = self.store_locked(state).await?;
        let broker: Arc<dyn Broker> = match &self.config.broker_url {
            Some(url) => RemoteBroker::connect(url).await?,
            None => InProcessBroker::with_prefetch_count(self.config.prefetch_count),
        };
        let communicator = Communicator::new(broker, store);
        debug!(
            broker_url = self.config.broker_url.as_deref().unwrap_or("in-process"),
            "Communicator connected"
        );
        state.communicator = Some(communicator.clone());
        Ok(communicator)
    }

    async fn build_runner(&self, state: &mut ManagerState) -> Result<Runner, RunnerError> {
        let store = self.store_locked(state).await?;
        let communicator = self.communicator_locked(state).await?;
        Runner::builder()
            .store(store.clone())
            .persister(store)
            .communicator(communicator)
            .registry(Arc::clone(&self.registry))
            .config(self.config.runner_config())
            .build()
    }
}
