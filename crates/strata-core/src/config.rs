// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::runner::RunnerConfig;

/// Strata configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL (`sqlite::memory:` or `sqlite:path/to.db`)
    pub database_url: String,
    /// Identity of this worker, used as lease owner
    pub worker_id: String,
    /// Timeout for control-plane RPC calls
    pub rpc_timeout: Duration,
    /// Poll interval for process futures, `None` disables polling
    pub poll_interval: Option<Duration>,
    /// How long a killed process waits for its children to confirm
    pub kill_children_timeout: Duration,
    /// Whether checkpoints are written at all
    pub persistence_enabled: bool,
    /// Maximum number of in-flight tasks per worker
    pub prefetch_count: usize,
    /// Lifetime of a process lease before another worker may take over
    pub lease_ttl: Duration,
    /// Broker server to connect to, `None` keeps the bus in-process
    pub broker_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STRATA_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STRATA_WORKER_ID`: lease owner identity (default: random UUID)
    /// - `STRATA_RPC_TIMEOUT_MS`: control RPC timeout (default: 10000)
    /// - `STRATA_POLL_INTERVAL_MS`: process future poll interval, 0 disables (default: 1000)
    /// - `STRATA_KILL_CHILDREN_TIMEOUT_MS`: child kill confirmation window (default: 5000)
    /// - `STRATA_PERSISTENCE_ENABLED`: write checkpoints (default: true)
    /// - `STRATA_PREFETCH_COUNT`: in-flight tasks per worker (default: 200)
    /// - `STRATA_LEASE_TTL_SECS`: process lease lifetime (default: 300)
    /// - `STRATA_BROKER_URL`: `tcp://host:port` of a broker server (default: in-process bus)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STRATA_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STRATA_DATABASE_URL"))?;

        let worker_id = std::env::var("STRATA_WORKER_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let rpc_timeout_ms: u64 = parse_var("STRATA_RPC_TIMEOUT_MS", "10000", "must be milliseconds")?;
        let poll_interval_ms: u64 =
            parse_var("STRATA_POLL_INTERVAL_MS", "1000", "must be milliseconds")?;
        let kill_children_timeout_ms: u64 = parse_var(
            "STRATA_KILL_CHILDREN_TIMEOUT_MS",
            "5000",
            "must be milliseconds",
        )?;
        let persistence_enabled: bool = parse_var(
            "STRATA_PERSISTENCE_ENABLED",
            "true",
            "must be true or false",
        )?;
        let prefetch_count: usize =
            parse_var("STRATA_PREFETCH_COUNT", "200", "must be a positive integer")?;
        if prefetch_count == 0 {
            return Err(ConfigError::Invalid(
                "STRATA_PREFETCH_COUNT",
                "must be a positive integer",
            ));
        }
        let lease_ttl_secs: u64 =
            parse_var("STRATA_LEASE_TTL_SECS", "300", "must be a number of seconds")?;

        let broker_url = std::env::var("STRATA_BROKER_URL")
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        if let Some(url) = &broker_url
            && url.contains("://")
            && !url.starts_with("tcp://")
        {
            return Err(ConfigError::Invalid(
                "STRATA_BROKER_URL",
                "must be tcp://host:port",
            ));
        }

        Ok(Self {
            database_url,
            worker_id,
            rpc_timeout: Duration::from_millis(rpc_timeout_ms),
            poll_interval: (poll_interval_ms > 0).then(|| Duration::from_millis(poll_interval_ms)),
            kill_children_timeout: Duration::from_millis(kill_children_timeout_ms),
            persistence_enabled,
            prefetch_count,
            lease_ttl: Duration::from_secs(lease_ttl_secs),
            broker_url,
        })
    }

    /// Runner settings derived from this configuration.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            persistence_enabled: self.persistence_enabled,
            rpc_timeout: self.rpc_timeout,
            poll_interval: self.poll_interval,
            kill_children_timeout: self.kill_children_timeout,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(key, message))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: [&str; 8] = [
        "STRATA_WORKER_ID",
        "STRATA_RPC_TIMEOUT_MS",
        "STRATA_POLL_INTERVAL_MS",
        "STRATA_KILL_CHILDREN_TIMEOUT_MS",
        "STRATA_PERSISTENCE_ENABLED",
        "STRATA_PREFETCH_COUNT",
        "STRATA_LEASE_TTL_SECS",
        "STRATA_BROKER_URL",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL_VARS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("STRATA_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(uuid::Uuid::parse_str(&config.worker_id).is_ok());
        assert_eq!(config.rpc_timeout, Duration::from_secs(10));
        assert_eq!(config.poll_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.kill_children_timeout, Duration::from_secs(5));
        assert!(config.persistence_enabled);
        assert_eq!(config.prefetch_count, 200);
        assert_eq!(config.lease_ttl, Duration::from_secs(300));
        assert_eq!(config.broker_url, None);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("STRATA_DATABASE_URL", "sqlite:/var/lib/strata/strata.db");
        guard.set("STRATA_WORKER_ID", "worker-7");
        guard.set("STRATA_RPC_TIMEOUT_MS", "2500");
        guard.set("STRATA_POLL_INTERVAL_MS", "250");
        guard.set("STRATA_KILL_CHILDREN_TIMEOUT_MS", "100");
        guard.set("STRATA_PERSISTENCE_ENABLED", "false");
        guard.set("STRATA_PREFETCH_COUNT", "8");
        guard.set("STRATA_LEASE_TTL_SECS", "60");
        guard.set("STRATA_BROKER_URL", "tcp://broker.internal:7400");

        let config = Config::from_env().unwrap();

        assert_eq!(config.worker_id, "worker-7");
        assert_eq!(config.rpc_timeout, Duration::from_millis(2500));
        assert_eq!(config.poll_interval, Some(Duration::from_millis(250)));
        assert_eq!(config.kill_children_timeout, Duration::from_millis(100));
        assert!(!config.persistence_enabled);
        assert_eq!(config.prefetch_count, 8);
        assert_eq!(config.lease_ttl, Duration::from_secs(60));
        assert_eq!(config.broker_url.as_deref(), Some("tcp://broker.internal:7400"));

        let runner = config.runner_config();
        assert!(!runner.persistence_enabled);
        assert_eq!(runner.poll_interval, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_config_zero_poll_interval_disables_polling() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("STRATA_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();
        guard.set("STRATA_POLL_INTERVAL_MS", "0");

        let config = Config::from_env().unwrap();
        assert_eq!(config.poll_interval, None);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("STRATA_DATABASE_URL");

        let result = Config::from_env();
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Missing("STRATA_DATABASE_URL")));
        assert!(err.to_string().contains("STRATA_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let cases = [
            ("STRATA_RPC_TIMEOUT_MS", "soon"),
            ("STRATA_POLL_INTERVAL_MS", "-1"),
            ("STRATA_PERSISTENCE_ENABLED", "maybe"),
            ("STRATA_PREFETCH_COUNT", "0"),
            ("STRATA_LEASE_TTL_SECS", "forever"),
            ("STRATA_BROKER_URL", "amqp://guest@localhost"),
        ];

        for (key, value) in cases {
            let mut guard = EnvGuard::new();
            guard.set("STRATA_DATABASE_URL", "sqlite::memory:");
            guard.clear_optional();
            guard.set(key, value);

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(k, _) if k == key),
                "{key}={value} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_blank_worker_id_falls_back_to_uuid() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("STRATA_DATABASE_URL", "sqlite::memory:");
        guard.clear_optional();
        guard.set("STRATA_WORKER_ID", "  ");

        let config = Config::from_env().unwrap();
        assert!(uuid::Uuid::parse_str(&config.worker_id).is_ok());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Missing("TEST_VAR");
        assert_eq!(
            err.to_string(),
            "missing required environment variable: TEST_VAR"
        );

        let err = ConfigError::Invalid("TEST_VAR", "must be a number");
        assert_eq!(err.to_string(), "invalid value for TEST_VAR: must be a number");
    }
}
