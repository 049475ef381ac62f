//! Runtime configuration: defaults shared by the Parallel Executor, Error
//! Recovery, and State Manager, plus backend/connection selection.
//!
//! Mirrors the teacher crate's `runtimes::runtime_config` shape: a plain
//! struct with `Default`, overridable field-by-field, with connection
//! strings resolved through `dotenvy` + environment variables the way the
//! teacher resolves `SQLITE_DB_NAME`.

use std::env;
use std::time::Duration;

use crate::error_recovery::RetryPolicy;

/// Selects which durable backend [`crate::state_manager::StateStore`] talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBackend {
    /// Ephemeral, process-local store. Useful for tests and calibration runs.
    InMemory,
    /// SQLite file or `:memory:` database, gated behind the `sqlite` feature.
    Sqlite { connection_string: String },
    /// Postgres connection, gated behind the `postgres` feature.
    Postgres { connection_string: String },
}

impl Default for StateBackend {
    fn default() -> Self {
        StateBackend::InMemory
    }
}

/// Concurrency, retry, and circuit-breaker defaults plus durable backend
/// selection. Constructed once at process start and shared (`Arc`) across
/// every [`crate::engine::Engine`] instance in the host process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default `maxConcurrency` (N) for the Parallel Executor. §4.3 default: 3.
    pub max_concurrency: usize,
    /// Default retry policy merged with any step-supplied override. §4.4.
    pub default_retry_policy: RetryPolicy,
    /// Circuit breaker failure threshold before tripping to `open`.
    pub circuit_breaker_max_failures: u32,
    /// How long an `open` circuit breaker waits before probing half-open.
    pub circuit_breaker_reset_timeout: Duration,
    /// Gate for `State Manager::checkpoint` (§4.2): when false, checkpoint
    /// calls are no-ops. Useful for calibration runs that shouldn't pay the
    /// durable-write cost.
    pub progress_tracking_enabled: bool,
    /// Durable backend selection.
    pub state_backend: StateBackend,
    /// Inter-batch delay for `execute_batched` (§9 design note: "preserved
    /// here but value should be configurable").
    pub batch_delay: Duration,
    /// Retention window for `cleanup_old_executions` (§6). Default 90 days.
    pub retention_days: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            default_retry_policy: RetryPolicy::default(),
            circuit_breaker_max_failures: 5,
            circuit_breaker_reset_timeout: Duration::from_secs(30),
            progress_tracking_enabled: true,
            state_backend: StateBackend::InMemory,
            batch_delay: Duration::from_millis(100),
            retention_days: 90,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from process environment (via `dotenvy`), falling
    /// back to [`RuntimeConfig::default`] for anything unset.
    ///
    /// Recognized variables: `ORCHESTRA_MAX_CONCURRENCY`,
    /// `ORCHESTRA_PROGRESS_TRACKING_ENABLED`, `ORCHESTRA_STATE_BACKEND`
    /// (`memory` | `sqlite` | `postgres`), `ORCHESTRA_DATABASE_URL`.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(raw) = env::var("ORCHESTRA_MAX_CONCURRENCY") {
            if let Ok(parsed) = raw.parse() {
                config.max_concurrency = parsed;
            }
        }
        if let Ok(raw) = env::var("ORCHESTRA_PROGRESS_TRACKING_ENABLED") {
            config.progress_tracking_enabled = raw != "0" && raw.to_lowercase() != "false";
        }

        let backend = env::var("ORCHESTRA_STATE_BACKEND").unwrap_or_default();
        let connection_string = env::var("ORCHESTRA_DATABASE_URL").unwrap_or_default();
        config.state_backend = match backend.as_str() {
            "sqlite" => StateBackend::Sqlite { connection_string },
            "postgres" => StateBackend::Postgres { connection_string },
            _ => StateBackend::InMemory,
        };

        config
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    #[must_use]
    pub fn with_state_backend(mut self, backend: StateBackend) -> Self {
        self.state_backend = backend;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.circuit_breaker_max_failures, 5);
        assert_eq!(config.retention_days, 90);
        assert_eq!(config.state_backend, StateBackend::InMemory);
    }

    #[test]
    fn builder_clamps_concurrency_to_at_least_one() {
        let config = RuntimeConfig::default().with_max_concurrency(0);
        assert_eq!(config.max_concurrency, 1);
    }
}
