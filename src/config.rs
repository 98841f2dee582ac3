//! Pool configuration surface (spec §6), built explicitly instead of parsed
//! from properties/JNDI — that parsing is an external collaborator this
//! crate does not implement (spec §1).

use std::time::Duration;

use crate::error::{Error, PoolError};

/// Symbolic transaction isolation levels (spec §6 `defaultTransactionIsolation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    None,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Special sentinel for `test_connection_query`: use the driver's native
/// liveness probe (`Connection::is_valid`) instead of a SQL query.
pub const IS_VALID: &str = "isValid";

const CRITICAL_SQL_STATES_DEFAULT: &[&str] = &[
    "08001", "08006", "08007", "08S01", "57P01", "57P02", "57P03", "JZ0C0", "JZ0C1",
];

/// Full configuration for a [`crate::DataSource`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,

    // Pool sizing
    pub pool_initial_size: u32,
    pub pool_max_size: u32,
    pub pool_fair: bool,
    pub pool_fifo: bool,
    pub pool_enable_connection_tracking: bool,

    // Timeouts
    pub connection_timeout_ms: u64,
    pub login_timeout_secs: u64,
    pub acquire_retry_delay_ms: u64,
    pub acquire_retry_attempts: u32,
    pub validate_timeout_secs: u64,
    pub connection_idle_limit_secs: i64,

    // Validation
    pub test_connection_query: Option<String>,
    pub init_sql: Option<String>,
    pub use_network_timeout: bool,

    // Reducer
    pub reducer_time_interval_secs: u64,
    pub reducer_samples: u32,

    // Statement cache
    pub statement_cache_max_size: usize,

    // Failure classification
    pub critical_sql_states: Vec<String>,

    // Defaults applied on create / restore
    pub default_auto_commit: Option<bool>,
    pub default_read_only: Option<bool>,
    pub default_transaction_isolation: Option<IsolationLevel>,
    pub default_catalog: Option<String>,
    pub reset_defaults_after_use: bool,
    pub clear_sql_warnings: bool,

    // Logging thresholds
    pub log_connection_longer_than_ms: Option<u64>,
    pub log_query_execution_longer_than_ms: Option<u64>,
    pub log_large_result_set: Option<u64>,
    pub include_query_parameters: bool,
    pub log_taken_connections_on_timeout: bool,
    pub log_all_stack_traces_on_timeout: bool,

    // Misc
    pub allow_connection_after_termination: bool,
    pub allow_unwrapping: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "vibur-pool".into(),
            pool_initial_size: 5,
            pool_max_size: 10,
            pool_fair: false,
            pool_fifo: false,
            pool_enable_connection_tracking: false,
            connection_timeout_ms: 15_000,
            login_timeout_secs: 15,
            acquire_retry_delay_ms: 500,
            acquire_retry_attempts: 3,
            validate_timeout_secs: 5,
            connection_idle_limit_secs: 5,
            test_connection_query: None,
            init_sql: None,
            use_network_timeout: false,
            reducer_time_interval_secs: 60,
            reducer_samples: 15,
            statement_cache_max_size: 0,
            critical_sql_states: CRITICAL_SQL_STATES_DEFAULT
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_auto_commit: None,
            default_read_only: None,
            default_transaction_isolation: None,
            default_catalog: None,
            reset_defaults_after_use: false,
            clear_sql_warnings: true,
            log_connection_longer_than_ms: None,
            log_query_execution_longer_than_ms: None,
            log_large_result_set: None,
            include_query_parameters: false,
            log_taken_connections_on_timeout: false,
            log_all_stack_traces_on_timeout: false,
            allow_connection_after_termination: false,
            allow_unwrapping: false,
        }
    }
}

impl PoolConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// `start()`-time validation (spec §4.9): thresholds must be consistent
    /// and the cache cap must respect the hard limit from spec §4.3/§6.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool_initial_size > self.pool_max_size || self.pool_max_size == 0 {
            return Err(PoolError::ConnectionInit(format!(
                "poolInitialSize ({}) must be <= poolMaxSize ({}), and poolMaxSize must be > 0",
                self.pool_initial_size, self.pool_max_size
            ))
            .into());
        }

        if let Some(log_conn) = self.log_connection_longer_than_ms {
            if log_conn > self.connection_timeout_ms {
                return Err(PoolError::ConnectionInit(format!(
                    "logConnectionLongerThanMs ({log_conn}) must be <= connectionTimeoutInMs ({})",
                    self.connection_timeout_ms
                ))
                .into());
            }
        }

        if self.statement_cache_max_size > 2000 {
            return Err(PoolError::ConnectionInit(format!(
                "statementCacheMaxSize ({}) exceeds the hard cap of 2000",
                self.statement_cache_max_size
            ))
            .into());
        }

        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn acquire_retry_delay(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_delay_ms)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_secs)
    }

    /// Total bound for `get_connection`, per spec §5.
    pub fn max_wait(&self) -> Duration {
        let retries = self.acquire_retry_attempts as u64 + 1;
        Duration::from_millis(
            self.connection_timeout_ms
                + retries * self.login_timeout_secs * 1000
                + self.acquire_retry_attempts as u64 * self.acquire_retry_delay_ms,
        )
    }
}

/// Builder for [`PoolConfig`]. Unknown keys have no representation here by
/// construction (spec §9: explicit builder replaces reflection-based
/// properties loading, so there is nothing to "reject").
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: PoolConfig,
}

macro_rules! setter {
    ($name:ident, $field:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$field = value;
            self
        }
    };
}

impl ConfigBuilder {
    setter!(name, name, String);
    setter!(pool_initial_size, pool_initial_size, u32);
    setter!(pool_max_size, pool_max_size, u32);
    setter!(pool_fair, pool_fair, bool);
    setter!(pool_fifo, pool_fifo, bool);
    setter!(
        pool_enable_connection_tracking,
        pool_enable_connection_tracking,
        bool
    );
    setter!(connection_timeout_ms, connection_timeout_ms, u64);
    setter!(login_timeout_secs, login_timeout_secs, u64);
    setter!(acquire_retry_delay_ms, acquire_retry_delay_ms, u64);
    setter!(acquire_retry_attempts, acquire_retry_attempts, u32);
    setter!(validate_timeout_secs, validate_timeout_secs, u64);
    setter!(connection_idle_limit_secs, connection_idle_limit_secs, i64);
    setter!(init_sql, init_sql, Option<String>);
    setter!(use_network_timeout, use_network_timeout, bool);
    setter!(reducer_time_interval_secs, reducer_time_interval_secs, u64);
    setter!(reducer_samples, reducer_samples, u32);
    setter!(statement_cache_max_size, statement_cache_max_size, usize);
    setter!(critical_sql_states, critical_sql_states, Vec<String>);
    setter!(reset_defaults_after_use, reset_defaults_after_use, bool);
    setter!(clear_sql_warnings, clear_sql_warnings, bool);
    setter!(include_query_parameters, include_query_parameters, bool);
    setter!(
        log_taken_connections_on_timeout,
        log_taken_connections_on_timeout,
        bool
    );
    setter!(
        log_all_stack_traces_on_timeout,
        log_all_stack_traces_on_timeout,
        bool
    );
    setter!(
        allow_connection_after_termination,
        allow_connection_after_termination,
        bool
    );
    setter!(allow_unwrapping, allow_unwrapping, bool);

    pub fn test_connection_query(mut self, query: impl Into<String>) -> Self {
        self.config.test_connection_query = Some(query.into());
        self
    }

    pub fn log_connection_longer_than_ms(mut self, ms: u64) -> Self {
        self.config.log_connection_longer_than_ms = Some(ms);
        self
    }

    pub fn log_query_execution_longer_than_ms(mut self, ms: u64) -> Self {
        self.config.log_query_execution_longer_than_ms = Some(ms);
        self
    }

    pub fn default_auto_commit(mut self, value: bool) -> Self {
        self.config.default_auto_commit = Some(value);
        self
    }

    pub fn default_read_only(mut self, value: bool) -> Self {
        self.config.default_read_only = Some(value);
        self
    }

    pub fn default_transaction_isolation(mut self, level: IsolationLevel) -> Self {
        self.config.default_transaction_isolation = Some(level);
        self
    }

    pub fn default_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.config.default_catalog = Some(catalog.into());
        self
    }

    pub fn build(self) -> Result<PoolConfig, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
