//! Connection configuration.
//!
//! Settings are read with the [`config`] crate from an optional TOML or YAML
//! file (section `database`) overlaid by `RUMDIARY_DATABASE__*` environment
//! variables. `DATABASE_URL`, when set, overrides the connection URI.
//!
//! ```toml
//! [database]
//! database_uri = "postgresql://localhost:5432/rumdiary"
//! user = "rumdiary"
//! connect_retries = 5
//! ```

use std::path::Path;
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::error::DbError;

/// Default maximum number of connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default connection timeout in milliseconds.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default idle timeout in milliseconds.
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;

/// Default number of retries for a transient connection failure.
const DEFAULT_CONNECT_RETRIES: usize = 3;

/// Default first backoff delay in milliseconds.
const DEFAULT_RETRY_MIN_DELAY_MS: u64 = 200;

/// Default backoff ceiling in milliseconds.
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;

/// Default connection URI.
const DEFAULT_DATABASE_URI: &str = "postgresql://localhost:5432/rumdiary";

/// Prefix for environment overrides (`RUMDIARY_DATABASE__USER`, ...).
const ENV_PREFIX: &str = "RUMDIARY";

/// Configuration for the shared database connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL.
    ///
    /// Format: `postgresql://host:port/database`
    pub database_uri: String,
    /// User name, overriding any user in the URI.
    pub user: Option<String>,
    /// Password, overriding any password in the URI.
    pub password: Option<String>,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Idle connection timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// How many times a transient connection failure is retried.
    pub connect_retries: usize,
    /// First backoff delay between connection attempts, in milliseconds.
    pub retry_min_delay_ms: u64,
    /// Upper bound for the backoff delay, in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Whether a failed connection may be attempted again on the next call.
    ///
    /// When `false` the first failure is kept until the connection is
    /// explicitly closed.
    pub reconnect_after_failure: bool,
    /// Whether bundled migrations run right after connecting.
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_uri: DEFAULT_DATABASE_URI.to_owned(),
            user: None,
            password: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            retry_min_delay_ms: DEFAULT_RETRY_MIN_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            reconnect_after_failure: true,
            run_migrations: true,
        }
    }
}

/// File layout: everything lives under `[database]`.
#[derive(Debug, Default, Deserialize)]
struct Settings {
    #[serde(default)]
    database: DatabaseConfig,
}

impl DatabaseConfig {
    /// Create a new configuration from a database URI.
    pub fn new(uri: &str) -> Self {
        Self {
            database_uri: uri.to_owned(),
            ..Self::default()
        }
    }

    /// Load configuration from an optional file plus the environment.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the file cannot be read or a value has
    /// the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, DbError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        let mut config = settings.database;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the string is not valid TOML or a value
    /// has the wrong type.
    pub fn parse(toml: &str) -> Result<Self, DbError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(settings.database)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_uri = url;
        }
    }

    /// Set the user name and password.
    #[must_use]
    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = Some(user.to_owned());
        self.password = Some(password.to_owned());
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set how many times a transient connection failure is retried.
    #[must_use]
    pub const fn with_connect_retries(mut self, retries: usize) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Set whether a failed connection may be attempted again.
    #[must_use]
    pub const fn with_reconnect_after_failure(mut self, reconnect: bool) -> Self {
        self.reconnect_after_failure = reconnect;
        self
    }

    /// Set whether migrations run after connecting.
    #[must_use]
    pub const fn with_run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Connection timeout as a [`Duration`].
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout as a [`Duration`].
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Backoff policy for transient connection failures.
    pub fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry_min_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .with_max_times(self.connect_retries)
            .with_jitter()
    }

    /// User name shown in connection logs.
    pub fn display_user(&self) -> &str {
        self.user.as_deref().unwrap_or("<default>")
    }
}
