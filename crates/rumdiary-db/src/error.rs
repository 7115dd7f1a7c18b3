//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`]. Connection failures are
//! carried as a clonable [`ConnectionError`] because one failed attempt is
//! reported to every caller that was waiting on it.

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The caller passed a value the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A record does not satisfy its model's schema.
    #[error("validation failed for {model}: {message}")]
    Validation {
        /// Model the record belongs to.
        model: String,
        /// What is wrong with the record.
        message: String,
    },

    /// The database connection could not be established.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A cursor failed while records were being streamed.
    #[error("stream error: {0}")]
    Stream(String),

    /// A sink rejected a record during a pipe.
    #[error("sink error: {0}")]
    Sink(String),

    /// A model operation ran before `init` injected its dependencies.
    #[error("model `{0}` is not initialized")]
    NotInitialized(String),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for DbError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Failure to establish the shared database connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Error connecting to database: {message}")]
pub struct ConnectionError {
    /// Human-readable cause reported by the connector.
    pub message: String,
    /// Whether another attempt may succeed (network blips, timeouts).
    pub transient: bool,
}

impl ConnectionError {
    /// A failure that retrying will not fix (bad URL, bad credentials).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// A failure that may clear up on a later attempt.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

impl From<sqlx::Error> for ConnectionError {
    fn from(e: sqlx::Error) -> Self {
        let transient = matches!(
            e,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
        );
        Self {
            message: e.to_string(),
            transient,
        }
    }
}

impl From<sqlx::migrate::MigrateError> for ConnectionError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::permanent(format!("migration failed: {e}"))
    }
}
