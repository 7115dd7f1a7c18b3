//! Lazy, memoised connection to the shared database.
//!
//! Every model operation calls [`ConnectionManager::connect`] before touching
//! its collection. The first call starts an attempt; callers arriving while
//! it is in flight join the same attempt; once it resolves, later callers
//! reuse the handle.
//!
//! ```text
//! Unconnected --connect--> Connecting --ok--> Connected --close--> Unconnected
//!                              |
//!                              +--err--> Failed --connect (reconnect on)--> Connecting
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use crate::config::DatabaseConfig;
use crate::error::{ConnectionError, DbError};
use crate::logger::Logger;
use crate::store::Database;

/// Where a connector points, for connection logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// Connection URI with any password removed.
    pub uri: String,
    /// User the connection authenticates as.
    pub user: String,
}

/// Opens database handles.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one handle. Called once per attempt (plus retries).
    async fn establish(&self) -> Result<Arc<dyn Database>, ConnectionError>;

    /// Where this connector points.
    fn describe(&self) -> ConnectionTarget;
}

/// Observable state of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No attempt made yet, or closed.
    Unconnected,
    /// An attempt is in flight.
    Connecting,
    /// A handle is available.
    Connected,
    /// The last attempt failed.
    Failed(ConnectionError),
}

type PendingConnection = Shared<BoxFuture<'static, Result<Arc<dyn Database>, ConnectionError>>>;

enum Slot {
    Unconnected,
    Connecting(PendingConnection),
    Connected(Arc<dyn Database>),
    Failed(ConnectionError),
}

/// Owner of the one shared database handle.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    logger: Arc<dyn Logger>,
    retry_policy: ExponentialBuilder,
    reconnect_after_failure: bool,
    slot: Mutex<Slot>,
}

impl ConnectionManager {
    /// Manager with the default retry and failure policy.
    pub fn new(connector: Arc<dyn Connector>, logger: Arc<dyn Logger>) -> Self {
        Self::from_config(connector, logger, &DatabaseConfig::default())
    }

    /// Manager whose retry and failure policy come from `config`.
    pub fn from_config(
        connector: Arc<dyn Connector>,
        logger: Arc<dyn Logger>,
        config: &DatabaseConfig,
    ) -> Self {
        Self {
            connector,
            logger,
            retry_policy: config.retry_policy(),
            reconnect_after_failure: config.reconnect_after_failure,
            slot: Mutex::new(Slot::Unconnected),
        }
    }

    /// Replace the backoff used for transient failures.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: ExponentialBuilder) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set whether a failed connection may be attempted again.
    #[must_use]
    pub const fn with_reconnect_after_failure(mut self, reconnect: bool) -> Self {
        self.reconnect_after_failure = reconnect;
        self
    }

    /// Resolve to the shared database handle, connecting if needed.
    ///
    /// Concurrent callers share one attempt and observe the same outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the attempt failed, or
    /// [`DbError::Cancelled`] if `cancel` fired first. Cancelling one caller
    /// does not abort the attempt for the others.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<Arc<dyn Database>, DbError> {
        let pending = {
            let mut slot = self.lock();
            match &*slot {
                Slot::Connected(database) => return Ok(Arc::clone(database)),
                Slot::Failed(error) if !self.reconnect_after_failure => {
                    return Err(error.clone().into());
                }
                Slot::Connecting(pending) => pending.clone(),
                Slot::Unconnected | Slot::Failed(_) => {
                    let pending = self.attempt();
                    *slot = Slot::Connecting(pending.clone());
                    pending
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DbError::Cancelled),
            outcome = pending.clone() => outcome,
        };
        self.settle(&pending, &outcome);
        outcome.map_err(DbError::from)
    }

    /// Where the connector points.
    pub fn target(&self) -> ConnectionTarget {
        self.connector.describe()
    }

    /// Whether a handle is available.
    pub fn is_open(&self) -> bool {
        matches!(&*self.lock(), Slot::Connected(_))
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        match &*self.lock() {
            Slot::Unconnected => ConnectionState::Unconnected,
            Slot::Connecting(_) => ConnectionState::Connecting,
            Slot::Connected(_) => ConnectionState::Connected,
            Slot::Failed(error) => ConnectionState::Failed(error.clone()),
        }
    }

    /// Drop the handle (closing it) and any remembered failure.
    ///
    /// An attempt still in flight completes for the callers already waiting
    /// on it but is not remembered.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Slot::Unconnected);
        if let Slot::Connected(database) = previous {
            database.close().await;
            tracing::info!(backend = database.backend(), "Database connection closed");
        }
    }

    fn attempt(&self) -> PendingConnection {
        let connector = Arc::clone(&self.connector);
        let logger = Arc::clone(&self.logger);
        let policy = self.retry_policy;

        async move {
            let target = connector.describe();
            logger.info(&format!(
                "connecting to database: `{}` as user `{}`",
                target.uri, target.user
            ));

            let outcome = (|| async { connector.establish().await })
                .retry(policy)
                .when(|e: &ConnectionError| e.transient)
                .notify(|e: &ConnectionError, delay| {
                    tracing::warn!(error = %e, ?delay, "Retrying database connection");
                })
                .await;

            match &outcome {
                Ok(database) => {
                    logger.info("Connected to database");
                    tracing::info!(backend = database.backend(), "Database connection established");
                }
                Err(error) => logger.error(&error.to_string()),
            }
            outcome
        }
        .boxed()
        .shared()
    }

    fn settle(
        &self,
        pending: &PendingConnection,
        outcome: &Result<Arc<dyn Database>, ConnectionError>,
    ) {
        let mut slot = self.lock();
        let current = matches!(&*slot, Slot::Connecting(p) if p.ptr_eq(pending));
        if current {
            *slot = match outcome {
                Ok(database) => Slot::Connected(Arc::clone(database)),
                Err(error) => Slot::Failed(error.clone()),
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.target())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::logger::{LogLevel, RecordingLogger};
    use crate::memory::MemoryConnector;

    fn fast_retry(times: usize) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
            .with_max_times(times)
    }

    #[tokio::test]
    async fn connect_memoises_the_handle() {
        let connector = Arc::new(MemoryConnector::new());
        let manager = ConnectionManager::new(connector.clone(), Arc::new(RecordingLogger::new()));
        let cancel = CancellationToken::new();

        assert_eq!(manager.state(), ConnectionState::Unconnected);
        assert!(manager.connect(&cancel).await.is_ok());
        assert!(manager.connect(&cancel).await.is_ok());
        assert!(manager.is_open());
        assert_eq!(connector.establish_count(), 1);
    }

    #[tokio::test]
    async fn connect_logs_target_and_success() {
        let logger = Arc::new(RecordingLogger::new());
        let manager = ConnectionManager::new(Arc::new(MemoryConnector::new()), logger.clone());
        assert!(manager.connect(&CancellationToken::new()).await.is_ok());
        assert_eq!(logger.count(LogLevel::Info, "connecting to database: `memory://"), 1);
        assert_eq!(logger.count(LogLevel::Info, "Connected to database"), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let connector = Arc::new(MemoryConnector::new().with_failures(vec![
            ConnectionError::transient("reset"),
            ConnectionError::transient("reset"),
        ]));
        let manager = ConnectionManager::new(connector.clone(), Arc::new(RecordingLogger::new()))
            .with_retry_policy(fast_retry(3));

        assert!(manager.connect(&CancellationToken::new()).await.is_ok());
        assert_eq!(connector.establish_count(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried_and_is_logged() {
        let connector = Arc::new(
            MemoryConnector::new().with_failures(vec![ConnectionError::permanent("bad password")]),
        );
        let logger = Arc::new(RecordingLogger::new());
        let manager = ConnectionManager::new(connector.clone(), logger.clone())
            .with_retry_policy(fast_retry(3));

        let result = manager.connect(&CancellationToken::new()).await;
        assert!(matches!(result, Err(DbError::Connection(ref e)) if e.message == "bad password"));
        assert_eq!(connector.establish_count(), 1);
        assert_eq!(
            manager.state(),
            ConnectionState::Failed(ConnectionError::permanent("bad password"))
        );
        assert_eq!(
            logger.count(LogLevel::Error, "Error connecting to database: bad password"),
            1
        );
    }

    #[tokio::test]
    async fn sticky_failure_without_reconnect() {
        let connector = Arc::new(
            MemoryConnector::new().with_failures(vec![ConnectionError::permanent("down")]),
        );
        let manager = ConnectionManager::new(connector.clone(), Arc::new(RecordingLogger::new()))
            .with_reconnect_after_failure(false);
        let cancel = CancellationToken::new();

        assert!(manager.connect(&cancel).await.is_err());
        assert!(manager.connect(&cancel).await.is_err());
        assert_eq!(connector.establish_count(), 1);

        manager.close().await;
        assert!(manager.connect(&cancel).await.is_ok());
        assert_eq!(connector.establish_count(), 2);
    }

    #[tokio::test]
    async fn reconnects_after_failure_by_default() {
        let connector = Arc::new(
            MemoryConnector::new().with_failures(vec![ConnectionError::permanent("down")]),
        );
        let manager = ConnectionManager::new(connector.clone(), Arc::new(RecordingLogger::new()));
        let cancel = CancellationToken::new();

        assert!(manager.connect(&cancel).await.is_err());
        assert!(manager.connect(&cancel).await.is_ok());
        assert_eq!(connector.establish_count(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn close_returns_to_unconnected() {
        let connector = Arc::new(MemoryConnector::new());
        let manager = ConnectionManager::new(connector.clone(), Arc::new(RecordingLogger::new()));
        let cancel = CancellationToken::new();

        assert!(manager.connect(&cancel).await.is_ok());
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Unconnected);
        assert!(!manager.is_open());
        assert!(manager.connect(&cancel).await.is_ok());
        assert_eq!(connector.establish_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_abort_the_attempt() {
        let connector = Arc::new(MemoryConnector::new().with_latency(Duration::from_millis(50)));
        let manager = ConnectionManager::new(connector.clone(), Arc::new(RecordingLogger::new()));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            manager.connect(&cancelled).await,
            Err(DbError::Cancelled)
        ));
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert!(manager.connect(&CancellationToken::new()).await.is_ok());
        assert_eq!(connector.establish_count(), 1);
    }
}
