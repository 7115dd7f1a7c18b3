//! Top-level entry point: one connection, every model wired to it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::DatabaseConfig;
use crate::connection::{ConnectionManager, Connector};
use crate::error::DbError;
use crate::logger::{Logger, TracingLogger};
use crate::postgres::PostgresConnector;
use crate::registry::Models;

/// The database adapter the application talks to.
#[derive(Debug)]
pub struct Datastore {
    connection: Arc<ConnectionManager>,
    models: Models,
}

impl Datastore {
    /// Wire every model to a `PostgreSQL` connection described by `config`.
    ///
    /// Nothing connects until the first model operation. Without a logger,
    /// model messages go to `tracing`.
    pub fn init(config: &DatabaseConfig, logger: Option<Arc<dyn Logger>>) -> Self {
        let connector = Arc::new(PostgresConnector::new(config.clone()));
        Self::with_connector(connector, config, logger)
    }

    /// Wire every model to a connection opened by `connector`.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        config: &DatabaseConfig,
        logger: Option<Arc<dyn Logger>>,
    ) -> Self {
        let logger = logger.unwrap_or_else(|| Arc::new(TracingLogger));
        let connection = Arc::new(ConnectionManager::from_config(
            connector,
            Arc::clone(&logger),
            config,
        ));
        let models = Models::define();
        models.init_all(&connection, &logger);

        tracing::info!(
            models = models.all().len(),
            uri = %connection.target().uri,
            "Datastore initialized"
        );

        Self { connection, models }
    }

    /// Every model.
    pub const fn models(&self) -> &Models {
        &self.models
    }

    /// The shared connection.
    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Remove every record of every model, clearing them concurrently.
    ///
    /// # Errors
    ///
    /// Returns the first failure.
    pub async fn clear(&self, cancel: &CancellationToken) -> Result<(), DbError> {
        let removed = self.models.clear_all(cancel).await?;
        tracing::info!(removed = removed.iter().sum::<u64>(), "Datastore cleared");
        Ok(())
    }

    /// Close the shared connection.
    pub async fn close(&self) {
        self.connection.close().await;
    }
}
