//! `PostgreSQL` record store.
//!
//! Every collection shares one `records` table keyed by `(collection, id)`.
//! Domain fields live in a `JSONB` column. Equality filters go through the
//! `record_fields_match` SQL function, which gives the same answers as
//! [`Filter::matches`] (a stored array matches an element it holds), and
//! `start` / `end` become a range over the time-ordered `UUID` primary key.
//!
//! Uses [`sqlx`] with runtime query construction (not compile-time checked)
//! to avoid requiring a live database at build time. All queries are
//! parameterized.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rumdiary_types::{Document, Record, RecordId};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::connection::{ConnectionTarget, Connector};
use crate::error::{ConnectionError, DbError};
use crate::query::{Filter, Projection};
use crate::store::{
    Database, FindOneAndUpdateOptions, RecordStore, RecordStream, ReturnDocument, upsert_record,
};

/// Records buffered between the query task and a slow reader.
const STREAM_BUFFER: usize = 64;

const SELECT_SQL: &str = r"SELECT id, created_at, updated_at, doc FROM records
    WHERE collection = $1 AND record_fields_match(doc, $2)
      AND ($3::UUID IS NULL OR id = $3)
      AND ($4::UUID IS NULL OR id >= $4)
      AND ($5::UUID IS NULL OR id <= $5)
    ORDER BY id";

const SELECT_FIRST_SQL: &str = r"SELECT id, created_at, updated_at, doc FROM records
    WHERE collection = $1 AND record_fields_match(doc, $2)
      AND ($3::UUID IS NULL OR id = $3)
      AND ($4::UUID IS NULL OR id >= $4)
      AND ($5::UUID IS NULL OR id <= $5)
    ORDER BY id
    LIMIT 1";

const SELECT_FIRST_FOR_UPDATE_SQL: &str = r"SELECT id, created_at, updated_at, doc FROM records
    WHERE collection = $1 AND record_fields_match(doc, $2)
      AND ($3::UUID IS NULL OR id = $3)
      AND ($4::UUID IS NULL OR id >= $4)
      AND ($5::UUID IS NULL OR id <= $5)
    ORDER BY id
    LIMIT 1
    FOR UPDATE";

const DELETE_FIRST_SQL: &str = r"DELETE FROM records
    WHERE collection = $1 AND id = (
        SELECT id FROM records
        WHERE collection = $1 AND record_fields_match(doc, $2)
          AND ($3::UUID IS NULL OR id = $3)
          AND ($4::UUID IS NULL OR id >= $4)
          AND ($5::UUID IS NULL OR id <= $5)
        ORDER BY id
        LIMIT 1
        FOR UPDATE)
    RETURNING id, created_at, updated_at, doc";

const DELETE_SQL: &str = r"DELETE FROM records
    WHERE collection = $1 AND record_fields_match(doc, $2)
      AND ($3::UUID IS NULL OR id = $3)
      AND ($4::UUID IS NULL OR id >= $4)
      AND ($5::UUID IS NULL OR id <= $5)";

const UPSERT_SQL: &str = r"INSERT INTO records (collection, id, created_at, updated_at, doc)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (collection, id)
    DO UPDATE SET doc = EXCLUDED.doc, updated_at = EXCLUDED.updated_at
    RETURNING id, created_at, updated_at, doc";

const UPDATE_SQL: &str = r"UPDATE records SET doc = $3, updated_at = $4
    WHERE collection = $1 AND id = $2
    RETURNING id, created_at, updated_at, doc";

/// Connector that opens a [`PgPool`] from [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: DatabaseConfig,
}

impl PostgresConnector {
    /// Connector for `config`.
    pub const fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    fn connect_options(&self) -> Result<PgConnectOptions, ConnectionError> {
        let mut options: PgConnectOptions = self
            .config
            .database_uri
            .parse()
            .map_err(|e: sqlx::Error| ConnectionError::permanent(format!("invalid database URI: {e}")))?;
        if let Some(user) = &self.config.user {
            options = options.username(user);
        }
        if let Some(password) = &self.config.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn establish(&self) -> Result<Arc<dyn Database>, ConnectionError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.connect_timeout())
            .idle_timeout(self.config.idle_timeout())
            .connect_with(self.connect_options()?)
            .await?;

        tracing::info!(
            max_connections = self.config.max_connections,
            "Connected to PostgreSQL"
        );

        let database = PostgresDatabase::new(pool);
        if self.config.run_migrations {
            database
                .run_migrations()
                .await
                .map_err(|e| ConnectionError::permanent(e.to_string()))?;
        }
        Ok(Arc::new(database))
    }

    fn describe(&self) -> ConnectionTarget {
        let (uri, uri_user) = split_credentials(&self.config.database_uri);
        let user = self
            .config
            .user
            .clone()
            .or(uri_user)
            .unwrap_or_else(|| self.config.display_user().to_owned());
        ConnectionTarget { uri, user }
    }
}

/// Strip credentials from a connection URI, returning the user separately.
fn split_credentials(uri: &str) -> (String, Option<String>) {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return (uri.to_owned(), None);
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo
                .split(':')
                .next()
                .filter(|u| !u.is_empty())
                .map(str::to_owned);
            (format!("{scheme}://{host}"), user)
        }
        None => (uri.to_owned(), None),
    }
}

/// Connection pool handle to `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    /// Wrap an existing pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations from the `migrations/` directory.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if any migration fails.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Return a reference to the underlying [`PgPool`].
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn collection(&self, name: &str) -> Arc<dyn RecordStore> {
        Arc::new(PostgresCollection {
            pool: self.pool.clone(),
            name: name.to_owned(),
        })
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}

/// Row shape of the `records` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    doc: Json<Document>,
}

impl RecordRow {
    fn into_record(self) -> Record {
        let mut record = Record::with_id(RecordId::from(self.id), self.doc.0);
        record.created_at = Some(self.created_at);
        record.updated_at = Some(self.updated_at);
        record
    }
}

type RowQuery<'q> = sqlx::query::QueryAs<'q, Postgres, RecordRow, PgArguments>;

fn bind_filter<'q>(query: RowQuery<'q>, collection: &'q str, filter: &Filter) -> RowQuery<'q> {
    query
        .bind(collection)
        .bind(Json(filter.fields.clone()))
        .bind(filter.id.eq.map(RecordId::into_inner))
        .bind(filter.id.gte.map(RecordId::into_inner))
        .bind(filter.id.lte.map(RecordId::into_inner))
}

/// One collection: the rows of `records` with a given `collection` value.
#[derive(Debug, Clone)]
pub struct PostgresCollection {
    pool: PgPool,
    name: String,
}

#[async_trait]
impl RecordStore for PostgresCollection {
    async fn find(&self, filter: &Filter, projection: &Projection) -> Result<RecordStream, DbError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let pool = self.pool.clone();
        let name = self.name.clone();
        let filter = filter.clone();
        let projection = projection.clone();

        tokio::spawn(async move {
            let mut rows = bind_filter(sqlx::query_as::<_, RecordRow>(SELECT_SQL), &name, &filter)
                .fetch(&pool);
            let mut count: u64 = 0;
            while let Some(row) = rows.next().await {
                let item = row.map_err(|e| DbError::Stream(e.to_string())).map(|row| {
                    let mut record = row.into_record();
                    projection.apply(&mut record);
                    record
                });
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
                count = count.saturating_add(1);
            }
            tracing::debug!(collection = %name, count, "Streamed records");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, DbError> {
        let row = bind_filter(sqlx::query_as::<_, RecordRow>(SELECT_FIRST_SQL), &self.name, filter)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RecordRow::into_record))
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        patch: &Document,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Record>, DbError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existing = bind_filter(
            sqlx::query_as::<_, RecordRow>(SELECT_FIRST_FOR_UPDATE_SQL),
            &self.name,
            filter,
        )
        .fetch_optional(&mut *tx)
        .await?
        .map(RecordRow::into_record);

        let result = if let Some(before) = existing {
            let mut fields = before.fields.clone();
            for (key, value) in patch {
                fields.insert(key.clone(), value.clone());
            }
            let after = sqlx::query_as::<_, RecordRow>(UPDATE_SQL)
                .bind(&self.name)
                .bind(before.id.into_inner())
                .bind(Json(fields))
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
                .into_record();
            Some(match options.return_document {
                ReturnDocument::Before => before,
                ReturnDocument::After => after,
            })
        } else if options.upsert {
            let mut record = upsert_record(filter, patch);
            record.touch(now);
            let inserted = self.upsert(&mut *tx, &record).await?;
            match options.return_document {
                ReturnDocument::Before => None,
                ReturnDocument::After => Some(inserted),
            }
        } else {
            None
        };

        tx.commit().await?;
        Ok(result)
    }

    async fn find_one_and_remove(&self, filter: &Filter) -> Result<Option<Record>, DbError> {
        let row = bind_filter(sqlx::query_as::<_, RecordRow>(DELETE_FIRST_SQL), &self.name, filter)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RecordRow::into_record))
    }

    async fn remove(&self, filter: &Filter) -> Result<u64, DbError> {
        let result = sqlx::query(DELETE_SQL)
            .bind(&self.name)
            .bind(Json(filter.fields.clone()))
            .bind(filter.id.eq.map(RecordId::into_inner))
            .bind(filter.id.gte.map(RecordId::into_inner))
            .bind(filter.id.lte.map(RecordId::into_inner))
            .execute(&self.pool)
            .await?;
        tracing::debug!(collection = %self.name, removed = result.rows_affected(), "Removed records");
        Ok(result.rows_affected())
    }

    async fn save(&self, mut record: Record) -> Result<Record, DbError> {
        record.touch(Utc::now());
        let mut conn = self.pool.acquire().await?;
        self.upsert(&mut *conn, &record).await
    }
}

impl PostgresCollection {
    async fn upsert(
        &self,
        conn: &mut sqlx::PgConnection,
        record: &Record,
    ) -> Result<Record, DbError> {
        let row = sqlx::query_as::<_, RecordRow>(UPSERT_SQL)
            .bind(&self.name)
            .bind(record.id.into_inner())
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(Json(&record.fields))
            .fetch_one(conn)
            .await?;
        Ok(row.into_record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_credentials_removes_userinfo() {
        assert_eq!(
            split_credentials("postgresql://rum:secret@db:5432/analytics"),
            ("postgresql://db:5432/analytics".to_owned(), Some("rum".to_owned()))
        );
        assert_eq!(
            split_credentials("postgresql://localhost/rumdiary"),
            ("postgresql://localhost/rumdiary".to_owned(), None)
        );
        assert_eq!(split_credentials("not a uri"), ("not a uri".to_owned(), None));
    }

    #[test]
    fn describe_prefers_configured_user() {
        let connector = PostgresConnector::new(
            DatabaseConfig::new("postgresql://uri_user:pw@localhost/rumdiary")
                .with_credentials("configured", "pw2"),
        );
        let target = connector.describe();
        assert_eq!(target.uri, "postgresql://localhost/rumdiary");
        assert_eq!(target.user, "configured");

        let from_uri = PostgresConnector::new(DatabaseConfig::new(
            "postgresql://uri_user:pw@localhost/rumdiary",
        ));
        assert_eq!(from_uri.describe().user, "uri_user");
    }

    #[test]
    fn bad_uri_is_a_permanent_connection_error() {
        let connector = PostgresConnector::new(DatabaseConfig::new("not a uri"));
        let result = connector.connect_options();
        assert!(matches!(result, Err(ref e) if !e.transient));
    }

    #[test]
    fn rows_become_records() {
        let id = RecordId::new();
        let now = Utc::now();
        let mut doc = Document::new();
        doc.insert("hostname".into(), "example.com".into());
        let record = RecordRow {
            id: id.into_inner(),
            created_at: now,
            updated_at: now,
            doc: Json(doc),
        }
        .into_record();
        assert_eq!(record.id, id);
        assert_eq!(record.created_at, Some(now));
        assert_eq!(record.get("hostname"), Some(&"example.com".into()));
    }
}
