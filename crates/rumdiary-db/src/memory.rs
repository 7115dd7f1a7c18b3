//! In-process record store.
//!
//! Collections are id-ordered maps behind a lock, so reads come back in
//! creation order and find-and-modify is atomic under the write lock. The
//! data lives in the [`MemoryDatabase`], which outlives individual
//! connections: closing and reconnecting sees the same records.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rumdiary_types::{Document, Record, RecordId};

use crate::connection::{ConnectionTarget, Connector};
use crate::error::{ConnectionError, DbError};
use crate::query::{Filter, Projection};
use crate::store::{
    Database, FindOneAndUpdateOptions, RecordStore, RecordStream, ReturnDocument, upsert_record,
};

/// URI reported for in-process connections.
const MEMORY_URI: &str = "memory://rumdiary";

/// Connector for the in-process store.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    database: Arc<MemoryDatabase>,
    latency: Option<Duration>,
    failures: Mutex<VecDeque<ConnectionError>>,
    establish_calls: AtomicUsize,
}

impl MemoryConnector {
    /// Connector over an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `establish` call, so concurrent callers overlap.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `establish` calls with these errors, in order.
    #[must_use]
    pub fn with_failures(self, failures: Vec<ConnectionError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            ..self
        }
    }

    /// Fail every read with [`DbError::Stream`] once `records` records
    /// have been delivered.
    #[must_use]
    pub fn with_stream_failure_after(self, records: usize) -> Self {
        self.database.fail_streams_after(Some(records));
        self
    }

    /// How many times `establish` ran.
    pub fn establish_count(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    /// The store this connector opens.
    pub fn database(&self) -> Arc<MemoryDatabase> {
        Arc::clone(&self.database)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn establish(&self) -> Result<Arc<dyn Database>, ConnectionError> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.database()),
        }
    }

    fn describe(&self) -> ConnectionTarget {
        ConnectionTarget {
            uri: MEMORY_URI.to_owned(),
            user: "<none>".to_owned(),
        }
    }
}

/// Every collection of the in-process store.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    collections: RwLock<HashMap<String, Arc<MemoryCollection>>>,
    stream_failure_after: Arc<Mutex<Option<usize>>>,
}

impl MemoryDatabase {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make reads of every collection fail after `records` records, or stop
    /// failing them with `None`.
    pub fn fail_streams_after(&self, records: Option<usize>) {
        *self
            .stream_failure_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = records;
    }

    /// Number of records in `name`, zero for an unknown collection.
    pub fn record_count(&self, name: &str) -> usize {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, |c| c.read().len())
    }

    fn collection_handle(&self, name: &str) -> Arc<MemoryCollection> {
        if let Some(existing) = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(existing);
        }
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(collections.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(MemoryCollection {
                records: RwLock::default(),
                stream_failure_after: Arc::clone(&self.stream_failure_after),
            })
        }))
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn collection(&self, name: &str) -> Arc<dyn RecordStore> {
        self.collection_handle(name)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn close(&self) {}
}

/// One id-ordered collection.
#[derive(Debug)]
pub struct MemoryCollection {
    records: RwLock<BTreeMap<RecordId, Record>>,
    stream_failure_after: Arc<Mutex<Option<usize>>>,
}

impl MemoryCollection {
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordStore for MemoryCollection {
    async fn find(&self, filter: &Filter, projection: &Projection) -> Result<RecordStream, DbError> {
        let matches: Vec<Record> = self
            .read()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .map(|mut record| {
                projection.apply(&mut record);
                record
            })
            .collect();
        tracing::debug!(count = matches.len(), "Memory find");

        let failure_after = *self
            .stream_failure_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let items: Vec<Result<Record, DbError>> = match failure_after {
            Some(limit) if matches.len() > limit => matches
                .into_iter()
                .take(limit)
                .map(Ok)
                .chain(std::iter::once(Err(DbError::Stream(format!(
                    "cursor failed after {limit} records"
                )))))
                .collect(),
            _ => matches.into_iter().map(Ok).collect(),
        };
        Ok(futures::stream::iter(items).boxed())
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, DbError> {
        Ok(self
            .read()
            .values()
            .find(|record| filter.matches(record))
            .cloned())
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        patch: &Document,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Record>, DbError> {
        let mut records = self.write();
        let now = Utc::now();
        if let Some(record) = records.values_mut().find(|record| filter.matches(record)) {
            let before = record.clone();
            record.merge(patch);
            record.touch(now);
            return Ok(Some(match options.return_document {
                ReturnDocument::Before => before,
                ReturnDocument::After => record.clone(),
            }));
        }
        if !options.upsert {
            return Ok(None);
        }
        let mut record = upsert_record(filter, patch);
        record.touch(now);
        records.insert(record.id, record.clone());
        Ok(match options.return_document {
            ReturnDocument::Before => None,
            ReturnDocument::After => Some(record),
        })
    }

    async fn find_one_and_remove(&self, filter: &Filter) -> Result<Option<Record>, DbError> {
        let mut records = self.write();
        let id = records
            .values()
            .find(|record| filter.matches(record))
            .map(|record| record.id);
        Ok(id.and_then(|id| records.remove(&id)))
    }

    async fn remove(&self, filter: &Filter) -> Result<u64, DbError> {
        let mut records = self.write();
        let before = records.len();
        records.retain(|_, record| !filter.matches(record));
        let removed = before.saturating_sub(records.len());
        tracing::debug!(removed, "Memory remove");
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    async fn save(&self, mut record: Record) -> Result<Record, DbError> {
        record.touch(Utc::now());
        self.write().insert(record.id, record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use serde_json::json;

    use super::*;
    use crate::query::{SearchCriteria, translate};

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    async fn seeded() -> Arc<dyn RecordStore> {
        let database = MemoryDatabase::new();
        let store = database.collection("pageView");
        for path in ["/a", "/b", "/c"] {
            let saved = store
                .save(Record::new(doc(json!({ "hostname": "a.com", "path": path }))))
                .await;
            assert!(saved.is_ok());
        }
        store
    }

    #[tokio::test]
    async fn find_returns_matches_in_id_order() {
        let store = seeded().await;
        let records: Vec<Record> = store
            .find(&Filter::all(), &Projection::All)
            .await
            .unwrap_or_else(|_| futures::stream::empty().boxed())
            .try_collect()
            .await
            .unwrap_or_default();
        let paths: Vec<_> = records.iter().filter_map(|r| r.get("path")).collect();
        assert_eq!(paths, [&json!("/a"), &json!("/b"), &json!("/c")]);
        assert!(records.iter().all(|r| !r.is_new()));
    }

    #[tokio::test]
    async fn find_one_and_update_returns_requested_image() {
        let store = seeded().await;
        let filter = translate(&SearchCriteria::all().with("path", "/b"));
        let patch = doc(json!({ "path": "/b2" }));

        let before = store
            .find_one_and_update(&filter, &patch, FindOneAndUpdateOptions::default())
            .await
            .ok()
            .flatten();
        assert_eq!(before.and_then(|r| r.get("path").cloned()), Some(json!("/b")));

        let moved = translate(&SearchCriteria::all().with("path", "/b2"));
        let after = store
            .find_one_and_update(
                &moved,
                &doc(json!({ "title": "B" })),
                FindOneAndUpdateOptions::default().returning_after(),
            )
            .await
            .ok()
            .flatten();
        assert_eq!(after.and_then(|r| r.get("title").cloned()), Some(json!("B")));
    }

    #[tokio::test]
    async fn upsert_inserts_filter_fields_and_patch() {
        let store = seeded().await;
        let filter = translate(&SearchCriteria::all().with("hostname", "new.com"));
        let inserted = store
            .find_one_and_update(
                &filter,
                &doc(json!({ "path": "/" })),
                FindOneAndUpdateOptions::default().returning_after().with_upsert(true),
            )
            .await
            .ok()
            .flatten();
        let inserted = inserted.unwrap_or_else(|| Record::new(Document::new()));
        assert_eq!(inserted.get("hostname"), Some(&json!("new.com")));
        assert_eq!(inserted.get("path"), Some(&json!("/")));
        assert!(!inserted.is_new());
    }

    #[tokio::test]
    async fn remove_and_find_one_and_remove() {
        let store = seeded().await;
        let first = store.find_one_and_remove(&Filter::all()).await.ok().flatten();
        assert_eq!(first.and_then(|r| r.get("path").cloned()), Some(json!("/a")));
        assert_eq!(store.remove(&Filter::all()).await.ok(), Some(2));
        assert_eq!(store.find_one(&Filter::all()).await.ok().flatten(), None);
    }

    #[tokio::test]
    async fn injected_stream_failure_ends_the_read() {
        let database = MemoryDatabase::new();
        let store = database.collection("pageView");
        for path in ["/a", "/b", "/c"] {
            let saved = store
                .save(Record::new(doc(json!({ "hostname": "a.com", "path": path }))))
                .await;
            assert!(saved.is_ok());
        }
        database.fail_streams_after(Some(1));

        let items: Vec<Result<Record, DbError>> = store
            .find(&Filter::all(), &Projection::All)
            .await
            .unwrap_or_else(|_| futures::stream::empty().boxed())
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items.first().is_some_and(Result::is_ok));
        assert!(matches!(items.get(1), Some(Err(DbError::Stream(_)))));

        database.fail_streams_after(None);
        let healthy = store
            .find(&Filter::all(), &Projection::All)
            .await
            .unwrap_or_else(|_| futures::stream::empty().boxed())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(healthy.len(), 3);
    }

    #[tokio::test]
    async fn collections_are_shared_by_name() {
        let database = MemoryDatabase::new();
        let saved = database
            .collection("site")
            .save(Record::new(doc(json!({ "name": "x" }))))
            .await;
        assert!(saved.is_ok());
        assert_eq!(database.record_count("site"), 1);
        assert_eq!(database.record_count("user"), 0);
    }
}
