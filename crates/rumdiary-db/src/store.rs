//! Storage seams: a connected [`Database`] hands out one [`RecordStore`]
//! per collection.
//!
//! Both the `PostgreSQL` and in-memory backends implement these traits; the
//! model facade only ever talks to them through `Arc<dyn ...>`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rumdiary_types::{Document, Record};

use crate::error::DbError;
use crate::query::{Filter, Projection};

/// Forward-only stream of records in id order.
pub type RecordStream = BoxStream<'static, Result<Record, DbError>>;

/// Which image of the record a find-and-modify returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    /// The record as it was before the patch.
    #[default]
    Before,
    /// The record after the patch was applied.
    After,
}

/// Options for [`RecordStore::find_one_and_update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOneAndUpdateOptions {
    /// Pre- or post-update image.
    pub return_document: ReturnDocument,
    /// Insert a record built from the filter fields and the patch when
    /// nothing matches.
    pub upsert: bool,
}

impl FindOneAndUpdateOptions {
    /// Return the post-update image.
    #[must_use]
    pub const fn returning_after(mut self) -> Self {
        self.return_document = ReturnDocument::After;
        self
    }

    /// Insert when nothing matches.
    #[must_use]
    pub const fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }
}

/// A live database handle.
#[async_trait]
pub trait Database: Send + Sync {
    /// Store for the named collection.
    fn collection(&self, name: &str) -> Arc<dyn RecordStore>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Release the underlying resources.
    async fn close(&self);
}

/// Primitive operations on one collection.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stream every matching record, projected, in id order.
    ///
    /// Errors that happen after the query starts arrive as `Err` items.
    async fn find(&self, filter: &Filter, projection: &Projection) -> Result<RecordStream, DbError>;

    /// First matching record in id order.
    async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, DbError>;

    /// Atomically merge `patch` into the first matching record.
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        patch: &Document,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Record>, DbError>;

    /// Atomically remove the first matching record and return it.
    async fn find_one_and_remove(&self, filter: &Filter) -> Result<Option<Record>, DbError>;

    /// Remove every matching record, returning how many went.
    async fn remove(&self, filter: &Filter) -> Result<u64, DbError>;

    /// Insert or replace `record`, stamping its timestamps.
    async fn save(&self, record: Record) -> Result<Record, DbError>;
}

/// Record inserted by an upsert: filter fields first, then the patch.
pub(crate) fn upsert_record(filter: &Filter, patch: &Document) -> Record {
    let mut record = filter
        .id
        .eq
        .map_or_else(|| Record::new(filter.fields.clone()), |id| Record::with_id(id, filter.fields.clone()));
    record.merge(patch);
    record
}
