//! Generic model: the CRUD, streaming and aggregation operations every
//! domain model shares.
//!
//! A [`Model`] is defined once with a name and a [`Schema`], then receives
//! its connection and logger through [`Model::init`]. Every operation
//! ensures the shared connection first, works on the collection named
//! after the model, and logs a start line and a duration line:
//!
//! ```text
//! pageView->getOne: {"hostname":"example.com"}
//! pageView->getOne query time for {"hostname":"example.com"}: 3 ms
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rumdiary_types::{Document, Record};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::connection::ConnectionManager;
use crate::error::DbError;
use crate::logger::Logger;
use crate::query::{Filter, ReadRequest, SearchCriteria, translate};
use crate::schema::Schema;
use crate::store::{FindOneAndUpdateOptions, RecordStore, RecordStream};

/// Above this many records, [`Model::get`] warns that a stream should be
/// used instead.
pub const FETCH_COUNT_WARNING_THRESHOLD: usize = 500;

const HEAP_WARNING: &str =
    "Using model.get for large data sets is heap inefficient. Use getStream instead.";

const NOT_A_MODEL: &str = "attempting to save an item that is not a model. Try create instead.";

/// Something handed to [`Model::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum Persistable {
    /// A record built by [`Model::create_model`] or read from the store.
    Record(Record),
    /// Raw data that never went through a model.
    Plain(Document),
}

impl From<Record> for Persistable {
    fn from(record: Record) -> Self {
        Self::Record(record)
    }
}

impl From<Document> for Persistable {
    fn from(document: Document) -> Self {
        Self::Plain(document)
    }
}

/// Destination for piped records.
#[async_trait]
pub trait RecordSink: Send {
    /// Accept one record.
    async fn write(&mut self, record: Record) -> Result<(), DbError>;
}

#[async_trait]
impl RecordSink for Vec<Record> {
    async fn write(&mut self, record: Record) -> Result<(), DbError> {
        self.push(record);
        Ok(())
    }
}

#[async_trait]
impl RecordSink for mpsc::Sender<Record> {
    async fn write(&mut self, record: Record) -> Result<(), DbError> {
        self.send(record)
            .await
            .map_err(|e| DbError::Sink(e.to_string()))
    }
}

/// Options for [`Model::calculate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalculateOptions {
    /// Which records feed the calculation.
    pub filter: SearchCriteria,
}

/// Dependencies injected by [`Model::init`].
#[derive(Clone)]
pub struct ModelDeps {
    /// Shared connection.
    pub connection: Arc<ConnectionManager>,
    /// Where log lines go.
    pub logger: Arc<dyn Logger>,
}

/// A named collection with the shared model operations.
pub struct Model {
    name: String,
    schema: Schema,
    deps: RwLock<Option<ModelDeps>>,
}

impl Model {
    /// Define a model. It cannot run operations until [`Model::init`].
    pub fn define(name: &str, schema: Schema) -> Self {
        Self {
            name: name.to_owned(),
            schema,
            deps: RwLock::new(None),
        }
    }

    /// Inject the connection and logger.
    pub fn init(&self, connection: Arc<ConnectionManager>, logger: Arc<dyn Logger>) {
        *self.deps.write().unwrap_or_else(PoisonError::into_inner) =
            Some(ModelDeps { connection, logger });
    }

    /// Model name, also the collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields this model stores.
    pub const fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Build an unsaved record from `data`.
    ///
    /// Only declared fields are kept and defaults are filled in.
    pub fn create_model(&self, data: &Document) -> Record {
        Record::new(self.schema.build(data))
    }

    /// Translate caller criteria into a storage filter.
    #[allow(clippy::unused_self)]
    pub fn get_search_by(&self, criteria: &SearchCriteria) -> Filter {
        translate(criteria)
    }

    /// Build a record from `data` and save it.
    ///
    /// # Errors
    ///
    /// Same as [`Model::update`].
    pub async fn create(&self, data: &Document, cancel: &CancellationToken) -> Result<Record, DbError> {
        self.update(self.create_model(data), cancel).await
    }

    /// Save a record, returning it as stored.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] for plain data,
    /// [`DbError::Validation`] if the record does not fit the schema, or the
    /// store's error.
    pub async fn update(
        &self,
        item: impl Into<Persistable> + Send,
        cancel: &CancellationToken,
    ) -> Result<Record, DbError> {
        let (store, logger) = self.store(cancel).await?;
        let Persistable::Record(record) = item.into() else {
            return Err(DbError::InvalidArgument(NOT_A_MODEL.to_owned()));
        };
        self.schema
            .validate(&record)
            .map_err(|message| DbError::Validation {
                model: self.name.clone(),
                message,
            })?;

        self.log_it(logger.as_ref(), "update", None, cancel, store.save(record))
            .await
    }

    /// Read every matching record into memory.
    ///
    /// Accepts criteria, criteria plus a projection, or a bare projection
    /// string (every record). Warns once when more than
    /// [`FETCH_COUNT_WARNING_THRESHOLD`] records come back.
    ///
    /// # Errors
    ///
    /// Returns the first error of the underlying stream.
    pub async fn get(
        &self,
        request: impl Into<ReadRequest> + Send,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, DbError> {
        let mut cursor = self.get_stream(request, cancel).await?;
        let mut records = Vec::new();
        while let Some(record) = cursor.next().await {
            records.push(record?);
        }
        if records.len() > FETCH_COUNT_WARNING_THRESHOLD {
            self.deps()?.logger.warn(HEAP_WARNING);
        }
        Ok(records)
    }

    /// Open a lazy cursor over every matching record, in id order.
    ///
    /// Failures after the cursor is returned arrive as `Err` items.
    ///
    /// # Errors
    ///
    /// Returns connection errors and invalid projections.
    pub async fn get_stream(
        &self,
        request: impl Into<ReadRequest> + Send,
        cancel: &CancellationToken,
    ) -> Result<RecordCursor, DbError> {
        let request = request.into();
        let (store, logger) = self.store(cancel).await?;
        let projection = request.projection()?;
        let filter = self.get_search_by(&request.criteria);

        logger.info(&start_message(&self.name, "getStream", Some(&filter)));
        let timer = QueryTimer {
            logger,
            model: self.name.clone(),
            method: "getStream",
            filter: Some(filter.clone()),
            started: Instant::now(),
        };
        match store.find(&filter, &projection).await {
            Ok(stream) => Ok(RecordCursor::new(stream, cancel.clone(), timer)),
            Err(e) => {
                timer.finish();
                Err(e)
            }
        }
    }

    /// Forward every matching record to `sink`, returning how many went.
    ///
    /// # Errors
    ///
    /// Returns the first stream or sink error.
    pub async fn pipe<S>(
        &self,
        request: impl Into<ReadRequest> + Send,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<usize, DbError>
    where
        S: RecordSink + ?Sized,
    {
        let mut cursor = self.get_stream(request, cancel).await?;
        let mut forwarded: usize = 0;
        while let Some(record) = cursor.next().await {
            sink.write(record?).await?;
            forwarded = forwarded.saturating_add(1);
        }
        Ok(forwarded)
    }

    /// Pipe the records selected by `options.filter` into a reducing sink.
    ///
    /// # Errors
    ///
    /// Same as [`Model::pipe`].
    pub async fn calculate<S>(
        &self,
        sink: &mut S,
        options: CalculateOptions,
        cancel: &CancellationToken,
    ) -> Result<usize, DbError>
    where
        S: RecordSink + ?Sized,
    {
        self.pipe(options.filter, sink, cancel).await
    }

    /// First matching record, or `None`.
    ///
    /// # Errors
    ///
    /// Returns connection and store errors.
    pub async fn get_one(
        &self,
        criteria: &SearchCriteria,
        cancel: &CancellationToken,
    ) -> Result<Option<Record>, DbError> {
        let (store, logger) = self.store(cancel).await?;
        let filter = self.get_search_by(criteria);
        self.log_it(logger.as_ref(), "getOne", Some(&filter), cancel, store.find_one(&filter))
            .await
    }

    /// Atomically merge `patch` into the first matching record.
    ///
    /// Envelope keys in `patch` are ignored.
    ///
    /// # Errors
    ///
    /// Returns connection and store errors.
    pub async fn find_one_and_update(
        &self,
        criteria: &SearchCriteria,
        patch: &Document,
        options: FindOneAndUpdateOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<Record>, DbError> {
        let (store, logger) = self.store(cancel).await?;
        let filter = self.get_search_by(criteria);
        let mut patch = patch.clone();
        patch.retain(|key, _| !Record::RESERVED_FIELDS.contains(&key.as_str()));
        self.log_it(
            logger.as_ref(),
            "findOneAndUpdate",
            Some(&filter),
            cancel,
            store.find_one_and_update(&filter, &patch, options),
        )
        .await
    }

    /// Atomically remove the first matching record and return it.
    ///
    /// # Errors
    ///
    /// Returns connection and store errors.
    pub async fn find_one_and_delete(
        &self,
        criteria: &SearchCriteria,
        cancel: &CancellationToken,
    ) -> Result<Option<Record>, DbError> {
        let (store, logger) = self.store(cancel).await?;
        let filter = self.get_search_by(criteria);
        self.log_it(
            logger.as_ref(),
            "findOneAndDelete",
            Some(&filter),
            cancel,
            store.find_one_and_remove(&filter),
        )
        .await
    }

    /// Remove every record of this model, returning how many went.
    ///
    /// # Errors
    ///
    /// Returns connection and store errors.
    pub async fn clear(&self, cancel: &CancellationToken) -> Result<u64, DbError> {
        let (store, logger) = self.store(cancel).await?;
        logger.warn(&format!("clearing table: {}", self.name));
        let all = Filter::all();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DbError::Cancelled),
            removed = store.remove(&all) => removed,
        }
    }

    fn deps(&self) -> Result<ModelDeps, DbError> {
        self.deps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| DbError::NotInitialized(self.name.clone()))
    }

    async fn store(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Arc<dyn RecordStore>, Arc<dyn Logger>), DbError> {
        let deps = self.deps()?;
        let database = deps.connection.connect(cancel).await?;
        Ok((database.collection(&self.name), deps.logger))
    }

    async fn log_it<T, F>(
        &self,
        logger: &dyn Logger,
        method: &'static str,
        filter: Option<&Filter>,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>> + Send,
    {
        logger.info(&start_message(&self.name, method, filter));
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DbError::Cancelled),
            outcome = operation => outcome,
        };
        logger.log(&duration_message(&self.name, method, filter, started.elapsed()));
        outcome
    }
}

impl core::fmt::Debug for Model {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let initialized = self
            .deps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("initialized", &initialized)
            .finish_non_exhaustive()
    }
}

fn start_message(model: &str, method: &str, filter: Option<&Filter>) -> String {
    match filter {
        Some(filter) => format!("{model}->{method}: {filter}"),
        None => format!("{model}->{method}"),
    }
}

fn duration_message(model: &str, method: &str, filter: Option<&Filter>, elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    match filter {
        Some(filter) => format!("{model}->{method} query time for {filter}: {ms} ms"),
        None => format!("{model}->{method} query time: {ms} ms"),
    }
}

/// Logs a read's duration once, when the cursor closes.
struct QueryTimer {
    logger: Arc<dyn Logger>,
    model: String,
    method: &'static str,
    filter: Option<Filter>,
    started: Instant,
}

impl QueryTimer {
    fn finish(self) {
        self.logger.log(&duration_message(
            &self.model,
            self.method,
            self.filter.as_ref(),
            self.started.elapsed(),
        ));
    }
}

/// Lazy, forward-only stream of records returned by [`Model::get_stream`].
///
/// Ends after the last record, after the first error, or with
/// [`DbError::Cancelled`] once its cancellation token fires. The read
/// duration is logged once when the cursor ends or is dropped.
pub struct RecordCursor {
    inner: RecordStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    timer: Option<QueryTimer>,
}

impl RecordCursor {
    fn new(inner: RecordStream, cancel: CancellationToken, timer: QueryTimer) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancel.cancelled_owned()),
            timer: Some(timer),
        }
    }

    /// Whether the cursor has ended.
    pub const fn is_closed(&self) -> bool {
        self.timer.is_none()
    }

    fn close(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.finish();
        }
    }
}

impl Stream for RecordCursor {
    type Item = Result<Record, DbError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.is_closed() {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.close();
            return Poll::Ready(Some(Err(DbError::Cancelled)));
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(record))) => Poll::Ready(Some(Ok(record))),
            Poll::Ready(Some(Err(e))) => {
                this.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RecordCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for RecordCursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecordCursor")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Convert a JSON object into a [`Document`]; anything else is empty.
pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_match_log_format() {
        let filter = translate(&SearchCriteria::all().with("hostname", "a.com"));
        assert_eq!(
            start_message("pageView", "getOne", Some(&filter)),
            r#"pageView->getOne: {"hostname":"a.com"}"#
        );
        assert_eq!(start_message("site", "update", None), "site->update");
        assert_eq!(
            duration_message("pageView", "getOne", Some(&filter), Duration::from_millis(42)),
            r#"pageView->getOne query time for {"hostname":"a.com"}: 42 ms"#
        );
        assert_eq!(
            duration_message("site", "update", None, Duration::from_millis(7)),
            "site->update query time: 7 ms"
        );
    }

    #[test]
    fn create_model_is_strict() {
        let model = Model::define("tags", crate::schemas::tags());
        let record = model.create_model(&document(json!({ "hostname": "a.com", "junk": 1 })));
        assert!(record.is_new());
        assert_eq!(record.get("hostname"), Some(&json!("a.com")));
        assert_eq!(record.get("tags"), Some(&json!([])));
        assert!(record.get("junk").is_none());
    }

    #[tokio::test]
    async fn operations_before_init_fail() {
        let model = Model::define("site", crate::schemas::site());
        let result = model.get_one(&SearchCriteria::all(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(DbError::NotInitialized(ref name)) if name == "site"));
    }

    #[tokio::test]
    async fn sinks_accept_records() {
        let mut collected: Vec<Record> = Vec::new();
        assert!(collected.write(Record::new(Document::new())).await.is_ok());
        assert_eq!(collected.len(), 1);

        let (mut tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = tx.write(Record::new(Document::new())).await;
        assert!(matches!(result, Err(DbError::Sink(_))));
    }
}
