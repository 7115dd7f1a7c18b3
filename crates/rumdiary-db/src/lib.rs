//! Data layer for RumDiary (`PostgreSQL` JSONB or in-memory).
//!
//! Every domain model (page views, sites, users, tags, invites,
//! annotations) is a [`Model`]: a named collection with the same create /
//! read / update / delete / stream / aggregate operations. Models share
//! one lazily opened connection and report what they do through an
//! injected [`Logger`].
//!
//! # Architecture
//!
//! ```text
//! Datastore::init(config, logger)
//!     |
//!     +-- ConnectionManager (one shared, memoised connection)
//!     |       +-- Connector: PostgresConnector | MemoryConnector
//!     |
//!     +-- Models (registry, broadcasts init / clear)
//!             +-- Model -> Database::collection(name) -> RecordStore
//! ```
//!
//! # Modules
//!
//! - [`connection`] -- connection state machine and the [`Connector`] seam
//! - [`store`] -- [`Database`] and [`RecordStore`] traits
//! - [`postgres`] -- `PostgreSQL` record store
//! - [`memory`] -- in-process record store
//! - [`query`] -- search criteria, filters, projections
//! - [`schema`] / [`schemas`] -- field schemas of the domain models
//! - [`model`] -- the generic model facade
//! - [`registry`] -- the set of domain models
//! - [`datastore`] -- top-level adapter
//! - [`config`], [`logger`], [`error`] -- configuration, logging, errors

pub mod config;
pub mod connection;
pub mod datastore;
pub mod error;
pub mod logger;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod query;
pub mod registry;
pub mod schema;
pub mod schemas;
pub mod store;

// Re-export primary types for convenience.
pub use config::DatabaseConfig;
pub use connection::{ConnectionManager, ConnectionState, ConnectionTarget, Connector};
pub use datastore::Datastore;
pub use error::{ConnectionError, DbError};
pub use logger::{LogLevel, LogLine, Logger, NullLogger, RecordingLogger, TracingLogger};
pub use memory::{MemoryConnector, MemoryDatabase};
pub use model::{
    CalculateOptions, FETCH_COUNT_WARNING_THRESHOLD, Model, ModelDeps, Persistable, RecordCursor,
    RecordSink, document,
};
pub use postgres::{PostgresConnector, PostgresDatabase};
pub use query::{Filter, IdRange, Projection, ReadRequest, SearchCriteria};
pub use registry::Models;
pub use schema::{FieldType, Schema};
pub use store::{Database, FindOneAndUpdateOptions, RecordStore, RecordStream, ReturnDocument};

pub use rumdiary_types::{Document, Record, RecordId};
