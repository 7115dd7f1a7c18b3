//! Error types for the `rumdiary-dbctl` binary.

/// Top-level error for the operator CLI.
#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    /// A datastore operation failed.
    #[error("datastore error: {source}")]
    Db {
        /// The underlying datastore error.
        #[from]
        source: rumdiary_db::DbError,
    },
}
