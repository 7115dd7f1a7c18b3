//! Shared type definitions for the RumDiary data layer.
//!
//! # Modules
//!
//! - [`ids`] -- Time-ordered record identifiers (UUID v7)
//! - [`record`] -- Stored documents and their field maps

pub mod ids;
pub mod record;

// Re-export all public types at crate root for convenience.
pub use ids::{ParseRecordIdError, RecordId};
pub use record::{Document, Record};
