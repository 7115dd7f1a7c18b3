//! Time-ordered record identifiers.
//!
//! Every record is keyed by a UUID v7. The first 48 bits of a v7 UUID hold
//! the Unix timestamp in milliseconds, so identifiers sort by creation time
//! and a creation-time window can be queried as an identifier range. The
//! storage layer keeps no separate creation column for range filtering.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, time-ordered identifier of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Create a new identifier for the current instant.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The lowest identifier that can embed the given timestamp.
    ///
    /// All random bits are zero, so every identifier generated at or after
    /// `timestamp` compares greater than or equal to the result. Timestamps
    /// before the Unix epoch clamp to the epoch.
    pub fn from_timestamp(timestamp: DateTime<Utc>) -> Self {
        let millis = u64::try_from(timestamp.timestamp_millis()).unwrap_or(0);
        Self(uuid::Builder::from_unix_timestamp_millis(millis, &[0; 10]).into_uuid())
    }

    /// Creation time embedded in the identifier, at millisecond precision.
    ///
    /// Returns `None` for identifiers that are not time-based.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        let secs = i64::try_from(secs).ok()?;
        Utc.timestamp_opt(secs, nanos).single()
    }

    /// Return the inner [`Uuid`] value.
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for RecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RecordId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<RecordId> for Uuid {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

/// Error returned when a string is not a valid record identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRecordIdError(String);

impl core::fmt::Display for ParseRecordIdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid record id: {}", self.0)
    }
}

impl std::error::Error for ParseRecordIdError {}

impl FromStr for RecordId {
    type Err = ParseRecordIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ParseRecordIdError(format!("{s}: {e}")))
    }
}
