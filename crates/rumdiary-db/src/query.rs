//! Search criteria, storage filters and field projections.
//!
//! Callers describe what they want with [`SearchCriteria`]: equality on
//! domain fields plus the reserved `start` / `end` pseudo-fields. The store
//! has no creation-time column to range over, so [`translate`] rewrites
//! `start` / `end` into bounds on the time-ordered record id:
//!
//! ```text
//! { hostname: "a.com", start: t1, end: t2 }
//!     -> hostname = "a.com" AND _id >= id_for(t1) AND _id <= id_for(t2)
//! ```

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rumdiary_types::{Document, Record, RecordId};
use serde::{Serialize, Serializer};
use serde_json::{Value, json};

use crate::error::DbError;

/// Reserved criteria key for the lower creation-time bound.
pub const START_KEY: &str = "start";

/// Reserved criteria key for the upper creation-time bound.
pub const END_KEY: &str = "end";

/// Criteria key that matches a single record id.
pub const ID_KEY: &str = "_id";

/// What a caller is looking for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    /// Match exactly this record.
    pub id: Option<RecordId>,
    /// Only records created at or after this instant.
    pub start: Option<DateTime<Utc>>,
    /// Only records created at or before this instant.
    pub end: Option<DateTime<Utc>>,
    /// Field equality constraints.
    pub fields: Document,
}

impl SearchCriteria {
    /// Criteria that match every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality constraint.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Restrict to records created at or after `start`.
    #[must_use]
    pub const fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// Restrict to records created at or before `end`.
    #[must_use]
    pub const fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// Match a single record by id.
    #[must_use]
    pub const fn by_id(mut self, id: RecordId) -> Self {
        self.id = Some(id);
        self
    }

    /// Build criteria from a plain document.
    ///
    /// `start` and `end` accept RFC 3339 strings or Unix milliseconds; `_id`
    /// accepts a UUID string. Every other key is an equality constraint.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if a reserved key has a value of
    /// the wrong shape.
    pub fn from_document(document: Document) -> Result<Self, DbError> {
        let mut criteria = Self::default();
        for (key, value) in document {
            match key.as_str() {
                START_KEY => criteria.start = Some(parse_instant(START_KEY, &value)?),
                END_KEY => criteria.end = Some(parse_instant(END_KEY, &value)?),
                ID_KEY => criteria.id = Some(parse_id(&value)?),
                _ => {
                    criteria.fields.insert(key, value);
                }
            }
        }
        Ok(criteria)
    }
}

impl TryFrom<Value> for SearchCriteria {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(document) => Self::from_document(document),
            Value::Null => Ok(Self::all()),
            other => Err(DbError::InvalidArgument(format!(
                "search criteria must be an object, got {other}"
            ))),
        }
    }
}

fn parse_instant(key: &str, value: &Value) -> Result<DateTime<Utc>, DbError> {
    let parsed = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        DbError::InvalidArgument(format!(
            "`{key}` must be an RFC 3339 timestamp or Unix milliseconds, got {value}"
        ))
    })
}

fn parse_id(value: &Value) -> Result<RecordId, DbError> {
    value
        .as_str()
        .and_then(|s| RecordId::from_str(s).ok())
        .ok_or_else(|| DbError::InvalidArgument(format!("`_id` must be a record id, got {value}")))
}

/// Constraint on the record id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdRange {
    /// Exact id.
    pub eq: Option<RecordId>,
    /// Inclusive lower bound.
    pub gte: Option<RecordId>,
    /// Inclusive upper bound.
    pub lte: Option<RecordId>,
}

impl IdRange {
    /// Whether `id` satisfies every bound.
    pub fn contains(&self, id: RecordId) -> bool {
        self.eq.is_none_or(|eq| id == eq)
            && self.gte.is_none_or(|gte| id >= gte)
            && self.lte.is_none_or(|lte| id <= lte)
    }

    /// Whether no bound is set.
    pub const fn is_unbounded(&self) -> bool {
        self.eq.is_none() && self.gte.is_none() && self.lte.is_none()
    }
}

/// Storage-level filter: an id constraint AND field equality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Constraint on the record id.
    pub id: IdRange,
    /// Field equality constraints.
    pub fields: Document,
}

impl Filter {
    /// Filter that matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether the filter matches every record.
    pub fn is_all(&self) -> bool {
        self.id.is_unbounded() && self.fields.is_empty()
    }

    /// Whether `record` satisfies the filter.
    ///
    /// A stored array matches a scalar constraint it contains.
    pub fn matches(&self, record: &Record) -> bool {
        self.id.contains(record.id)
            && self
                .fields
                .iter()
                .all(|(key, expected)| record.get(key).is_some_and(|stored| value_matches(stored, expected)))
    }

    /// Document-store rendering used in log lines.
    pub fn to_json(&self) -> Value {
        let mut out = self.fields.clone();
        if let Some(eq) = self.id.eq {
            out.insert(ID_KEY.to_owned(), json!(eq.to_string()));
        } else if !self.id.is_unbounded() {
            let mut range = Document::new();
            if let Some(gte) = self.id.gte {
                range.insert("$gte".to_owned(), json!(gte.to_string()));
            }
            if let Some(lte) = self.id.lte {
                range.insert("$lte".to_owned(), json!(lte.to_string()));
            }
            out.insert(ID_KEY.to_owned(), Value::Object(range));
        }
        Value::Object(out)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl core::fmt::Display for Filter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn value_matches(stored: &Value, expected: &Value) -> bool {
    if stored == expected {
        return true;
    }
    match stored {
        Value::Array(items) if !expected.is_array() => items.contains(expected),
        _ => false,
    }
}

/// Translate caller criteria into a storage filter.
///
/// Pure: `start` / `end` become inclusive id bounds, `_id` an exact id, and
/// every other key passes through as equality.
pub fn translate(criteria: &SearchCriteria) -> Filter {
    Filter {
        id: IdRange {
            eq: criteria.id,
            gte: criteria.start.map(RecordId::from_timestamp),
            lte: criteria.end.map(RecordId::from_timestamp),
        },
        fields: criteria.fields.clone(),
    }
}

/// Which fields a read returns.
///
/// Parsed from a space-separated list: `"hostname path"` keeps only those
/// fields, `"-referrer"` drops one. The envelope keys (`_id`, `createdAt`,
/// `updatedAt`) are always returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Projection {
    /// Every field.
    #[default]
    All,
    /// Only these fields.
    Include(Vec<String>),
    /// Every field except these.
    Exclude(Vec<String>),
}

impl Projection {
    /// Parse a projection list.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] when inclusions and exclusions
    /// are mixed.
    pub fn parse(spec: &str) -> Result<Self, DbError> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        let mut inclusion_requested = false;
        for token in spec.split_whitespace() {
            match token.strip_prefix('-') {
                Some(field) if !field.is_empty() => exclude.push(field.to_owned()),
                Some(_) => {}
                None => {
                    inclusion_requested = true;
                    if !Record::RESERVED_FIELDS.contains(&token) {
                        include.push(token.to_owned());
                    }
                }
            }
        }
        // Naming only envelope keys still selects no domain fields.
        match (inclusion_requested, exclude.is_empty()) {
            (false, true) => Ok(Self::All),
            (true, true) => Ok(Self::Include(include)),
            (_, false) if include.is_empty() => Ok(Self::Exclude(exclude)),
            (_, false) => Err(DbError::InvalidArgument(format!(
                "projection `{spec}` mixes inclusion and exclusion"
            ))),
        }
    }

    /// Strip the fields this projection does not return.
    pub fn apply(&self, record: &mut Record) {
        match self {
            Self::All => {}
            Self::Include(keep) => record.fields.retain(|key, _| keep.contains(key)),
            Self::Exclude(drop) => record.fields.retain(|key, _| !drop.contains(key)),
        }
    }
}

impl FromStr for Projection {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Arguments of a read: criteria plus an optional projection.
///
/// A bare string converts into a projection over all records, so
/// `model.get("hostname", ..)` reads the `hostname` field of every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadRequest {
    /// Which records.
    pub criteria: SearchCriteria,
    /// Which fields, as a projection list.
    pub fields: Option<String>,
}

impl ReadRequest {
    /// Parsed projection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] for an invalid projection list.
    pub fn projection(&self) -> Result<Projection, DbError> {
        self.fields
            .as_deref()
            .map_or(Ok(Projection::All), Projection::parse)
    }
}

impl From<SearchCriteria> for ReadRequest {
    fn from(criteria: SearchCriteria) -> Self {
        Self {
            criteria,
            fields: None,
        }
    }
}

impl From<&str> for ReadRequest {
    fn from(fields: &str) -> Self {
        Self {
            criteria: SearchCriteria::all(),
            fields: Some(fields.to_owned()),
        }
    }
}

impl From<(SearchCriteria, &str)> for ReadRequest {
    fn from((criteria, fields): (SearchCriteria, &str)) -> Self {
        Self {
            criteria,
            fields: Some(fields.to_owned()),
        }
    }
}

impl From<(SearchCriteria, Option<&str>)> for ReadRequest {
    fn from((criteria, fields): (SearchCriteria, Option<&str>)) -> Self {
        Self {
            criteria,
            fields: fields.map(str::to_owned),
        }
    }
}
