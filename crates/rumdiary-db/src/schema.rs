//! Field schemas.
//!
//! A [`Schema`] names the fields a model stores, their types, defaults and
//! whether they are required. Construction through a schema is strict:
//! unknown keys are dropped and defaults filled in. Saving validates the
//! record against the same schema.

use chrono::DateTime;
use rumdiary_types::{Document, Record};
use serde_json::Value;

/// Type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// RFC 3339 string or Unix milliseconds.
    Date,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
    /// Anything.
    Any,
}

impl FieldType {
    /// Whether `value` has this type. `null` never does.
    pub fn accepts(self, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        match (self, value) {
            (Self::Any, _)
            | (Self::String, Value::String(_))
            | (Self::Number, Value::Number(_))
            | (Self::Boolean, Value::Bool(_))
            | (Self::Array, Value::Array(_))
            | (Self::Object, Value::Object(_)) => true,
            (Self::Date, Value::String(s)) => DateTime::parse_from_rfc3339(s).is_ok(),
            (Self::Date, Value::Number(n)) => n.is_i64() || n.is_u64(),
            _ => false,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// One field of a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Expected type.
    pub field_type: FieldType,
    /// Whether a saved record must carry the field.
    pub required: bool,
    /// Value filled in by construction when the field is absent.
    pub default: Option<Value>,
}

/// The fields of one model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Schema with no fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an optional field.
    #[must_use]
    pub fn field(self, name: &str, field_type: FieldType) -> Self {
        self.push(name, field_type, false, None)
    }

    /// Add a required field.
    #[must_use]
    pub fn required(self, name: &str, field_type: FieldType) -> Self {
        self.push(name, field_type, true, None)
    }

    /// Add an optional field with a default value.
    #[must_use]
    pub fn with_default(self, name: &str, field_type: FieldType, default: impl Into<Value>) -> Self {
        self.push(name, field_type, false, Some(default.into()))
    }

    fn push(mut self, name: &str, field_type: FieldType, required: bool, default: Option<Value>) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_owned(),
            field_type,
            required,
            default,
        });
        self
    }

    /// Declared fields, in declaration order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Look up a field by name.
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Keep the declared keys of `data` and fill in defaults.
    pub fn build(&self, data: &Document) -> Document {
        let mut out = Document::new();
        for spec in &self.fields {
            if let Some(value) = data.get(&spec.name).or(spec.default.as_ref()) {
                out.insert(spec.name.clone(), value.clone());
            }
        }
        out
    }

    /// Check that `record` has every required field and that every declared
    /// field it carries has the declared type.
    ///
    /// Undeclared fields are left alone.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending field.
    pub fn validate(&self, record: &Record) -> Result<(), String> {
        for spec in &self.fields {
            match record.get(&spec.name).filter(|v| !v.is_null()) {
                None if spec.required => {
                    return Err(format!("`{}` is required", spec.name));
                }
                Some(value) if !spec.field_type.accepts(value) => {
                    return Err(format!(
                        "`{}` must be of type {}, got {value}",
                        spec.name,
                        spec.field_type.name()
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
