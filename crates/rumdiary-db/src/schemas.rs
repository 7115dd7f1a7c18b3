//! Schemas of the RumDiary domain models.

use serde_json::json;

use crate::schema::{FieldType, Schema};

/// One recorded page load.
pub fn page_view() -> Schema {
    Schema::new()
        .required("hostname", FieldType::String)
        .field("path", FieldType::String)
        .field("uuid", FieldType::String)
        .field("referrer", FieldType::String)
        .field("refer_to", FieldType::String)
        .field("title", FieldType::String)
        .field("os", FieldType::String)
        .field("os_parsed", FieldType::Object)
        .field("browser", FieldType::String)
        .field("lang", FieldType::String)
        .with_default("tags", FieldType::Array, json!([]))
        .with_default("returning", FieldType::Boolean, false)
        .with_default("is_exit", FieldType::Boolean, true)
        .field("duration", FieldType::Number)
        .field("screen_width", FieldType::Number)
        .field("screen_height", FieldType::Number)
        .field("navigationTiming", FieldType::Object)
}

/// A tracked hostname and who may see it.
pub fn site() -> Schema {
    Schema::new()
        .required("hostname", FieldType::String)
        .with_default("admin_users", FieldType::Array, json!([]))
        .with_default("readonly_users", FieldType::Array, json!([]))
        .with_default("total_hits", FieldType::Number, 0)
        .with_default("is_public", FieldType::Boolean, false)
}

/// A person who signs in.
pub fn user() -> Schema {
    Schema::new()
        .required("email", FieldType::String)
        .field("last_login", FieldType::Date)
}

/// Tags seen on a site.
pub fn tags() -> Schema {
    Schema::new()
        .required("hostname", FieldType::String)
        .with_default("tags", FieldType::Array, json!([]))
}

/// An invitation to view a site.
pub fn invite() -> Schema {
    Schema::new()
        .required("token", FieldType::String)
        .required("hostname", FieldType::String)
        .required("from_email", FieldType::String)
        .required("to_email", FieldType::String)
        .field("expires_at", FieldType::Date)
}

/// A note pinned to a point in a site's history.
pub fn annotation() -> Schema {
    Schema::new()
        .required("hostname", FieldType::String)
        .required("occurredAt", FieldType::Date)
        .required("title", FieldType::String)
        .field("url", FieldType::String)
}
