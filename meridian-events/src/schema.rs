//! Structural payload schemas

use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{FieldError, FieldErrors};

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$").expect("email pattern compiles")
});

/// Shape of a single value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    /// Nested object with its own schema
    Object(Box<Schema>),
    /// Array whose items all have the given shape
    Array(Box<FieldKind>),
    /// Hyphenated or simple UUID string
    Uuid,
    Email,
    /// RFC 3339 timestamp string
    Timestamp,
    Any,
}

impl FieldKind {
    pub fn object(schema: Schema) -> Self {
        Self::Object(Box::new(schema))
    }

    pub fn array_of(kind: FieldKind) -> Self {
        Self::Array(Box::new(kind))
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Number => "a number",
            Self::Integer => "an integer",
            Self::Boolean => "a boolean",
            Self::Object(_) => "an object",
            Self::Array(_) => "an array",
            Self::Uuid => "a UUID",
            Self::Email => "a valid email",
            Self::Timestamp => "an RFC 3339 timestamp",
            Self::Any => "any value",
        }
    }

    fn constraint(&self) -> &'static str {
        match self {
            Self::String => "isString",
            Self::Number => "isNumber",
            Self::Integer => "isInt",
            Self::Boolean => "isBoolean",
            Self::Object(_) => "isObject",
            Self::Array(_) => "isArray",
            Self::Uuid => "isUuid",
            Self::Email => "isEmail",
            Self::Timestamp => "isTimestamp",
            Self::Any => "any",
        }
    }

    fn check(&self, path: &str, value: &Value, errors: &mut FieldErrors) {
        let matches = match (self, value) {
            (Self::Any, _) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Uuid, Value::String(s)) => Uuid::parse_str(s).is_ok(),
            (Self::Email, Value::String(s)) => EMAIL_REGEX.is_match(s),
            (Self::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s).is_ok(),
            (Self::Object(schema), Value::Object(_)) => {
                schema.check(path, value, errors);
                true
            }
            (Self::Array(item), Value::Array(items)) => {
                for (i, v) in items.iter().enumerate() {
                    item.check(&format!("{}[{}]", path, i), v, errors);
                }
                true
            }
            _ => false,
        };

        if !matches {
            errors.push(FieldError::new(
                path,
                self.constraint(),
                format!("{} must be {}", leaf(path), self.describe()),
            ));
        }
    }
}

/// A field of a [`Schema`]
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Structural schema of a JSON object.
///
/// ```rust
/// use meridian_events::{FieldKind, Schema};
/// use serde_json::json;
///
/// let schema = Schema::new()
///     .required("userId", FieldKind::Uuid)
///     .optional("nickname", FieldKind::String);
///
/// assert!(schema.validate(&json!({ "userId": "8c1f6f0e-2c41-4c2e-9d59-3a9a6f3b1b11" })).is_ok());
/// assert!(schema.validate(&json!({ "nickname": "kim" })).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    fields: Vec<FieldSchema>,
    additional_fields: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    /// An object schema with no fields that accepts additional fields
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            additional_fields: true,
        }
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// A field that may be absent or `null`
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Reject fields the schema does not name
    pub fn deny_additional_fields(mut self) -> Self {
        self.additional_fields = false;
        self
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn allows_additional_fields(&self) -> bool {
        self.additional_fields
    }

    /// Validate a payload, reporting every failing field.
    pub fn validate(&self, value: &Value) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::default();
        self.check("", value, &mut errors);
        errors.into_result()
    }

    /// Validate `value` found at `path`, reporting fields as `path.field`.
    pub fn validate_at(&self, path: &str, value: &Value) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::default();
        self.check(path, value, &mut errors);
        errors.into_result()
    }

    fn check(&self, path: &str, value: &Value, errors: &mut FieldErrors) {
        let Value::Object(object) = value else {
            let field = if path.is_empty() { "$" } else { path };
            errors.push(FieldError::new(
                field,
                "isObject",
                format!("{} must be an object", leaf(field)),
            ));
            return;
        };

        for field in &self.fields {
            let field_path = join(path, &field.name);
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => errors.push(FieldError::new(
                    &field_path,
                    "required",
                    format!("{} is required", field.name),
                )),
                None | Some(Value::Null) => {}
                Some(v) => field.kind.check(&field_path, v, errors),
            }
        }

        if !self.additional_fields {
            for key in object.keys() {
                if !self.fields.iter().any(|f| &f.name == key) {
                    errors.push(FieldError::new(
                        join(path, key),
                        "whitelist",
                        format!("{} is not allowed", key),
                    ));
                }
            }
        }
    }
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

fn leaf(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> Schema {
        Schema::new()
            .required("userId", FieldKind::Uuid)
            .required("email", FieldKind::Email)
            .optional("age", FieldKind::Integer)
            .optional(
                "address",
                FieldKind::object(Schema::new().required("city", FieldKind::String)),
            )
            .optional("tags", FieldKind::array_of(FieldKind::String))
    }

    #[test]
    fn test_valid_payload() {
        let payload = json!({
            "userId": "8c1f6f0e-2c41-4c2e-9d59-3a9a6f3b1b11",
            "email": "ana@example.com",
            "age": 31,
            "address": { "city": "Lisbon" },
            "tags": ["admin"],
            "extra": true
        });
        assert!(user_schema().validate(&payload).is_ok());
    }

    #[test]
    fn test_reports_every_failing_field() {
        let payload = json!({
            "userId": "not-a-uuid",
            "age": 31.5,
            "address": {},
            "tags": ["ok", 3]
        });
        let errors = user_schema().validate_at("data", &payload).unwrap_err();

        assert_eq!(errors.len(), 5);
        assert_eq!(errors.field("data.userId").unwrap().constraint, "isUuid");
        assert_eq!(errors.field("data.email").unwrap().message, "email is required");
        assert_eq!(errors.field("data.age").unwrap().constraint, "isInt");
        assert!(errors.field("data.address.city").is_some());
        assert_eq!(
            errors.field("data.tags[1]").unwrap().message,
            "tags[1] must be a string"
        );
    }

    #[test]
    fn test_null_optional_and_required() {
        let schema = Schema::new()
            .required("id", FieldKind::String)
            .optional("note", FieldKind::String);
        assert!(schema.validate(&json!({ "id": "a", "note": null })).is_ok());
        assert!(schema.validate(&json!({ "id": null })).is_err());
    }

    #[test]
    fn test_deny_additional_fields() {
        let schema = Schema::new()
            .required("id", FieldKind::String)
            .deny_additional_fields();
        let errors = schema.validate(&json!({ "id": "a", "rogue": 1 })).unwrap_err();
        assert_eq!(errors.field("rogue").unwrap().constraint, "whitelist");
    }

    #[test]
    fn test_non_object_and_timestamp() {
        assert_eq!(
            Schema::new().validate(&json!([1])).unwrap_err().0[0].field,
            "$"
        );

        let schema = Schema::new().required("at", FieldKind::Timestamp);
        assert!(schema.validate(&json!({ "at": "2024-05-01T12:00:00Z" })).is_ok());
        assert!(schema.validate(&json!({ "at": "yesterday" })).is_err());
    }
}
