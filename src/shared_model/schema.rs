//! # Model Schemas
//!
//! Typed field declarations for shared models and value validation against them.

use super::errors::ValidationError;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

static EMAIL_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$").ok()
});

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Declared type of a model field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    /// A string holding a parseable timestamp or calendar date
    Date,
    Email,
    /// Unrecognized type name; any value passes
    Other(String),
}

impl FieldType {
    /// Check a non-null value against this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Date => value.as_str().is_some_and(is_parseable_date),
            Self::Email => value.as_str().is_some_and(is_email),
            Self::Other(_) => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::Boolean => write!(f, "boolean"),
            Self::Date => write!(f, "date"),
            Self::Email => write!(f, "email"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

impl std::str::FromStr for FieldType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "string" => Self::String,
            "integer" => Self::Integer,
            "float" => Self::Float,
            "boolean" => Self::Boolean,
            "date" => Self::Date,
            "email" => Self::Email,
            _ => Self::Other(s.trim().to_string()),
        })
    }
}

impl From<&str> for FieldType {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(field_type) => field_type,
            Err(never) => match never {},
        }
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(FieldType::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(field_type: impl Into<FieldType>) -> Self {
        Self {
            field_type: field_type.into(),
            required: true,
        }
    }

    pub fn optional(field_type: impl Into<FieldType>) -> Self {
        Self {
            field_type: field_type.into(),
            required: false,
        }
    }
}

/// A registered model: name plus field declarations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub fields: BTreeMap<String, FieldSpec>,
}

impl ModelSchema {
    pub fn new(
        name: impl Into<String>,
        fields: BTreeMap<String, FieldSpec>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::invalid_schema(name, "model name must not be empty"));
        }
        if fields.is_empty() {
            return Err(ValidationError::invalid_schema(name, "a model needs at least one field"));
        }
        if let Some(blank) = fields.keys().find(|k| k.trim().is_empty()) {
            return Err(ValidationError::invalid_schema(
                name,
                format!("field name '{blank}' is blank"),
            ));
        }
        Ok(Self { name, fields })
    }

    /// Validate a complete record body.
    ///
    /// Null values count as missing. Undeclared fields are rejected.
    pub fn validate(&self, data: &Map<String, Value>) -> Result<(), ValidationError> {
        if let Some(field) = data.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(ValidationError::unknown_field(&self.name, field));
        }

        for (field, spec) in &self.fields {
            match data.get(field) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(ValidationError::missing_field(&self.name, field));
                    }
                }
                Some(value) => {
                    if !spec.field_type.accepts(value) {
                        return Err(ValidationError::TypeMismatch {
                            model: self.name.clone(),
                            field: field.clone(),
                            expected: spec.field_type.to_string(),
                            actual: describe(value),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_parseable_date(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || NAIVE_DATETIME_FORMATS
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(s, format).is_ok())
}

fn is_email(s: &str) -> bool {
    EMAIL_RE.as_ref().is_some_and(|re| re.is_match(s))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(n) if n.is_f64() => "float".to_string(),
        Value::Number(_) => "integer".to_string(),
        Value::String(s) => format!("string \"{s}\""),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}
